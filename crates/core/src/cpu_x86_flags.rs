//! FLAGS/EFLAGS layout and the lazy flag evaluator.
//!
//! ALU instructions do not compute their status flags eagerly. They record the
//! operation, operand width, operands and result in [`LazyFlags`]; the packed
//! FLAGS word is only brought up to date by [`LazyFlags::rebuild`] when an
//! instruction needs to read or overwrite individual status bits (FCOMI,
//! PUSHF, ...). Instructions that load FLAGS wholesale (IRET, POPF) call
//! [`LazyFlags::extract`] afterwards so the stale record is discarded.

use serde::{Deserialize, Serialize};

// Low word (FLAGS)
pub const FLAG_CF: u16 = 0x0001;
/// Bit 1 reads as one on every x86
pub const FLAG_RESERVED1: u16 = 0x0002;
pub const FLAG_PF: u16 = 0x0004;
pub const FLAG_AF: u16 = 0x0010;
pub const FLAG_ZF: u16 = 0x0040;
pub const FLAG_SF: u16 = 0x0080;
pub const FLAG_TF: u16 = 0x0100;
pub const FLAG_IF: u16 = 0x0200;
pub const FLAG_DF: u16 = 0x0400;
pub const FLAG_OF: u16 = 0x0800;
pub const FLAG_IOPL: u16 = 0x3000;
pub const FLAG_NT: u16 = 0x4000;

/// Status bits covered by the lazy evaluator
pub const STATUS_FLAGS: u16 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;

// High word (EFLAGS bits 16-31, stored shifted down by 16)
pub const EFLAG_RF: u16 = 0x0001;
pub const EFLAG_VM: u16 = 0x0002;
pub const EFLAG_AC: u16 = 0x0004;
pub const EFLAG_VIF: u16 = 0x0008;
pub const EFLAG_VIP: u16 = 0x0010;
pub const EFLAG_ID: u16 = 0x0020;

/// Extract the IOPL field from a FLAGS word
#[inline]
pub fn iopl(flags: u16) -> u8 {
    ((flags & FLAG_IOPL) >> 12) as u8
}

/// Operand width of the instruction that produced the pending result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpWidth {
    Byte,
    #[default]
    Word,
    Dword,
}

impl OpWidth {
    #[inline]
    fn mask(self) -> u32 {
        match self {
            OpWidth::Byte => 0xFF,
            OpWidth::Word => 0xFFFF,
            OpWidth::Dword => 0xFFFF_FFFF,
        }
    }

    #[inline]
    fn sign_bit(self) -> u32 {
        match self {
            OpWidth::Byte => 0x80,
            OpWidth::Word => 0x8000,
            OpWidth::Dword => 0x8000_0000,
        }
    }

    #[inline]
    fn bits(self) -> u32 {
        match self {
            OpWidth::Byte => 8,
            OpWidth::Word => 16,
            OpWidth::Dword => 32,
        }
    }
}

/// Kind of operation whose flags are still pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlagOp {
    /// FLAGS is authoritative; nothing pending
    #[default]
    Unknown,
    /// AND/OR/XOR/TEST: CF and OF cleared, AF cleared
    Logic,
    Add,
    Sub,
    /// INC keeps CF from FLAGS
    Inc,
    /// DEC keeps CF from FLAGS
    Dec,
    /// `src` holds the shift count
    Shl,
    Shr,
    Sar,
}

/// Deferred status-flag state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LazyFlags {
    pub op: FlagOp,
    pub width: OpWidth,
    pub dst: u32,
    pub src: u32,
    pub res: u32,
}

impl LazyFlags {
    /// Record a pending result. Operands are masked to `width`.
    pub fn set(&mut self, op: FlagOp, width: OpWidth, dst: u32, src: u32, res: u32) {
        let m = width.mask();
        *self = LazyFlags {
            op,
            width,
            dst: dst & m,
            src: src & m,
            res: res & m,
        };
    }

    pub fn is_pending(&self) -> bool {
        self.op != FlagOp::Unknown
    }

    /// Fold any pending result into `flags` and mark FLAGS authoritative.
    pub fn rebuild(&mut self, flags: &mut u16) {
        if !self.is_pending() {
            return;
        }
        let computed = self.status_bits(*flags);
        *flags = (*flags & !STATUS_FLAGS) | computed | FLAG_RESERVED1;
        self.op = FlagOp::Unknown;
    }

    /// Drop the pending record after FLAGS has been loaded wholesale.
    pub fn extract(&mut self) {
        self.op = FlagOp::Unknown;
    }

    fn status_bits(&self, old_flags: u16) -> u16 {
        let w = self.width;
        let sign = w.sign_bit();
        let (dst, src, res) = (self.dst, self.src, self.res);

        let mut cf = false;
        let mut of = false;
        let mut af = false;
        match self.op {
            FlagOp::Unknown | FlagOp::Logic => {}
            FlagOp::Add => {
                cf = res < dst || (res == dst && src != 0);
                of = (dst ^ res) & (src ^ res) & sign != 0;
                af = (dst ^ src ^ res) & 0x10 != 0;
            }
            FlagOp::Sub => {
                cf = dst < src;
                of = (dst ^ src) & (dst ^ res) & sign != 0;
                af = (dst ^ src ^ res) & 0x10 != 0;
            }
            FlagOp::Inc => {
                cf = old_flags & FLAG_CF != 0;
                of = res == sign;
                af = res & 0x0F == 0;
            }
            FlagOp::Dec => {
                cf = old_flags & FLAG_CF != 0;
                of = res == sign - 1;
                af = res & 0x0F == 0x0F;
            }
            FlagOp::Shl => {
                let count = src;
                if count == 0 || count > w.bits() {
                    cf = old_flags & FLAG_CF != 0;
                } else {
                    cf = (dst >> (w.bits() - count)) & 1 != 0;
                }
                of = cf != (res & sign != 0);
            }
            FlagOp::Shr => {
                let count = src;
                if count == 0 || count > w.bits() {
                    cf = old_flags & FLAG_CF != 0;
                } else {
                    cf = (dst >> (count - 1)) & 1 != 0;
                }
                of = dst & sign != 0;
            }
            FlagOp::Sar => {
                let count = src.min(w.bits());
                if count == 0 {
                    cf = old_flags & FLAG_CF != 0;
                } else {
                    // Sign-extend to 64 bits so shifting by the full width is defined.
                    let signed = if dst & sign != 0 {
                        (dst as u64) | !(w.mask() as u64)
                    } else {
                        dst as u64
                    };
                    cf = (signed >> (count - 1)) & 1 != 0;
                }
            }
        }

        let mut out = 0;
        if cf {
            out |= FLAG_CF;
        }
        if (res as u8).count_ones() % 2 == 0 {
            out |= FLAG_PF;
        }
        if af {
            out |= FLAG_AF;
        }
        if res == 0 {
            out |= FLAG_ZF;
        }
        if res & sign != 0 {
            out |= FLAG_SF;
        }
        if of {
            out |= FLAG_OF;
        }
        out
    }
}
