//! Far control transfers: RETF, IRET and IRETD.
//!
//! Each transfer first classifies the processor mode into a [`ReturnPath`].
//! Real mode and virtual-8086 mode returns are handled here; protected mode
//! returns go to the [`ProtectedModeReturns`] unit. All operands are popped
//! and checked before anything is committed, so a refused pop or a
//! protection fault leaves SP, CS, IP and FLAGS untouched.
//!
//! [`ProtectedModeReturns`]: crate::cpu_x86_protected::ProtectedModeReturns

use crate::cpu_x86::{CpuX86, Fault, IretVariant, TransferKind};
use crate::cpu_x86_bus::{MemoryBus, StackFrame};
use crate::cpu_x86_flags::{
    EFLAG_VIF, EFLAG_VIP, EFLAG_VM, FLAG_IF, FLAG_RESERVED1, FLAG_TF,
};
use crate::cpu_x86_protected::PmodeContext;
use crate::cpu_x86_timing::TimingModel;
use crate::logging::{log, LogCategory, LogLevel};

/// Mode-dependent route taken by a far return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnPath {
    /// Real mode, or V86 mode with IOPL 3
    RealOrV86,
    /// CR0.PE set, EFLAGS.VM clear
    Protected,
    /// V86 mode below IOPL 3 with CR4.VME set
    VmeRedirect,
    /// V86 mode below IOPL 3 without VME
    GeneralProtection,
}

impl IretVariant {
    /// (preserve, merge) masks applied to FLAGS by a real mode IRET
    pub fn flag_masks(self, stack32: bool) -> (u16, u16) {
        match self {
            IretVariant::Legacy286 if stack32 => (0x7000, 0xFFD5),
            IretVariant::Legacy286 => (0x7000, 0x0FD5),
            IretVariant::Modern => (0x0000, 0xFFD5),
        }
    }
}

/// FLAGS bits an IRET in V86 mode keeps under VME
const VME_PRESERVE: u16 = 0x3300;
/// FLAGS bits an IRET in V86 mode takes from the stack under VME
const VME_MERGE: u16 = 0x4CD5;

impl<B: MemoryBus, T: TimingModel> CpuX86<B, T> {
    /// Route of a RETF in the current mode
    pub fn far_return_path(&self) -> ReturnPath {
        if self.state.pe() && !self.state.vm() {
            ReturnPath::Protected
        } else {
            ReturnPath::RealOrV86
        }
    }

    /// Route of an IRET/IRETD in the current mode. Only the 386+ 16-bit
    /// IRET has the VME redirection path.
    pub fn iret_path(&self, variant: Option<IretVariant>) -> ReturnPath {
        let state = &self.state;
        if state.pe() && state.vm() && state.iopl() != 3 {
            if variant == Some(IretVariant::Modern) && state.vme() {
                ReturnPath::VmeRedirect
            } else {
                ReturnPath::GeneralProtection
            }
        } else if state.pe() && !state.vm() {
            ReturnPath::Protected
        } else {
            ReturnPath::RealOrV86
        }
    }

    /// RETF / RETF imm16.
    ///
    /// Pops IP and CS, loads CS, then releases `4 + dealloc` (16-bit) or
    /// `8 + dealloc` (32-bit) bytes using the stack width of SS.
    pub fn far_return(&mut self, op32: bool, dealloc: u16) -> Result<u32, Fault> {
        let cycles = match self.far_return_path() {
            ReturnPath::Protected => {
                self.state.optype = Some(TransferKind::FarReturn);
                log(LogCategory::Control, LogLevel::Trace, || {
                    format!("RETF{} delegated to protected mode", if op32 { "D" } else { "" })
                });
                let ctx = PmodeContext {
                    state: &mut self.state,
                    bus: &mut self.bus,
                    loader: self.loader.as_mut(),
                };
                let cycles = self.pmode.far_return(ctx, op32, dealloc)?;
                self.state.optype = None;
                cycles
            }
            _ => {
                let state = &mut self.state;
                let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
                let (ip, cs) = {
                    let mut frame = StackFrame::new(&mut self.bus, &mut state.abrt, ss, top, stack32);
                    if op32 {
                        (frame.dword(0)?, frame.dword(4)? as u16)
                    } else {
                        (frame.word(0)? as u32, frame.word(2)?)
                    }
                };

                self.loader.load_code_segment(state, &mut self.bus, cs)?;
                state.pc = ip;
                state.adjust_sp(if op32 { 8 } else { 4 } + dealloc as u32);
                self.control_timings.retf_rm
            }
        };

        self.state.block_end = true;
        self.timing.charge_cycles(cycles);
        Ok(cycles)
    }

    /// IRET with 16-bit operand size
    pub fn iret_16(&mut self, variant: IretVariant) -> Result<u32, Fault> {
        match self.iret_path(Some(variant)) {
            ReturnPath::GeneralProtection => {
                log(LogCategory::Control, LogLevel::Debug, || {
                    format!("IRET in V86 mode at IOPL {}", self.state.iopl())
                });
                Err(Fault::GeneralProtection)
            }
            ReturnPath::Protected => self.iret_protected(false),
            ReturnPath::VmeRedirect => self.iret_vme(),
            ReturnPath::RealOrV86 => {
                let state = &mut self.state;
                let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
                let (ip, cs, new_flags) = {
                    let mut frame = StackFrame::new(&mut self.bus, &mut state.abrt, ss, top, stack32);
                    (frame.word(0)?, frame.word(2)?, frame.word(4)?)
                };

                let (preserve, merge) = variant.flag_masks(stack32);
                state.flags = (state.flags & preserve) | (new_flags & merge) | FLAG_RESERVED1;
                state.adjust_sp(6);
                self.loader.load_code_segment(state, &mut self.bus, cs)?;
                state.pc = ip as u32;

                let cycles = self.control_timings.iret_rm;
                Ok(self.finish_iret(cycles))
            }
        }
    }

    /// IRETD: 32-bit IP, CS from the low half of a dword, then FLAGS and the
    /// high word of EFLAGS.
    ///
    /// In real mode the popped high word cannot change VM, VIF or VIP.
    pub fn iret_32(&mut self) -> Result<u32, Fault> {
        match self.iret_path(None) {
            ReturnPath::GeneralProtection | ReturnPath::VmeRedirect => {
                log(LogCategory::Control, LogLevel::Debug, || {
                    format!("IRETD in V86 mode at IOPL {}", self.state.iopl())
                });
                Err(Fault::GeneralProtection)
            }
            ReturnPath::Protected => self.iret_protected(true),
            ReturnPath::RealOrV86 => {
                let state = &mut self.state;
                let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
                let (ip, cs, new_flags, new_high) = {
                    let mut frame = StackFrame::new(&mut self.bus, &mut state.abrt, ss, top, stack32);
                    (frame.dword(0)?, frame.word(4)?, frame.word(8)?, frame.word(10)?)
                };

                state.flags = (new_flags & 0xFFD5) | FLAG_RESERVED1;
                // VM and the virtual interrupt bits cannot be changed from here.
                let fixed = EFLAG_VM | EFLAG_VIF | EFLAG_VIP;
                state.eflags = (state.eflags & fixed) | (new_high & !fixed);
                state.adjust_sp(12);
                self.loader.load_code_segment(state, &mut self.bus, cs)?;
                state.pc = ip;

                let cycles = self.control_timings.iret_rm;
                Ok(self.finish_iret(cycles))
            }
        }
    }

    fn iret_protected(&mut self, op32: bool) -> Result<u32, Fault> {
        self.state.optype = Some(TransferKind::Iret);
        log(LogCategory::Control, LogLevel::Trace, || {
            format!("IRET{} delegated to protected mode", if op32 { "D" } else { "" })
        });
        let ctx = PmodeContext {
            state: &mut self.state,
            bus: &mut self.bus,
            loader: self.loader.as_mut(),
        };
        let cycles = self.pmode.iret(ctx, op32)?;
        self.state.optype = None;
        Ok(self.finish_iret(cycles))
    }

    /// V86 mode IRET below IOPL 3 with CR4.VME: IF goes to VIF instead.
    fn iret_vme(&mut self) -> Result<u32, Fault> {
        let state = &mut self.state;
        let sp = state.sp();
        let (ip, cs, new_flags) = {
            let mut frame = StackFrame::new(&mut self.bus, &mut state.abrt, state.ss, sp as u32, false);
            (frame.word(0)?, frame.word(2)?, frame.word(4)?)
        };

        let (_, vip) = state.virtual_interrupt_bits();
        if new_flags & FLAG_TF != 0 || (new_flags & FLAG_IF != 0 && vip) {
            log(LogCategory::Control, LogLevel::Debug, || {
                format!("VME IRET refused, popped flags {:04X}", new_flags)
            });
            return Err(Fault::GeneralProtection);
        }

        state.set_sp(sp.wrapping_add(6));
        if new_flags & FLAG_IF != 0 {
            state.eflags |= EFLAG_VIF;
        } else {
            state.eflags &= !EFLAG_VIF;
        }
        state.flags = (state.flags & VME_PRESERVE) | (new_flags & VME_MERGE) | FLAG_RESERVED1;
        self.loader.load_code_segment(state, &mut self.bus, cs)?;
        state.pc = ip as u32;

        log(LogCategory::Control, LogLevel::Debug, || {
            format!("VME IRET to {:04X}:{:04X}, VIF={}", cs, ip, new_flags & FLAG_IF != 0)
        });
        let cycles = self.control_timings.iret_rm;
        Ok(self.finish_iret(cycles))
    }

    /// Success tail shared by every IRET path
    fn finish_iret(&mut self, cycles: u32) -> u32 {
        self.state.lazy.extract();
        self.state.nmi_enable = true;
        self.state.block_end = true;
        self.timing.charge_cycles(cycles);
        cycles
    }
}
