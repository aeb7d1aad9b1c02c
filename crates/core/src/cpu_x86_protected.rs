//! Protected mode support: control registers, descriptor tables, code
//! segment loading and the privilege-checked far/interrupt returns.
//!
//! The real-mode and virtual-8086 halves of RETF/IRET live in
//! `cpu_x86_control`; whenever CR0.PE is set and EFLAGS.VM is clear those
//! instructions hand over to a [`ProtectedModeReturns`] implementation.
//!
//! Key pieces:
//! - CR0 (PE/MP/EM/TS) and CR4 (VME)
//! - GDTR/IDTR and the cached LDT
//! - 8-byte segment descriptors with base, limit, access rights and flags
//! - [`SegmentLoader`]: CS loading for real, V86 and protected mode
//! - [`DescriptorReturns`]: same-level and outer-level RETF/IRET, and IRET
//!   back into virtual-8086 mode

use crate::cpu_x86::{CpuState, Fault, SegReg, SegmentCache};
use crate::cpu_x86_bus::{checked, MemoryBus, StackFrame};
use crate::cpu_x86_flags::{
    iopl, EFLAG_AC, EFLAG_ID, EFLAG_RF, EFLAG_VIF, EFLAG_VIP, EFLAG_VM, FLAG_IF, FLAG_IOPL,
    FLAG_NT, FLAG_RESERVED1,
};
use crate::cpu_x86_timing::ControlTimings;
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// CR0.PE: protection enable
pub const CR0_PE: u32 = 0x0000_0001;
/// CR0.EM: no coprocessor, ESC opcodes trap with #NM
pub const CR0_EM: u32 = 0x0000_0004;
/// CR0.TS: task switched, the next ESC opcode traps with #NM
pub const CR0_TS: u32 = 0x0000_0008;
/// CR4.VME: virtual-8086 mode extensions
pub const CR4_VME: u32 = 0x0000_0001;

/// Control registers and descriptor-table registers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedModeState {
    /// CR0; the low 16 bits are the 286 Machine Status Word
    pub cr0: u32,
    /// CR4 (Pentium and later, VME on some late 486s)
    pub cr4: u32,
    pub gdtr: DescriptorTableRegister,
    pub idtr: DescriptorTableRegister,
    /// LDT selector
    pub ldtr: u16,
    /// Base and limit loaded from the LDT descriptor
    pub ldt: DescriptorTableRegister,
    /// Task register selector
    pub tr: u16,
}

/// Base and limit of a descriptor table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTableRegister {
    pub base: u32,
    pub limit: u32,
}

/// Segment Descriptor (8 bytes)
///
/// Format:
/// - Bytes 0-1: Segment Limit (bits 0-15)
/// - Bytes 2-3: Base Address (bits 0-15)
/// - Byte 4: Base Address (bits 16-23)
/// - Byte 5: Access Rights
/// - Byte 6: Limit (bits 16-19) + Flags
/// - Byte 7: Base Address (bits 24-31) [80386 only]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub base: u32,
    /// Raw 20-bit limit, before granularity scaling
    pub limit: u32,
    pub access: u8,
    /// AVL (bit 0), L (bit 1), D/B (bit 2), G (bit 3)
    pub flags: u8,
}

impl ProtectedModeState {
    /// Power-on state: real mode, empty tables
    pub fn new() -> Self {
        Self {
            cr0: 0,
            cr4: 0,
            gdtr: DescriptorTableRegister::default(),
            idtr: DescriptorTableRegister { base: 0, limit: 0x3FF },
            ldtr: 0,
            ldt: DescriptorTableRegister::default(),
            tr: 0,
        }
    }

    #[inline]
    pub fn is_protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    #[inline]
    pub fn enable_protected_mode(&mut self) {
        self.cr0 |= CR0_PE;
    }

    /// Leave protected mode. A real 286 needs a reset for this; a 386 clears PE with MOV CR0.
    #[inline]
    pub fn disable_protected_mode(&mut self) {
        self.cr0 &= !CR0_PE;
    }

    #[inline]
    pub fn vme_enabled(&self) -> bool {
        self.cr4 & CR4_VME != 0
    }

    /// LMSW: writes the low four bits of CR0 but can never clear PE
    pub fn set_msw(&mut self, value: u16) {
        let pe = self.cr0 & CR0_PE;
        self.cr0 = (self.cr0 & !0x000F) | (value as u32 & 0x000F) | pe;
    }

    /// SMSW
    #[inline]
    pub fn get_msw(&self) -> u16 {
        self.cr0 as u16
    }

    pub fn load_gdtr(&mut self, base: u32, limit: u16, wide: bool) {
        self.gdtr = DescriptorTableRegister {
            base: if wide { base } else { base & 0x00FF_FFFF },
            limit: limit as u32,
        };
    }

    pub fn load_idtr(&mut self, base: u32, limit: u16, wide: bool) {
        self.idtr = DescriptorTableRegister {
            base: if wide { base } else { base & 0x00FF_FFFF },
            limit: limit as u32,
        };
    }

    /// Record an LDT selector together with the table its descriptor describes
    pub fn load_ldtr(&mut self, selector: u16, table: DescriptorTableRegister) {
        self.ldtr = selector;
        self.ldt = table;
    }

    pub fn load_tr(&mut self, selector: u16) {
        self.tr = selector;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ProtectedModeState {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentDescriptor {
    /// Parse a segment descriptor from 8 bytes in memory
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        let limit_low = u16::from_le_bytes([bytes[0], bytes[1]]);
        let base_low = u16::from_le_bytes([bytes[2], bytes[3]]);
        let limit = (limit_low as u32) | (((bytes[6] & 0x0F) as u32) << 16);
        let base = (base_low as u32) | ((bytes[4] as u32) << 16) | ((bytes[7] as u32) << 24);

        Self {
            base,
            limit,
            access: bytes[5],
            flags: (bytes[6] >> 4) & 0x0F,
        }
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.access & access_rights::PRESENT != 0
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 0x03
    }

    /// System descriptors (TSS, gates, LDT) have the S bit clear
    #[inline]
    pub fn is_system(&self) -> bool {
        self.access & access_rights::DESCRIPTOR_TYPE == 0
    }

    #[inline]
    pub fn is_code_segment(&self) -> bool {
        !self.is_system() && self.access & access_rights::CODE_SEGMENT != 0
    }

    #[inline]
    pub fn is_data_segment(&self) -> bool {
        !self.is_system() && self.access & access_rights::CODE_SEGMENT == 0
    }

    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code_segment() && self.access & access_rights::EXPAND_DOWN_CONFORMING != 0
    }

    #[inline]
    pub fn is_writable_data(&self) -> bool {
        self.is_data_segment() && self.access & access_rights::WRITABLE_READABLE != 0
    }

    /// D/B bit: 32-bit default operand size (code) or ESP stack (SS)
    #[inline]
    pub fn is_big(&self) -> bool {
        self.flags & 0x04 != 0
    }

    /// Limit in bytes after applying the granularity bit
    #[inline]
    pub fn byte_limit(&self) -> u32 {
        if self.flags & 0x08 != 0 {
            (self.limit << 12) | 0xFFF
        } else {
            self.limit
        }
    }
}

/// Access Rights Byte flags
pub mod access_rights {
    /// For data segments: Writable
    /// For code segments: Readable
    pub const WRITABLE_READABLE: u8 = 0x02;

    /// For data segments: Expand down
    /// For code segments: Conforming
    pub const EXPAND_DOWN_CONFORMING: u8 = 0x04;

    /// Code segment (1) vs Data segment (0)
    pub const CODE_SEGMENT: u8 = 0x08;

    /// Descriptor type: System (0) or Code/Data (1)
    pub const DESCRIPTOR_TYPE: u8 = 0x10;

    /// Descriptor Privilege Level (2 bits)
    pub const DPL_MASK: u8 = 0x60;

    /// Present bit
    pub const PRESENT: u8 = 0x80;
}

/// Fetch the descriptor named by `selector` from the GDT or LDT.
pub fn read_descriptor(
    state: &mut CpuState,
    bus: &mut dyn MemoryBus,
    selector: u16,
) -> Result<SegmentDescriptor, Fault> {
    let table = if selector & 0x4 != 0 {
        state.protected_mode.ldt
    } else {
        state.protected_mode.gdtr
    };
    let index = (selector & !0x7) as u32;
    if index + 7 > table.limit {
        return Err(Fault::SegmentLoad { selector });
    }

    let flat = SegmentCache::flat();
    let addr = table.base.wrapping_add(index);
    let r = bus.read_u32(&flat, addr);
    let low = checked(bus, &mut state.abrt, r)?;
    let r = bus.read_u32(&flat, addr.wrapping_add(4));
    let high = checked(bus, &mut state.abrt, r)?;

    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&low.to_le_bytes());
    bytes[4..].copy_from_slice(&high.to_le_bytes());
    Ok(SegmentDescriptor::from_bytes(&bytes))
}

/// Loads CS for a far transfer.
///
/// Implementations read the processor mode from `state`; callers never pass
/// it separately. On failure nothing in `state` other than `abrt` changes.
pub trait SegmentLoader {
    fn load_code_segment(
        &mut self,
        state: &mut CpuState,
        bus: &mut dyn MemoryBus,
        selector: u16,
    ) -> Result<(), Fault>;
}

/// Descriptor-table backed CS loader.
///
/// Real and V86 mode loads cannot fail. Protected mode requires a present,
/// non-system code segment; non-conforming segments must have DPL equal to
/// the selector RPL, conforming ones DPL at most RPL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescriptorSegmentLoader;

impl SegmentLoader for DescriptorSegmentLoader {
    fn load_code_segment(
        &mut self,
        state: &mut CpuState,
        bus: &mut dyn MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        if !state.pe() {
            state.cs = SegmentCache::real(selector, 0);
            state.use32 = false;
            return Ok(());
        }
        if state.vm() {
            state.cs = SegmentCache::real(selector, 3);
            state.use32 = false;
            return Ok(());
        }

        if selector & !0x3 == 0 {
            return Err(Fault::SegmentLoad { selector });
        }
        let desc = read_descriptor(state, bus, selector)?;
        let rpl = (selector & 0x3) as u8;
        let privilege_ok = if desc.is_conforming() {
            desc.dpl() <= rpl
        } else {
            desc.dpl() == rpl
        };
        if !desc.is_code_segment() || !privilege_ok || !desc.is_present() {
            log(LogCategory::Control, LogLevel::Debug, || {
                format!(
                    "CS load of {:04X} refused (access {:02X}, rpl {})",
                    selector, desc.access, rpl
                )
            });
            return Err(Fault::SegmentLoad { selector });
        }

        let mut cache = SegmentCache::from_descriptor(selector, &desc);
        // The new CPL is the selector's RPL, even for conforming segments.
        cache.access = (cache.access & !access_rights::DPL_MASK) | (rpl << 5);
        state.cs = cache;
        state.use32 = desc.is_big();
        Ok(())
    }
}

/// Borrowed machine pieces handed to the protected-mode unit
pub struct PmodeContext<'a> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut dyn MemoryBus,
    pub loader: &'a mut dyn SegmentLoader,
}

/// Privilege-checked RETF/IRET, used whenever CR0.PE=1 and EFLAGS.VM=0.
///
/// Both calls return the cycles the return cost. `state.optype` is set by the
/// caller for the duration of an IRET.
pub trait ProtectedModeReturns {
    fn far_return(&mut self, ctx: PmodeContext<'_>, op32: bool, dealloc: u16)
        -> Result<u32, Fault>;

    fn iret(&mut self, ctx: PmodeContext<'_>, op32: bool) -> Result<u32, Fault>;
}

/// Descriptor-checked returns: same privilege level, outer privilege level
/// (with the SS:ESP pop and data segment scrub), and IRET into V86 mode.
/// Nested-task IRET (NT set) is refused with #GP.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorReturns {
    timings: ControlTimings,
}

impl DescriptorReturns {
    pub fn new(timings: ControlTimings) -> Self {
        Self { timings }
    }
}

/// Return target popped off the stack, before any of it is committed
struct ReturnTarget {
    ip: u32,
    cs: u16,
    /// Bytes of IP/CS(/FLAGS) in the frame
    frame: u32,
}

impl DescriptorReturns {
    /// Validate a new SS for a return to privilege level `rpl`
    fn check_stack_segment(
        state: &mut CpuState,
        bus: &mut dyn MemoryBus,
        selector: u16,
        rpl: u8,
    ) -> Result<SegmentDescriptor, Fault> {
        if selector & !0x3 == 0 || (selector & 0x3) as u8 != rpl {
            return Err(Fault::GeneralProtection);
        }
        let desc = read_descriptor(state, bus, selector)?;
        if !desc.is_writable_data() || desc.dpl() != rpl {
            return Err(Fault::GeneralProtection);
        }
        if !desc.is_present() {
            return Err(Fault::SegmentLoad { selector });
        }
        Ok(desc)
    }

    /// Null any data segment the new, less privileged CPL may not use
    fn scrub_data_segments(state: &mut CpuState) {
        let cpl = state.cpl();
        for reg in [SegReg::ES, SegReg::DS, SegReg::FS, SegReg::GS] {
            let seg = state.segment(reg);
            let dpl = (seg.access >> 5) & 0x3;
            let conforming_code = seg.access & access_rights::CODE_SEGMENT != 0
                && seg.access & access_rights::EXPAND_DOWN_CONFORMING != 0;
            if seg.selector & !0x3 != 0 && !conforming_code && dpl < cpl {
                *state.segment_mut(reg) = SegmentCache::null();
            }
        }
    }

    /// Finish a return to an outer privilege level.
    ///
    /// `target.frame + extra` is where the outer SS:(E)SP pair sits.
    fn return_outer(
        &self,
        ctx: PmodeContext<'_>,
        target: ReturnTarget,
        op32: bool,
        extra: u32,
    ) -> Result<(), Fault> {
        let PmodeContext { state, bus, loader } = ctx;
        let rpl = (target.cs & 0x3) as u8;
        let at = target.frame + extra;

        let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
        let (new_sp, new_ss) = {
            let mut frame = StackFrame::new(&mut *bus, &mut state.abrt, ss, top, stack32);
            if op32 {
                (frame.dword(at)?, frame.dword(at + 4)? as u16)
            } else {
                (frame.word(at)? as u32, frame.word(at + 2)?)
            }
        };

        let ss_desc = Self::check_stack_segment(state, bus, new_ss, rpl)?;
        loader.load_code_segment(state, bus, target.cs)?;

        state.pc = if op32 { target.ip } else { target.ip & 0xFFFF };
        state.ss = SegmentCache::from_descriptor(new_ss, &ss_desc);
        state.stack32 = ss_desc.is_big();
        if state.stack32 {
            state.set_esp(new_sp);
        } else {
            state.set_sp(new_sp as u16);
        }
        Self::scrub_data_segments(state);
        Ok(())
    }

    /// IRETD from CPL 0 with VM set in the popped EFLAGS
    fn iret_to_v86(
        &self,
        ctx: PmodeContext<'_>,
        target: ReturnTarget,
        new_flags: u32,
    ) -> Result<u32, Fault> {
        let PmodeContext { state, bus, .. } = ctx;
        let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
        let mut regs = [0u32; 6];
        {
            let mut frame = StackFrame::new(&mut *bus, &mut state.abrt, ss, top, stack32);
            for (i, r) in regs.iter_mut().enumerate() {
                *r = frame.dword(12 + 4 * i as u32)?;
            }
        }
        let [esp, new_ss, es, ds, fs, gs] = regs;

        state.flags = (new_flags as u16) | FLAG_RESERVED1;
        state.eflags = (new_flags >> 16) as u16;
        state.cs = SegmentCache::real(target.cs, 3);
        state.ss = SegmentCache::real(new_ss as u16, 3);
        state.es = SegmentCache::real(es as u16, 3);
        state.ds = SegmentCache::real(ds as u16, 3);
        state.fs = SegmentCache::real(fs as u16, 3);
        state.gs = SegmentCache::real(gs as u16, 3);
        state.stack32 = false;
        state.use32 = false;
        state.set_esp(esp);
        state.pc = target.ip & 0xFFFF;

        log(LogCategory::Control, LogLevel::Debug, || {
            format!("IRETD to V86 {:04X}:{:04X}", target.cs, state.pc)
        });
        Ok(self.timings.iret_pm_outer)
    }

    fn merge_flags(state: &mut CpuState, new_flags: u32, op32: bool, old_cpl: u8) {
        let mut mask: u16 = 0x7FD5;
        if old_cpl > 0 {
            mask &= !FLAG_IOPL;
        }
        if old_cpl > iopl(state.flags) {
            mask &= !FLAG_IF;
        }
        state.flags = (state.flags & !mask) | (new_flags as u16 & mask) | FLAG_RESERVED1;

        if op32 {
            let mut high = EFLAG_RF | EFLAG_AC | EFLAG_ID;
            if old_cpl == 0 {
                high |= EFLAG_VIF | EFLAG_VIP;
            }
            state.eflags = (state.eflags & !high) | ((new_flags >> 16) as u16 & high);
        }
    }
}

impl ProtectedModeReturns for DescriptorReturns {
    fn far_return(
        &mut self,
        ctx: PmodeContext<'_>,
        op32: bool,
        dealloc: u16,
    ) -> Result<u32, Fault> {
        let PmodeContext { state, bus, loader } = ctx;
        let cpl = state.cpl();
        let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
        let target = {
            let mut frame = StackFrame::new(&mut *bus, &mut state.abrt, ss, top, stack32);
            if op32 {
                ReturnTarget {
                    ip: frame.dword(0)?,
                    cs: frame.dword(4)? as u16,
                    frame: 8,
                }
            } else {
                ReturnTarget {
                    ip: frame.word(0)? as u32,
                    cs: frame.word(2)?,
                    frame: 4,
                }
            }
        };

        let rpl = (target.cs & 0x3) as u8;
        if target.cs & !0x3 == 0 || rpl < cpl {
            return Err(Fault::GeneralProtection);
        }

        if rpl == cpl {
            loader.load_code_segment(state, bus, target.cs)?;
            state.pc = target.ip;
            state.adjust_sp(target.frame + dealloc as u32);
            return Ok(self.timings.retf_pm);
        }

        log(LogCategory::Control, LogLevel::Trace, || {
            format!("RETF to outer level {} via {:04X}", rpl, target.cs)
        });
        let at = dealloc as u32;
        let outer = PmodeContext {
            state: &mut *state,
            bus,
            loader,
        };
        self.return_outer(outer, target, op32, at)?;
        // The immediate also releases parameters on the outer stack.
        state.adjust_sp(at);
        Ok(self.timings.retf_pm_outer)
    }

    fn iret(&mut self, ctx: PmodeContext<'_>, op32: bool) -> Result<u32, Fault> {
        let PmodeContext { state, bus, loader } = ctx;
        if state.flags & FLAG_NT != 0 {
            log(LogCategory::Control, LogLevel::Debug, || {
                format!("nested-task IRET (TR {:04X}) not supported", state.protected_mode.tr)
            });
            return Err(Fault::GeneralProtection);
        }

        let cpl = state.cpl();
        let (ss, top, stack32) = (state.ss, state.stack_top(), state.stack32);
        let (target, new_flags) = {
            let mut frame = StackFrame::new(&mut *bus, &mut state.abrt, ss, top, stack32);
            if op32 {
                let ip = frame.dword(0)?;
                let cs = frame.dword(4)? as u16;
                let flags = frame.dword(8)?;
                (ReturnTarget { ip, cs, frame: 12 }, flags)
            } else {
                let ip = frame.word(0)? as u32;
                let cs = frame.word(2)?;
                let flags = frame.word(4)? as u32;
                (ReturnTarget { ip, cs, frame: 6 }, flags)
            }
        };

        if op32 && cpl == 0 && (new_flags >> 16) as u16 & EFLAG_VM != 0 {
            let ctx = PmodeContext { state, bus, loader };
            return self.iret_to_v86(ctx, target, new_flags);
        }

        let rpl = (target.cs & 0x3) as u8;
        if target.cs & !0x3 == 0 || rpl < cpl {
            return Err(Fault::GeneralProtection);
        }

        if rpl == cpl {
            loader.load_code_segment(state, bus, target.cs)?;
            state.pc = if op32 { target.ip } else { target.ip & 0xFFFF };
            state.adjust_sp(target.frame);
            Self::merge_flags(state, new_flags, op32, cpl);
            return Ok(self.timings.iret_pm);
        }

        let outer = PmodeContext {
            state: &mut *state,
            bus,
            loader,
        };
        self.return_outer(outer, target, op32, 0)?;
        Self::merge_flags(state, new_flags, op32, cpl);
        Ok(self.timings.iret_pm_outer)
    }
}
