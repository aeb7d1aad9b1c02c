//! x86 CPU core for the 80286 through Pentium, with x87 coprocessor.
//!
//! This core executes the far control transfers (RETF, IRET, IRETD) and the
//! x87 arithmetic and compare family. Instruction fetch and ModRM decoding
//! happen in the front end, which hands each opcode over as a [`DecodedOp`].
//!
//! The machine is split into:
//! - [`CpuState`]: registers, segment caches, control registers, FPU stack
//! - [`MemoryBus`]: segmented guest memory, which may abort an access
//! - [`SegmentLoader`] and [`ProtectedModeReturns`]: protected mode
//!   collaborators, replaceable by the host
//! - [`TimingModel`]: cycle accounting and prefetch queue
//!
//! Every handler returns `Result<u32, Fault>` with the cycles charged. A
//! fault leaves the instruction pointer at the faulting instruction.

use crate::cpu_x86_bus::MemoryBus;
use crate::cpu_x86_flags::{
    iopl, LazyFlags, EFLAG_VIF, EFLAG_VIP, EFLAG_VM, FLAG_RESERVED1,
};
use crate::cpu_x86_protected::{
    DescriptorReturns, DescriptorSegmentLoader, ProtectedModeReturns, ProtectedModeState,
    SegmentDescriptor, SegmentLoader,
};
use crate::cpu_x86_timing::{
    ControlTimings, PrefetchConfig, PrefetchQueue, PrefetchRun, TimingModel, X87Timings,
};
use crate::cpu_x87::{memory_operand, FpuState, HostFpu, MemoryOperand};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU model/variant selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuModel {
    /// Intel 80286 (1982) - 16-bit protected mode, 24-bit addressing
    Intel80286,
    /// Intel 80386 (1985) - 32-bit registers, paging, virtual-8086 mode
    Intel80386,
    /// Intel 80486 (1989) - on-chip cache and (DX) FPU
    #[default]
    Intel80486,
    /// Intel Pentium (1993) - superscalar, CR4 with VME
    Pentium,
}

impl CpuModel {
    /// Returns true if this CPU model has 32-bit registers and addressing
    #[inline]
    pub fn supports_32bit(&self) -> bool {
        !matches!(self, CpuModel::Intel80286)
    }

    /// The coprocessor usually fitted alongside this CPU
    pub fn default_fpu(&self) -> FpuModel {
        match self {
            CpuModel::Intel80286 => FpuModel::I287,
            CpuModel::Intel80386 => FpuModel::I387,
            CpuModel::Intel80486 => FpuModel::I487,
            CpuModel::Pentium => FpuModel::Pentium,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CpuModel::Intel80286 => "Intel 80286",
            CpuModel::Intel80386 => "Intel 80386",
            CpuModel::Intel80486 => "Intel 80486",
            CpuModel::Pentium => "Intel Pentium",
        }
    }
}

/// x87 coprocessor model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FpuModel {
    I287,
    I387,
    /// On-die FPU of the 486DX, or the 487SX upgrade
    #[default]
    I487,
    Pentium,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid CPU configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{fpu:?} coprocessor cannot be fitted to an {}", .model.name())]
    Incompatible { model: CpuModel, fpu: FpuModel },
}

/// Machine configuration, loadable from JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub fpu: FpuModel,
    /// FCOMPP detection workaround; `None` picks it from the FPU model
    pub fpu_detection_quirk: Option<bool>,
    /// Prefetch unit shape; `None` picks it from the CPU model
    pub prefetch: Option<PrefetchConfig>,
}

impl CpuConfig {
    pub fn for_model(model: CpuModel) -> Self {
        Self {
            model,
            fpu: model.default_fpu(),
            fpu_detection_quirk: None,
            prefetch: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let ok = match (self.model, self.fpu) {
            (CpuModel::Intel80286, fpu) => fpu == FpuModel::I287,
            (CpuModel::Intel80386, fpu) => matches!(fpu, FpuModel::I287 | FpuModel::I387),
            (CpuModel::Intel80486, fpu) => matches!(fpu, FpuModel::I387 | FpuModel::I487),
            (CpuModel::Pentium, fpu) => fpu == FpuModel::Pentium,
        };
        if ok {
            Ok(())
        } else {
            Err(ConfigError::Incompatible {
                model: self.model,
                fpu: self.fpu,
            })
        }
    }

    /// Whether FCOMPP applies the 387 detection workaround
    pub fn detection_quirk(&self) -> bool {
        self.fpu_detection_quirk
            .unwrap_or(self.fpu != FpuModel::I287)
    }

    pub fn prefetch_config(&self) -> PrefetchConfig {
        self.prefetch
            .unwrap_or_else(|| PrefetchConfig::for_model(self.model))
    }
}

/// Outcome of a failed instruction, reported to the fault dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("memory access aborted")]
    MemoryAbort,
    #[error("general protection fault")]
    GeneralProtection,
    #[error("code segment load failed for selector {selector:#06x}")]
    SegmentLoad { selector: u16 },
    #[error("coprocessor not available")]
    DeviceNotAvailable,
    #[error("unmasked floating-point exception")]
    MathFault,
    #[error("opcode {opcode:#04x} is not handled by this core")]
    InvalidOpcode { opcode: u8 },
}

/// Hidden part of a segment register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    /// Limit in bytes
    pub limit: u32,
    pub access: u8,
    /// D/B bit
    pub big: bool,
}

impl SegmentCache {
    /// Real mode (and V86 mode, with `dpl` 3) segment: 64K at `selector << 4`
    pub fn real(selector: u16, dpl: u8) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            access: 0x93 | ((dpl & 0x3) << 5),
            big: false,
        }
    }

    /// 4GB flat data segment, used for descriptor table reads
    pub fn flat() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: 0x93,
            big: true,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn from_descriptor(selector: u16, desc: &SegmentDescriptor) -> Self {
        Self {
            selector,
            base: desc.base,
            limit: desc.byte_limit(),
            access: desc.access,
            big: desc.is_big(),
        }
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 0x3
    }
}

/// Segment register name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegReg {
    ES,
    CS,
    SS,
    DS,
    FS,
    GS,
}

/// Decoded memory operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveAddress {
    pub seg: SegReg,
    pub offset: u32,
}

impl EffectiveAddress {
    pub fn new(seg: SegReg, offset: u32) -> Self {
        Self { seg, offset }
    }
}

/// One instruction as delivered by the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedOp {
    pub opcode: u8,
    /// Bytes following the opcode, little-endian (ModRM first, or imm16)
    pub fetchdat: u32,
    /// 32-bit operand size
    pub op32: bool,
    /// 32-bit addressing
    pub ea32: bool,
    /// Decoded ModRM memory operand, if any
    pub ea: Option<EffectiveAddress>,
}

impl DecodedOp {
    pub fn new(opcode: u8, fetchdat: u32) -> Self {
        Self {
            opcode,
            fetchdat,
            op32: false,
            ea32: false,
            ea: None,
        }
    }

    pub fn with_op32(mut self, op32: bool) -> Self {
        self.op32 = op32;
        self
    }

    pub fn with_ea(mut self, ea: EffectiveAddress) -> Self {
        self.ea = Some(ea);
        self
    }

    #[inline]
    fn modrm(&self) -> u8 {
        self.fetchdat as u8
    }
}

/// Control transfer in progress, visible to the protected mode unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    FarReturn,
    Iret,
}

/// Index of ESP in `CpuState::regs`
pub const REG_ESP: usize = 4;

/// Architectural state of the processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuState {
    /// EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI
    pub regs: [u32; 8],
    /// Instruction pointer (offset into CS)
    pub pc: u32,
    /// Instruction pointer at the start of the current instruction
    pub oxpc: u32,
    /// FLAGS (low word of EFLAGS)
    pub flags: u16,
    /// High word of EFLAGS (RF, VM, AC, VIF, VIP, ID)
    pub eflags: u16,
    pub lazy: LazyFlags,

    pub cs: SegmentCache,
    pub ds: SegmentCache,
    pub es: SegmentCache,
    pub ss: SegmentCache,
    pub fs: SegmentCache,
    pub gs: SegmentCache,
    /// SS is a 32-bit stack (ESP rather than SP)
    pub stack32: bool,
    /// CS default operand size is 32-bit
    pub use32: bool,

    pub protected_mode: ProtectedModeState,

    /// Latched by a refused memory access; cleared at the next dispatch
    pub abrt: bool,
    pub optype: Option<TransferKind>,
    pub nmi_enable: bool,
    /// The last instruction ended a translated/cached block
    pub block_end: bool,

    pub fpu: FpuState,
}

impl CpuState {
    /// Power-on state: real mode at F000:FFF0
    pub fn new() -> Self {
        Self {
            regs: [0; 8],
            pc: 0xFFF0,
            oxpc: 0xFFF0,
            flags: FLAG_RESERVED1,
            eflags: 0,
            lazy: LazyFlags::default(),
            cs: SegmentCache::real(0xF000, 0),
            ds: SegmentCache::real(0, 0),
            es: SegmentCache::real(0, 0),
            ss: SegmentCache::real(0, 0),
            fs: SegmentCache::real(0, 0),
            gs: SegmentCache::real(0, 0),
            stack32: false,
            use32: false,
            protected_mode: ProtectedModeState::new(),
            abrt: false,
            optype: None,
            nmi_enable: true,
            block_end: false,
            fpu: FpuState::new(),
        }
    }

    /// CR0.PE
    #[inline]
    pub fn pe(&self) -> bool {
        self.protected_mode.is_protected_mode()
    }

    /// EFLAGS.VM
    #[inline]
    pub fn vm(&self) -> bool {
        self.eflags & EFLAG_VM != 0
    }

    /// CR4.VME
    #[inline]
    pub fn vme(&self) -> bool {
        self.protected_mode.vme_enabled()
    }

    #[inline]
    pub fn iopl(&self) -> u8 {
        iopl(self.flags)
    }

    /// Current privilege level
    pub fn cpl(&self) -> u8 {
        if !self.pe() {
            0
        } else if self.vm() {
            3
        } else {
            self.cs.dpl()
        }
    }

    #[inline]
    pub fn sp(&self) -> u16 {
        self.regs[REG_ESP] as u16
    }

    #[inline]
    pub fn esp(&self) -> u32 {
        self.regs[REG_ESP]
    }

    /// Write SP, leaving the high half of ESP alone
    #[inline]
    pub fn set_sp(&mut self, sp: u16) {
        self.regs[REG_ESP] = (self.regs[REG_ESP] & 0xFFFF_0000) | sp as u32;
    }

    #[inline]
    pub fn set_esp(&mut self, esp: u32) {
        self.regs[REG_ESP] = esp;
    }

    /// Offset of the stack top: ESP on a 32-bit stack, SP otherwise
    #[inline]
    pub fn stack_top(&self) -> u32 {
        if self.stack32 {
            self.esp()
        } else {
            self.sp() as u32
        }
    }

    /// Release `bytes` from the stack with the width selected by `stack32`
    pub fn adjust_sp(&mut self, bytes: u32) {
        if self.stack32 {
            self.set_esp(self.esp().wrapping_add(bytes));
        } else {
            self.set_sp(self.sp().wrapping_add(bytes as u16));
        }
    }

    pub fn segment(&self, reg: SegReg) -> SegmentCache {
        match reg {
            SegReg::ES => self.es,
            SegReg::CS => self.cs,
            SegReg::SS => self.ss,
            SegReg::DS => self.ds,
            SegReg::FS => self.fs,
            SegReg::GS => self.gs,
        }
    }

    pub fn segment_mut(&mut self, reg: SegReg) -> &mut SegmentCache {
        match reg {
            SegReg::ES => &mut self.es,
            SegReg::CS => &mut self.cs,
            SegReg::SS => &mut self.ss,
            SegReg::DS => &mut self.ds,
            SegReg::FS => &mut self.fs,
            SegReg::GS => &mut self.gs,
        }
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u16, value: bool) {
        if value {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    #[inline]
    pub fn get_flag(&self, flag: u16) -> bool {
        (self.flags & flag) != 0
    }

    /// Full 32-bit EFLAGS
    #[inline]
    pub fn eflags32(&self) -> u32 {
        ((self.eflags as u32) << 16) | self.flags as u32
    }

    /// VIF and VIP as seen by the VME redirection checks
    #[inline]
    pub fn virtual_interrupt_bits(&self) -> (bool, bool) {
        (self.eflags & EFLAG_VIF != 0, self.eflags & EFLAG_VIP != 0)
    }
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// x86 processor: architectural state plus the collaborators it drives.
///
/// The processor talks to guest memory through the bus `B` and reports
/// cycles to `T`. Protected mode segment loads and privilege-checked
/// returns go through replaceable trait objects.
pub struct CpuX86<B: MemoryBus, T: TimingModel = PrefetchQueue> {
    pub state: CpuState,
    /// Memory interface
    pub bus: B,
    pub timing: T,
    pub(crate) loader: Box<dyn SegmentLoader>,
    pub(crate) pmode: Box<dyn ProtectedModeReturns>,
    pub(crate) host_fpu: HostFpu,
    pub(crate) config: CpuConfig,
    pub(crate) control_timings: ControlTimings,
    pub(crate) x87_timings: X87Timings,
}

impl<B: MemoryBus> CpuX86<B, PrefetchQueue> {
    /// Create a 486DX with the default collaborators
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, CpuConfig::default())
    }

    pub fn with_config(bus: B, config: CpuConfig) -> Self {
        let timing = PrefetchQueue::new(config.prefetch_config());
        Self::with_parts(bus, timing, config)
    }
}

impl<B: MemoryBus, T: TimingModel> CpuX86<B, T> {
    pub fn with_parts(bus: B, timing: T, config: CpuConfig) -> Self {
        let control_timings = ControlTimings::for_model(config.model);
        Self {
            state: CpuState::new(),
            bus,
            timing,
            loader: Box::new(DescriptorSegmentLoader),
            pmode: Box::new(DescriptorReturns::new(control_timings)),
            host_fpu: HostFpu::new(),
            config,
            control_timings,
            x87_timings: X87Timings::for_model(config.fpu),
        }
    }

    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    pub fn model(&self) -> CpuModel {
        self.config.model
    }

    /// Replace the code segment loader
    pub fn set_segment_loader(&mut self, loader: Box<dyn SegmentLoader>) {
        self.loader = loader;
    }

    /// Replace the protected mode RETF/IRET unit
    pub fn set_protected_mode_unit(&mut self, unit: Box<dyn ProtectedModeReturns>) {
        self.pmode = unit;
    }

    pub fn control_timings(&self) -> &ControlTimings {
        &self.control_timings
    }

    pub fn x87_timings(&self) -> &X87Timings {
        &self.x87_timings
    }

    pub fn set_x87_timings(&mut self, timings: X87Timings) {
        self.x87_timings = timings;
    }

    /// Rounding state of the host FPU
    pub fn host_fpu(&self) -> &HostFpu {
        &self.host_fpu
    }

    pub fn reset(&mut self) {
        self.state = CpuState::new();
        self.host_fpu = HostFpu::new();
    }

    /// Per-instruction scratch reset
    fn begin_instruction(&mut self) {
        self.state.abrt = false;
        self.state.optype = None;
        self.state.block_end = false;
        self.state.oxpc = self.state.pc;
    }

    /// Execute one decoded instruction and return the cycles it took.
    ///
    /// On a fault the instruction pointer is rolled back to the start of
    /// the instruction and the fault is handed back for vectoring.
    pub fn execute(&mut self, op: DecodedOp) -> Result<u32, Fault> {
        self.begin_instruction();

        let result = match op.opcode {
            // RETF imm16
            0xCA => self.far_return(op.op32, op.fetchdat as u16),
            // RETF
            0xCB => self.far_return(op.op32, 0),
            // IRETD
            0xCF if op.op32 => self.iret_32(),
            // IRET
            0xCF => {
                let variant = if self.config.model == CpuModel::Intel80286 {
                    IretVariant::Legacy286
                } else {
                    IretVariant::Modern
                };
                self.iret_16(variant)
            }
            0xD8..=0xDF => self.execute_x87(&op),
            opcode => {
                log(LogCategory::CPU, LogLevel::Warn, || {
                    format!("opcode {:02X} not handled by this core", opcode)
                });
                Err(Fault::InvalidOpcode { opcode })
            }
        };

        match result {
            Ok(cycles) => {
                let run = self.prefetch_shape(&op, cycles);
                self.timing.prefetch_run(run);
                if matches!(op.opcode, 0xCA | 0xCB | 0xCF) {
                    self.timing.prefetch_flush();
                }
                Ok(cycles)
            }
            Err(fault) => {
                self.state.pc = self.state.oxpc;
                log(LogCategory::Faults, LogLevel::Debug, || {
                    format!(
                        "{} at {:04X}:{:08X} (opcode {:02X})",
                        fault, self.state.cs.selector, self.state.oxpc, op.opcode
                    )
                });
                Err(fault)
            }
        }
    }

    /// Fixed prefetch shape of each opcode handled here
    fn prefetch_shape(&self, op: &DecodedOp, cycles: u32) -> PrefetchRun {
        let mut run = PrefetchRun {
            instr_cycles: cycles,
            bytes: 1,
            ea32: op.ea32,
            ..PrefetchRun::default()
        };
        let pops = |n: u32, run: &mut PrefetchRun| {
            if op.op32 {
                run.reads_l = n;
            } else {
                run.reads = n;
            }
        };
        match op.opcode {
            0xCA => {
                run.bytes = 3;
                pops(2, &mut run);
            }
            0xCB => pops(2, &mut run),
            0xCF => pops(3, &mut run),
            0xD8..=0xDF => {
                run.bytes = 2;
                let modrm = op.modrm();
                if modrm < 0xC0 {
                    run.modrm = Some(op.fetchdat as u16);
                    match memory_operand(op.opcode) {
                        Some(MemoryOperand::Int16) => run.reads = 1,
                        Some(MemoryOperand::Float64) => run.reads_l = 2,
                        Some(_) => run.reads_l = 1,
                        None => {}
                    }
                }
            }
            _ => {}
        }
        run
    }
}

/// Which of the two IRET entry points is executing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IretVariant {
    /// 80286 IRET: keeps FLAGS bits 12-14 and drops the popped ones on a 16-bit stack
    Legacy286,
    /// 386+ IRET, including the VME redirection path
    Modern,
}

#[cfg(test)]
mod tests;
