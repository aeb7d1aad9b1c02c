//! Tests for the x86 control transfer and x87 units
//!
//! Tests are organized by instruction group:
//! - `tests_retf`: RETF / RETF imm16 in every mode
//! - `tests_iret`: IRET/IRETD real mode entry points and protected mode returns
//! - `tests_vme`: virtual-8086 mode IRET gating and VME redirection
//! - `tests_x87_arith`: FADD/FSUB/FSUBR/FMUL/FDIV/FDIVR
//! - `tests_x87_compare`: FCOM/FUCOM/FCOMPP/FCOMI families
//! - `tests_timing`: cycle charging, prefetch shapes and configuration

mod tests_timing;
mod tests_vme;

use crate::cpu_x86::{CpuConfig, CpuModel, CpuState, CpuX86, Fault, SegmentCache, TransferKind};
use crate::cpu_x86_bus::{LinearMemory, MemoryBus};
use crate::cpu_x86_protected::{
    PmodeContext, ProtectedModeReturns, SegmentDescriptor, SegmentLoader,
};
use crate::cpu_x86_timing::{PrefetchRun, TimingModel};
use std::cell::RefCell;
use std::rc::Rc;

/// Timing model that records every event
#[derive(Debug, Default)]
pub(super) struct RecordingTiming {
    pub charged: Vec<u32>,
    pub runs: Vec<PrefetchRun>,
    pub flushes: u32,
}

impl TimingModel for RecordingTiming {
    fn charge_cycles(&mut self, cycles: u32) {
        self.charged.push(cycles);
    }

    fn prefetch_run(&mut self, run: PrefetchRun) {
        self.runs.push(run);
    }

    fn prefetch_flush(&mut self) {
        self.flushes += 1;
    }
}

pub(super) type TestCpu = CpuX86<LinearMemory, RecordingTiming>;

pub(super) fn cpu(model: CpuModel) -> TestCpu {
    cpu_with_config(CpuConfig::for_model(model))
}

pub(super) fn cpu_with_config(config: CpuConfig) -> TestCpu {
    CpuX86::with_parts(LinearMemory::new(), RecordingTiming::default(), config)
}

/// Point SS:(E)SP at a stack with the given words on top (first word at the top)
pub(super) fn set_stack(cpu: &mut TestCpu, ss: SegmentCache, esp: u32, stack32: bool, words: &[u16]) {
    cpu.state.ss = ss;
    cpu.state.stack32 = stack32;
    cpu.state.set_esp(esp);
    let top = if stack32 { esp } else { esp & 0xFFFF };
    for (i, w) in words.iter().enumerate() {
        let offset = top.wrapping_add(2 * i as u32);
        let offset = if stack32 { offset } else { offset & 0xFFFF };
        cpu.bus.write_u16(ss.base.wrapping_add(offset), *w);
    }
}

/// Replace the frame on the current stack
pub(super) fn set_frame(cpu: &mut TestCpu, esp: u32, words: &[u16]) {
    let (ss, stack32) = (cpu.state.ss, cpu.state.stack32);
    set_stack(cpu, ss, esp, stack32, words);
}

/// Linear address of SS:(E)SP + n
pub(super) fn stack_linear(cpu: &TestCpu, n: u32) -> u32 {
    cpu.state.ss.base.wrapping_add(cpu.state.stack_top() + n)
}

/// Refuses every code segment load
pub(super) struct RefusingLoader;

impl SegmentLoader for RefusingLoader {
    fn load_code_segment(
        &mut self,
        _state: &mut CpuState,
        _bus: &mut dyn MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        Err(Fault::SegmentLoad { selector })
    }
}

/// Call made to the protected mode unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct PmodeCall {
    pub kind: TransferKind,
    pub op32: bool,
    pub dealloc: u16,
    pub optype: Option<TransferKind>,
}

/// Protected mode unit that records its calls and charges a fixed cost
pub(super) struct RecordingPmode {
    pub calls: Rc<RefCell<Vec<PmodeCall>>>,
    pub cycles: u32,
}

impl ProtectedModeReturns for RecordingPmode {
    fn far_return(&mut self, ctx: PmodeContext<'_>, op32: bool, dealloc: u16) -> Result<u32, Fault> {
        self.calls.borrow_mut().push(PmodeCall {
            kind: TransferKind::FarReturn,
            op32,
            dealloc,
            optype: ctx.state.optype,
        });
        Ok(self.cycles)
    }

    fn iret(&mut self, ctx: PmodeContext<'_>, op32: bool) -> Result<u32, Fault> {
        self.calls.borrow_mut().push(PmodeCall {
            kind: TransferKind::Iret,
            op32,
            dealloc: 0,
            optype: ctx.state.optype,
        });
        Ok(self.cycles)
    }
}

pub(super) fn recording_pmode(cpu: &mut TestCpu, cycles: u32) -> Rc<RefCell<Vec<PmodeCall>>> {
    let calls = Rc::new(RefCell::new(Vec::new()));
    cpu.set_protected_mode_unit(Box::new(RecordingPmode {
        calls: Rc::clone(&calls),
        cycles,
    }));
    calls
}

// GDT used by the protected mode tests
pub(super) const GDT_BASE: u32 = 0x1000;
pub(super) const SEL_CODE0: u16 = 0x08;
pub(super) const SEL_DATA0: u16 = 0x10;
pub(super) const SEL_CODE3: u16 = 0x1B;
pub(super) const SEL_DATA3: u16 = 0x23;
pub(super) const SEL_CODE0_32: u16 = 0x28;

/// Enter protected mode at CPL 0 with a small GDT and a ring 0 stack at SS:0x8000
pub(super) fn enter_protected_mode(cpu: &mut TestCpu) {
    let descriptors: [[u8; 8]; 6] = [
        [0; 8],
        // 64K ring 0 code, 16-bit
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0x00, 0x00],
        // 64K ring 0 data
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x92, 0x00, 0x00],
        // 64K ring 3 code
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0xFA, 0x00, 0x00],
        // 64K ring 3 data
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0xF2, 0x00, 0x00],
        // 4GB ring 0 code, 32-bit
        [0xFF, 0xFF, 0x00, 0x00, 0x00, 0x9A, 0xCF, 0x00],
    ];
    for (i, d) in descriptors.iter().enumerate() {
        cpu.bus.load(GDT_BASE + 8 * i as u32, d);
    }

    let pm = &mut cpu.state.protected_mode;
    pm.enable_protected_mode();
    pm.load_gdtr(GDT_BASE, (descriptors.len() * 8 - 1) as u16, true);

    let code = SegmentDescriptor::from_bytes(&descriptors[1]);
    let data = SegmentDescriptor::from_bytes(&descriptors[2]);
    cpu.state.cs = SegmentCache::from_descriptor(SEL_CODE0, &code);
    cpu.state.ds = SegmentCache::from_descriptor(SEL_DATA0, &data);
    cpu.state.es = SegmentCache::from_descriptor(SEL_DATA0, &data);
    let ss = SegmentCache::from_descriptor(SEL_DATA0, &data);
    set_stack(cpu, ss, 0x8000, false, &[]);
}
