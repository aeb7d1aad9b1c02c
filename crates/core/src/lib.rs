//! x86 processor core primitives: far control transfers and the x87 stack.

pub mod cpu_x86;
pub mod cpu_x86_bus;
pub mod cpu_x86_control;
pub mod cpu_x86_flags;
pub mod cpu_x86_protected;
pub mod cpu_x86_timing;
pub mod cpu_x87;
pub mod logging;

pub use cpu_x86::{
    ConfigError, CpuConfig, CpuModel, CpuState, CpuX86, DecodedOp, EffectiveAddress, Fault,
    FpuModel, IretVariant, SegReg, SegmentCache,
};
pub use cpu_x86_bus::{BusFault, LinearMemory, MemoryBus};
pub use cpu_x86_control::ReturnPath;
pub use cpu_x86_protected::{PmodeContext, ProtectedModeReturns, SegmentLoader};
pub use cpu_x86_timing::{PrefetchQueue, PrefetchRun, TimingModel};
pub use cpu_x87::{ArithForm, ArithOp, CompareKind, FpuState, MemoryOperand, Operand};

/// A CPU-like component that executes decoded instructions; returns cycles consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn execute(&mut self, op: DecodedOp) -> Result<u32, Fault>;
}

impl<B: MemoryBus, T: TimingModel> Cpu for CpuX86<B, T> {
    fn reset(&mut self) {
        CpuX86::reset(self);
    }

    fn execute(&mut self, op: DecodedOp) -> Result<u32, Fault> {
        CpuX86::execute(self, op)
    }
}
