//! Cycle accounting and the prefetch queue simulator.
//!
//! Handlers charge their own base cost through [`TimingModel::charge_cycles`].
//! After a successful instruction the dispatcher reports its shape (length,
//! ModRM, memory traffic) with [`TimingModel::prefetch_run`], and control
//! transfers then empty the queue with [`TimingModel::prefetch_flush`].

use crate::cpu_x86::{CpuModel, FpuModel};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

/// Shape of a completed instruction, for prefetch accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefetchRun {
    pub instr_cycles: u32,
    /// Opcode bytes consumed, excluding ModRM displacement
    pub bytes: u32,
    /// ModRM byte, with the SIB byte in bits 8-15 for 32-bit addressing
    pub modrm: Option<u16>,
    pub reads: u32,
    pub reads_l: u32,
    pub writes: u32,
    pub writes_l: u32,
    pub ea32: bool,
}

/// Receiver for cycle and prefetch events
pub trait TimingModel {
    fn charge_cycles(&mut self, cycles: u32);
    fn prefetch_run(&mut self, run: PrefetchRun);
    fn prefetch_flush(&mut self);
}

/// Prefetch queue model for the 286 through Pentium.
///
/// The queue refills `width` bytes per `fetch_cycles` of instruction time
/// not spent on data accesses. Running dry stalls the core for the
/// missing fetches, which shows up in `total_cycles`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchQueue {
    bytes: i32,
    width: i32,
    fetch_cycles: i32,
    read_cycles: i32,
    read_l_cycles: i32,
    write_cycles: i32,
    write_l_cycles: i32,
    total_cycles: u64,
    stall_cycles: u64,
    flushes: u64,
}

/// Queue capacity in bytes
const PREFETCH_MAX: i32 = 16;

/// Bus shape of the prefetch unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefetchConfig {
    /// Bytes delivered per code fetch
    pub width: u32,
    /// Cycles per code fetch
    pub fetch_cycles: u32,
    /// Cycles per data word / dword read
    pub read_cycles: u32,
    pub read_l_cycles: u32,
    /// Cycles per data word / dword write
    pub write_cycles: u32,
    pub write_l_cycles: u32,
}

impl PrefetchConfig {
    pub fn for_model(model: CpuModel) -> Self {
        let (width, fetch_cycles, read_cycles, read_l_cycles, write_cycles, write_l_cycles) =
            match model {
                CpuModel::Intel80286 => (2, 2, 2, 4, 2, 4),
                CpuModel::Intel80386 => (4, 2, 2, 2, 2, 2),
                CpuModel::Intel80486 => (4, 1, 1, 1, 1, 1),
                CpuModel::Pentium => (8, 1, 1, 1, 1, 1),
            };
        Self {
            width,
            fetch_cycles,
            read_cycles,
            read_l_cycles,
            write_cycles,
            write_l_cycles,
        }
    }
}

impl PrefetchQueue {
    pub fn new(config: PrefetchConfig) -> Self {
        Self {
            bytes: 0,
            // A zero-width or zero-cycle fetch would never refill the queue.
            width: config.width.max(1) as i32,
            fetch_cycles: config.fetch_cycles.max(1) as i32,
            read_cycles: config.read_cycles as i32,
            read_l_cycles: config.read_l_cycles as i32,
            write_cycles: config.write_cycles as i32,
            write_l_cycles: config.write_l_cycles as i32,
            total_cycles: 0,
            stall_cycles: 0,
            flushes: 0,
        }
    }

    pub fn for_model(model: CpuModel) -> Self {
        Self::new(PrefetchConfig::for_model(model))
    }

    /// Bytes currently queued
    pub fn queued(&self) -> i32 {
        self.bytes
    }

    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Cycles lost waiting on an empty queue
    pub fn stall_cycles(&self) -> u64 {
        self.stall_cycles
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Displacement bytes implied by a ModRM (and SIB) encoding
    fn displacement(modrm: u16, ea32: bool) -> i32 {
        let mode = modrm & 0xC0;
        if ea32 {
            if modrm & 0x07 == 4 {
                // SIB byte follows; base=5 with mod=0 means disp32
                if modrm & 0x700 == 0x500 && mode == 0 {
                    5
                } else if mode == 0x40 {
                    2
                } else if mode == 0x80 {
                    5
                } else {
                    1
                }
            } else if modrm & 0xC7 == 0x05 || mode == 0x80 {
                4
            } else if mode == 0x40 {
                1
            } else {
                0
            }
        } else if modrm & 0xC7 == 0x06 {
            2
        } else if mode != 0xC0 {
            (mode >> 6) as i32
        } else {
            0
        }
    }
}

impl Default for PrefetchQueue {
    fn default() -> Self {
        Self::for_model(CpuModel::Intel80486)
    }
}

impl TimingModel for PrefetchQueue {
    fn charge_cycles(&mut self, cycles: u32) {
        self.total_cycles += cycles as u64;
    }

    fn prefetch_run(&mut self, run: PrefetchRun) {
        let mem_cycles = run.reads as i32 * self.read_cycles
            + run.reads_l as i32 * self.read_l_cycles
            + run.writes as i32 * self.write_cycles
            + run.writes_l as i32 * self.write_l_cycles;
        let mut instr_cycles = (run.instr_cycles as i32).max(mem_cycles);

        self.bytes -= run.bytes as i32;
        if let Some(modrm) = run.modrm {
            self.bytes -= Self::displacement(modrm, run.ea32);
        }

        // Ran dry: stall for the missing fetches
        let mut stall = 0u64;
        while self.bytes < 0 {
            self.bytes += self.width;
            stall += self.fetch_cycles as u64;
        }
        if stall != 0 {
            self.stall_cycles += stall;
            self.total_cycles += stall;
            log(LogCategory::Timing, LogLevel::Trace, || {
                format!("prefetch stall: {} cycles, {} byte instruction", stall, run.bytes)
            });
        }

        instr_cycles -= mem_cycles;
        while instr_cycles >= self.fetch_cycles {
            self.bytes += self.width;
            instr_cycles -= self.fetch_cycles;
        }

        self.bytes = self.bytes.min(PREFETCH_MAX);
    }

    fn prefetch_flush(&mut self) {
        self.bytes = 0;
        self.flushes += 1;
    }
}

/// Base costs of the far control transfers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlTimings {
    pub retf_rm: u32,
    pub retf_pm: u32,
    pub retf_pm_outer: u32,
    pub iret_rm: u32,
    pub iret_pm: u32,
    pub iret_pm_outer: u32,
}

impl ControlTimings {
    pub fn for_model(model: CpuModel) -> Self {
        let (retf_rm, retf_pm, retf_pm_outer, iret_rm, iret_pm, iret_pm_outer) = match model {
            CpuModel::Intel80286 => (15, 25, 55, 17, 31, 55),
            CpuModel::Intel80386 => (18, 32, 68, 22, 38, 82),
            CpuModel::Intel80486 => (13, 18, 33, 15, 20, 36),
            CpuModel::Pentium => (4, 4, 23, 7, 10, 27),
        };
        Self {
            retf_rm,
            retf_pm,
            retf_pm_outer,
            iret_rm,
            iret_pm,
            iret_pm_outer,
        }
    }
}

/// Source operand class of an x87 instruction, for cost lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    Register,
    Float32,
    Float64,
    Int16,
    Int32,
}

/// Costs of one x87 instruction family per operand class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandCosts {
    pub reg: u32,
    pub m32: u32,
    pub m64: u32,
    pub i16: u32,
    pub i32: u32,
}

impl OperandCosts {
    pub const fn new(reg: u32, m32: u32, m64: u32, i16: u32, i32: u32) -> Self {
        Self {
            reg,
            m32,
            m64,
            i16,
            i32,
        }
    }

    pub fn get(&self, class: OperandClass) -> u32 {
        match class {
            OperandClass::Register => self.reg,
            OperandClass::Float32 => self.m32,
            OperandClass::Float64 => self.m64,
            OperandClass::Int16 => self.i16,
            OperandClass::Int32 => self.i32,
        }
    }
}

/// Coprocessor cost table. SUB/SUBR share the ADD costs and DIVR shares DIV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct X87Timings {
    pub fadd: OperandCosts,
    pub fcom: OperandCosts,
    pub fmul: OperandCosts,
    pub fdiv: OperandCosts,
    pub fcompp: u32,
    pub fucom: u32,
    pub fcomi: u32,
}

impl X87Timings {
    pub fn for_model(model: FpuModel) -> Self {
        match model {
            FpuModel::I287 => Self {
                fadd: OperandCosts::new(85, 105, 110, 120, 125),
                fcom: OperandCosts::new(45, 65, 70, 80, 85),
                fmul: OperandCosts::new(97, 118, 161, 130, 136),
                fdiv: OperandCosts::new(198, 220, 225, 230, 236),
                fcompp: 50,
                fucom: 45,
                fcomi: 45,
            },
            FpuModel::I387 => Self {
                fadd: OperandCosts::new(23, 24, 29, 71, 57),
                fcom: OperandCosts::new(24, 26, 31, 71, 56),
                fmul: OperandCosts::new(46, 27, 32, 76, 61),
                fdiv: OperandCosts::new(88, 89, 94, 136, 120),
                fcompp: 26,
                fucom: 24,
                fcomi: 24,
            },
            FpuModel::I487 => Self {
                fadd: OperandCosts::new(8, 8, 8, 20, 19),
                fcom: OperandCosts::new(4, 4, 4, 16, 15),
                fmul: OperandCosts::new(16, 11, 14, 23, 22),
                fdiv: OperandCosts::new(73, 73, 73, 85, 84),
                fcompp: 5,
                fucom: 4,
                fcomi: 4,
            },
            FpuModel::Pentium => Self {
                fadd: OperandCosts::new(3, 3, 3, 7, 7),
                fcom: OperandCosts::new(4, 4, 4, 8, 8),
                fmul: OperandCosts::new(3, 3, 3, 7, 7),
                fdiv: OperandCosts::new(39, 39, 39, 42, 42),
                fcompp: 4,
                fucom: 4,
                fcomi: 4,
            },
        }
    }
}

impl Default for X87Timings {
    fn default() -> Self {
        Self::for_model(FpuModel::I487)
    }
}
