//! x87 coprocessor: register stack, host rounding and the arithmetic /
//! compare instruction family.
//!
//! Registers hold host doubles. The control word rounding mode is applied
//! per operation through a [`RoundingScope`], which computes the correctly
//! rounded result for the selected direction and puts the host back to
//! round-to-nearest when it goes out of scope.
//!
//! All ESC opcodes share two generic handlers, [`CpuX86::fpu_arith`] and
//! [`CpuX86::fpu_compare`], selected from static tables keyed by opcode and
//! ModRM reg field.

use crate::cpu_x86::{CpuX86, DecodedOp, EffectiveAddress, Fault};
use crate::cpu_x86_bus::{checked, MemoryBus};
use crate::cpu_x86_flags::{FLAG_CF, FLAG_PF, FLAG_ZF};
use crate::cpu_x86_protected::{CR0_EM, CR0_TS};
use crate::cpu_x86_timing::{OperandClass, TimingModel, X87Timings};
use crate::logging::{log, LogCategory, LogLevel};
use serde::{Deserialize, Serialize};

// Tag byte values
pub const TAG_EMPTY: u8 = 0;
pub const TAG_VALID: u8 = 1;
/// Slot was loaded through the integer path
pub const TAG_UINT64: u8 = 0x80;

// Status word
pub const FPU_IE: u16 = 0x0001;
pub const FPU_ZE: u16 = 0x0004;
pub const FPU_ES: u16 = 0x0080;
pub const C0: u16 = 0x0100;
pub const C1: u16 = 0x0200;
pub const C2: u16 = 0x0400;
pub const C3: u16 = 0x4000;
const SW_TOP: u16 = 0x3800;

/// FNINIT control word: all exceptions masked, 64-bit precision, nearest
pub const DEFAULT_CONTROL_WORD: u16 = 0x037F;

/// Default NaN produced by a masked invalid operation
const INDEFINITE: u64 = 0xFFF8_0000_0000_0000;

/// Rounding control field (control word bits 10-11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoundingMode {
    #[default]
    Nearest,
    Down,
    Up,
    TowardZero,
}

impl RoundingMode {
    pub fn from_control_word(npxc: u16) -> Self {
        match (npxc >> 10) & 0x3 {
            0 => RoundingMode::Nearest,
            1 => RoundingMode::Down,
            2 => RoundingMode::Up,
            _ => RoundingMode::TowardZero,
        }
    }
}

/// Rounding state of the host floating-point unit
#[derive(Debug, Default)]
pub struct HostFpu {
    mode: RoundingMode,
}

impl HostFpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> RoundingMode {
        self.mode
    }

    /// Switch to `mode` until the returned scope is dropped
    pub fn scoped(&mut self, mode: RoundingMode) -> RoundingScope<'_> {
        self.mode = mode;
        RoundingScope { host: self }
    }
}

/// Arithmetic under a directed rounding mode; restores nearest on drop.
///
/// Results are computed in round-to-nearest and corrected by one ulp using
/// the exact error of the operation (two-sum for add, fused multiply-add
/// for multiply and the division remainder).
pub struct RoundingScope<'a> {
    host: &'a mut HostFpu,
}

impl RoundingScope<'_> {
    pub fn mode(&self) -> RoundingMode {
        self.host.mode
    }

    pub fn add(&self, a: f64, b: f64) -> f64 {
        let s = a + b;
        if !a.is_finite() || !b.is_finite() {
            return s;
        }
        if s.is_infinite() {
            return self.overflowed(s);
        }
        if s == 0.0 {
            // Exact zero: -0 only when rounding down, or from two -0 operands
            let both_positive_zero = a == 0.0 && b == 0.0 && a.is_sign_positive() && b.is_sign_positive();
            return if self.mode() == RoundingMode::Down && !both_positive_zero {
                -0.0
            } else {
                s
            };
        }
        let bb = s - a;
        let err = (a - (s - bb)) + (b - bb);
        self.directed(s, err)
    }

    pub fn sub(&self, a: f64, b: f64) -> f64 {
        self.add(a, -b)
    }

    pub fn mul(&self, a: f64, b: f64) -> f64 {
        let p = a * b;
        if !a.is_finite() || !b.is_finite() {
            return p;
        }
        if p.is_infinite() {
            return self.overflowed(p);
        }
        let err = a.mul_add(b, -p);
        self.directed(p, err)
    }

    pub fn div(&self, a: f64, b: f64) -> f64 {
        let q = a / b;
        if !a.is_finite() || !b.is_finite() || b == 0.0 {
            return q;
        }
        if q.is_infinite() {
            return self.overflowed(q);
        }
        let r = (-q).mul_add(b, a);
        let err = if r == 0.0 {
            0.0
        } else if (r > 0.0) == (b > 0.0) {
            1.0
        } else {
            -1.0
        };
        self.directed(q, err)
    }

    /// `err` is the sign of (exact result - `nearest`)
    fn directed(&self, nearest: f64, err: f64) -> f64 {
        if err == 0.0 || err.is_nan() {
            return nearest;
        }
        match self.mode() {
            RoundingMode::Nearest => nearest,
            RoundingMode::Up if err > 0.0 => next_up(nearest),
            RoundingMode::Down if err < 0.0 => next_down(nearest),
            RoundingMode::TowardZero if nearest > 0.0 && err < 0.0 => next_down(nearest),
            RoundingMode::TowardZero if nearest < 0.0 && err > 0.0 => next_up(nearest),
            _ => nearest,
        }
    }

    fn overflowed(&self, inf: f64) -> f64 {
        match (self.mode(), inf > 0.0) {
            (RoundingMode::Nearest, _) | (RoundingMode::Up, true) | (RoundingMode::Down, false) => inf,
            _ => f64::MAX.copysign(inf),
        }
    }
}

impl Drop for RoundingScope<'_> {
    fn drop(&mut self) {
        self.host.mode = RoundingMode::Nearest;
    }
}

fn next_up(x: f64) -> f64 {
    if x.is_nan() || x == f64::INFINITY {
        return x;
    }
    if x == 0.0 {
        return f64::from_bits(1);
    }
    let bits = x.to_bits();
    if x > 0.0 {
        f64::from_bits(bits + 1)
    } else {
        f64::from_bits(bits - 1)
    }
}

fn next_down(x: f64) -> f64 {
    -next_up(-x)
}

#[inline]
fn is_signalling_nan(x: f64) -> bool {
    x.is_nan() && x.to_bits() & (1 << 51) == 0
}

/// Registers travel as raw bit patterns so infinities and NaNs survive
/// formats without a representation for them.
mod register_bits {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(st: &[f64; 8], serializer: S) -> Result<S::Ok, S::Error> {
        st.map(f64::to_bits).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[f64; 8], D::Error> {
        Ok(<[u64; 8]>::deserialize(deserializer)?.map(f64::from_bits))
    }
}

/// x87 register file and control/status words
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FpuState {
    /// Physical registers R0-R7
    #[serde(with = "register_bits")]
    pub st: [f64; 8],
    pub top: u8,
    pub tag: [u8; 8],
    /// Control word
    pub npxc: u16,
    /// Status word, without TOP
    pub npxs: u16,
}

impl FpuState {
    pub fn new() -> Self {
        Self {
            st: [0.0; 8],
            top: 0,
            tag: [TAG_EMPTY; 8],
            npxc: DEFAULT_CONTROL_WORD,
            npxs: 0,
        }
    }

    /// Physical register behind ST(i)
    #[inline]
    pub fn phys(&self, i: u8) -> usize {
        (self.top.wrapping_add(i) & 7) as usize
    }

    #[inline]
    pub fn st(&self, i: u8) -> f64 {
        self.st[self.phys(i)]
    }

    #[inline]
    pub fn set_st(&mut self, i: u8, value: f64) {
        let p = self.phys(i);
        self.st[p] = value;
    }

    pub fn push(&mut self, value: f64) {
        self.top = self.top.wrapping_sub(1) & 7;
        let p = self.top as usize;
        self.st[p] = value;
        self.tag[p] = TAG_VALID;
    }

    /// FILD-style push: the slot remembers its integer origin
    pub fn push_integer(&mut self, value: i64) {
        self.push(value as f64);
        self.tag[self.top as usize] |= TAG_UINT64;
    }

    pub fn pop(&mut self) {
        self.tag[self.top as usize] = TAG_EMPTY;
        self.top = self.top.wrapping_add(1) & 7;
    }

    /// FNSTSW view: status word with TOP in bits 11-13
    pub fn status_word(&self) -> u16 {
        (self.npxs & !SW_TOP) | (((self.top & 7) as u16) << 11)
    }

    /// FNSTENV view: two bits per physical register
    /// (valid 00, zero 01, special 10, empty 11)
    pub fn tag_word(&self) -> u16 {
        let mut word = 0u16;
        for (i, (&tag, &value)) in self.tag.iter().zip(self.st.iter()).enumerate() {
            let bits = if tag & !TAG_UINT64 == TAG_EMPTY {
                0b11
            } else if value.is_nan() || value.is_infinite() || value.is_subnormal() {
                0b10
            } else if value == 0.0 {
                0b01
            } else {
                0b00
            };
            word |= bits << (i * 2);
        }
        word
    }

    pub fn rounding(&self) -> RoundingMode {
        RoundingMode::from_control_word(self.npxc)
    }

    #[inline]
    fn set_condition_codes(&mut self, codes: u16) {
        self.npxs = (self.npxs & !(C0 | C2 | C3)) | codes;
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Condition codes for comparing `a` with `b`
pub fn compare(a: f64, b: f64) -> u16 {
    if a.is_nan() || b.is_nan() {
        C0 | C2 | C3
    } else if a == b {
        C3
    } else if a < b {
        C0
    } else {
        0
    }
}

/// Width and type of a memory source operand
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOperand {
    Float32,
    Float64,
    Int16,
    Int32,
}

/// Source operand of an x87 instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// ST(i)
    Register(u8),
    Memory(MemoryOperand, EffectiveAddress),
}

impl Operand {
    pub fn class(&self) -> OperandClass {
        match self {
            Operand::Register(_) => OperandClass::Register,
            Operand::Memory(MemoryOperand::Float32, _) => OperandClass::Float32,
            Operand::Memory(MemoryOperand::Float64, _) => OperandClass::Float64,
            Operand::Memory(MemoryOperand::Int16, _) => OperandClass::Int16,
            Operand::Memory(MemoryOperand::Int32, _) => OperandClass::Int32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    SubR,
    Mul,
    Div,
    DivR,
}

impl ArithOp {
    /// Combine destination `a` with source `b`
    fn apply(self, scope: &RoundingScope<'_>, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => scope.add(a, b),
            ArithOp::Sub => scope.sub(a, b),
            ArithOp::SubR => scope.sub(b, a),
            ArithOp::Mul => scope.mul(a, b),
            ArithOp::Div => scope.div(a, b),
            ArithOp::DivR => scope.div(b, a),
        }
    }

    /// (dividend, divisor) for the division forms
    fn division(self, a: f64, b: f64) -> Option<(f64, f64)> {
        match self {
            ArithOp::Div => Some((a, b)),
            ArithOp::DivR => Some((b, a)),
            _ => None,
        }
    }

    fn cycles(self, timings: &X87Timings, class: OperandClass) -> u32 {
        match self {
            ArithOp::Add | ArithOp::Sub | ArithOp::SubR => timings.fadd.get(class),
            ArithOp::Mul => timings.fmul.get(class),
            ArithOp::Div | ArithOp::DivR => timings.fdiv.get(class),
        }
    }
}

/// Operands and destination of an arithmetic instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithForm {
    /// ST(0) = ST(0) op src
    St0(Operand),
    /// ST(i) = ST(i) op ST(0), popping afterwards for the P forms
    StI { i: u8, pop: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareKind {
    /// FCOM: any NaN is an invalid operation
    Ordered,
    /// FUCOM: only signalling NaNs are invalid
    Unordered,
}

#[derive(Debug, Clone, Copy)]
enum RegisterDest {
    St0,
    StI,
    StIPop,
}

#[derive(Debug, Clone, Copy)]
enum RegisterForm {
    Arith(ArithOp, RegisterDest),
    Compare(CompareKind, u8),
    /// FCOMPP/FUCOMPP, only encoded with ST(1)
    ComparePopTwo(CompareKind),
    CompareEflags(CompareKind, bool),
    Unhandled,
}

#[derive(Debug, Clone, Copy)]
enum MemoryForm {
    Arith(ArithOp),
    Compare(u8),
}

use ArithOp::{Add, Div, DivR, Mul, Sub, SubR};
use CompareKind::{Ordered, Unordered};
use RegisterDest::{St0, StI, StIPop};

const UNHANDLED_ROW: [RegisterForm; 8] = [RegisterForm::Unhandled; 8];

/// Register forms (mod = 3) by ESC opcode and reg field
static REGISTER_FORMS: [[RegisterForm; 8]; 8] = {
    use RegisterForm::{Arith, Compare, CompareEflags, ComparePopTwo, Unhandled as U};
    [
        // D8
        [
            Arith(Add, St0),
            Arith(Mul, St0),
            Compare(Ordered, 0),
            Compare(Ordered, 1),
            Arith(Sub, St0),
            Arith(SubR, St0),
            Arith(Div, St0),
            Arith(DivR, St0),
        ],
        // D9
        UNHANDLED_ROW,
        // DA
        [U, U, U, U, U, ComparePopTwo(Unordered), U, U],
        // DB
        [
            U,
            U,
            U,
            U,
            U,
            CompareEflags(Unordered, false),
            CompareEflags(Ordered, false),
            U,
        ],
        // DC
        [
            Arith(Add, StI),
            Arith(Mul, StI),
            Compare(Ordered, 0),
            Compare(Ordered, 1),
            Arith(SubR, StI),
            Arith(Sub, StI),
            Arith(DivR, StI),
            Arith(Div, StI),
        ],
        // DD
        [U, U, U, U, Compare(Unordered, 0), Compare(Unordered, 1), U, U],
        // DE
        [
            Arith(Add, StIPop),
            Arith(Mul, StIPop),
            Compare(Ordered, 1),
            ComparePopTwo(Ordered),
            Arith(SubR, StIPop),
            Arith(Sub, StIPop),
            Arith(DivR, StIPop),
            Arith(Div, StIPop),
        ],
        // DF
        [
            U,
            U,
            U,
            U,
            U,
            CompareEflags(Unordered, true),
            CompareEflags(Ordered, true),
            U,
        ],
    ]
};

/// Memory forms of D8/DA/DC/DE by reg field
static MEMORY_FORMS: [MemoryForm; 8] = [
    MemoryForm::Arith(Add),
    MemoryForm::Arith(Mul),
    MemoryForm::Compare(0),
    MemoryForm::Compare(1),
    MemoryForm::Arith(Sub),
    MemoryForm::Arith(SubR),
    MemoryForm::Arith(Div),
    MemoryForm::Arith(DivR),
];

/// Memory operand type of an ESC opcode's arithmetic group
pub(crate) fn memory_operand(opcode: u8) -> Option<MemoryOperand> {
    match opcode {
        0xD8 => Some(MemoryOperand::Float32),
        0xDA => Some(MemoryOperand::Int32),
        0xDC => Some(MemoryOperand::Float64),
        0xDE => Some(MemoryOperand::Int16),
        _ => None,
    }
}

impl<B: MemoryBus, T: TimingModel> CpuX86<B, T> {
    /// #NM when the coprocessor is emulated or its state belongs to another task
    fn fp_enter(&self) -> Result<(), Fault> {
        if self.state.protected_mode.cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Fault::DeviceNotAvailable);
        }
        Ok(())
    }

    fn fetch_operand(&mut self, src: Operand) -> Result<f64, Fault> {
        let (kind, ea) = match src {
            Operand::Register(i) => return Ok(self.state.fpu.st(i)),
            Operand::Memory(kind, ea) => (kind, ea),
        };
        let seg = self.state.segment(ea.seg);
        let bus: &mut dyn MemoryBus = &mut self.bus;
        let abrt = &mut self.state.abrt;
        let value = match kind {
            MemoryOperand::Float32 => {
                let r = bus.read_u32(&seg, ea.offset);
                f32::from_bits(checked(bus, abrt, r)?) as f64
            }
            MemoryOperand::Float64 => {
                let r = bus.read_u32(&seg, ea.offset);
                let low = checked(bus, abrt, r)?;
                let r = bus.read_u32(&seg, ea.offset.wrapping_add(4));
                let high = checked(bus, abrt, r)?;
                f64::from_bits(((high as u64) << 32) | low as u64)
            }
            MemoryOperand::Int16 => {
                let r = bus.read_u16(&seg, ea.offset);
                checked(bus, abrt, r)? as i16 as f64
            }
            MemoryOperand::Int32 => {
                let r = bus.read_u32(&seg, ea.offset);
                checked(bus, abrt, r)? as i32 as f64
            }
        };
        Ok(value)
    }

    /// Record exception `exc`; fails with #MF when it is unmasked
    fn raise_fpu_exception(&mut self, exc: u16) -> Result<(), Fault> {
        let fpu = &mut self.state.fpu;
        fpu.npxs |= exc;
        if fpu.npxc & exc != 0 {
            return Ok(());
        }
        fpu.npxs |= FPU_ES;
        log(LogCategory::FPU, LogLevel::Debug, || {
            format!("unmasked x87 exception {:02X}, status {:04X}", exc, fpu.status_word())
        });
        Err(Fault::MathFault)
    }

    fn check_compare_operands(&mut self, kind: CompareKind, a: f64, b: f64) -> Result<(), Fault> {
        let invalid = match kind {
            CompareKind::Ordered => a.is_nan() || b.is_nan(),
            CompareKind::Unordered => is_signalling_nan(a) || is_signalling_nan(b),
        };
        if invalid {
            self.raise_fpu_exception(FPU_IE)?;
        }
        Ok(())
    }

    /// FADD/FSUB/FSUBR/FMUL/FDIV/FDIVR in all operand forms
    pub fn fpu_arith(&mut self, op: ArithOp, form: ArithForm) -> Result<u32, Fault> {
        self.fp_enter()?;
        let (slot, a, b, class, pop) = match form {
            ArithForm::St0(src) => {
                let b = self.fetch_operand(src)?;
                (0, self.state.fpu.st(0), b, src.class(), false)
            }
            ArithForm::StI { i, pop } => {
                let fpu = &self.state.fpu;
                (i & 7, fpu.st(i), fpu.st(0), OperandClass::Register, pop)
            }
        };

        if let Some((dividend, divisor)) = op.division(a, b) {
            if divisor == 0.0 && dividend.is_finite() && dividend != 0.0 {
                // Masked: the host quotient is already the signed infinity.
                self.raise_fpu_exception(FPU_ZE)?;
            }
        }

        let result = {
            let scope = self.host_fpu.scoped(self.state.fpu.rounding());
            op.apply(&scope, a, b)
        };

        let mut result = result;
        if is_signalling_nan(a) || is_signalling_nan(b) {
            self.raise_fpu_exception(FPU_IE)?;
        } else if result.is_nan() && !a.is_nan() && !b.is_nan() {
            self.raise_fpu_exception(FPU_IE)?;
            result = f64::from_bits(INDEFINITE);
        }

        let fpu = &mut self.state.fpu;
        fpu.set_st(slot, result);
        let p = fpu.phys(slot);
        fpu.tag[p] &= !TAG_UINT64;
        if pop {
            fpu.pop();
        }

        let cycles = op.cycles(&self.x87_timings, class);
        self.timing.charge_cycles(cycles);
        Ok(cycles)
    }

    /// FCOM/FCOMP/FUCOM/FUCOMP against a register or memory operand
    pub fn fpu_compare(&mut self, kind: CompareKind, src: Operand, pops: u8) -> Result<u32, Fault> {
        self.fp_enter()?;
        let b = self.fetch_operand(src)?;
        let a = self.state.fpu.st(0);
        self.check_compare_operands(kind, a, b)?;

        let fpu = &mut self.state.fpu;
        fpu.set_condition_codes(compare(a, b));
        for _ in 0..pops {
            fpu.pop();
        }

        let cycles = match kind {
            CompareKind::Ordered => self.x87_timings.fcom.get(src.class()),
            CompareKind::Unordered => self.x87_timings.fucom,
        };
        self.timing.charge_cycles(cycles);
        Ok(cycles)
    }

    /// FCOMPP/FUCOMPP: compare ST(0) with ST(1) and pop both.
    ///
    /// With the detection quirk enabled, FCOMPP of a -0.0 bit pattern
    /// (only the sign bit set) against a zero of either sign reports
    /// "less", which is what BIOS 387 detection code expects.
    pub fn fpu_compare_pop_two(&mut self, kind: CompareKind) -> Result<u32, Fault> {
        self.fp_enter()?;
        let (a, b) = (self.state.fpu.st(0), self.state.fpu.st(1));

        let codes = if kind == CompareKind::Ordered
            && self.config.detection_quirk()
            && a.to_bits() == 1 << 63
            && b == 0.0
        {
            C0
        } else {
            self.check_compare_operands(kind, a, b)?;
            compare(a, b)
        };

        let fpu = &mut self.state.fpu;
        fpu.set_condition_codes(codes);
        fpu.pop();
        fpu.pop();

        let cycles = match kind {
            CompareKind::Ordered => self.x87_timings.fcompp,
            CompareKind::Unordered => self.x87_timings.fucom,
        };
        self.timing.charge_cycles(cycles);
        Ok(cycles)
    }

    /// FCOMI/FCOMIP/FUCOMI/FUCOMIP: compare ST(0) with ST(i) into ZF/PF/CF
    pub fn fpu_compare_eflags(&mut self, kind: CompareKind, i: u8, pop: bool) -> Result<u32, Fault> {
        self.fp_enter()?;
        let (a, b) = (self.state.fpu.st(0), self.state.fpu.st(i));
        self.check_compare_operands(kind, a, b)?;

        let state = &mut self.state;
        state.lazy.rebuild(&mut state.flags);
        state.flags &= !(FLAG_ZF | FLAG_PF | FLAG_CF);
        state.flags |= match compare(a, b) {
            C3 => FLAG_ZF,
            C0 => FLAG_CF,
            0 => 0,
            _ => FLAG_ZF | FLAG_PF | FLAG_CF,
        };
        if pop {
            state.fpu.pop();
        }

        let cycles = self.x87_timings.fcomi;
        self.timing.charge_cycles(cycles);
        Ok(cycles)
    }

    /// Route an ESC opcode (D8-DF) through the form tables
    pub(crate) fn execute_x87(&mut self, op: &DecodedOp) -> Result<u32, Fault> {
        let modrm = op.fetchdat as u8;
        let reg = ((modrm >> 3) & 7) as usize;
        let rm = modrm & 7;

        if modrm >= 0xC0 {
            return match REGISTER_FORMS[(op.opcode - 0xD8) as usize][reg] {
                RegisterForm::Arith(aop, St0) => self.fpu_arith(aop, ArithForm::St0(Operand::Register(rm))),
                RegisterForm::Arith(aop, StI) => self.fpu_arith(aop, ArithForm::StI { i: rm, pop: false }),
                RegisterForm::Arith(aop, StIPop) => self.fpu_arith(aop, ArithForm::StI { i: rm, pop: true }),
                RegisterForm::Compare(kind, pops) => self.fpu_compare(kind, Operand::Register(rm), pops),
                RegisterForm::ComparePopTwo(kind) if rm == 1 => self.fpu_compare_pop_two(kind),
                RegisterForm::CompareEflags(kind, pop) => self.fpu_compare_eflags(kind, rm, pop),
                _ => Self::unhandled_x87(op),
            };
        }

        let (Some(kind), Some(ea)) = (memory_operand(op.opcode), op.ea) else {
            return Self::unhandled_x87(op);
        };
        let src = Operand::Memory(kind, ea);
        match MEMORY_FORMS[reg] {
            MemoryForm::Arith(aop) => self.fpu_arith(aop, ArithForm::St0(src)),
            MemoryForm::Compare(pops) => self.fpu_compare(CompareKind::Ordered, src, pops),
        }
    }

    fn unhandled_x87(op: &DecodedOp) -> Result<u32, Fault> {
        log(LogCategory::FPU, LogLevel::Warn, || {
            format!("x87 opcode {:02X} {:02X} not handled", op.opcode, op.fetchdat as u8)
        });
        Err(Fault::InvalidOpcode { opcode: op.opcode })
    }
}
