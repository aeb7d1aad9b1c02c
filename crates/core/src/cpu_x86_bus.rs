//! Memory bus interface used by the control-transfer and x87 units.
//!
//! The CPU never touches guest memory directly. Every operand fetch and
//! stack pop goes through [`MemoryBus`], which may refuse the access (limit
//! violation, page fault). A refused access, or an abort the bus raises
//! outside of the call's own result, latches `CpuState::abrt`; from then on
//! the current instruction must not commit anything further.

use crate::cpu_x86::{Fault, SegmentCache};
use crate::logging::{log, LogCategory, LogLevel};
use thiserror::Error;

/// Reason a bus access was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("offset {offset:#x} outside segment limit {limit:#x}")]
    Limit { offset: u32, limit: u32 },
    #[error("page fault at linear address {linear:#010x}")]
    Page { linear: u32 },
}

/// Segmented read access to guest memory
pub trait MemoryBus {
    /// Read a little-endian word at `seg:offset`
    fn read_u16(&mut self, seg: &SegmentCache, offset: u32) -> Result<u16, BusFault>;

    /// Read a little-endian dword at `seg:offset`
    fn read_u32(&mut self, seg: &SegmentCache, offset: u32) -> Result<u32, BusFault>;

    /// Report (and clear) an abort raised outside a read's own result, e.g.
    /// by a nested table walk that faulted after the data was returned.
    fn take_abort(&mut self) -> bool {
        false
    }
}

/// Turn a bus result into a CPU result, latching `abrt` on any failure.
///
/// A read that succeeds while `abrt` is already latched still fails: the
/// instruction is being abandoned.
pub(crate) fn checked<V>(
    bus: &mut dyn MemoryBus,
    abrt: &mut bool,
    result: Result<V, BusFault>,
) -> Result<V, Fault> {
    let value = match result {
        Ok(v) => Some(v),
        Err(e) => {
            log(LogCategory::Bus, LogLevel::Debug, || format!("read aborted: {}", e));
            None
        }
    };
    if value.is_none() || bus.take_abort() {
        *abrt = true;
    }
    match value {
        Some(v) if !*abrt => Ok(v),
        _ => Err(Fault::MemoryAbort),
    }
}

/// Reader for the words of a stack frame at SS:[(E)SP + n].
///
/// With a 16-bit stack the offsets wrap at 64K, as SP does.
pub(crate) struct StackFrame<'a> {
    bus: &'a mut dyn MemoryBus,
    abrt: &'a mut bool,
    ss: SegmentCache,
    top: u32,
    stack32: bool,
}

impl<'a> StackFrame<'a> {
    pub(crate) fn new(
        bus: &'a mut dyn MemoryBus,
        abrt: &'a mut bool,
        ss: SegmentCache,
        top: u32,
        stack32: bool,
    ) -> Self {
        Self {
            bus,
            abrt,
            ss,
            top,
            stack32,
        }
    }

    #[inline]
    fn offset(&self, n: u32) -> u32 {
        let off = self.top.wrapping_add(n);
        if self.stack32 {
            off
        } else {
            off & 0xFFFF
        }
    }

    pub(crate) fn word(&mut self, n: u32) -> Result<u16, Fault> {
        let off = self.offset(n);
        let r = self.bus.read_u16(&self.ss, off);
        checked(self.bus, self.abrt, r)
    }

    pub(crate) fn dword(&mut self, n: u32) -> Result<u32, Fault> {
        let off = self.offset(n);
        let r = self.bus.read_u32(&self.ss, off);
        checked(self.bus, self.abrt, r)
    }
}

/// Flat RAM behind a segmented bus, for tests and benchmarks.
///
/// Reads past the end of RAM return open-bus `0xFF` bytes. Linear ranges can
/// be marked as faulting, and a linear address can be set to raise the
/// out-of-band abort after an otherwise successful read.
pub struct LinearMemory {
    data: Vec<u8>,
    faulting: Vec<(u32, u32)>,
    abort_after: Option<u32>,
    abort_latched: bool,
    reads: u64,
}

impl LinearMemory {
    /// 1MB plus the high memory area
    pub fn new() -> Self {
        Self::with_size(0x10_FFF0)
    }

    pub fn with_size(size: usize) -> Self {
        Self {
            data: vec![0; size],
            faulting: Vec::new(),
            abort_after: None,
            abort_latched: false,
            reads: 0,
        }
    }

    /// Copy `bytes` into RAM at a linear address
    pub fn load(&mut self, linear: u32, bytes: &[u8]) {
        let start = linear as usize;
        let end = (start + bytes.len()).min(self.data.len());
        if start < end {
            self.data[start..end].copy_from_slice(&bytes[..end - start]);
        }
    }

    pub fn read_u8(&self, linear: u32) -> u8 {
        self.data.get(linear as usize).copied().unwrap_or(0xFF)
    }

    pub fn write_u8(&mut self, linear: u32, val: u8) {
        if let Some(b) = self.data.get_mut(linear as usize) {
            *b = val;
        }
    }

    pub fn write_u16(&mut self, linear: u32, val: u16) {
        self.load(linear, &val.to_le_bytes());
    }

    pub fn write_u32(&mut self, linear: u32, val: u32) {
        self.load(linear, &val.to_le_bytes());
    }

    pub fn write_u64(&mut self, linear: u32, val: u64) {
        self.load(linear, &val.to_le_bytes());
    }

    /// Make every read touching `[linear, linear + len)` fault
    pub fn fail_range(&mut self, linear: u32, len: u32) {
        self.faulting.push((linear, len));
    }

    /// Let the next read of `linear` succeed but raise the out-of-band abort
    pub fn abort_after_read(&mut self, linear: u32) {
        self.abort_after = Some(linear);
    }

    /// Number of successful reads so far
    pub fn reads(&self) -> u64 {
        self.reads
    }

    fn access(&mut self, seg: &SegmentCache, offset: u32, size: u32) -> Result<u32, BusFault> {
        if offset > seg.limit || seg.limit - offset < size - 1 {
            return Err(BusFault::Limit {
                offset,
                limit: seg.limit,
            });
        }
        let linear = seg.base.wrapping_add(offset);
        let last = linear.wrapping_add(size - 1);
        for &(start, len) in &self.faulting {
            let end = start.wrapping_add(len);
            if (linear >= start && linear < end) || (last >= start && last < end) {
                return Err(BusFault::Page { linear });
            }
        }
        if self.abort_after == Some(linear) {
            self.abort_after = None;
            self.abort_latched = true;
        }
        self.reads += 1;
        Ok(linear)
    }

    fn bytes<const N: usize>(&self, linear: u32) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.read_u8(linear.wrapping_add(i as u32));
        }
        out
    }
}

impl Default for LinearMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus for LinearMemory {
    fn read_u16(&mut self, seg: &SegmentCache, offset: u32) -> Result<u16, BusFault> {
        let linear = self.access(seg, offset, 2)?;
        Ok(u16::from_le_bytes(self.bytes(linear)))
    }

    fn read_u32(&mut self, seg: &SegmentCache, offset: u32) -> Result<u32, BusFault> {
        let linear = self.access(seg, offset, 4)?;
        Ok(u32::from_le_bytes(self.bytes(linear)))
    }

    fn take_abort(&mut self) -> bool {
        std::mem::take(&mut self.abort_latched)
    }
}
