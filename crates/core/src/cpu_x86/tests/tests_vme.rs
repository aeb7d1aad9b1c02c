//! Tests for IRET in virtual-8086 mode
//!
//! Below IOPL 3 an IRET either faults or, with CR4.VME, takes the virtual
//! interrupt path where the popped IF lands in VIF.

use super::*;
use crate::cpu_x86::{CpuModel, DecodedOp, Fault, IretVariant, SegmentCache};
use crate::cpu_x86_control::ReturnPath;
use crate::cpu_x86_flags::{EFLAG_VIF, EFLAG_VIP, EFLAG_VM, FLAG_IF, FLAG_TF};
use crate::cpu_x86_protected::CR4_VME;

const V86_SS: u16 = 0x3000;

/// Pentium in V86 mode at IOPL `iopl` with the given words at SS:0x0100
fn v86_cpu(iopl: u8, vme: bool, words: &[u16]) -> TestCpu {
    let mut cpu = cpu(CpuModel::Pentium);
    cpu.state.protected_mode.enable_protected_mode();
    if vme {
        cpu.state.protected_mode.cr4 |= CR4_VME;
    }
    cpu.state.eflags = EFLAG_VM;
    cpu.state.flags = 0x0202 | ((iopl as u16) << 12);
    cpu.state.cs = SegmentCache::real(0x1000, 3);
    set_stack(&mut cpu, SegmentCache::real(V86_SS, 3), 0x0100, false, words);
    cpu
}

fn iret() -> DecodedOp {
    DecodedOp::new(0xCF, 0)
}

#[test]
fn test_return_paths_in_v86() {
    let cpu = v86_cpu(0, false, &[]);
    assert_eq!(cpu.iret_path(Some(IretVariant::Modern)), ReturnPath::GeneralProtection);
    assert_eq!(cpu.far_return_path(), ReturnPath::RealOrV86);

    let cpu = v86_cpu(0, true, &[]);
    assert_eq!(cpu.iret_path(Some(IretVariant::Modern)), ReturnPath::VmeRedirect);
    assert_eq!(cpu.iret_path(Some(IretVariant::Legacy286)), ReturnPath::GeneralProtection);
    assert_eq!(cpu.iret_path(None), ReturnPath::GeneralProtection);

    let cpu = v86_cpu(3, true, &[]);
    assert_eq!(cpu.iret_path(Some(IretVariant::Modern)), ReturnPath::RealOrV86);
}

#[test]
fn test_iret_without_vme_faults() {
    let mut cpu = v86_cpu(1, false, &[0x0400, 0x2000, 0x0202]);
    let before = cpu.state.clone();

    assert_eq!(cpu.execute(iret()), Err(Fault::GeneralProtection));
    assert_eq!(cpu.state.flags, before.flags);
    assert_eq!(cpu.state.eflags, before.eflags);
    assert_eq!(cpu.state.regs, before.regs);
    assert_eq!(cpu.state.cs, before.cs);
    assert_eq!(cpu.state.pc, before.pc);
    assert_eq!(cpu.bus.reads(), 0);
    assert!(cpu.timing.charged.is_empty());
}

#[test]
fn test_vme_iret_sets_vif_from_if() {
    let mut cpu = v86_cpu(1, true, &[0x0400, 0x2000, 0x0AD7]);

    assert_eq!(cpu.execute(iret()), Ok(7));
    assert_eq!(cpu.state.pc, 0x0400);
    assert_eq!(cpu.state.cs.selector, 0x2000);
    assert_eq!(cpu.state.cs.base, 0x20000);
    assert_eq!(cpu.state.cs.dpl(), 3);
    assert_ne!(cpu.state.eflags & EFLAG_VIF, 0);
    assert_ne!(cpu.state.eflags & EFLAG_VM, 0);
    // IOPL, TF and IF come from the old FLAGS
    assert_eq!(cpu.state.flags, 0x1200 | (0x0AD7 & 0x4CD5) | 0x0002);
    assert_eq!(cpu.state.sp(), 0x0106);
    assert!(cpu.state.nmi_enable);
}

#[test]
fn test_vme_iret_clears_vif() {
    let mut cpu = v86_cpu(0, true, &[0x0400, 0x2000, 0x0046]);
    cpu.state.eflags |= EFLAG_VIF | EFLAG_VIP;

    assert_eq!(cpu.execute(iret()), Ok(7));
    assert_eq!(cpu.state.eflags & EFLAG_VIF, 0);
    assert_ne!(cpu.state.eflags & EFLAG_VIP, 0);
    // IF itself is untouched
    assert_ne!(cpu.state.flags & FLAG_IF, 0);
}

#[test]
fn test_vme_iret_moves_only_sp() {
    let mut cpu = v86_cpu(1, true, &[]);
    cpu.state.stack32 = true;
    cpu.state.set_esp(0x0005_0100);
    let base = cpu.state.ss.base;
    for (i, w) in [0x0400u16, 0x2000, 0x0202].iter().enumerate() {
        cpu.bus.write_u16(base + 0x0100 + 2 * i as u32, *w);
    }

    assert_eq!(cpu.execute(iret()), Ok(7));
    assert_eq!(cpu.state.esp(), 0x0005_0106);
    assert_eq!(cpu.state.pc, 0x0400);
}

#[test]
fn test_vme_iret_with_tf_faults() {
    let mut cpu = v86_cpu(1, true, &[0x0400, 0x2000, 0x0002 | FLAG_TF]);
    let before = cpu.state.clone();

    assert_eq!(cpu.execute(iret()), Err(Fault::GeneralProtection));
    assert_eq!(cpu.state.sp(), 0x0100);
    assert_eq!(cpu.state.eflags, before.eflags);
    assert_eq!(cpu.state.flags, before.flags);
    assert_eq!(cpu.state.cs, before.cs);
}

#[test]
fn test_vme_iret_with_pending_virtual_interrupt_faults() {
    let mut cpu = v86_cpu(1, true, &[0x0400, 0x2000, 0x0202]);
    cpu.state.eflags |= EFLAG_VIP;

    assert_eq!(cpu.execute(iret()), Err(Fault::GeneralProtection));
    assert_eq!(cpu.state.sp(), 0x0100);
    assert_eq!(cpu.state.eflags & EFLAG_VIF, 0);

    // Popping IF clear is fine even with VIP set
    let mut cpu = v86_cpu(1, true, &[0x0400, 0x2000, 0x0002]);
    cpu.state.eflags |= EFLAG_VIP;
    assert_eq!(cpu.execute(iret()), Ok(7));
}

#[test]
fn test_vme_iret_abort_leaves_state() {
    let mut cpu = v86_cpu(1, true, &[0x0400, 0x2000, 0x0202]);
    let linear = stack_linear(&cpu, 2);
    cpu.bus.fail_range(linear, 2);
    let before = cpu.state.clone();

    assert_eq!(cpu.execute(iret()), Err(Fault::MemoryAbort));
    assert_eq!(cpu.state.regs, before.regs);
    assert_eq!(cpu.state.eflags, before.eflags);
    assert_eq!(cpu.state.cs, before.cs);
}

#[test]
fn test_iretd_and_legacy_iret_fault_below_iopl3() {
    let words = [0x0400, 0, 0x2000, 0, 0x0202, 0x0002];
    let mut cpu = v86_cpu(1, true, &words);
    assert_eq!(cpu.execute(iret().with_op32(true)), Err(Fault::GeneralProtection));

    let mut cpu = v86_cpu(1, true, &words);
    assert_eq!(cpu.iret_16(IretVariant::Legacy286), Err(Fault::GeneralProtection));
    assert_eq!(cpu.state.sp(), 0x0100);
}

#[test]
fn test_iret_at_iopl3_takes_real_path() {
    let mut cpu = v86_cpu(3, true, &[0x0400, 0x2000, 0x3046]);

    assert_eq!(cpu.execute(iret()), Ok(7));
    assert_eq!(cpu.state.flags, (0x3046 & 0xFFD5) | 0x0002);
    assert_eq!(cpu.state.eflags, EFLAG_VM);
    assert_eq!(cpu.state.cs.dpl(), 3);
    assert_eq!(cpu.state.sp(), 0x0106);
}
