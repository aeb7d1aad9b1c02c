//! Tests for cycle charging, prefetch accounting and machine configuration

use super::*;
use crate::cpu_x86::{
    ConfigError, CpuConfig, CpuModel, CpuState, CpuX86, DecodedOp, FpuModel, SegmentCache,
};
use crate::cpu_x86_bus::LinearMemory;
use crate::cpu_x86_timing::{OperandCosts, PrefetchConfig, PrefetchRun, X87Timings};
use crate::Cpu;

fn real_mode_frame(cpu: &mut TestCpu, words: &[u16]) {
    set_stack(cpu, SegmentCache::real(0x2000, 0), 0x0100, false, words);
}

#[test]
fn test_far_return_prefetch_shapes() {
    let mut cpu = cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0x0800]);
    assert_eq!(cpu.execute(DecodedOp::new(0xCB, 0)), Ok(13));
    assert_eq!(
        cpu.timing.runs[0],
        PrefetchRun {
            instr_cycles: 13,
            bytes: 1,
            reads: 2,
            ..PrefetchRun::default()
        }
    );
    assert_eq!(cpu.timing.flushes, 1);

    let mut cpu = super::cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0, 0x0800, 0]);
    assert!(cpu.execute(DecodedOp::new(0xCA, 8).with_op32(true)).is_ok());
    let run = cpu.timing.runs[0];
    assert_eq!((run.bytes, run.reads, run.reads_l), (3, 0, 2));
    assert_eq!(cpu.timing.flushes, 1);
}

#[test]
fn test_iret_prefetch_shapes() {
    let mut cpu = cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0x0800, 0x0002]);
    assert!(cpu.execute(DecodedOp::new(0xCF, 0)).is_ok());
    let run = cpu.timing.runs[0];
    assert_eq!((run.bytes, run.reads, run.reads_l), (1, 3, 0));

    let mut cpu = super::cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0, 0x0800, 0, 0x0002, 0]);
    assert!(cpu.execute(DecodedOp::new(0xCF, 0).with_op32(true)).is_ok());
    let run = cpu.timing.runs[0];
    assert_eq!((run.bytes, run.reads, run.reads_l), (1, 0, 3));
    assert_eq!(cpu.timing.flushes, 1);
}

#[test]
fn test_x87_register_form_does_not_flush() {
    let mut cpu = cpu(CpuModel::Intel80486);
    cpu.state.fpu.push(1.0);
    cpu.state.fpu.push(2.0);
    assert_eq!(cpu.execute(DecodedOp::new(0xD8, 0xC1)), Ok(8));
    let run = cpu.timing.runs[0];
    assert_eq!((run.bytes, run.modrm, run.reads_l), (2, None, 0));
    assert_eq!(cpu.timing.flushes, 0);
}

#[test]
fn test_fault_produces_no_prefetch_run() {
    let mut cpu = cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0x0800]);
    let linear = stack_linear(&cpu, 0);
    cpu.bus.fail_range(linear, 4);

    assert!(cpu.execute(DecodedOp::new(0xCB, 0)).is_err());
    assert!(cpu.timing.runs.is_empty());
    assert_eq!(cpu.timing.flushes, 0);
    assert!(cpu.timing.charged.is_empty());
}

#[test]
fn test_real_mode_costs_by_model() {
    let expected = [
        (CpuModel::Intel80286, 15, 17),
        (CpuModel::Intel80386, 18, 22),
        (CpuModel::Intel80486, 13, 15),
        (CpuModel::Pentium, 4, 7),
    ];
    for (model, retf, iret) in expected {
        let mut cpu = cpu(model);
        real_mode_frame(&mut cpu, &[0x0010, 0x0800]);
        assert_eq!(cpu.execute(DecodedOp::new(0xCB, 0)), Ok(retf), "{}", model.name());

        let mut cpu = super::cpu(model);
        real_mode_frame(&mut cpu, &[0x0010, 0x0800, 0x0002]);
        assert_eq!(cpu.execute(DecodedOp::new(0xCF, 0)), Ok(iret), "{}", model.name());
        assert_eq!(cpu.control_timings().iret_rm, iret);
    }
}

#[test]
fn test_x87_costs_by_coprocessor() {
    let expected = [
        (CpuModel::Intel80286, 85, 50),
        (CpuModel::Intel80386, 23, 26),
        (CpuModel::Intel80486, 8, 5),
        (CpuModel::Pentium, 3, 4),
    ];
    for (model, fadd, fcompp) in expected {
        let mut cpu = cpu(model);
        cpu.state.fpu.push(1.0);
        cpu.state.fpu.push(2.0);
        assert_eq!(cpu.execute(DecodedOp::new(0xD8, 0xC1)), Ok(fadd), "{}", model.name());
        assert_eq!(cpu.execute(DecodedOp::new(0xDE, 0xD9)), Ok(fcompp), "{}", model.name());
    }
}

#[test]
fn test_custom_x87_timings() {
    let mut cpu = cpu(CpuModel::Intel80486);
    let timings = X87Timings {
        fadd: OperandCosts::new(1, 2, 3, 4, 5),
        ..X87Timings::default()
    };
    cpu.set_x87_timings(timings);
    assert_eq!(*cpu.x87_timings(), timings);

    cpu.state.fpu.push(1.0);
    cpu.state.fpu.push(2.0);
    assert_eq!(cpu.execute(DecodedOp::new(0xD8, 0xE1)), Ok(1));
}

#[test]
fn test_prefetch_queue_accounting() {
    let mut cpu = CpuX86::new(LinearMemory::new());
    cpu.state.ss = SegmentCache::real(0x2000, 0);
    cpu.state.set_sp(0x0100);
    cpu.bus.write_u16(0x20100, 0x0010);
    cpu.bus.write_u16(0x20102, 0x0800);

    assert_eq!(cpu.execute(DecodedOp::new(0xCB, 0)), Ok(13));
    // One byte from an empty queue costs a fetch before the flush
    assert_eq!(cpu.timing.stall_cycles(), 1);
    assert_eq!(cpu.timing.total_cycles(), 14);
    assert_eq!(cpu.timing.queued(), 0);
    assert_eq!(cpu.timing.flushes(), 1);
}

#[test]
fn test_prefetch_override_from_config() {
    let config = CpuConfig {
        prefetch: Some(PrefetchConfig {
            width: 2,
            fetch_cycles: 4,
            ..PrefetchConfig::for_model(CpuModel::Intel80486)
        }),
        ..CpuConfig::default()
    };
    let mut cpu = CpuX86::with_config(LinearMemory::new(), config);
    cpu.state.fpu.push(1.0);
    cpu.state.fpu.push(2.0);

    assert_eq!(cpu.execute(DecodedOp::new(0xD8, 0xC1)), Ok(8));
    // 2 bytes from an empty queue: one 4-cycle fetch, then two more fetches
    assert_eq!(cpu.timing.stall_cycles(), 4);
    assert_eq!(cpu.timing.queued(), 4);
}

#[test]
fn test_config_from_json() {
    let config = CpuConfig::from_json(r#"{"model": "Intel80386", "fpu": "I287"}"#)
        .expect("valid config");
    assert_eq!(config.model, CpuModel::Intel80386);
    assert_eq!(config.fpu, FpuModel::I287);
    assert!(!config.detection_quirk());

    let config = CpuConfig::from_json("{}").expect("defaults");
    assert_eq!(config, CpuConfig::default());
    assert_eq!(config.fpu, FpuModel::I487);
    assert!(config.detection_quirk());

    let config = CpuConfig::from_json(r#"{"fpu": "I387", "fpu_detection_quirk": false}"#)
        .expect("quirk override");
    assert!(!config.detection_quirk());
    assert_eq!(config.prefetch_config(), PrefetchConfig::for_model(CpuModel::Intel80486));
}

#[test]
fn test_config_rejects_bad_input() {
    let err = CpuConfig::from_json(r#"{"model": "Pentium", "fpu": "I387"}"#).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Incompatible {
            model: CpuModel::Pentium,
            fpu: FpuModel::I387
        }
    ));
    assert_eq!(err.to_string(), "I387 coprocessor cannot be fitted to an Intel Pentium");

    let err = CpuConfig::from_json(r#"{"model": "Intel8088"}"#).unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    assert!(CpuConfig {
        model: CpuModel::Intel80286,
        fpu: FpuModel::I387,
        ..CpuConfig::default()
    }
    .validate()
    .is_err());
}

#[test]
fn test_unhandled_opcode_keeps_pc() {
    let mut cpu = cpu(CpuModel::Intel80486);
    cpu.state.pc = 0x1234;

    assert_eq!(
        cpu.execute(DecodedOp::new(0x90, 0)),
        Err(crate::cpu_x86::Fault::InvalidOpcode { opcode: 0x90 })
    );
    assert_eq!(cpu.state.pc, 0x1234);
    assert_eq!(cpu.state.oxpc, 0x1234);
    assert!(cpu.timing.runs.is_empty());
}

#[test]
fn test_stack_pointer_width() {
    let mut state = CpuState::new();
    state.set_esp(0x1234_FFFE);
    state.adjust_sp(4);
    assert_eq!(state.esp(), 0x1234_0002);

    state.stack32 = true;
    state.adjust_sp(0x10);
    assert_eq!(state.esp(), 0x1234_0012);
    assert_eq!(state.cpl(), 0);
}

#[test]
fn test_state_snapshot() {
    let mut cpu = cpu(CpuModel::Intel80486);
    real_mode_frame(&mut cpu, &[0x0010, 0x0800]);
    cpu.state.fpu.push(2.5);
    assert!(cpu.execute(DecodedOp::new(0xCB, 0)).is_ok());

    let json = serde_json::to_string(&cpu.state).expect("serialize");
    let restored: CpuState = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(restored.pc, cpu.state.pc);
    assert_eq!(restored.cs, cpu.state.cs);
    assert_eq!(restored.regs, cpu.state.regs);
    assert_eq!(restored.fpu, cpu.state.fpu);
}

#[test]
fn test_state_snapshot_keeps_special_registers() {
    let mut cpu = cpu(CpuModel::Intel80486);
    cpu.state.fpu.push(f64::from_bits(0xFFF8_0000_0000_0000));
    cpu.state.fpu.push(0.0);
    cpu.state.fpu.push(-1.0);
    // Masked zero divide leaves -inf in ST(0)
    assert!(cpu.execute(DecodedOp::new(0xD8, 0xF1)).is_ok());
    assert_eq!(cpu.state.fpu.st(0), f64::NEG_INFINITY);

    let json = serde_json::to_string(&cpu.state).expect("serialize");
    let restored: CpuState = serde_json::from_str(&json).expect("deserialize");
    for (r, (restored, live)) in restored.fpu.st.iter().zip(cpu.state.fpu.st.iter()).enumerate() {
        assert_eq!(restored.to_bits(), live.to_bits(), "R{}", r);
    }
    assert_eq!(restored.fpu.tag, cpu.state.fpu.tag);
    assert_eq!(restored.fpu.top, cpu.state.fpu.top);
}

#[test]
fn test_reset_through_cpu_trait() {
    let mut cpu = cpu(CpuModel::Intel80486);
    cpu.state.pc = 0x4000;
    cpu.state.fpu.push(1.0);

    let core: &mut dyn Cpu = &mut cpu;
    core.reset();
    assert_eq!(cpu.state.pc, 0xFFF0);
    assert_eq!(cpu.state.cs.selector, 0xF000);
    assert_eq!(cpu.state.fpu.top, 0);
}
