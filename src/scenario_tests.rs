//! End-to-end runs from raw routine bytes through the whole pipeline.

use rstest::rstest;

use crate::cfg::{ControlFlowGraph, ENTRY, EXIT};
use crate::decoder::{Disassembler, Operand};
use crate::isil::{LiftOptions, OpCode, WasmSignature};
use crate::pipeline::{analyze_batch, analyze_routine, AnalysisOptions, BatchSummary, Routine};
use crate::stack::{StackError, StackMode, StackTally};
use crate::{AnalysisError, Architecture};

/// Structural checks every constructed graph must pass.
fn assert_well_formed(cfg: &ControlFlowGraph) {
    cfg.validate().unwrap();

    assert!(cfg.entry().predecessors.is_empty());
    assert!(cfg.exit().successors.is_empty());
    for (from, to) in cfg.edges() {
        assert!(cfg.blocks()[to].predecessors.contains(&from), "edge {} -> {} is one-sided", from, to);
        assert_ne!(to, ENTRY);
        assert_ne!(from, EXIT);
    }

    let mut covered = 0;
    for block in cfg.blocks().iter().skip(2) {
        assert_eq!(block.statements.start, covered);
        covered = block.statements.end;
    }
    assert_eq!(covered, cfg.statements().len());
}

fn analyze(arch: Architecture, code: &[u8]) -> Result<crate::pipeline::RoutineAnalysis, AnalysisError> {
    analyze_routine(&Routine::new("scenario", 0x1000, code), &AnalysisOptions::new(arch))
}

#[rstest]
// push rbp; pop rbp; ret
#[case::push_pop(Architecture::X86_64, &[0x55, 0x5d, 0xc3][..])]
// push ebp; mov ebp, esp; pop ebp; ret
#[case::x86_32_frame(Architecture::X86_32, &[0x55, 0x89, 0xe5, 0x5d, 0xc3][..])]
// push rbp; mov rbp, rsp; sub rsp, 0x10; leave; ret
#[case::leave_epilogue(Architecture::X86_64, &[0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0xc9, 0xc3][..])]
// push rbx; jmp 0x2000
#[case::tail_call(Architecture::X86_64, &[0x53, 0xe9, 0xfa, 0x0f, 0x00, 0x00][..])]
// stp x29, x30, [sp, #-16]!; mov x29, sp; ldp x29, x30, [sp], #16; ret
#[case::arm64_frame(
    Architecture::ArmV8,
    &[0xfd, 0x7b, 0xbf, 0xa9, 0xfd, 0x03, 0x00, 0x91, 0xfd, 0x7b, 0xc1, 0xa8, 0xc0, 0x03, 0x5f, 0xd6][..]
)]
// push {r4, lr}; pop {r4, pc}
#[case::arm_push_pop(Architecture::ArmV7, &[0x10, 0x40, 0x2d, 0xe9, 0x10, 0x80, 0xbd, 0xe8][..])]
// loop; local.get 0; br_if 0; end; end
#[case::wasm_loop(Architecture::Wasm, &[0x03, 0x40, 0x20, 0x00, 0x0d, 0x00, 0x0b, 0x0b][..])]
// block (result i32); i32.const 1; i32.const 2; br 0; end; drop; end
#[case::wasm_br_surplus(
    Architecture::Wasm,
    &[0x02, 0x7f, 0x41, 0x01, 0x41, 0x02, 0x0c, 0x00, 0x0b, 0x1a, 0x0b][..]
)]
// block (result i32); i32.const 1; i32.const 2; local.get 0; br_if 0; drop; end; drop; end
#[case::wasm_br_if_surplus(
    Architecture::Wasm,
    &[0x02, 0x7f, 0x41, 0x01, 0x41, 0x02, 0x20, 0x00, 0x0d, 0x00, 0x1a, 0x0b, 0x1a, 0x0b][..]
)]
// block (result i32); i32.const 1; i32.const 2; local.get 0; br_table [0] default 0; end; drop; end
#[case::wasm_br_table_surplus(
    Architecture::Wasm,
    &[0x02, 0x7f, 0x41, 0x01, 0x41, 0x02, 0x20, 0x00, 0x0e, 0x01, 0x00, 0x00, 0x0b, 0x1a, 0x0b][..]
)]
// i32.const 1; i32.const 2; i32.const 0; select (result i32); drop; end
#[case::wasm_typed_select(
    Architecture::Wasm,
    &[0x41, 0x01, 0x41, 0x02, 0x41, 0x00, 0x1c, 0x01, 0x7f, 0x1a, 0x0b][..]
)]
fn test_balanced_routines(#[case] arch: Architecture, #[case] code: &[u8]) {
    let analysis = analyze(arch, code).unwrap();
    assert_well_formed(&analysis.cfg);
    assert!(analysis.is_balanced(), "{:?}", analysis.stack);
}

#[test]
fn test_wasm_early_return_with_extra_values_is_balanced() {
    // i32.const 1; i32.const 2; return; end
    let routine = Routine::new("f", 0, &[0x41, 0x01, 0x41, 0x02, 0x0f, 0x0b]).with_signature(WasmSignature::new(0, 1));
    let analysis = analyze_routine(&routine, &AnalysisOptions::new(Architecture::Wasm)).unwrap();
    assert_well_formed(&analysis.cfg);
    assert!(analysis.is_balanced(), "{:?}", analysis.stack);
}

#[test]
fn test_wasm_block_type_index_uses_type_section() {
    // i32.const 5; block (type 0); i32.const 1; br 0; end; drop; end
    let code = [0x41, 0x05, 0x02, 0x00, 0x41, 0x01, 0x0c, 0x00, 0x0b, 0x1a, 0x0b];
    let mut lift = LiftOptions::default();
    lift.wasm.type_signatures = vec![WasmSignature::new(1, 1)];
    let options = AnalysisOptions::new(Architecture::Wasm).with_lift_options(lift);

    let analysis = analyze_routine(&Routine::new("typed", 0, &code), &options).unwrap();
    assert!(analysis.is_balanced(), "{:?}", analysis.stack);
}

#[test]
fn test_stdcall_return_releases_arguments() {
    // push ebp; pop ebp; ret 8
    let analysis = analyze(Architecture::X86_32, &[0x55, 0x5d, 0xc2, 0x08, 0x00]).unwrap();
    let summary = analysis.stack.unwrap();
    assert_eq!(summary.argument_slots, 2);
    assert_eq!(
        analysis.statements.iter().map(|s| s.opcode).collect::<Vec<_>>(),
        vec![OpCode::Push, OpCode::Pop, OpCode::ShiftStack, OpCode::Return]
    );
}

#[test]
fn test_unsigned_branch_keeps_its_condition() {
    // cmp eax, 1; ja +1; nop; ret
    let analysis = analyze(Architecture::X86_64, &[0x83, 0xf8, 0x01, 0x77, 0x01, 0x90, 0xc3]).unwrap();
    assert_eq!(analysis.statements[1].opcode, OpCode::JumpIfAbove);
    assert_eq!(analysis.statements[1].branch_target(), Some(2));
    assert!(analysis.is_balanced());
}

#[test]
fn test_tail_call_block_reaches_exit() {
    let analysis = analyze(Architecture::X86_64, &[0x53, 0xe9, 0xfa, 0x0f, 0x00, 0x00]).unwrap();
    let summary = analysis.stack.unwrap();
    assert_eq!(summary.tail_calls, 1);
    assert_eq!(summary.max_depth, 1);
    assert_eq!(analysis.statements.last().map(|s| s.opcode), Some(OpCode::CallNoReturn));
}

#[test]
fn test_missing_pop_is_unbalanced() {
    // push rbp; ret
    let analysis = analyze(Architecture::X86_64, &[0x55, 0xc3]).unwrap();
    assert_eq!(analysis.stack, Err(StackError::NonEmptyExit { depth: 1 }));
}

#[test]
fn test_divergent_paths_raise_merge_mismatch() {
    // test eax, eax; je +1; push rax; ret
    let analysis = analyze(Architecture::X86_64, &[0x85, 0xc0, 0x74, 0x01, 0x50, 0xc3]).unwrap();
    assert_well_formed(&analysis.cfg);
    assert!(
        matches!(analysis.stack, Err(StackError::MergeMismatch { .. })),
        "{:?}",
        analysis.stack
    );
}

#[test]
fn test_misaligned_shift_is_contained_in_batch() {
    let routines = vec![
        Routine::new("before", 0x1000, &[0x55, 0x5d, 0xc3]),
        // sub rsp, 3; add rsp, 3; ret
        Routine::new("odd", 0x2000, &[0x48, 0x83, 0xec, 0x03, 0x48, 0x83, 0xc4, 0x03, 0xc3]),
        Routine::new("after", 0x3000, &[0x53, 0x5b, 0xc3]),
    ];
    let tally = StackTally::new();
    let report = analyze_batch(&routines, &AnalysisOptions::new(Architecture::X86_64), &tally);

    assert_eq!(
        report.summary,
        BatchSummary {
            balanced: 2,
            unbalanced: 1,
            faulted: 0
        }
    );
    assert_eq!(tally.balanced(), 2);
    assert_eq!(tally.unbalanced(), 1);

    let odd = report.routines[1].outcome.as_ref().unwrap();
    assert_eq!(
        odd.stack,
        Err(StackError::Misaligned {
            statement: 0,
            shift: -3,
            width: 8
        })
    );
    assert!(report.routines[0].is_balanced());
    assert!(report.routines[2].is_balanced());
}

#[test]
fn test_decode_fault_counts_as_unbalanced() {
    let routines = vec![
        Routine::new("good", 0, &[0x41, 0x00, 0x1a, 0x0b]),
        // truncated i32.const
        Routine::new("cut", 0x10, &[0x41]),
    ];
    let tally = StackTally::new();
    let report = analyze_batch(&routines, &AnalysisOptions::new(Architecture::Wasm), &tally);

    assert_eq!(report.summary.faulted, 1);
    assert_eq!(report.summary.total(), 2);
    assert!(matches!(report.routines[1].outcome, Err(AnalysisError::Decode(_))));
    assert_eq!(tally.unbalanced(), 1);
}

#[test]
fn test_arm64_sxtw_decodes_as_single_move() {
    let decoder = Disassembler::for_architecture(Architecture::ArmV8);
    let insn = decoder.decode_word(0x9340_7e95, 0).unwrap();

    assert_eq!(insn.mnemonic, "SXTW");
    assert_eq!(insn.operands[0], Operand::Register("X21".into()));
    assert_eq!(insn.operands[1], Operand::Register("W20".into()));
    assert_eq!(insn.size(), 4);

    let analysis = analyze(Architecture::ArmV8, &0x9340_7e95u32.to_le_bytes()).unwrap();
    assert_eq!(analysis.instructions.len(), 1);
    assert_eq!(analysis.statements[0].opcode, OpCode::Move);
}

#[test]
fn test_fixed_width_bulk_and_random_access_agree() {
    // sxtw x21, w20; nop; ret
    let words: [u32; 3] = [0x9340_7e95, 0xd503_201f, 0xd65f_03c0];
    let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    let decoder = Disassembler::for_architecture(Architecture::ArmV8);

    let bulk = decoder.decode_all(&code, 0x4000).unwrap();
    assert_eq!(bulk.instruction_count(), code.len() / 4);
    for (n, insn) in bulk.instructions.iter().enumerate() {
        assert_eq!(&decoder.decode_one(&code, 0x4000, n * 4).unwrap(), insn);
    }

    let mut lazy = decoder.iter(&code, 0x4000);
    let first = lazy.next().unwrap().unwrap();
    assert_eq!(lazy.by_ref().count(), 2);
    lazy.restart();
    assert_eq!(lazy.next().unwrap().unwrap(), first);
}

#[test]
fn test_slots_mode_translates_frame_accesses() {
    // push rbp; mov rbp, rsp; sub rsp, 0x10; mov qword ptr [rsp + 8], rdi; leave; ret
    let code = [
        0x55, 0x48, 0x89, 0xe5, 0x48, 0x83, 0xec, 0x10, 0x48, 0x89, 0x7c, 0x24, 0x08, 0xc9, 0xc3,
    ];
    let options = AnalysisOptions::new(Architecture::X86_64).with_stack_mode(StackMode::Slots);
    let analysis = analyze_routine(&Routine::new("frame", 0x1000, &code), &options).unwrap();

    let summary = analysis.stack.as_ref().unwrap();
    assert_eq!(summary.max_depth, 3);
    let store = analysis
        .statements
        .iter()
        .find(|s| s.address == 0x1008)
        .unwrap();
    // three slots below the entry stack pointer, plus the 8-byte displacement
    assert_eq!(store.operands[0], crate::isil::IsilOperand::StackOffset(-16));
}
