// Integration tests driving the whole lowering pipeline through the public API: graph
// construction, register allocation under pressure, spill/reload round trips, forward and
// backward jump resolution, frame layout bounds and sticky error behavior. Emitted bytes
// are verified with the iced-x86 decoder, so the assertions hold against the actual
// machine code rather than internal state.

use bumpalo::Bump;
use corten::core::{Compiler, Session};
use corten::x64::{ArgType, CallConv, InstCode};
use corten::{CompileError, Operand};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, Register};

fn decode(bytes: &[u8], ip: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    out
}

fn sum_function(c: &mut Compiler, live_vars: usize) {
    c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let seed = c.arg(0).unwrap();

    let mut vars = Vec::new();
    for i in 0..live_vars {
        let v = c.gpq(Some(&format!("t{i}"))).unwrap();
        c.mov(c.var_op(v), Operand::imm(i as i64)).unwrap();
        c.add(c.var_op(v), c.var_op(seed)).unwrap();
        vars.push(v);
    }
    let acc = vars[0];
    for v in &vars[1..] {
        c.add(c.var_op(acc), c.var_op(*v)).unwrap();
    }
    c.ret(Some(c.var_op(acc))).unwrap();
    c.end_func().unwrap();
}

#[test]
fn add_two_arguments_compiles() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    let f = c
        .new_func(CallConv::SysV64, &[ArgType::Int64, ArgType::Int64], Some(ArgType::Int64))
        .unwrap();
    let a = c.arg(0).unwrap();
    let b = c.arg(1).unwrap();
    c.add(c.var_op(a), c.var_op(b)).unwrap();
    c.ret(Some(c.var_op(a))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0x1000).unwrap();
    assert!(!code.is_empty());
    assert!(c.error().is_none());

    // The function entry resolves to the start of the buffer.
    assert_eq!(code.label_address(c.func_entry(f)), Some(0x1000));

    // Standard frame: the first instruction is push rbp.
    let insns = decode(&code.bytes, code.base);
    assert_eq!(insns[0].mnemonic(), Mnemonic::Push);
    assert_eq!(insns[0].op0_register(), Register::RBP);
    // The value lands in rax somewhere before ret.
    assert!(insns.iter().any(|i| i.mnemonic() == Mnemonic::Ret));
    assert!(insns
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Add && i.op0_register() == Register::RDI));
}

#[test]
fn register_pressure_forces_spill_and_reload() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    // More simultaneously-live values than allocatable GP registers.
    sum_function(&mut c, 20);
    let code = c.make(0).unwrap();

    let stats = session.stats();
    assert!(stats.spills > 0, "expected at least one spill, got {stats}");
    assert!(stats.reloads > 0, "expected at least one reload, got {stats}");

    // A dirty value spilled and reloaded must use the same stack slot: some
    // rsp-relative store displacement shows up again as a load.
    let insns = decode(&code.bytes, code.base);
    let mut stores = Vec::new();
    let mut loads = Vec::new();
    for i in &insns {
        if i.mnemonic() != Mnemonic::Mov || i.memory_base() != Register::RSP {
            continue;
        }
        if i.op0_register() == Register::None {
            stores.push(i.memory_displacement64());
        } else {
            loads.push(i.memory_displacement64());
        }
    }
    assert!(
        loads.iter().any(|d| stores.contains(d)),
        "no spill slot was both written and read back"
    );
}

#[test]
fn frame_displacements_stay_inside_the_frame() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    sum_function(&mut c, 20);
    let code = c.make(0).unwrap();
    let insns = decode(&code.bytes, code.base);

    // Recover the frame size from the prologue's rsp adjustment.
    let frame = insns
        .iter()
        .find(|i| i.mnemonic() == Mnemonic::Sub && i.op0_register() == Register::RSP)
        .map(|i| i.immediate(1))
        .expect("prologue must adjust rsp");
    assert_eq!(frame % 16, 0);

    for i in &insns {
        if i.memory_base() == Register::RSP {
            let disp = i.memory_displacement64();
            assert!(disp < frame, "displacement {disp} outside frame of {frame} bytes");
        }
    }
}

#[test]
fn forward_jump_resolves_exactly_once() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let n = c.arg(0).unwrap();
    let skip = c.new_label();

    c.cmp(c.var_op(n), Operand::imm(0)).unwrap();
    c.j(InstCode::Jle, skip).unwrap();
    c.add(c.var_op(n), Operand::imm(1)).unwrap();
    c.bind(skip).unwrap();
    c.ret(Some(c.var_op(n))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0).unwrap();
    assert!(c.error().is_none());
    assert_eq!(session.stats().forward_jumps_resolved, 1);
    assert!(!code.is_empty());
}

#[test]
fn backward_loop_compiles_deterministically() {
    let build = |session: &Session| -> Vec<u8> {
        let mut c = Compiler::new(session);
        c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
        let n = c.arg(0).unwrap();
        let total = c.gpq(Some("total")).unwrap();

        c.mov(c.var_op(total), Operand::imm(0)).unwrap();
        let top = c.new_label();
        let done = c.new_label();
        c.bind(top).unwrap();
        c.cmp(c.var_op(n), Operand::imm(0)).unwrap();
        c.j(InstCode::Jle, done).unwrap();
        c.add(c.var_op(total), c.var_op(n)).unwrap();
        c.sub(c.var_op(n), Operand::imm(1)).unwrap();
        c.jmp(top).unwrap();
        c.bind(done).unwrap();
        c.ret(Some(c.var_op(total))).unwrap();
        c.end_func().unwrap();
        c.make(0x2000).unwrap().bytes
    };

    let arena = Bump::new();
    let session = Session::new(&arena);
    let first = build(&session);
    let second = build(&session);
    // Identical input graph, identical allocation decisions, identical bytes.
    assert_eq!(first, second);

    // The loop-back edge is an actual backward branch.
    let insns = decode(&first, 0x2000);
    assert!(insns
        .iter()
        .any(|i| i.mnemonic() == Mnemonic::Jmp && i.near_branch_target() < i.ip()));
}

#[test]
fn jump_to_unbound_label_fails() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    c.new_func(CallConv::SysV64, &[], None).unwrap();
    let nowhere = c.new_label();
    c.j(InstCode::Je, nowhere).unwrap();
    c.ret(None).unwrap();
    c.end_func().unwrap();

    let r = c.make(0);
    assert!(matches!(r, Err(CompileError::UnboundLabel { .. })));
    assert!(c.error().is_some());
}

#[test]
fn multiple_functions_in_one_unit() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    let f1 = c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let a = c.arg(0).unwrap();
    c.add(c.var_op(a), Operand::imm(1)).unwrap();
    c.ret(Some(c.var_op(a))).unwrap();
    c.end_func().unwrap();

    let f2 = c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let b = c.arg(0).unwrap();
    c.sub(c.var_op(b), Operand::imm(1)).unwrap();
    c.ret(Some(c.var_op(b))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0x1000).unwrap();
    assert_eq!(session.stats().functions_compiled, 2);

    let e1 = code.label_address(c.func_entry(f1)).unwrap();
    let e2 = code.label_address(c.func_entry(f2)).unwrap();
    assert!(e1 < e2);
    assert!(e2 < 0x1000 + code.len() as u64);
}

#[test]
fn memory_argument_is_loaded_from_callers_frame() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    // Seven integer arguments: the last one arrives on the stack.
    let args = vec![ArgType::Int64; 7];
    c.new_func(CallConv::SysV64, &args, Some(ArgType::Int64)).unwrap();
    let last = c.arg(6).unwrap();
    c.add(c.var_op(last), Operand::imm(1)).unwrap();
    c.ret(Some(c.var_op(last))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0).unwrap();
    let insns = decode(&code.bytes, code.base);
    // The stack argument loads from rbp + 16 (saved rbp + return address).
    assert!(insns.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.memory_base() == Register::RBP
            && i.memory_displacement64() == 16
    }));
}

#[test]
fn call_places_arguments_in_convention_registers() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let x = c.arg(0).unwrap();
    let out = c.gpq(Some("out")).unwrap();
    c.call(Operand::imm(0x5000), &[c.var_op(x), Operand::imm(41)], Some(out)).unwrap();
    c.ret(Some(c.var_op(out))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0x1000).unwrap();
    let insns = decode(&code.bytes, code.base);

    assert!(insns.iter().any(|i| i.mnemonic() == Mnemonic::Call));
    // The second argument's immediate materializes in rsi.
    assert!(insns.iter().any(|i| {
        i.mnemonic() == Mnemonic::Mov
            && i.op0_register() == Register::RSI
            && i.immediate(1) == 41
    }));
}

#[test]
fn variable_hints_spill_and_reload() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    c.new_func(CallConv::SysV64, &[ArgType::Int64], Some(ArgType::Int64)).unwrap();
    let v = c.arg(0).unwrap();
    c.add(c.var_op(v), Operand::imm(5)).unwrap();
    c.spill_hint(v).unwrap();
    c.add(c.var_op(v), Operand::imm(7)).unwrap();
    c.ret(Some(c.var_op(v))).unwrap();
    c.end_func().unwrap();

    let code = c.make(0).unwrap();
    assert!(session.stats().spills >= 1);
    assert!(session.stats().reloads >= 1);
    assert!(!code.is_empty());
}

#[test]
fn comments_and_data_pass_through() {
    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    c.new_func(CallConv::SysV64, &[], None).unwrap();
    c.comment("function body").unwrap();
    c.ret(None).unwrap();
    c.end_func().unwrap();
    c.data(&[0xCC, 0xCC]).unwrap();

    let code = c.make(0).unwrap();
    // The trailing data bytes survive at the end of the buffer.
    assert_eq!(&code.bytes[code.len() - 2..], &[0xCC, 0xCC]);
}
