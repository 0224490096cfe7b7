// Demo binary for the corten backend. Builds one of a few sample functions through the
// public builder API, lowers it to machine code and prints the encoded bytes as hex.
// Useful for eyeballing what the register allocator and frame synthesis produce; run with
// RUST_LOG=debug to watch spill decisions and pass transitions.

use bumpalo::Bump;
use clap::Parser;
use corten::core::{Compiler, Session};
use corten::x64::{ArgType, CallConv, InstCode};
use corten::Operand;

#[derive(Parser)]
#[command(name = "cortendemo", about = "Compile sample functions and dump the bytes")]
struct Args {
    /// Which sample to compile: add, pressure or loop.
    #[arg(long, default_value = "add")]
    demo: String,

    /// Base address to assemble at.
    #[arg(long, default_value_t = 0x1000)]
    base: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let arena = Bump::new();
    let session = Session::new(&arena);
    let mut c = Compiler::new(&session);

    let result = match args.demo.as_str() {
        "add" => build_add(&mut c),
        "pressure" => build_pressure(&mut c),
        "loop" => build_loop(&mut c),
        other => {
            eprintln!("unknown demo '{other}', expected add, pressure or loop");
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("graph construction failed: {e}");
        std::process::exit(1);
    }

    match c.make(args.base) {
        Ok(code) => {
            println!("{} bytes at {:#x}", code.len(), code.base);
            for chunk in code.bytes.chunks(16) {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("  {}", hex.join(" "));
            }
            println!("{}", session.stats());
        }
        Err(e) => {
            eprintln!("lowering failed: {e}");
            std::process::exit(1);
        }
    }
}

/// fn(a, b) -> a + b
fn build_add(c: &mut Compiler) -> corten::CompileResult<()> {
    c.new_func(CallConv::host(), &[ArgType::Int64, ArgType::Int64], Some(ArgType::Int64))?;
    let a = c.arg(0)?;
    let b = c.arg(1)?;
    c.add(c.var_op(a), c.var_op(b))?;
    c.ret(Some(c.var_op(a)))?;
    c.end_func()?;
    Ok(())
}

/// Sums more simultaneously-live variables than there are registers.
fn build_pressure(c: &mut Compiler) -> corten::CompileResult<()> {
    c.new_func(CallConv::host(), &[ArgType::Int64], Some(ArgType::Int64))?;
    let seed = c.arg(0)?;

    let mut vars = Vec::new();
    for i in 0..20 {
        let v = c.gpq(Some(&format!("t{i}")))?;
        c.mov(c.var_op(v), Operand::imm(i))?;
        c.add(c.var_op(v), c.var_op(seed))?;
        vars.push(v);
    }
    let acc = vars[0];
    for v in &vars[1..] {
        c.add(c.var_op(acc), c.var_op(*v))?;
    }
    c.ret(Some(c.var_op(acc)))?;
    c.end_func()?;
    Ok(())
}

/// Counts the argument down to zero in a backward-branching loop.
fn build_loop(c: &mut Compiler) -> corten::CompileResult<()> {
    c.new_func(CallConv::host(), &[ArgType::Int64], Some(ArgType::Int64))?;
    let n = c.arg(0)?;
    let total = c.gpq(Some("total"))?;

    c.mov(c.var_op(total), Operand::imm(0))?;
    let top = c.new_label();
    let done = c.new_label();
    c.bind(top)?;
    c.cmp(c.var_op(n), Operand::imm(0))?;
    c.j(InstCode::Jle, done)?;
    c.add(c.var_op(total), c.var_op(n))?;
    c.sub(c.var_op(n), Operand::imm(1))?;
    c.jmp(top)?;
    c.bind(done)?;
    c.ret(Some(c.var_op(total)))?;
    c.end_func()?;
    Ok(())
}
