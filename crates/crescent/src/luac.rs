//! The `crescentc` compiler driver: Lua source in, `.luac` chunk out.
//!
//! Exit codes: 0 on success, 2 on a syntax error, 3 on an I/O error.

use crescent_core::opcode::InstructionFormat;
use crescent_core::proto::Proto;
use crescent_core::string::StringInterner;
use crescent_vm::binary_chunk;

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut list_bytecode = false;
    let mut parse_only = false;
    let mut strip_debug = false;
    let mut output: Option<String> = None;
    let mut inputs: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-l" => {
                list_bytecode = true;
                i += 1;
            }
            "-p" => {
                parse_only = true;
                i += 1;
            }
            "-s" => {
                strip_debug = true;
                i += 1;
            }
            "-o" => {
                if i + 1 >= args.len() {
                    eprintln!("crescentc: '-o' needs argument");
                    std::process::exit(2);
                }
                output = Some(args[i + 1].clone());
                i += 2;
            }
            "-v" => {
                println!("Crescent 0.1.0 -- Lua 5.3 compiler");
                i += 1;
            }
            "--" => {
                inputs.extend(args[i + 1..].iter().cloned());
                break;
            }
            arg if arg.starts_with('-') => {
                eprintln!("crescentc: unrecognized option '{arg}'");
                eprintln!("usage: crescentc [-l] [-p] [-s] [-o out.luac] in.lua");
                std::process::exit(2);
            }
            _ => {
                inputs.push(args[i].clone());
                i += 1;
            }
        }
    }

    if inputs.is_empty() {
        eprintln!("usage: crescentc [-l] [-p] [-s] [-o out.luac] in.lua");
        std::process::exit(2);
    }

    let output = output.unwrap_or_else(|| "luac.out".to_string());

    for path in &inputs {
        let source = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                eprintln!("crescentc: cannot open {path}: {e}");
                std::process::exit(3);
            }
        };
        let chunk_name = format!("@{path}");
        let (proto, strings) =
            match crescent_compiler::compile(&source, &chunk_name) {
                Ok(ok) => ok,
                Err(e) => {
                    eprintln!("crescentc: {path}:{e}");
                    std::process::exit(2);
                }
            };

        if list_bytecode {
            list_proto(&proto, &strings, path, true);
        }
        if parse_only {
            continue;
        }

        let bytes = binary_chunk::dump(&proto, &strings, strip_debug);
        if let Err(e) = std::fs::write(&output, bytes) {
            eprintln!("crescentc: cannot write {output}: {e}");
            std::process::exit(3);
        }
    }
}

/// Print a luac-style listing of a function and its children.
fn list_proto(proto: &Proto, strings: &StringInterner, path: &str, is_main: bool) {
    let kind = if is_main { "main" } else { "function" };
    println!(
        "\n{kind} <{path}:{},{}> ({} instructions)",
        proto.line_defined,
        proto.last_line_defined,
        proto.code.len()
    );
    for (pc, inst) in proto.code.iter().enumerate() {
        let line = proto.get_line(pc);
        let op = inst.opcode();
        let fields = match op.format() {
            InstructionFormat::IABC => {
                format!("{} {} {}", inst.a(), inst.b(), inst.c())
            }
            InstructionFormat::IABx => format!("{} {}", inst.a(), inst.bx()),
            InstructionFormat::IAsBx => format!("{} {}", inst.a(), inst.sbx()),
            InstructionFormat::IAx => format!("{}", inst.ax_field()),
        };
        println!("\t{}\t[{}]\t{}\t{}", pc + 1, line, op.name(), fields);
    }
    println!(
        "constants ({}), upvalues ({}), functions ({})",
        proto.constants.len(),
        proto.upvalues.len(),
        proto.protos.len()
    );
    for child in &proto.protos {
        list_proto(child, strings, path, false);
    }
}
