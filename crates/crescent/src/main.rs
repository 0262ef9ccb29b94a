//! The `crescent` interpreter: runs Lua source or precompiled chunks.
//!
//! Exit codes: 0 on success, 1 on an uncaught runtime error, 2 on a
//! compile or load error, 3 on an I/O error.

use crescent_vm::binary_chunk::LUA_SIGNATURE;
use crescent_vm::vm::Vm;
use std::io::Read;

const VERSION_BANNER: &str = "Crescent 0.1.0 -- Lua 5.3";

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let mut script_file: Option<String> = None;
    let mut exec_statements: Vec<String> = Vec::new();
    let mut interactive = false;
    let mut show_version = false;
    let mut script_args: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--" => {
                script_args.extend(args[i + 1..].iter().cloned());
                break;
            }
            "-v" => {
                show_version = true;
                i += 1;
            }
            "-i" => {
                interactive = true;
                i += 1;
            }
            "-e" => {
                if i + 1 >= args.len() {
                    eprintln!("crescent: '-e' needs argument");
                    std::process::exit(1);
                }
                exec_statements.push(args[i + 1].clone());
                i += 2;
            }
            arg if arg.starts_with("-e") && arg.len() > 2 => {
                exec_statements.push(arg[2..].to_string());
                i += 1;
            }
            arg if arg.starts_with('-') && arg != "-" => {
                eprintln!("crescent: unrecognized option '{arg}'");
                eprintln!("usage: crescent [-v] [-i] [-e stat] [script [args]]");
                std::process::exit(1);
            }
            _ => {
                script_file = Some(args[i].clone());
                script_args = args[i + 1..].to_vec();
                break;
            }
        }
    }

    if show_version {
        println!("{VERSION_BANNER}");
        if script_file.is_none() && exec_statements.is_empty() && !interactive {
            return;
        }
    }

    let mut vm = Vm::new();
    crescent_stdlib::register_all(&mut vm);
    set_arg_table(&mut vm, script_file.as_deref(), &script_args);

    for stat in &exec_statements {
        run_source(&mut vm, stat.as_bytes(), "=(command line)");
    }

    match script_file.as_deref() {
        Some("-") => {
            let mut buf = Vec::new();
            if let Err(e) = std::io::stdin().read_to_end(&mut buf) {
                eprintln!("crescent: cannot read stdin: {e}");
                std::process::exit(3);
            }
            run_any(&mut vm, &buf, "=stdin", false);
        }
        Some(path) => {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    eprintln!("crescent: cannot open {path}: {e}");
                    std::process::exit(3);
                }
            };
            let chunk_name = format!("@{path}");
            run_any(&mut vm, &bytes, &chunk_name, path.ends_with(".luac"));
        }
        None => {
            if exec_statements.is_empty() || interactive {
                println!("{VERSION_BANNER}");
                run_repl(&mut vm);
            }
        }
    }

    if interactive && script_file.is_some() {
        run_repl(&mut vm);
    }
}

/// Run either source text or a binary chunk, picked by the signature.
fn run_any(vm: &mut Vm, bytes: &[u8], chunk_name: &str, force_binary: bool) {
    if force_binary || bytes.starts_with(LUA_SIGNATURE) {
        let closure = match vm.load_binary(bytes, chunk_name) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("crescent: {e}");
                std::process::exit(2);
            }
        };
        run_closure(vm, closure);
    } else {
        let source = strip_shebang(bytes);
        let closure = match vm.load_source(source, chunk_name) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("crescent: {chunk_name}:{e}");
                std::process::exit(2);
            }
        };
        run_closure(vm, closure);
    }
}

fn run_source(vm: &mut Vm, source: &[u8], chunk_name: &str) {
    match vm.load_source(source, chunk_name) {
        Ok(closure) => run_closure(vm, closure),
        Err(e) => {
            eprintln!("crescent: {e}");
            std::process::exit(2);
        }
    }
}

fn run_closure(vm: &mut Vm, closure: crescent_core::value::LuaValue) {
    if let Err(e) = vm.call_value(closure, &[]) {
        eprintln!("crescent: {}", e.display(&vm.strings));
        if let Some(tb) = vm.last_traceback.take() {
            eprintln!("{tb}");
        }
        std::process::exit(1);
    }
}

/// `arg[0]` is the script, `arg[1..]` its arguments, `arg[-1]` the
/// interpreter.
fn set_arg_table(vm: &mut Vm, script: Option<&str>, script_args: &[String]) {
    use crescent_core::value::LuaValue;
    let t = vm.gc.alloc_table(script_args.len(), 2);
    let prog = vm.strings.intern(b"crescent");
    vm.gc.get_table_mut(t).raw_seti(-1, LuaValue::Str(prog));
    if let Some(path) = script {
        let id = vm.strings.intern(path.as_bytes());
        vm.gc.get_table_mut(t).raw_seti(0, LuaValue::Str(id));
    }
    for (i, a) in script_args.iter().enumerate() {
        let id = vm.strings.intern(a.as_bytes());
        vm.gc
            .get_table_mut(t)
            .raw_seti(i as i64 + 1, LuaValue::Str(id));
    }
    vm.set_global("arg", LuaValue::Table(t));
}

/// A `#!` first line is launcher territory, not Lua syntax.
fn strip_shebang(source: &[u8]) -> &[u8] {
    if source.starts_with(b"#") {
        match source.iter().position(|&b| b == b'\n') {
            Some(pos) => &source[pos..],
            None => b"",
        }
    } else {
        source
    }
}

fn run_repl(vm: &mut Vm) {
    let config = rustyline::config::Config::builder()
        .auto_add_history(true)
        .build();
    let mut rl = match rustyline::DefaultEditor::with_config(config) {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("crescent: cannot initialize REPL: {e}");
            return;
        }
    };

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                // Try to compile as an expression first so `1+2` prints
                // 3; fall back to a statement. Only one form ever runs.
                let as_expr = format!("return {line}");
                let closure = vm
                    .load_source(as_expr.as_bytes(), "=stdin")
                    .or_else(|_| vm.load_source(line.as_bytes(), "=stdin"));
                match closure {
                    Ok(closure) => {
                        if let Err(e) = run_and_print(vm, closure) {
                            eprintln!("{e}");
                        }
                    }
                    Err(e) => eprintln!("stdin:{e}"),
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => continue,
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("crescent: readline error: {e}");
                break;
            }
        }
    }
}

fn run_and_print(vm: &mut Vm, closure: crescent_core::value::LuaValue) -> Result<(), String> {
    match vm.call_value(closure, &[]) {
        Ok(results) => {
            if !results.is_empty() {
                let parts: Vec<String> = results
                    .iter()
                    .map(|v| crescent_vm::vm::format_value(*v, &vm.gc, &vm.strings))
                    .collect();
                println!("{}", parts.join("\t"));
            }
            Ok(())
        }
        Err(e) => Err(e.display(&vm.strings)),
    }
}
