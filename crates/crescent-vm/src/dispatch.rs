//! The bytecode dispatch loop.
//!
//! `run` executes frames until the entry frame returns. Lua-to-Lua calls
//! push frames and re-enter the loop; native calls and metamethod
//! invocations run synchronously through `Vm::call_value`.

use crate::arith::{self, ArithOp, ArithResult};
use crate::callinfo::CallInfo;
use crate::coerce::{self, Number};
use crate::compare::{self, CompareResult};
use crate::error::LuaError;
use crate::metamethod::{self, MAX_META_CHAIN};
use crate::vm::Vm;
use crescent_core::opcode::{self, OpCode};
use crescent_core::proto::{Constant, Proto};
use crescent_core::value::LuaValue;
use std::rc::Rc;

/// Convert a constant-pool entry to a runtime value.
pub fn constant_to_value(k: &Constant) -> LuaValue {
    match k {
        Constant::Nil => LuaValue::Nil,
        Constant::Boolean(b) => LuaValue::Boolean(*b),
        Constant::Integer(i) => LuaValue::Integer(*i),
        Constant::Float(f) => LuaValue::Float(*f),
        Constant::Str(id) => LuaValue::Str(*id),
    }
}

/// Decode an RK operand: constant-table index behind the high bit, a
/// register otherwise.
#[inline]
fn rk(vm: &Vm, base: usize, proto: &Proto, field: u32) -> LuaValue {
    if opcode::is_k(field) {
        constant_to_value(&proto.constants[opcode::index_k(field) as usize])
    } else {
        vm.stack[base + field as usize]
    }
}

/// Runtime error with `source:line:` position of the current instruction.
fn rt_error(vm: &Vm, proto: &Proto, pc: usize, msg: impl Into<String>) -> LuaError {
    let line = proto.get_line(pc);
    LuaError::Runtime(format!("{}:{}: {}", vm.chunk_id(proto), line, msg.into()))
}

/// Push a call frame for the Lua closure sitting at `func_stack_idx`,
/// with `nargs` arguments laid out right after it. Vararg functions get
/// their fixed parameters relocated above the argument block so `...`
/// stays addressable.
pub fn push_lua_frame(
    vm: &mut Vm,
    func_stack_idx: usize,
    nargs: usize,
    num_results: i32,
) -> Result<(), LuaError> {
    if vm.call_stack.len() >= vm.max_call_depth {
        return Err(LuaError::StackOverflow);
    }
    let closure_idx = vm.stack[func_stack_idx]
        .as_closure_idx()
        .expect("push_lua_frame on a non-closure");
    let proto = vm.gc.get_closure(closure_idx).proto.clone();
    let num_params = proto.num_params as usize;
    let max_stack = proto.max_stack_size as usize;
    let arg_base = func_stack_idx + 1;

    let mut ci = CallInfo::new(0, closure_idx, func_stack_idx);
    ci.num_results = num_results;

    if proto.is_vararg {
        let actual_base = arg_base + nargs;
        vm.ensure_stack(actual_base, max_stack);
        for i in 0..num_params.min(nargs) {
            vm.stack[actual_base + i] = vm.stack[arg_base + i];
        }
        for i in num_params.min(nargs)..max_stack {
            vm.stack[actual_base + i] = LuaValue::Nil;
        }
        vm.stack_top = actual_base + max_stack;
        ci.base = actual_base;
        ci.vararg_base = Some(arg_base);
    } else {
        vm.ensure_stack(arg_base, max_stack);
        for i in nargs.min(num_params)..max_stack {
            vm.stack[arg_base + i] = LuaValue::Nil;
        }
        vm.stack_top = arg_base + max_stack;
        ci.base = arg_base;
    }
    vm.call_stack.push(ci);
    Ok(())
}

/// Place a finished frame's results into its caller's window.
fn finish_return(vm: &mut Vm, ci: CallInfo, results: Vec<LuaValue>) {
    let dst = ci.func_stack_idx;
    if ci.num_results < 0 {
        vm.ensure_stack(dst, results.len());
        for (i, v) in results.iter().enumerate() {
            vm.stack[dst + i] = *v;
        }
        vm.stack_top = dst + results.len();
    } else {
        let want = ci.num_results as usize;
        vm.ensure_stack(dst, want);
        for i in 0..want {
            vm.stack[dst + i] = results.get(i).copied().unwrap_or(LuaValue::Nil);
        }
        // Restore the caller's register window top.
        if let Some(caller) = vm.call_stack.last() {
            let caller_max = vm.gc.get_closure(caller.closure_idx).proto.max_stack_size;
            vm.stack_top = caller.base + caller_max as usize;
        }
    }
}

/// Execute until the frame at `entry_depth` returns; hands back its
/// results. Errors propagate with the frame chain intact so the caller
/// can capture a traceback before unwinding.
pub fn run(vm: &mut Vm, entry_depth: usize) -> Result<Vec<LuaValue>, LuaError> {
    'reentry: loop {
        let ci_idx = vm.call_stack.len() - 1;
        let closure_idx = vm.call_stack[ci_idx].closure_idx;
        let proto: Rc<Proto> = vm.gc.get_closure(closure_idx).proto.clone();

        loop {
            let base = vm.call_stack[ci_idx].base;
            let pc = vm.call_stack[ci_idx].pc;
            if pc >= proto.code.len() {
                // Fell off the end: implicit return of nothing.
                vm.close_upvalues(base);
                let ci = vm.call_stack.pop().unwrap();
                if ci_idx == entry_depth {
                    return Ok(vec![]);
                }
                finish_return(vm, ci, vec![]);
                continue 'reentry;
            }
            let inst = proto.code[pc];
            vm.call_stack[ci_idx].pc = pc + 1;
            let op = inst.opcode();
            let a = inst.a() as usize;

            match op {
                OpCode::Move => {
                    vm.stack[base + a] = vm.stack[base + inst.b() as usize];
                }
                OpCode::LoadK => {
                    vm.stack[base + a] = constant_to_value(&proto.constants[inst.bx() as usize]);
                }
                OpCode::LoadKX => {
                    let next = proto.code[vm.call_stack[ci_idx].pc];
                    vm.call_stack[ci_idx].pc += 1;
                    vm.stack[base + a] =
                        constant_to_value(&proto.constants[next.ax_field() as usize]);
                }
                OpCode::LoadBool => {
                    vm.stack[base + a] = LuaValue::Boolean(inst.b() != 0);
                    if inst.c() != 0 {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }
                OpCode::LoadNil => {
                    for i in a..=a + inst.b() as usize {
                        vm.stack[base + i] = LuaValue::Nil;
                    }
                }

                // ---- Upvalues ----
                OpCode::GetUpval => {
                    let uv = vm.gc.get_closure(closure_idx).upvalues[inst.b() as usize];
                    vm.stack[base + a] = vm.get_upval_value(uv);
                }
                OpCode::SetUpval => {
                    let uv = vm.gc.get_closure(closure_idx).upvalues[inst.b() as usize];
                    let val = vm.stack[base + a];
                    vm.set_upval_value(uv, val);
                }

                // ---- Table access ----
                OpCode::GetTabUp => {
                    let uv = vm.gc.get_closure(closure_idx).upvalues[inst.b() as usize];
                    let t = vm.get_upval_value(uv);
                    let key = rk(vm, base, &proto, inst.c());
                    let val = index_value(vm, t, key, &proto, pc)?;
                    vm.stack[base + a] = val;
                }
                OpCode::GetTable => {
                    let t = vm.stack[base + inst.b() as usize];
                    let key = rk(vm, base, &proto, inst.c());
                    let val = index_value(vm, t, key, &proto, pc)?;
                    vm.stack[base + a] = val;
                }
                OpCode::SetTabUp => {
                    let uv = vm.gc.get_closure(closure_idx).upvalues[a];
                    let t = vm.get_upval_value(uv);
                    let key = rk(vm, base, &proto, inst.b());
                    let val = rk(vm, base, &proto, inst.c());
                    newindex_value(vm, t, key, val, &proto, pc)?;
                }
                OpCode::SetTable => {
                    let t = vm.stack[base + a];
                    let key = rk(vm, base, &proto, inst.b());
                    let val = rk(vm, base, &proto, inst.c());
                    newindex_value(vm, t, key, val, &proto, pc)?;
                }
                OpCode::NewTable => {
                    let narr = opcode::fb_to_int(inst.b()) as usize;
                    let nhash = opcode::fb_to_int(inst.c()) as usize;
                    let idx = vm.gc.alloc_table(narr, nhash);
                    vm.stack[base + a] = LuaValue::Table(idx);
                    vm.maybe_collect();
                }
                OpCode::Self_ => {
                    let t = vm.stack[base + inst.b() as usize];
                    let key = rk(vm, base, &proto, inst.c());
                    vm.stack[base + a + 1] = t;
                    let val = index_value(vm, t, key, &proto, pc)?;
                    vm.stack[base + a] = val;
                }

                // ---- Arithmetic ----
                OpCode::Add
                | OpCode::Sub
                | OpCode::Mul
                | OpCode::Mod
                | OpCode::Pow
                | OpCode::Div
                | OpCode::IDiv
                | OpCode::BAnd
                | OpCode::BOr
                | OpCode::BXor
                | OpCode::Shl
                | OpCode::Shr => {
                    let aop = match op {
                        OpCode::Add => ArithOp::Add,
                        OpCode::Sub => ArithOp::Sub,
                        OpCode::Mul => ArithOp::Mul,
                        OpCode::Mod => ArithOp::Mod,
                        OpCode::Pow => ArithOp::Pow,
                        OpCode::Div => ArithOp::Div,
                        OpCode::IDiv => ArithOp::IDiv,
                        OpCode::BAnd => ArithOp::BAnd,
                        OpCode::BOr => ArithOp::BOr,
                        OpCode::BXor => ArithOp::BXor,
                        OpCode::Shl => ArithOp::Shl,
                        _ => ArithOp::Shr,
                    };
                    let vb = rk(vm, base, &proto, inst.b());
                    let vc = rk(vm, base, &proto, inst.c());
                    let val = arith_with_mm(vm, aop, vb, vc, &proto, pc)?;
                    vm.stack[base + a] = val;
                }
                OpCode::Unm => {
                    let v = vm.stack[base + inst.b() as usize];
                    let val = match arith::arith_unm(v, &vm.strings) {
                        ArithResult::Ok(r) => r,
                        ArithResult::NeedMetamethod => {
                            match metamethod::get_metamethod(v, vm.mm.unm, &vm.gc) {
                                Some(mm) => first_result(vm.call_value(mm, &[v, v])?),
                                None => {
                                    return Err(rt_error(
                                        vm,
                                        &proto,
                                        pc,
                                        format!(
                                            "attempt to perform arithmetic on a {} value",
                                            v.type_name()
                                        ),
                                    ))
                                }
                            }
                        }
                        ArithResult::Error(LuaError::Runtime(msg)) => {
                            return Err(rt_error(vm, &proto, pc, msg))
                        }
                        ArithResult::Error(e) => return Err(e),
                    };
                    vm.stack[base + a] = val;
                }
                OpCode::BNot => {
                    let v = vm.stack[base + inst.b() as usize];
                    let val = match arith::arith_bnot(v, &vm.strings) {
                        ArithResult::Ok(r) => r,
                        ArithResult::NeedMetamethod => {
                            match metamethod::get_metamethod(v, vm.mm.bnot, &vm.gc) {
                                Some(mm) => first_result(vm.call_value(mm, &[v, v])?),
                                None => {
                                    return Err(rt_error(
                                        vm,
                                        &proto,
                                        pc,
                                        format!(
                                            "attempt to perform bitwise operation on a {} value",
                                            v.type_name()
                                        ),
                                    ))
                                }
                            }
                        }
                        ArithResult::Error(LuaError::Runtime(msg)) => {
                            return Err(rt_error(vm, &proto, pc, msg))
                        }
                        ArithResult::Error(e) => return Err(e),
                    };
                    vm.stack[base + a] = val;
                }
                OpCode::Not => {
                    let v = vm.stack[base + inst.b() as usize];
                    vm.stack[base + a] = LuaValue::Boolean(v.is_falsy());
                }
                OpCode::Len => {
                    let v = vm.stack[base + inst.b() as usize];
                    let val = len_value(vm, v, &proto, pc)?;
                    vm.stack[base + a] = val;
                }
                OpCode::Concat => {
                    let b = inst.b() as usize;
                    let c = inst.c() as usize;
                    let mut acc = vm.stack[base + c];
                    for i in (b..c).rev() {
                        let lhs = vm.stack[base + i];
                        acc = concat_pair(vm, lhs, acc, &proto, pc)?;
                    }
                    vm.stack[base + a] = acc;
                    vm.maybe_collect();
                }

                // ---- Control flow ----
                OpCode::Jmp => {
                    if a != 0 {
                        vm.close_upvalues(base + a - 1);
                    }
                    let new_pc = vm.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                    vm.call_stack[ci_idx].pc = new_pc as usize;
                }
                OpCode::Eq => {
                    let vb = rk(vm, base, &proto, inst.b());
                    let vc = rk(vm, base, &proto, inst.c());
                    let eq = eq_values(vm, vb, vc)?;
                    if eq != (a != 0) {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }
                OpCode::Lt => {
                    let vb = rk(vm, base, &proto, inst.b());
                    let vc = rk(vm, base, &proto, inst.c());
                    let lt = lt_values(vm, vb, vc, &proto, pc)?;
                    if lt != (a != 0) {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }
                OpCode::Le => {
                    let vb = rk(vm, base, &proto, inst.b());
                    let vc = rk(vm, base, &proto, inst.c());
                    let le = le_values(vm, vb, vc, &proto, pc)?;
                    if le != (a != 0) {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }
                OpCode::Test => {
                    if vm.stack[base + a].is_truthy() != (inst.c() != 0) {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }
                OpCode::TestSet => {
                    let vb = vm.stack[base + inst.b() as usize];
                    if vb.is_truthy() == (inst.c() != 0) {
                        vm.stack[base + a] = vb;
                    } else {
                        vm.call_stack[ci_idx].pc += 1;
                    }
                }

                // ---- Calls ----
                OpCode::Call => {
                    let b = inst.b() as usize;
                    let c = inst.c();
                    let func_idx = base + a;
                    let nargs = if b == 0 {
                        vm.stack_top.saturating_sub(func_idx + 1)
                    } else {
                        b - 1
                    };
                    let num_results = c as i32 - 1;
                    let func = vm.stack[func_idx];

                    if func.as_closure_idx().is_some() {
                        push_lua_frame(vm, func_idx, nargs, num_results)
                            .map_err(|e| overflow_pos(vm, &proto, pc, e))?;
                        vm.maybe_collect();
                        continue 'reentry;
                    }
                    // Natives and __call objects run synchronously.
                    let args: Vec<LuaValue> =
                        (0..nargs).map(|i| vm.stack[func_idx + 1 + i]).collect();
                    let results = vm
                        .call_value(func, &args)
                        .map_err(|e| call_error_pos(vm, &proto, pc, func, e))?;
                    place_results(vm, func_idx, num_results, results);
                    if num_results >= 0 {
                        vm.stack_top = base + proto.max_stack_size as usize;
                    }
                }

                OpCode::TailCall => {
                    let b = inst.b() as usize;
                    let func_idx = base + a;
                    let nargs = if b == 0 {
                        vm.stack_top.saturating_sub(func_idx + 1)
                    } else {
                        b - 1
                    };
                    let func = vm.stack[func_idx];
                    vm.close_upvalues(base);

                    if func.as_closure_idx().is_some() {
                        // Reuse the frame: shift the callee down over it.
                        let old = vm.call_stack.pop().unwrap();
                        let dst = old.func_stack_idx;
                        vm.stack[dst] = func;
                        for i in 0..nargs {
                            vm.stack[dst + 1 + i] = vm.stack[func_idx + 1 + i];
                        }
                        push_lua_frame(vm, dst, nargs, old.num_results)
                            .map_err(|e| overflow_pos(vm, &proto, pc, e))?;
                        continue 'reentry;
                    }
                    let args: Vec<LuaValue> =
                        (0..nargs).map(|i| vm.stack[func_idx + 1 + i]).collect();
                    let results = vm
                        .call_value(func, &args)
                        .map_err(|e| call_error_pos(vm, &proto, pc, func, e))?;
                    let ci = vm.call_stack.pop().unwrap();
                    if ci_idx == entry_depth {
                        return Ok(results);
                    }
                    finish_return(vm, ci, results);
                    continue 'reentry;
                }

                OpCode::Return => {
                    let b = inst.b() as usize;
                    let results: Vec<LuaValue> = if b == 0 {
                        (base + a..vm.stack_top).map(|i| vm.stack[i]).collect()
                    } else {
                        (0..b - 1).map(|i| vm.stack[base + a + i]).collect()
                    };
                    vm.close_upvalues(base);
                    let ci = vm.call_stack.pop().unwrap();
                    if ci_idx == entry_depth {
                        return Ok(results);
                    }
                    finish_return(vm, ci, results);
                    continue 'reentry;
                }

                // ---- Loops ----
                OpCode::ForPrep => {
                    for_prep(vm, base + a, &proto, pc)?;
                    let new_pc = vm.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                    vm.call_stack[ci_idx].pc = new_pc as usize;
                }
                OpCode::ForLoop => {
                    if for_loop_step(vm, base + a) {
                        let new_pc = vm.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                        vm.call_stack[ci_idx].pc = new_pc as usize;
                    }
                }
                OpCode::TForCall => {
                    let c = inst.c() as usize;
                    let func = vm.stack[base + a];
                    let args = [vm.stack[base + a + 1], vm.stack[base + a + 2]];
                    let results = vm.call_value(func, &args)?;
                    vm.ensure_stack(base + a + 3, c);
                    for i in 0..c {
                        vm.stack[base + a + 3 + i] =
                            results.get(i).copied().unwrap_or(LuaValue::Nil);
                    }
                }
                OpCode::TForLoop => {
                    let control = vm.stack[base + a + 1];
                    if !control.is_nil() {
                        vm.stack[base + a] = control;
                        let new_pc = vm.call_stack[ci_idx].pc as i64 + inst.sbx() as i64;
                        vm.call_stack[ci_idx].pc = new_pc as usize;
                    }
                }

                // ---- Tables & closures ----
                OpCode::SetList => {
                    let b = inst.b() as usize;
                    let mut c = inst.c();
                    if c == 0 {
                        let next = proto.code[vm.call_stack[ci_idx].pc];
                        vm.call_stack[ci_idx].pc += 1;
                        c = next.ax_field();
                    }
                    let n = if b == 0 {
                        vm.stack_top.saturating_sub(base + a + 1)
                    } else {
                        b
                    };
                    let t = vm.stack[base + a];
                    let Some(tidx) = t.as_table_idx() else {
                        return Err(rt_error(vm, &proto, pc, "internal: SETLIST on non-table"));
                    };
                    let offset = (c as i64 - 1) * opcode::FIELDS_PER_FLUSH as i64;
                    for i in 1..=n {
                        let val = vm.stack[base + a + i];
                        vm.gc.get_table_mut(tidx).raw_seti(offset + i as i64, val);
                    }
                    if b == 0 {
                        vm.stack_top = base + proto.max_stack_size as usize;
                    }
                }

                OpCode::Closure => {
                    let bx = inst.bx() as usize;
                    let child = proto.protos[bx].clone();
                    let descs = child.upvalues.clone();
                    let mut upvals = Vec::with_capacity(descs.len());
                    for desc in &descs {
                        if desc.in_stack {
                            let uv = vm.find_or_create_open_upval(base + desc.index as usize);
                            upvals.push(uv);
                        } else {
                            let uv =
                                vm.gc.get_closure(closure_idx).upvalues[desc.index as usize];
                            upvals.push(uv);
                        }
                    }
                    let new_closure = vm.gc.alloc_closure(child, upvals);
                    vm.stack[base + a] = LuaValue::Function(new_closure);
                    vm.maybe_collect();
                }

                OpCode::VarArg => {
                    let b = inst.b() as usize;
                    let ci = &vm.call_stack[ci_idx];
                    let (vararg_start, count) = match ci.vararg_base {
                        Some(vb) => {
                            let start = vb + proto.num_params as usize;
                            (start, ci.base.saturating_sub(start))
                        }
                        None => (0, 0),
                    };
                    let wanted = if b == 0 { count } else { b - 1 };
                    vm.ensure_stack(base + a, wanted);
                    for i in 0..wanted {
                        vm.stack[base + a + i] = if i < count {
                            vm.stack[vararg_start + i]
                        } else {
                            LuaValue::Nil
                        };
                    }
                    if b == 0 {
                        vm.stack_top = base + a + wanted;
                    }
                }

                OpCode::ExtraArg => {
                    // Consumed by the preceding LOADKX/SETLIST; standalone
                    // it is a no-op.
                }
            }
        }
    }
}

/// First result of a metamethod call, or nil.
fn first_result(results: Vec<LuaValue>) -> LuaValue {
    results.into_iter().next().unwrap_or(LuaValue::Nil)
}

/// Write a native call's results back into the register window.
fn place_results(vm: &mut Vm, dst: usize, num_results: i32, results: Vec<LuaValue>) {
    if num_results < 0 {
        vm.ensure_stack(dst, results.len());
        for (i, v) in results.iter().enumerate() {
            vm.stack[dst + i] = *v;
        }
        vm.stack_top = dst + results.len();
    } else {
        let want = num_results as usize;
        vm.ensure_stack(dst, want);
        for i in 0..want {
            vm.stack[dst + i] = results.get(i).copied().unwrap_or(LuaValue::Nil);
        }
    }
}

/// Attach a position to a stack overflow raised while entering a call.
fn overflow_pos(vm: &Vm, proto: &Proto, pc: usize, e: LuaError) -> LuaError {
    match e {
        LuaError::StackOverflow => rt_error(vm, proto, pc, "stack overflow"),
        other => other,
    }
}

/// Attach a position to "attempt to call" errors raised directly by this
/// call site (errors from inside the callee already carry one).
fn call_error_pos(vm: &Vm, proto: &Proto, pc: usize, func: LuaValue, e: LuaError) -> LuaError {
    match &e {
        LuaError::Runtime(msg) if msg.starts_with("attempt to call a") => rt_error(
            vm,
            proto,
            pc,
            format!("attempt to call a {} value", func.type_name()),
        ),
        _ => e,
    }
}

// ---- Indexing with metamethods ----

/// `t[key]` with the `__index` chain (bounded).
pub fn index_value(
    vm: &mut Vm,
    t: LuaValue,
    key: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<LuaValue, LuaError> {
    let mut current = t;
    for _ in 0..MAX_META_CHAIN {
        if let Some(tidx) = current.as_table_idx() {
            let raw = vm.gc.get_table(tidx).raw_get(key);
            if !raw.is_nil() {
                return Ok(raw);
            }
            match metamethod::get_metamethod(current, vm.mm.index, &vm.gc) {
                None => return Ok(LuaValue::Nil),
                Some(handler) => {
                    if handler.is_function() {
                        return Ok(first_result(vm.call_value(handler, &[current, key])?));
                    }
                    current = handler;
                }
            }
        } else {
            match metamethod::get_metamethod(current, vm.mm.index, &vm.gc) {
                Some(handler) => {
                    if handler.is_function() {
                        return Ok(first_result(vm.call_value(handler, &[current, key])?));
                    }
                    current = handler;
                }
                None => {
                    return Err(rt_error(
                        vm,
                        proto,
                        pc,
                        format!("attempt to index a {} value", current.type_name()),
                    ))
                }
            }
        }
    }
    Err(rt_error(vm, proto, pc, "'__index' chain too long; possible loop"))
}

/// `t[key] = val` with the `__newindex` chain (bounded).
pub fn newindex_value(
    vm: &mut Vm,
    t: LuaValue,
    key: LuaValue,
    val: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<(), LuaError> {
    let mut current = t;
    for _ in 0..MAX_META_CHAIN {
        if let Some(tidx) = current.as_table_idx() {
            let existing = vm.gc.get_table(tidx).raw_get(key);
            if !existing.is_nil() {
                // Present keys bypass __newindex.
                return vm
                    .gc
                    .get_table_mut(tidx)
                    .raw_set(key, val)
                    .map_err(|m| rt_error(vm, proto, pc, m));
            }
            match metamethod::get_metamethod(current, vm.mm.newindex, &vm.gc) {
                None => {
                    return vm
                        .gc
                        .get_table_mut(tidx)
                        .raw_set(key, val)
                        .map_err(|m| rt_error(vm, proto, pc, m));
                }
                Some(handler) => {
                    if handler.is_function() {
                        vm.call_value(handler, &[current, key, val])?;
                        return Ok(());
                    }
                    current = handler;
                }
            }
        } else {
            match metamethod::get_metamethod(current, vm.mm.newindex, &vm.gc) {
                Some(handler) => {
                    if handler.is_function() {
                        vm.call_value(handler, &[current, key, val])?;
                        return Ok(());
                    }
                    current = handler;
                }
                None => {
                    return Err(rt_error(
                        vm,
                        proto,
                        pc,
                        format!("attempt to index a {} value", current.type_name()),
                    ))
                }
            }
        }
    }
    Err(rt_error(vm, proto, pc, "'__newindex' chain too long; possible loop"))
}

// ---- Arithmetic / comparison / length / concat with metamethods ----

fn arith_with_mm(
    vm: &mut Vm,
    op: ArithOp,
    a: LuaValue,
    b: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<LuaValue, LuaError> {
    match arith::arith_op(op, a, b, &vm.strings) {
        ArithResult::Ok(v) => Ok(v),
        ArithResult::Error(LuaError::Runtime(msg)) => Err(rt_error(vm, proto, pc, msg)),
        ArithResult::Error(e) => Err(e),
        ArithResult::NeedMetamethod => {
            let name = vm.mm.for_event(op.event());
            let mm = metamethod::get_metamethod(a, name, &vm.gc)
                .or_else(|| metamethod::get_metamethod(b, name, &vm.gc));
            match mm {
                Some(handler) => Ok(first_result(vm.call_value(handler, &[a, b])?)),
                None => {
                    let offender = if coerce::to_number(a, &vm.strings).is_none() {
                        a
                    } else {
                        b
                    };
                    let what = if op.is_bitwise() {
                        "perform bitwise operation on"
                    } else {
                        "perform arithmetic on"
                    };
                    Err(rt_error(
                        vm,
                        proto,
                        pc,
                        format!("attempt to {what} a {} value", offender.type_name()),
                    ))
                }
            }
        }
    }
}

/// Equality with `__eq`: consulted only when both operands are tables
/// and not raw-equal.
pub fn eq_values(vm: &mut Vm, a: LuaValue, b: LuaValue) -> Result<bool, LuaError> {
    if compare::raw_eq(a, b) {
        return Ok(true);
    }
    if a.is_table() && b.is_table() {
        let mm = metamethod::get_metamethod(a, vm.mm.eq, &vm.gc)
            .or_else(|| metamethod::get_metamethod(b, vm.mm.eq, &vm.gc));
        if let Some(handler) = mm {
            let r = first_result(vm.call_value(handler, &[a, b])?);
            return Ok(r.is_truthy());
        }
    }
    Ok(false)
}

pub fn lt_values(
    vm: &mut Vm,
    a: LuaValue,
    b: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<bool, LuaError> {
    match compare::raw_lt(a, b, &vm.strings) {
        CompareResult::Ok(r) => Ok(r),
        CompareResult::NeedMetamethod => {
            let mm = metamethod::get_metamethod(a, vm.mm.lt, &vm.gc)
                .or_else(|| metamethod::get_metamethod(b, vm.mm.lt, &vm.gc));
            match mm {
                Some(handler) => {
                    Ok(first_result(vm.call_value(handler, &[a, b])?).is_truthy())
                }
                None => Err(rt_error(
                    vm,
                    proto,
                    pc,
                    format!(
                        "attempt to compare {} with {}",
                        a.type_name(),
                        b.type_name()
                    ),
                )),
            }
        }
    }
}

pub fn le_values(
    vm: &mut Vm,
    a: LuaValue,
    b: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<bool, LuaError> {
    match compare::raw_le(a, b, &vm.strings) {
        CompareResult::Ok(r) => Ok(r),
        CompareResult::NeedMetamethod => {
            if let Some(handler) = metamethod::get_metamethod(a, vm.mm.le, &vm.gc)
                .or_else(|| metamethod::get_metamethod(b, vm.mm.le, &vm.gc))
            {
                return Ok(first_result(vm.call_value(handler, &[a, b])?).is_truthy());
            }
            // 5.3 fallback: a <= b  ==  not (b < a).
            if let Some(handler) = metamethod::get_metamethod(a, vm.mm.lt, &vm.gc)
                .or_else(|| metamethod::get_metamethod(b, vm.mm.lt, &vm.gc))
            {
                return Ok(!first_result(vm.call_value(handler, &[b, a])?).is_truthy());
            }
            Err(rt_error(
                vm,
                proto,
                pc,
                format!(
                    "attempt to compare {} with {}",
                    a.type_name(),
                    b.type_name()
                ),
            ))
        }
    }
}

/// The `#` operator: string byte length, `__len`, or the table border.
pub fn len_value(
    vm: &mut Vm,
    v: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<LuaValue, LuaError> {
    if let Some(id) = v.as_string_id() {
        return Ok(LuaValue::Integer(vm.strings.get_bytes(id).len() as i64));
    }
    if let Some(handler) = metamethod::get_metamethod(v, vm.mm.len, &vm.gc) {
        return Ok(first_result(vm.call_value(handler, &[v])?));
    }
    if let Some(tidx) = v.as_table_idx() {
        return Ok(LuaValue::Integer(vm.gc.get_table(tidx).length()));
    }
    Err(rt_error(
        vm,
        proto,
        pc,
        format!("attempt to get length of a {} value", v.type_name()),
    ))
}

/// One concatenation step with `__concat` fallback.
pub fn concat_pair(
    vm: &mut Vm,
    a: LuaValue,
    b: LuaValue,
    proto: &Proto,
    pc: usize,
) -> Result<LuaValue, LuaError> {
    let a_ok = matches!(a, LuaValue::Str(_) | LuaValue::Integer(_) | LuaValue::Float(_));
    let b_ok = matches!(b, LuaValue::Str(_) | LuaValue::Integer(_) | LuaValue::Float(_));
    if a_ok && b_ok {
        let sa = coerce::to_string_for_concat(a, &mut vm.strings).unwrap();
        let sb = coerce::to_string_for_concat(b, &mut vm.strings).unwrap();
        let mut bytes = vm.strings.get_bytes(sa).to_vec();
        bytes.extend_from_slice(vm.strings.get_bytes(sb));
        let id = vm.strings.intern(&bytes);
        return Ok(LuaValue::Str(id));
    }
    let mm = metamethod::get_metamethod(a, vm.mm.concat, &vm.gc)
        .or_else(|| metamethod::get_metamethod(b, vm.mm.concat, &vm.gc));
    match mm {
        Some(handler) => Ok(first_result(vm.call_value(handler, &[a, b])?)),
        None => {
            let offender = if a_ok { b } else { a };
            Err(rt_error(
                vm,
                proto,
                pc,
                format!("attempt to concatenate a {} value", offender.type_name()),
            ))
        }
    }
}

// ---- Numeric for ----

/// FORPREP: validate and normalize init/limit/step, subtract one step
/// from the counter so FORLOOP's add starts the first iteration.
fn for_prep(vm: &mut Vm, ra: usize, proto: &Proto, pc: usize) -> Result<(), LuaError> {
    let init = vm.stack[ra];
    let limit = vm.stack[ra + 1];
    let step = vm.stack[ra + 2];

    let n_init = coerce::to_number(init, &vm.strings)
        .ok_or_else(|| rt_error(vm, proto, pc, "'for' initial value must be a number"))?;
    let n_limit = coerce::to_number(limit, &vm.strings)
        .ok_or_else(|| rt_error(vm, proto, pc, "'for' limit must be a number"))?;
    let n_step = coerce::to_number(step, &vm.strings)
        .ok_or_else(|| rt_error(vm, proto, pc, "'for' step must be a number"))?;

    match (n_init, n_step) {
        (Number::Int(i0), Number::Int(st)) => {
            if st == 0 {
                return Err(rt_error(vm, proto, pc, "'for' step is zero"));
            }
            // A float limit narrows to the nearest reachable integer; an
            // unreachable one degenerates to a loop that never runs.
            let (start, ilimit) = match n_limit {
                Number::Int(l) => (i0, l),
                Number::Float(f) => {
                    if st > 0 {
                        if f.is_nan() || f < i64::MIN as f64 {
                            (0, -1)
                        } else if f >= i64::MAX as f64 {
                            (i0, i64::MAX)
                        } else {
                            (i0, f.floor() as i64)
                        }
                    } else if f.is_nan() || f > i64::MAX as f64 {
                        (0, 1)
                    } else if f <= i64::MIN as f64 {
                        (i0, i64::MIN)
                    } else {
                        (i0, f.ceil() as i64)
                    }
                }
            };
            vm.stack[ra] = LuaValue::Integer(start.wrapping_sub(st));
            vm.stack[ra + 1] = LuaValue::Integer(ilimit);
            vm.stack[ra + 2] = LuaValue::Integer(st);
        }
        _ => {
            let f0 = n_init.as_f64();
            let fl = n_limit.as_f64();
            let fs = n_step.as_f64();
            if fs == 0.0 {
                return Err(rt_error(vm, proto, pc, "'for' step is zero"));
            }
            vm.stack[ra] = LuaValue::Float(f0 - fs);
            vm.stack[ra + 1] = LuaValue::Float(fl);
            vm.stack[ra + 2] = LuaValue::Float(fs);
        }
    }
    Ok(())
}

/// FORLOOP: advance the counter; true to jump back into the body.
fn for_loop_step(vm: &mut Vm, ra: usize) -> bool {
    match (vm.stack[ra], vm.stack[ra + 1], vm.stack[ra + 2]) {
        (LuaValue::Integer(i), LuaValue::Integer(limit), LuaValue::Integer(step)) => {
            let (next, overflow) = i.overflowing_add(step);
            if overflow {
                return false;
            }
            let cont = if step > 0 { next <= limit } else { next >= limit };
            if cont {
                vm.stack[ra] = LuaValue::Integer(next);
                vm.stack[ra + 3] = LuaValue::Integer(next);
            }
            cont
        }
        (LuaValue::Float(f), LuaValue::Float(limit), LuaValue::Float(step)) => {
            let next = f + step;
            let cont = if step > 0.0 {
                next <= limit
            } else {
                next >= limit
            };
            if cont {
                vm.stack[ra] = LuaValue::Float(next);
                vm.stack[ra + 3] = LuaValue::Float(next);
            }
            cont
        }
        _ => false,
    }
}
