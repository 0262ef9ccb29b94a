//! AST to Lua 5.3 bytecode lowering.
//!
//! One `FuncState` per function being compiled: a register allocator with
//! a free-watermark discipline (temporaries are released in reverse order
//! by lowering the watermark), a scoped locals table, per-block jump
//! lists for break/goto, and an upvalue table filled by searching the
//! enclosing functions.
//!
//! Expressions lower to `ExprDesc`s and stay symbolic until a consumer
//! commits them: literals become constants, comparisons become a
//! test instruction plus a JMP whose arms are reconciled at the use
//! site, calls and `...` stay open until their result count is known.

pub mod expr;
pub mod scope;

use crate::ast::*;
use crescent_core::opcode::{
    self, Instruction, OpCode, FIELDS_PER_FLUSH, MAX_BX, MAX_C, MAX_INDEX_RK, MAX_SBX, MIN_SBX,
};
use crescent_core::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crescent_core::string::{StringId, StringInterner};
use expr::{ExprDesc, IndexedBase};
use scope::{LabelInfo, PendingGoto, ScopeManager};
use std::fmt;
use std::rc::Rc;

/// Limit on constants per function (18-bit Bx).
const MAX_CONSTANTS: usize = 1 << 18;
/// Limit on upvalues per function (8-bit index).
const MAX_UPVALUES: usize = 255;

/// Code generation error with source line.
#[derive(Clone, Debug, PartialEq)]
pub struct CodegenError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CodegenError {}

/// Upvalue entry while the function is being compiled.
#[derive(Clone, Debug)]
struct UpvalInfo {
    name: StringId,
    in_stack: bool,
    index: u8,
}

/// State for one function being compiled.
struct FuncState {
    proto: Proto,
    scope: ScopeManager,
    upvalues: Vec<UpvalInfo>,
}

impl FuncState {
    fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            scope: ScopeManager::new(),
            upvalues: Vec::new(),
        }
    }

    /// Move compile-time upvalue info into the proto and fix the stack size.
    fn finalize(&mut self) {
        self.proto.upvalues = self
            .upvalues
            .iter()
            .map(|u| UpvalDesc {
                name: Some(u.name),
                in_stack: u.in_stack,
                index: u.index,
            })
            .collect();
        self.proto.max_stack_size = self.scope.max_reg.max(2);
        // Remaining locals are parameters and function-level names.
        let end = self.proto.code.len() as u32;
        for l in &self.scope.locals {
            self.proto.local_vars.push(LocalVar {
                name: l.name,
                start_pc: l.start_pc,
                end_pc: end,
            });
        }
    }
}

/// Where an assignment lands.
enum AssignTarget {
    Local(u8),
    Upvalue(u8),
    Indexed { obj: IndexedBase, key_rk: u32 },
}

/// Compile a parsed chunk into its main prototype. The main function is
/// vararg and carries `_ENV` as its single upvalue.
pub fn generate(
    block: &Block,
    source: StringId,
    strings: &mut StringInterner,
) -> Result<Proto, CodegenError> {
    let env_name = strings.intern(b"_ENV");
    let mut gen = Codegen {
        func_stack: Vec::new(),
        env_name,
        source,
    };

    let mut fs = FuncState::new();
    fs.proto.source = Some(source);
    fs.proto.is_vararg = true;
    fs.upvalues.push(UpvalInfo {
        name: env_name,
        in_stack: true,
        index: 0,
    });
    gen.func_stack.push(fs);

    gen.fs_mut().scope.enter_block(false);
    let has_ret = gen.compile_block_body(block)?;
    gen.leave_block(block.line, has_ret)?;
    let end_line = gen.fs().proto.line_info.last().copied().unwrap_or(0);
    gen.emit(Instruction::abc(OpCode::Return, 0, 1, 0), end_line);

    let mut fs = gen.func_stack.pop().unwrap();
    fs.finalize();
    Ok(fs.proto)
}

struct Codegen {
    func_stack: Vec<FuncState>,
    env_name: StringId,
    source: StringId,
}

impl Codegen {
    fn fs(&self) -> &FuncState {
        self.func_stack.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.func_stack.last_mut().unwrap()
    }

    fn error(&self, line: u32, msg: impl Into<String>) -> CodegenError {
        CodegenError {
            message: msg.into(),
            line,
        }
    }

    // ---- Emit helpers ----

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().proto.emit(inst, line)
    }

    fn current_pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    fn emit_jump(&mut self, line: u32) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line)
    }

    fn patch_jump_to(&mut self, jump_pc: usize, target: usize) -> Result<(), CodegenError> {
        let offset = target as i64 - jump_pc as i64 - 1;
        if offset < MIN_SBX as i64 || offset > MAX_SBX as i64 {
            let line = self.fs().proto.get_line(jump_pc);
            return Err(self.error(line, "control structure too long"));
        }
        self.fs_mut().proto.get_mut(jump_pc).set_sbx(offset as i32);
        Ok(())
    }

    fn patch_jump_here(&mut self, jump_pc: usize) -> Result<(), CodegenError> {
        let target = self.current_pc();
        self.patch_jump_to(jump_pc, target)
    }

    // ---- Register helpers ----

    fn alloc_reg(&mut self, line: u32) -> Result<u8, CodegenError> {
        self.fs_mut()
            .scope
            .alloc_reg()
            .ok_or_else(|| self.error(line, "function or expression needs too many registers"))
    }

    fn alloc_regs(&mut self, n: u16, line: u32) -> Result<u8, CodegenError> {
        self.fs_mut()
            .scope
            .alloc_regs(n)
            .ok_or_else(|| self.error(line, "function or expression needs too many registers"))
    }

    fn free_to(&mut self, level: u8) {
        self.fs_mut().scope.free_to(level);
    }

    fn free_reg(&self) -> u8 {
        self.fs().scope.free_reg
    }

    // ---- Constants ----

    fn add_constant(&mut self, k: Constant, line: u32) -> Result<u32, CodegenError> {
        let idx = self.fs_mut().proto.add_constant(k);
        if idx >= MAX_CONSTANTS {
            return Err(self.error(line, "too many constants in function"));
        }
        Ok(idx as u32)
    }

    /// Encode a constant as an RK operand, spilling to a register when the
    /// index does not fit in 8 bits.
    fn const_to_rk(&mut self, k: Constant, line: u32) -> Result<u32, CodegenError> {
        let idx = self.add_constant(k, line)?;
        if idx <= MAX_INDEX_RK {
            Ok(opcode::rk_as_k(idx))
        } else {
            let reg = self.alloc_reg(line)?;
            self.emit_load_constant(reg, idx, line);
            Ok(reg as u32)
        }
    }

    fn string_rk(&mut self, id: StringId, line: u32) -> Result<u32, CodegenError> {
        self.const_to_rk(Constant::Str(id), line)
    }

    fn emit_load_constant(&mut self, reg: u8, k: u32, line: u32) {
        if k <= MAX_BX {
            self.emit(Instruction::abx(OpCode::LoadK, reg as u32, k), line);
        } else {
            self.emit(Instruction::abx(OpCode::LoadKX, reg as u32, 0), line);
            self.emit(Instruction::ax(OpCode::ExtraArg, k), line);
        }
    }

    // ---- Discharge ----

    /// Commit an expression descriptor into a specific register.
    fn discharge_to_reg(&mut self, desc: ExprDesc, reg: u8, line: u32) -> Result<(), CodegenError> {
        match desc {
            ExprDesc::Nil => {
                self.emit(Instruction::abc(OpCode::LoadNil, reg as u32, 0, 0), line);
            }
            ExprDesc::True => {
                self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 1, 0), line);
            }
            ExprDesc::False => {
                self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 0, 0), line);
            }
            ExprDesc::Integer(i) => {
                let k = self.add_constant(Constant::Integer(i), line)?;
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Float(f) => {
                let k = self.add_constant(Constant::Float(f), line)?;
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Str(id) => {
                let k = self.add_constant(Constant::Str(id), line)?;
                self.emit_load_constant(reg, k, line);
            }
            ExprDesc::Register(src) => {
                if src != reg {
                    self.emit(
                        Instruction::abc(OpCode::Move, reg as u32, src as u32, 0),
                        line,
                    );
                }
            }
            ExprDesc::Upvalue(idx) => {
                self.emit(
                    Instruction::abc(OpCode::GetUpval, reg as u32, idx as u32, 0),
                    line,
                );
            }
            ExprDesc::Indexed { obj, key_rk } => match obj {
                IndexedBase::Register(t) => {
                    self.emit(
                        Instruction::abc(OpCode::GetTable, reg as u32, t as u32, key_rk),
                        line,
                    );
                }
                IndexedBase::Upvalue(u) => {
                    self.emit(
                        Instruction::abc(OpCode::GetTabUp, reg as u32, u as u32, key_rk),
                        line,
                    );
                }
            },
            ExprDesc::Relocatable(pc) => {
                self.fs_mut().proto.get_mut(pc).set_a(reg as u32);
            }
            ExprDesc::Call(pc) => {
                let inst = self.fs_mut().proto.get_mut(pc);
                inst.set_c(2);
                let a = inst.a();
                if a != reg as u32 {
                    self.emit(Instruction::abc(OpCode::Move, reg as u32, a, 0), line);
                }
            }
            ExprDesc::Vararg(pc) => {
                let inst = self.fs_mut().proto.get_mut(pc);
                inst.set_a(reg as u32);
                inst.set_b(2);
            }
            ExprDesc::Void => {
                self.emit(Instruction::abc(OpCode::LoadNil, reg as u32, 0, 0), line);
            }
        }
        Ok(())
    }

    /// Put a descriptor in some register, preferring where it already is.
    fn desc_to_any_reg(&mut self, desc: ExprDesc, line: u32) -> Result<u8, CodegenError> {
        match desc {
            ExprDesc::Register(r) => Ok(r),
            other => {
                let reg = self.alloc_reg(line)?;
                self.discharge_to_reg(other, reg, line)?;
                Ok(reg)
            }
        }
    }

    fn exp_to_any_reg(&mut self, e: &Expr) -> Result<u8, CodegenError> {
        let desc = self.expr(e)?;
        self.desc_to_any_reg(desc, e.line())
    }

    /// Compile an expression into the next free register, releasing any
    /// temporaries it used. Keeps expression lists consecutive.
    fn exp_to_next_reg(&mut self, e: &Expr) -> Result<u8, CodegenError> {
        let line = e.line();
        let target = self.free_reg();
        let desc = self.expr(e)?;
        self.free_to(target);
        let reg = self.alloc_reg(line)?;
        debug_assert_eq!(reg, target);
        self.discharge_to_reg(desc, reg, line)?;
        Ok(reg)
    }

    /// Compile an expression as an RK operand: a constant index with the
    /// high bit, or a register.
    fn exp_to_rk(&mut self, e: &Expr) -> Result<u32, CodegenError> {
        let line = e.line();
        let desc = self.expr(e)?;
        match desc {
            ExprDesc::Nil => self.const_to_rk(Constant::Nil, line),
            ExprDesc::True => self.const_to_rk(Constant::Boolean(true), line),
            ExprDesc::False => self.const_to_rk(Constant::Boolean(false), line),
            ExprDesc::Integer(i) => self.const_to_rk(Constant::Integer(i), line),
            ExprDesc::Float(f) => self.const_to_rk(Constant::Float(f), line),
            ExprDesc::Str(id) => self.const_to_rk(Constant::Str(id), line),
            other => Ok(self.desc_to_any_reg(other, line)? as u32),
        }
    }

    // ---- Name resolution ----

    /// Resolve a name to a local register, an upvalue, or a global
    /// (`_ENV` indexing).
    fn resolve_name(&mut self, name: StringId, line: u32) -> Result<ExprDesc, CodegenError> {
        let level = self.func_stack.len() - 1;
        if let Some(info) = self.func_stack[level].scope.resolve_local(name) {
            return Ok(ExprDesc::Register(info.reg));
        }
        if let Some(idx) = self.resolve_upvalue(level, name, line)? {
            return Ok(ExprDesc::Upvalue(idx));
        }
        // Global: _ENV[name]. _ENV itself follows the normal rules, so a
        // `local _ENV` shadows the chunk environment.
        let env = if let Some(info) = self.func_stack[level].scope.resolve_local(self.env_name) {
            IndexedBase::Register(info.reg)
        } else {
            let idx = self
                .resolve_upvalue(level, self.env_name, line)?
                .expect("_ENV is always reachable from the main chunk");
            IndexedBase::Upvalue(idx)
        };
        let name_rk = self.string_rk(name, line)?;
        Ok(ExprDesc::Indexed { obj: env, key_rk: name_rk })
    }

    /// Find or create an upvalue for `name` in the function at `level`,
    /// searching enclosing functions. The first hop through an enclosing
    /// local is flagged `in_stack`.
    fn resolve_upvalue(
        &mut self,
        level: usize,
        name: StringId,
        line: u32,
    ) -> Result<Option<u8>, CodegenError> {
        if let Some(i) = self.func_stack[level]
            .upvalues
            .iter()
            .position(|u| u.name == name)
        {
            return Ok(Some(i as u8));
        }
        if level == 0 {
            return Ok(None);
        }
        if let Some(info) = self.func_stack[level - 1].scope.resolve_local(name) {
            let reg = info.reg;
            self.func_stack[level - 1].scope.mark_capture(reg);
            return self.add_upvalue(level, name, true, reg, line).map(Some);
        }
        match self.resolve_upvalue(level - 1, name, line)? {
            Some(parent_idx) => self
                .add_upvalue(level, name, false, parent_idx, line)
                .map(Some),
            None => Ok(None),
        }
    }

    fn add_upvalue(
        &mut self,
        level: usize,
        name: StringId,
        in_stack: bool,
        index: u8,
        line: u32,
    ) -> Result<u8, CodegenError> {
        let ups = &mut self.func_stack[level].upvalues;
        if ups.len() >= MAX_UPVALUES {
            return Err(self.error(line, "too many upvalues"));
        }
        let idx = ups.len() as u8;
        ups.push(UpvalInfo {
            name,
            in_stack,
            index,
        });
        Ok(idx)
    }

    // ---- Blocks ----

    /// Compile a block's statements and return clause. The caller enters
    /// and leaves the scope. Returns true when the block ends in `return`.
    fn compile_block_body(&mut self, block: &Block) -> Result<bool, CodegenError> {
        for stmt in &block.stmts {
            self.compile_statement(stmt)?;
        }
        if let Some(ret) = &block.ret {
            self.compile_return(ret)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Leave the current block: record debug ranges, emit a closing jump
    /// when a local of the block was captured, bubble unresolved gotos.
    /// Returns the block for break patching.
    fn close_block(
        &mut self,
        line: u32,
        ended_in_return: bool,
    ) -> Result<scope::BlockScope, CodegenError> {
        let pc = self.current_pc() as u32;

        // A label at the very end of the block sits outside the scope of
        // the block's locals, so gotos that would otherwise jump into a
        // local's scope may still target it (the `continue` idiom).
        let end_pc = self.current_pc();
        let pending = std::mem::take(
            &mut self
                .fs_mut()
                .scope
                .blocks
                .last_mut()
                .expect("closing an open block")
                .pending_gotos,
        );
        let mut kept = Vec::new();
        for g in pending {
            let end_label = self
                .fs()
                .scope
                .blocks
                .last()
                .unwrap()
                .labels
                .iter()
                .any(|l| l.name == g.name && l.pc == end_pc);
            if end_label {
                self.patch_jump_to(g.pc, end_pc)?;
            } else {
                kept.push(g);
            }
        }
        self.fs_mut().scope.blocks.last_mut().unwrap().pending_gotos = kept;

        let (block, dead) = self.fs_mut().scope.leave_block();
        self.record_dead_locals(dead, pc);

        if block.needs_close && !ended_in_return {
            // A jump-to-next with a close level: closes upvalues over this
            // block's registers without transferring control.
            let a = block.first_free_reg_on_entry as u32 + 1;
            self.emit(Instruction::asbx(OpCode::Jmp, a, 0), line);
        }
        if block.needs_close {
            if let Some(parent) = self.fs_mut().scope.blocks.last_mut() {
                parent.needs_close = true;
            }
        }
        self.bubble_gotos(&block)?;
        Ok(block)
    }

    fn leave_block(&mut self, line: u32, ended_in_return: bool) -> Result<(), CodegenError> {
        self.close_block(line, ended_in_return).map(|_| ())
    }

    /// Patch this loop's break jumps to the current pc, setting their
    /// close level if the loop body captured locals.
    fn patch_breaks(&mut self, block: &scope::BlockScope) -> Result<(), CodegenError> {
        let target = self.current_pc();
        for &pc in &block.break_jumps {
            if block.needs_close {
                self.fs_mut()
                    .proto
                    .get_mut(pc)
                    .set_a(block.first_free_reg_on_entry as u32 + 1);
            }
            self.patch_jump_to(pc, target)?;
        }
        Ok(())
    }

    // ---- Statements ----

    fn compile_statement(&mut self, stmt: &Stmt) -> Result<(), CodegenError> {
        match stmt {
            Stmt::Local {
                names,
                values,
                line,
            } => self.compile_local(names, values, *line),
            Stmt::Assign {
                targets,
                values,
                line,
            } => self.compile_assign(targets, values, *line),
            Stmt::Call(e) => {
                let saved = self.free_reg();
                let desc = self.expr(e)?;
                if let ExprDesc::Call(pc) = desc {
                    // A call statement discards all results.
                    self.fs_mut().proto.get_mut(pc).set_c(1);
                }
                self.free_to(saved);
                Ok(())
            }
            Stmt::Do(block) => {
                self.fs_mut().scope.enter_block(false);
                let has_ret = self.compile_block_body(block)?;
                self.leave_block(block.line, has_ret)
            }
            Stmt::While { cond, body, line } => self.compile_while(cond, body, *line),
            Stmt::Repeat { body, cond, line } => self.compile_repeat(body, cond, *line),
            Stmt::If {
                cond,
                then_block,
                elseifs,
                else_block,
                line,
            } => self.compile_if(cond, then_block, elseifs, else_block.as_ref(), *line),
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.compile_numeric_for(*var, start, limit, step.as_ref(), body, *line),
            Stmt::GenericFor {
                vars,
                exprs,
                body,
                line,
            } => self.compile_generic_for(vars, exprs, body, *line),
            Stmt::FunctionDecl { name, body, line } => {
                self.compile_function_decl(name, body, *line)
            }
            Stmt::LocalFunction { name, body, line } => {
                // Declare the local first so the body can recurse.
                let reg = self.alloc_reg(*line)?;
                let pc = self.current_pc() as u32;
                self.fs_mut().scope.declare_local(*name, reg, pc);
                let desc = self.compile_function(body, *line)?;
                self.discharge_to_reg(desc, reg, *line)?;
                self.free_to(reg + 1);
                Ok(())
            }
            Stmt::Break(line) => {
                let Some(loop_idx) = self.fs().scope.innermost_loop() else {
                    return Err(self.error(*line, "break outside a loop"));
                };
                let jmp = self.emit_jump(*line);
                self.fs_mut().scope.blocks[loop_idx].break_jumps.push(jmp);
                Ok(())
            }
            Stmt::Goto { label, line } => self.compile_goto(*label, *line),
            Stmt::Label { name, line } => self.compile_label(*name, *line),
        }
    }

    fn compile_local(
        &mut self,
        names: &[StringId],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CodegenError> {
        let first = self.explist_adjust(values, names.len(), line)?;
        let pc = self.current_pc() as u32;
        for (i, &name) in names.iter().enumerate() {
            self.fs_mut()
                .scope
                .declare_local(name, first + i as u8, pc);
        }
        Ok(())
    }

    fn prepare_target(&mut self, e: &Expr) -> Result<AssignTarget, CodegenError> {
        match e {
            Expr::Name(name, line) => match self.resolve_name(*name, *line)? {
                ExprDesc::Register(r) => Ok(AssignTarget::Local(r)),
                ExprDesc::Upvalue(u) => Ok(AssignTarget::Upvalue(u)),
                ExprDesc::Indexed { obj, key_rk } => Ok(AssignTarget::Indexed { obj, key_rk }),
                _ => unreachable!("name resolves to register, upvalue, or index"),
            },
            Expr::Index { obj, key, line } => {
                let obj_desc = self.expr(obj)?;
                let base = match obj_desc {
                    ExprDesc::Upvalue(u) => IndexedBase::Upvalue(u),
                    other => IndexedBase::Register(self.desc_to_any_reg(other, *line)?),
                };
                let key_rk = self.exp_to_rk(key)?;
                Ok(AssignTarget::Indexed { obj: base, key_rk })
            }
            _ => Err(self.error(e.line(), "cannot assign to this expression")),
        }
    }

    fn store_target(
        &mut self,
        target: &AssignTarget,
        value_rk: u32,
        line: u32,
    ) -> Result<(), CodegenError> {
        match target {
            AssignTarget::Local(r) => {
                // Callers hand locals a register, not a constant.
                debug_assert!(!opcode::is_k(value_rk));
                if *r as u32 != value_rk {
                    self.emit(Instruction::abc(OpCode::Move, *r as u32, value_rk, 0), line);
                }
            }
            AssignTarget::Upvalue(u) => {
                debug_assert!(!opcode::is_k(value_rk));
                self.emit(
                    Instruction::abc(OpCode::SetUpval, value_rk, *u as u32, 0),
                    line,
                );
            }
            AssignTarget::Indexed { obj, key_rk } => match obj {
                IndexedBase::Register(t) => {
                    self.emit(
                        Instruction::abc(OpCode::SetTable, *t as u32, *key_rk, value_rk),
                        line,
                    );
                }
                IndexedBase::Upvalue(u) => {
                    self.emit(
                        Instruction::abc(OpCode::SetTabUp, *u as u32, *key_rk, value_rk),
                        line,
                    );
                }
            },
        }
        Ok(())
    }

    fn compile_assign(
        &mut self,
        targets: &[Expr],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CodegenError> {
        let saved = self.free_reg();

        // Single assignment gets direct stores without a staging copy.
        if targets.len() == 1 && values.len() == 1 {
            let target = self.prepare_target(&targets[0])?;
            match &target {
                AssignTarget::Local(r) => {
                    let desc = self.expr(&values[0])?;
                    self.discharge_to_reg(desc, *r, line)?;
                }
                AssignTarget::Upvalue(_) => {
                    let vr = self.exp_to_any_reg(&values[0])?;
                    self.store_target(&target, vr as u32, line)?;
                }
                AssignTarget::Indexed { .. } => {
                    let vrk = self.exp_to_rk(&values[0])?;
                    self.store_target(&target, vrk, line)?;
                }
            }
            self.free_to(saved);
            return Ok(());
        }

        // General case: evaluate target prefixes left to right, then all
        // values, then store (last target first, like PUC).
        let prepared: Vec<AssignTarget> = targets
            .iter()
            .map(|t| self.prepare_target(t))
            .collect::<Result<_, _>>()?;
        let val_base = self.explist_adjust(values, targets.len(), line)?;
        for (i, target) in prepared.iter().enumerate().rev() {
            self.store_target(target, (val_base + i as u8) as u32, line)?;
        }
        self.free_to(saved);
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), CodegenError> {
        let start = self.current_pc();
        let false_jumps = self.cond_false_jumps(cond)?;
        self.fs_mut().scope.enter_block(true);
        let has_ret = self.compile_block_body(body)?;
        let block = self.close_block(line, has_ret)?;
        let back = self.emit_jump(line);
        self.patch_jump_to(back, start)?;
        for pc in false_jumps {
            self.patch_jump_here(pc)?;
        }
        self.patch_breaks(&block)?;
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), CodegenError> {
        let start = self.current_pc();
        self.fs_mut().scope.enter_block(true);
        let has_ret = self.compile_block_body(body)?;
        // The until condition runs inside the body scope.
        let false_jumps = self.cond_false_jumps(cond)?;
        let block = self.close_block(line, has_ret)?;
        for jump in false_jumps {
            // The back edge leaves the body scope: close captured locals.
            if block.needs_close {
                self.fs_mut()
                    .proto
                    .get_mut(jump)
                    .set_a(block.first_free_reg_on_entry as u32 + 1);
            }
            self.patch_jump_to(jump, start)?;
        }
        self.patch_breaks(&block)?;
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then_block: &Block,
        elseifs: &[(Expr, Block)],
        else_block: Option<&Block>,
        line: u32,
    ) -> Result<(), CodegenError> {
        let mut end_jumps: Vec<usize> = Vec::new();
        let mut false_jumps = self.cond_false_jumps(cond)?;

        self.fs_mut().scope.enter_block(false);
        let has_ret = self.compile_block_body(then_block)?;
        self.leave_block(then_block.line, has_ret)?;

        let mut arms: Vec<&(Expr, Block)> = elseifs.iter().collect();
        let has_tail = !arms.is_empty() || else_block.is_some();
        if has_tail && !has_ret {
            end_jumps.push(self.emit_jump(line));
        }

        while let Some((c, b)) = arms.first().copied() {
            arms.remove(0);
            for pc in false_jumps.drain(..) {
                self.patch_jump_here(pc)?;
            }
            false_jumps = self.cond_false_jumps(c)?;
            self.fs_mut().scope.enter_block(false);
            let arm_ret = self.compile_block_body(b)?;
            self.leave_block(b.line, arm_ret)?;
            if (!arms.is_empty() || else_block.is_some()) && !arm_ret {
                end_jumps.push(self.emit_jump(line));
            }
        }

        for pc in false_jumps {
            self.patch_jump_here(pc)?;
        }
        if let Some(b) = else_block {
            self.fs_mut().scope.enter_block(false);
            let else_ret = self.compile_block_body(b)?;
            self.leave_block(b.line, else_ret)?;
        }
        for pc in end_jumps {
            self.patch_jump_here(pc)?;
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: StringId,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), CodegenError> {
        let saved = self.free_reg();
        let base = self.exp_to_next_reg(start)?;
        self.exp_to_next_reg(limit)?;
        match step {
            Some(e) => {
                self.exp_to_next_reg(e)?;
            }
            None => {
                let reg = self.alloc_reg(line)?;
                self.discharge_to_reg(ExprDesc::Integer(1), reg, line)?;
            }
        }

        self.fs_mut().scope.enter_block(true);
        let var_reg = self.alloc_reg(line)?;
        let pc = self.current_pc() as u32;
        self.fs_mut().scope.declare_local(var, var_reg, pc);

        let prep = self.emit(Instruction::asbx(OpCode::ForPrep, base as u32, 0), line);
        let has_ret = self.compile_block_body(body)?;
        // When the body captured the loop variable, close_block's closing
        // jump runs on every iteration, giving each one a fresh upvalue.
        let block = self.close_block(line, has_ret)?;

        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base as u32, 0), line);
        // FORLOOP jumps back to just after FORPREP; FORPREP jumps to FORLOOP.
        self.patch_jump_to(loop_pc, prep + 1)?;
        self.patch_jump_to(prep, loop_pc)?;
        self.patch_breaks(&block)?;
        self.free_to(saved);
        Ok(())
    }

    fn compile_generic_for(
        &mut self,
        vars: &[StringId],
        exprs: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), CodegenError> {
        let saved = self.free_reg();
        // Three control slots: iterator function, state, control variable.
        let base = self.explist_adjust(exprs, 3, line)?;

        self.fs_mut().scope.enter_block(true);
        let pc = self.current_pc() as u32;
        for &v in vars {
            let reg = self.alloc_reg(line)?;
            self.fs_mut().scope.declare_local(v, reg, pc);
        }

        let prep = self.emit_jump(line);
        let body_start = self.current_pc();
        let has_ret = self.compile_block_body(body)?;
        let block = self.close_block(line, has_ret)?;

        self.patch_jump_here(prep)?;
        self.emit(
            Instruction::abc(OpCode::TForCall, base as u32, 0, vars.len() as u32),
            line,
        );
        let tfl = self.emit(
            Instruction::asbx(OpCode::TForLoop, base as u32 + 2, 0),
            line,
        );
        self.patch_jump_to(tfl, body_start)?;
        self.patch_breaks(&block)?;
        self.free_to(saved);
        Ok(())
    }

    fn compile_function_decl(
        &mut self,
        name: &FuncName,
        body: &FuncBody,
        line: u32,
    ) -> Result<(), CodegenError> {
        let saved = self.free_reg();
        // Build the target: a plain name, or a chain of index stores.
        if name.parts.len() == 1 && name.method.is_none() {
            let target = self.prepare_target(&Expr::Name(name.parts[0], line))?;
            let desc = self.compile_function(body, line)?;
            match &target {
                AssignTarget::Local(r) => self.discharge_to_reg(desc, *r, line)?,
                _ => {
                    let vr = self.desc_to_any_reg(desc, line)?;
                    self.store_target(&target, vr as u32, line)?;
                }
            }
        } else {
            let mut target_expr = Expr::Name(name.parts[0], line);
            for &part in &name.parts[1..] {
                target_expr = Expr::Index {
                    obj: Box::new(target_expr),
                    key: Box::new(Expr::Str(part, line)),
                    line,
                };
            }
            if let Some(m) = name.method {
                target_expr = Expr::Index {
                    obj: Box::new(target_expr),
                    key: Box::new(Expr::Str(m, line)),
                    line,
                };
            }
            let target = self.prepare_target(&target_expr)?;
            let desc = self.compile_function(body, line)?;
            let vr = self.desc_to_any_reg(desc, line)?;
            self.store_target(&target, vr as u32, line)?;
        }
        self.free_to(saved);
        Ok(())
    }

    fn compile_goto(&mut self, label: StringId, line: u32) -> Result<(), CodegenError> {
        // Backward goto: the label already exists in an enclosing block.
        let found = self
            .fs()
            .scope
            .blocks
            .iter()
            .rev()
            .find_map(|b| b.labels.iter().find(|l| l.name == label).cloned());
        if let Some(li) = found {
            let jmp = self.emit_jump(line);
            // Close upvalues over locals that die on the way back.
            let num_locals = self.fs().scope.locals.len();
            if li.num_active < num_locals {
                let reg = self.fs().scope.locals[li.num_active].reg;
                self.fs_mut().proto.get_mut(jmp).set_a(reg as u32 + 1);
            }
            return self.patch_jump_to(jmp, li.pc);
        }
        // Forward goto: resolved when the label appears or at block close.
        let jmp = self.emit_jump(line);
        let num_active = self.fs().scope.locals.len();
        self.fs_mut()
            .scope
            .blocks
            .last_mut()
            .expect("goto inside a block")
            .pending_gotos
            .push(PendingGoto {
                name: label,
                pc: jmp,
                line,
                num_active,
            });
        Ok(())
    }

    fn compile_label(&mut self, name: StringId, line: u32) -> Result<(), CodegenError> {
        let pc = self.current_pc();
        let num_active = self.fs().scope.locals.len();
        let block = self
            .fs_mut()
            .scope
            .blocks
            .last_mut()
            .expect("label inside a block");
        if block.labels.iter().any(|l| l.name == name) {
            return Err(CodegenError {
                message: "label already defined".to_string(),
                line,
            });
        }
        block.labels.push(LabelInfo {
            name,
            pc,
            num_active,
        });

        // Resolve pending forward gotos in this block. A goto below the
        // label's local count would jump into a scope; it stays pending in
        // case the label turns out to sit at the end of the block (where
        // those locals are dead and the jump is legal).
        let pending = std::mem::take(&mut self.fs_mut().scope.blocks.last_mut().unwrap().pending_gotos);
        let mut kept = Vec::new();
        for g in pending {
            if g.name == name && g.num_active >= num_active {
                self.patch_jump_to(g.pc, pc)?;
            } else {
                kept.push(g);
            }
        }
        self.fs_mut().scope.blocks.last_mut().unwrap().pending_gotos = kept;
        Ok(())
    }

    /// Move a closed block's unresolved gotos into the parent block.
    fn bubble_gotos(&mut self, block: &scope::BlockScope) -> Result<(), CodegenError> {
        for g in &block.pending_gotos {
            let mut g = g.clone();
            if block.needs_close {
                self.fs_mut()
                    .proto
                    .get_mut(g.pc)
                    .set_a(block.first_free_reg_on_entry as u32 + 1);
            }
            g.num_active = g.num_active.min(block.num_locals_on_entry);
            match self.fs_mut().scope.blocks.last_mut() {
                Some(parent) => parent.pending_gotos.push(g),
                None => {
                    return Err(self.error(g.line, "no visible label for goto"));
                }
            }
        }
        Ok(())
    }

    fn record_dead_locals(&mut self, dead: Vec<scope::LocalVarInfo>, end_pc: u32) {
        for l in dead {
            self.fs_mut().proto.local_vars.push(LocalVar {
                name: l.name,
                start_pc: l.start_pc,
                end_pc,
            });
        }
    }

    fn compile_return(&mut self, ret: &ReturnStmt) -> Result<(), CodegenError> {
        let line = ret.line;
        // `return f(...)` becomes a tail call.
        if ret.values.len() == 1 {
            if matches!(
                ret.values[0],
                Expr::Call { .. } | Expr::MethodCall { .. }
            ) {
                let desc = self.expr(&ret.values[0])?;
                if let ExprDesc::Call(pc) = desc {
                    let inst = self.fs_mut().proto.get_mut(pc);
                    inst.set_opcode(OpCode::TailCall);
                    inst.set_c(0);
                    let a = inst.a();
                    self.emit(Instruction::abc(OpCode::Return, a, 0, 0), line);
                    return Ok(());
                }
            }
        }

        if ret.values.is_empty() {
            self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), line);
            return Ok(());
        }

        let saved = self.free_reg();
        if ret.values.len() == 1 && !ret.values[0].is_multi() {
            let r = self.exp_to_any_reg(&ret.values[0])?;
            self.emit(Instruction::abc(OpCode::Return, r as u32, 2, 0), line);
            self.free_to(saved);
            return Ok(());
        }

        let first = self.free_reg();
        let n = ret.values.len();
        for e in &ret.values[..n - 1] {
            self.exp_to_next_reg(e)?;
        }
        let last = &ret.values[n - 1];
        let b = if last.is_multi() {
            let desc = self.expr(last)?;
            self.set_multi_returns(desc)?;
            0
        } else {
            self.exp_to_next_reg(last)?;
            n as u32 + 1
        };
        self.emit(Instruction::abc(OpCode::Return, first as u32, b, 0), line);
        self.free_to(saved);
        Ok(())
    }

    /// Compile `want` values from `exprs` into consecutive registers
    /// starting at the current free register; extra expressions are still
    /// evaluated, missing ones are nil-filled, a trailing call or `...`
    /// stretches to fit. Returns the first register.
    fn explist_adjust(
        &mut self,
        exprs: &[Expr],
        want: usize,
        line: u32,
    ) -> Result<u8, CodegenError> {
        let first = self.free_reg();
        if exprs.is_empty() {
            if want > 0 {
                let r = self.alloc_regs(want as u16, line)?;
                self.emit(
                    Instruction::abc(OpCode::LoadNil, r as u32, want as u32 - 1, 0),
                    line,
                );
            }
            return Ok(first);
        }

        let n = exprs.len();
        for e in &exprs[..n - 1] {
            self.exp_to_next_reg(e)?;
        }
        let last = &exprs[n - 1];

        if last.is_multi() && want > n - 1 {
            let extra = want - (n - 1);
            let desc = self.expr(last)?;
            match desc {
                ExprDesc::Call(pc) => {
                    self.fs_mut().proto.get_mut(pc).set_c(extra as u32 + 1);
                    // The call keeps its base register; reserve the rest.
                    if extra > 1 {
                        self.alloc_regs(extra as u16 - 1, line)?;
                    }
                }
                ExprDesc::Vararg(pc) => {
                    let a = self.free_reg();
                    let inst = self.fs_mut().proto.get_mut(pc);
                    inst.set_a(a as u32);
                    inst.set_b(extra as u32 + 1);
                    self.alloc_regs(extra as u16, line)?;
                }
                _ => unreachable!("is_multi expressions produce Call or Vararg"),
            }
        } else {
            self.exp_to_next_reg(last)?;
            if n < want {
                let missing = want - n;
                let r = self.alloc_regs(missing as u16, line)?;
                self.emit(
                    Instruction::abc(OpCode::LoadNil, r as u32, missing as u32 - 1, 0),
                    line,
                );
            } else if n > want {
                self.free_to(first + want as u8);
            }
        }
        Ok(first)
    }

    /// Let an open call or vararg produce all its values (`B`/`C` = 0).
    fn set_multi_returns(&mut self, desc: ExprDesc) -> Result<(), CodegenError> {
        match desc {
            ExprDesc::Call(pc) => {
                self.fs_mut().proto.get_mut(pc).set_c(0);
                Ok(())
            }
            ExprDesc::Vararg(pc) => {
                let a = self.free_reg();
                let inst = self.fs_mut().proto.get_mut(pc);
                inst.set_a(a as u32);
                inst.set_b(0);
                Ok(())
            }
            _ => unreachable!("only calls and ... are multi-value"),
        }
    }

    // ---- Expressions ----

    fn expr(&mut self, e: &Expr) -> Result<ExprDesc, CodegenError> {
        match e {
            Expr::Nil(_) => Ok(ExprDesc::Nil),
            Expr::True(_) => Ok(ExprDesc::True),
            Expr::False(_) => Ok(ExprDesc::False),
            Expr::Integer(i, _) => Ok(ExprDesc::Integer(*i)),
            Expr::Float(f, _) => Ok(ExprDesc::Float(*f)),
            Expr::Str(id, _) => Ok(ExprDesc::Str(*id)),
            Expr::Name(name, line) => self.resolve_name(*name, *line),
            Expr::Vararg(line) => {
                let pc = self.emit(Instruction::abc(OpCode::VarArg, 0, 0, 0), *line);
                Ok(ExprDesc::Vararg(pc))
            }
            Expr::Paren(inner) => {
                let desc = self.expr(inner)?;
                let line = inner.line();
                match desc {
                    // Parentheses truncate multiple values to one.
                    ExprDesc::Call(_) | ExprDesc::Vararg(_) => {
                        let reg = self.desc_to_any_reg(desc, line)?;
                        Ok(ExprDesc::Register(reg))
                    }
                    other => Ok(other),
                }
            }
            Expr::Index { obj, key, line } => {
                let obj_desc = self.expr(obj)?;
                let base = match obj_desc {
                    ExprDesc::Upvalue(u) => IndexedBase::Upvalue(u),
                    other => IndexedBase::Register(self.desc_to_any_reg(other, *line)?),
                };
                let key_rk = self.exp_to_rk(key)?;
                Ok(ExprDesc::Indexed { obj: base, key_rk })
            }
            Expr::Call { func, args, line } => self.compile_call(func, args, None, *line),
            Expr::MethodCall {
                obj,
                method,
                args,
                line,
            } => self.compile_call(obj, args, Some(*method), *line),
            Expr::Function(body) => self.compile_function(body, body.line),
            Expr::Table { fields, line } => self.compile_table(fields, *line),
            Expr::BinOp { op, lhs, rhs, line } => self.compile_binop(*op, lhs, rhs, *line),
            Expr::UnOp { op, operand, line } => self.compile_unop(*op, operand, *line),
        }
    }

    fn compile_binop(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        match op {
            BinOp::And => self.compile_logic(true, lhs, rhs, line),
            BinOp::Or => self.compile_logic(false, lhs, rhs, line),
            BinOp::Concat => self.compile_concat(lhs, rhs, line),
            _ if op.is_comparison() => self.compile_comparison_value(op, lhs, rhs, line),
            _ => {
                let opcode = match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Sub,
                    BinOp::Mul => OpCode::Mul,
                    BinOp::Div => OpCode::Div,
                    BinOp::IDiv => OpCode::IDiv,
                    BinOp::Mod => OpCode::Mod,
                    BinOp::Pow => OpCode::Pow,
                    BinOp::BAnd => OpCode::BAnd,
                    BinOp::BOr => OpCode::BOr,
                    BinOp::BXor => OpCode::BXor,
                    BinOp::Shl => OpCode::Shl,
                    BinOp::Shr => OpCode::Shr,
                    _ => unreachable!(),
                };
                let rkb = self.exp_to_rk(lhs)?;
                let rkc = self.exp_to_rk(rhs)?;
                let pc = self.emit(Instruction::abc(opcode, 0, rkb, rkc), line);
                Ok(ExprDesc::Relocatable(pc))
            }
        }
    }

    /// `and`/`or` with TEST/TESTSET plus a jump over the right operand.
    fn compile_logic(
        &mut self,
        is_and: bool,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        let c = if is_and { 0 } else { 1 };
        let target = self.free_reg();
        let ldesc = self.expr(lhs)?;
        self.free_to(target);
        let r = self.alloc_reg(line)?;
        match ldesc {
            ExprDesc::Register(lr) if lr != r => {
                self.emit(
                    Instruction::abc(OpCode::TestSet, r as u32, lr as u32, c),
                    line,
                );
            }
            ExprDesc::Register(_) => {
                self.emit(Instruction::abc(OpCode::Test, r as u32, 0, c), line);
            }
            other => {
                self.discharge_to_reg(other, r, line)?;
                self.emit(Instruction::abc(OpCode::Test, r as u32, 0, c), line);
            }
        }
        let jmp = self.emit_jump(line);
        let rdesc = self.expr(rhs)?;
        self.discharge_to_reg(rdesc, r, line)?;
        self.free_to(r + 1);
        self.patch_jump_here(jmp)?;
        Ok(ExprDesc::Register(r))
    }

    /// Concatenation chains into consecutive registers, one CONCAT.
    fn compile_concat(
        &mut self,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        let mut parts: Vec<&Expr> = vec![lhs];
        let mut tail = rhs;
        while let Expr::BinOp {
            op: BinOp::Concat,
            lhs: l,
            rhs: r,
            ..
        } = tail
        {
            parts.push(l);
            tail = r;
        }
        parts.push(tail);

        let first = self.free_reg();
        for p in &parts {
            self.exp_to_next_reg(p)?;
        }
        let last = self.free_reg() - 1;
        let pc = self.emit(
            Instruction::abc(OpCode::Concat, 0, first as u32, last as u32),
            line,
        );
        self.free_to(first);
        Ok(ExprDesc::Relocatable(pc))
    }

    fn compile_unop(
        &mut self,
        op: UnOp,
        operand: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
            UnOp::BNot => OpCode::BNot,
        };
        let rb = self.exp_to_any_reg(operand)?;
        let pc = self.emit(Instruction::abc(opcode, 0, rb as u32, 0), line);
        Ok(ExprDesc::Relocatable(pc))
    }

    /// Value-context comparison: test + JMP + two LOADBOOLs.
    fn compile_comparison_value(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        let target = self.free_reg();
        let jmp = self.emit_cond_comparison(op, lhs, rhs, true, line)?;
        self.free_to(target);
        let reg = self.alloc_reg(line)?;
        // Fallthrough: condition false.
        self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 0, 1), line);
        let true_pc = self.current_pc();
        self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 1, 0), line);
        self.patch_jump_to(jmp, true_pc)?;
        Ok(ExprDesc::Register(reg))
    }

    /// Emit a comparison whose following JMP is taken when the result is
    /// `when_true`. Returns the JMP's pc for patching.
    fn emit_cond_comparison(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        when_true: bool,
        line: u32,
    ) -> Result<usize, CodegenError> {
        let (opcode, base_a, swap) = match op {
            BinOp::Eq => (OpCode::Eq, 1u32, false),
            BinOp::NotEq => (OpCode::Eq, 0, false),
            BinOp::Lt => (OpCode::Lt, 1, false),
            BinOp::LtEq => (OpCode::Le, 1, false),
            BinOp::Gt => (OpCode::Lt, 1, true),
            BinOp::GtEq => (OpCode::Le, 1, true),
            _ => unreachable!("not a comparison"),
        };
        let a = if when_true { base_a } else { 1 - base_a };
        let saved = self.free_reg();
        let (l, r) = if swap { (rhs, lhs) } else { (lhs, rhs) };
        let rkb = self.exp_to_rk(l)?;
        let rkc = self.exp_to_rk(r)?;
        self.free_to(saved);
        self.emit(Instruction::abc(opcode, a, rkb, rkc), line);
        Ok(self.emit_jump(line))
    }

    // ---- Conditions ----

    /// Emit code for a condition; returns the JMP pcs taken when it is
    /// false. Jumps taken when it is true are patched to the instruction
    /// following the condition (the "then" entry).
    fn cond_false_jumps(&mut self, e: &Expr) -> Result<Vec<usize>, CodegenError> {
        match e {
            Expr::BinOp {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_false_jumps(lhs)?;
                jumps.extend(self.cond_false_jumps(rhs)?);
                Ok(jumps)
            }
            Expr::BinOp {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let true_jumps = self.cond_true_jumps(lhs)?;
                let false_jumps = self.cond_false_jumps(rhs)?;
                for pc in true_jumps {
                    self.patch_jump_here(pc)?;
                }
                Ok(false_jumps)
            }
            Expr::BinOp { op, lhs, rhs, line } if op.is_comparison() => {
                Ok(vec![self.emit_cond_comparison(*op, lhs, rhs, false, *line)?])
            }
            Expr::UnOp {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_true_jumps(operand),
            Expr::Paren(inner) => self.cond_false_jumps(inner),
            // Constant conditions fold to no test at all.
            Expr::Nil(line) | Expr::False(line) => Ok(vec![self.emit_jump(*line)]),
            Expr::True(_) | Expr::Integer(..) | Expr::Float(..) | Expr::Str(..)
            | Expr::Function(_) => Ok(vec![]),
            _ => {
                let saved = self.free_reg();
                let r = self.exp_to_any_reg(e)?;
                self.free_to(saved);
                self.emit(Instruction::abc(OpCode::Test, r as u32, 0, 0), e.line());
                Ok(vec![self.emit_jump(e.line())])
            }
        }
    }

    /// Dual of `cond_false_jumps`: JMPs taken when the condition is true.
    fn cond_true_jumps(&mut self, e: &Expr) -> Result<Vec<usize>, CodegenError> {
        match e {
            Expr::BinOp {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_true_jumps(lhs)?;
                jumps.extend(self.cond_true_jumps(rhs)?);
                Ok(jumps)
            }
            Expr::BinOp {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let false_jumps = self.cond_false_jumps(lhs)?;
                let true_jumps = self.cond_true_jumps(rhs)?;
                for pc in false_jumps {
                    self.patch_jump_here(pc)?;
                }
                Ok(true_jumps)
            }
            Expr::BinOp { op, lhs, rhs, line } if op.is_comparison() => {
                Ok(vec![self.emit_cond_comparison(*op, lhs, rhs, true, *line)?])
            }
            Expr::UnOp {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_false_jumps(operand),
            Expr::Paren(inner) => self.cond_true_jumps(inner),
            Expr::Nil(_) | Expr::False(_) => Ok(vec![]),
            Expr::True(line) => Ok(vec![self.emit_jump(*line)]),
            Expr::Integer(_, line) | Expr::Float(_, line) | Expr::Str(_, line) => {
                Ok(vec![self.emit_jump(*line)])
            }
            _ => {
                let saved = self.free_reg();
                let r = self.exp_to_any_reg(e)?;
                self.free_to(saved);
                self.emit(Instruction::abc(OpCode::Test, r as u32, 0, 1), e.line());
                Ok(vec![self.emit_jump(e.line())])
            }
        }
    }

    // ---- Calls, closures, tables ----

    /// Compile a call or method call, leaving the CALL's result count
    /// open. The function value lands in a fresh register with arguments
    /// in the following ones.
    fn compile_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        method: Option<StringId>,
        line: u32,
    ) -> Result<ExprDesc, CodegenError> {
        let base;
        let fixed_extra;
        match method {
            Some(mname) => {
                let robj = self.exp_to_any_reg(func)?;
                let key_rk = self.string_rk(mname, line)?;
                base = self.alloc_regs(2, line)?;
                self.emit(
                    Instruction::abc(OpCode::Self_, base as u32, robj as u32, key_rk),
                    line,
                );
                fixed_extra = 1; // implicit self
            }
            None => {
                base = self.exp_to_next_reg(func)?;
                fixed_extra = 0;
            }
        }

        let mut multi = false;
        for (i, a) in args.iter().enumerate() {
            if i + 1 == args.len() && a.is_multi() {
                let desc = self.expr(a)?;
                self.set_multi_returns(desc)?;
                multi = true;
            } else {
                self.exp_to_next_reg(a)?;
            }
        }

        let b = if multi {
            0
        } else {
            args.len() as u32 + fixed_extra + 1
        };
        let pc = self.emit(Instruction::abc(OpCode::Call, base as u32, b, 1), line);
        self.free_to(base + 1);
        Ok(ExprDesc::Call(pc))
    }

    /// Compile a nested function body and emit CLOSURE for it.
    fn compile_function(&mut self, body: &FuncBody, line: u32) -> Result<ExprDesc, CodegenError> {
        let mut fs = FuncState::new();
        fs.proto.source = Some(self.source);
        fs.proto.line_defined = body.line;
        fs.proto.last_line_defined = body.end_line;
        fs.proto.num_params = body.params.len() as u8;
        fs.proto.is_vararg = body.is_vararg;
        self.func_stack.push(fs);

        for &p in &body.params {
            let reg = self.alloc_reg(body.line)?;
            self.fs_mut().scope.declare_local(p, reg, 0);
        }
        self.fs_mut().scope.enter_block(false);
        let has_ret = self.compile_block_body(&body.body)?;
        self.leave_block(body.end_line, has_ret)?;
        self.emit(
            Instruction::abc(OpCode::Return, 0, 1, 0),
            body.end_line,
        );

        let mut child = self.func_stack.pop().unwrap();
        child.finalize();
        let parent = self.fs_mut();
        let idx = parent.proto.protos.len();
        parent.proto.protos.push(Rc::new(child.proto));
        if idx > MAX_BX as usize {
            return Err(self.error(line, "too many nested functions"));
        }
        let pc = self.emit(Instruction::abx(OpCode::Closure, 0, idx as u32), line);
        Ok(ExprDesc::Relocatable(pc))
    }

    /// Table constructor: NEWTABLE, positional batches flushed through
    /// SETLIST every 50 items, keyed fields through SETTABLE.
    fn compile_table(&mut self, fields: &[Field], line: u32) -> Result<ExprDesc, CodegenError> {
        let treg = self.alloc_reg(line)?;
        let new_pc = self.emit(Instruction::abc(OpCode::NewTable, treg as u32, 0, 0), line);

        let mut array_total: u32 = 0;
        let mut pending: u32 = 0;
        let mut hash_count: u32 = 0;

        for (i, field) in fields.iter().enumerate() {
            match field {
                Field::Positional(e) if i + 1 == fields.len() && e.is_multi() => {
                    // Pending items and the open call/vararg sit in
                    // consecutive registers; one SETLIST with B=0 stores
                    // them all up to the stack top.
                    let desc = self.expr(e)?;
                    self.set_multi_returns(desc)?;
                    let batch = array_total / FIELDS_PER_FLUSH + 1;
                    self.emit_setlist(treg, 0, batch, line)?;
                    array_total += pending;
                    pending = 0;
                    self.free_to(treg + 1);
                }
                Field::Positional(e) => {
                    self.exp_to_next_reg(e)?;
                    pending += 1;
                    if pending == FIELDS_PER_FLUSH {
                        let batch = array_total / FIELDS_PER_FLUSH + 1;
                        self.emit_setlist(treg, pending, batch, line)?;
                        array_total += pending;
                        pending = 0;
                        self.free_to(treg + 1);
                    }
                }
                Field::Named(name, e) => {
                    let saved = self.free_reg();
                    let key_rk = self.string_rk(*name, line)?;
                    let val_rk = self.exp_to_rk(e)?;
                    self.emit(
                        Instruction::abc(OpCode::SetTable, treg as u32, key_rk, val_rk),
                        line,
                    );
                    self.free_to(saved);
                    hash_count += 1;
                }
                Field::Keyed(k, e) => {
                    let saved = self.free_reg();
                    let key_rk = self.exp_to_rk(k)?;
                    let val_rk = self.exp_to_rk(e)?;
                    self.emit(
                        Instruction::abc(OpCode::SetTable, treg as u32, key_rk, val_rk),
                        line,
                    );
                    self.free_to(saved);
                    hash_count += 1;
                }
            }
        }

        if pending > 0 {
            let batch = array_total / FIELDS_PER_FLUSH + 1;
            self.emit_setlist(treg, pending, batch, line)?;
            array_total += pending;
            self.free_to(treg + 1);
        }

        let inst = self.fs_mut().proto.get_mut(new_pc);
        inst.set_b(opcode::int_to_fb(array_total));
        inst.set_c(opcode::int_to_fb(hash_count));
        Ok(ExprDesc::Register(treg))
    }

    fn emit_setlist(
        &mut self,
        treg: u8,
        b: u32,
        batch: u32,
        line: u32,
    ) -> Result<(), CodegenError> {
        if batch <= MAX_C {
            self.emit(
                Instruction::abc(OpCode::SetList, treg as u32, b, batch),
                line,
            );
        } else {
            // Batch number goes in a following EXTRAARG.
            self.emit(Instruction::abc(OpCode::SetList, treg as u32, b, 0), line);
            self.emit(Instruction::ax(OpCode::ExtraArg, batch), line);
        }
        Ok(())
    }
}
