//! VM state: the register file, call stack, globals, open upvalues, and
//! the protected-call boundary.

use crate::callinfo::CallInfo;
use crate::coerce;
use crate::dispatch;
use crate::error::LuaError;
use crate::metamethod::{self, MetamethodNames};
use crescent_compiler::CompileError;
use crescent_core::gc::{GcHeap, GcIdx, UpVal, UpValLocation};
use crescent_core::proto::Proto;
use crescent_core::string::StringInterner;
use crescent_core::table::Table;
use crescent_core::value::{LuaValue, NativeId};
use std::rc::Rc;

/// Signature of a host function callable from Lua.
pub type NativeFn = fn(&mut Vm, &[LuaValue]) -> Result<Vec<LuaValue>, LuaError>;

/// A registered host function.
pub struct NativeFunction {
    pub name: &'static str,
    pub func: NativeFn,
}

/// The Lua virtual machine.
pub struct Vm {
    /// One linear register file shared by all frames.
    pub stack: Vec<LuaValue>,
    pub call_stack: Vec<CallInfo>,
    pub gc: GcHeap,
    pub strings: StringInterner,
    /// Host functions; never collected.
    pub natives: Vec<NativeFunction>,
    /// First stack slot not holding a live value (for multi-return).
    pub stack_top: usize,
    /// The global environment, bound to `_ENV` of every chunk.
    pub globals: GcIdx<Table>,
    /// Open upvalues by absolute stack index, descending.
    pub open_upvals: Vec<(usize, GcIdx<UpVal>)>,
    /// Bounded call depth; exceeding it raises a stack overflow.
    pub max_call_depth: usize,
    pub mm: MetamethodNames,
    /// The `next` builtin, handed out by `pairs`. Set during stdlib
    /// registration.
    pub next_fn: Option<LuaValue>,
    /// The anonymous iterator behind `ipairs`.
    pub ipairs_aux_fn: Option<LuaValue>,
    /// Traceback captured at the most recent uncaught raise.
    pub last_traceback: Option<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut strings = StringInterner::new();
        let mm = MetamethodNames::init(&mut strings);
        let mut gc = GcHeap::new();
        let globals = gc.alloc_table(0, 32);
        Vm {
            stack: vec![LuaValue::Nil; 256],
            call_stack: Vec::new(),
            gc,
            strings,
            natives: Vec::new(),
            stack_top: 0,
            globals,
            open_upvals: Vec::new(),
            max_call_depth: 200,
            mm,
            next_fn: None,
            ipairs_aux_fn: None,
            last_traceback: None,
        }
    }

    // ---- Loading ----

    /// Compile source text into a callable main closure. The VM's string
    /// interner is shared with the compiler so ids stay stable across
    /// chunks (and across failed compiles).
    pub fn load_source(
        &mut self,
        source: &[u8],
        chunk_name: &str,
    ) -> Result<LuaValue, CompileError> {
        let proto = crescent_compiler::compile_into(source, chunk_name, &mut self.strings)?;
        Ok(self.make_main_closure(Rc::new(proto)))
    }

    /// Decode a binary chunk into a callable main closure.
    pub fn load_binary(
        &mut self,
        bytes: &[u8],
        chunk_name: &str,
    ) -> Result<LuaValue, crate::error::LoadError> {
        let proto = crate::binary_chunk::undump(bytes, chunk_name, &mut self.strings)?;
        Ok(self.make_main_closure(Rc::new(proto)))
    }

    /// Wrap a main prototype in a closure whose first upvalue is `_ENV`.
    pub fn make_main_closure(&mut self, proto: Rc<Proto>) -> LuaValue {
        let env_val = LuaValue::Table(self.globals);
        let env_upval = self.gc.alloc_upval(UpValLocation::Closed(env_val));
        let nupvals = proto.upvalues.len().max(1);
        // Chunks only ever reference _ENV; pad any extra slots with it.
        let upvals = vec![env_upval; nupvals];
        let closure_idx = self.gc.alloc_closure(proto, upvals);
        LuaValue::Function(closure_idx)
    }

    // ---- Natives & globals ----

    /// Register a host function without binding it to a global (for
    /// helper functions like the `ipairs` iterator).
    pub fn add_native(&mut self, name: &'static str, func: NativeFn) -> LuaValue {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(NativeFunction { name, func });
        LuaValue::Native(id)
    }

    /// Register a host function under a global name.
    pub fn register_native(&mut self, name: &'static str, func: NativeFn) -> LuaValue {
        let val = self.add_native(name, func);
        let key = self.strings.intern(name.as_bytes());
        self.gc.get_table_mut(self.globals).raw_set_str(key, val);
        val
    }

    pub fn set_global(&mut self, name: &str, val: LuaValue) {
        let key = self.strings.intern(name.as_bytes());
        self.gc.get_table_mut(self.globals).raw_set_str(key, val);
    }

    pub fn get_global(&mut self, name: &str) -> LuaValue {
        let key = self.strings.intern(name.as_bytes());
        self.gc.get_table(self.globals).raw_get_str(key)
    }

    // ---- Calls ----

    /// Call any callable value with the given arguments, running nested
    /// dispatch until it returns. This is the entry point for the host,
    /// for builtins like `pcall`, and for metamethod invocation.
    pub fn call_value(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
    ) -> Result<Vec<LuaValue>, LuaError> {
        if self.call_stack.len() >= self.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        match func {
            LuaValue::Native(id) => {
                let f = self.natives[id.0 as usize].func;
                f(self, args)
            }
            LuaValue::Function(_) => {
                let entry_depth = self.call_stack.len();
                let entry_base = self.stack_top;
                // Lay out function + args above the live stack.
                let needed = entry_base + args.len() + 1;
                if self.stack.len() < needed {
                    self.stack.resize(needed, LuaValue::Nil);
                }
                self.stack[entry_base] = func;
                for (i, &a) in args.iter().enumerate() {
                    self.stack[entry_base + 1 + i] = a;
                }
                self.stack_top = entry_base + 1 + args.len();

                dispatch::push_lua_frame(self, entry_base, args.len(), -1)?;
                let result = dispatch::run(self, entry_depth);
                match result {
                    Ok(values) => {
                        self.stack_top = entry_base;
                        Ok(values)
                    }
                    Err(e) => {
                        // Capture the traceback while the frames are still
                        // intact, then unwind to the protected boundary.
                        self.last_traceback = Some(self.build_traceback());
                        while self.call_stack.len() > entry_depth {
                            self.call_stack.pop();
                        }
                        self.close_upvalues(entry_base);
                        self.stack_top = entry_base;
                        Err(e)
                    }
                }
            }
            other => {
                // A value with a __call metamethod is callable; the value
                // itself becomes the first argument.
                if let Some(mm) = metamethod::get_metamethod(other, self.mm.call, &self.gc) {
                    let mut full = Vec::with_capacity(args.len() + 1);
                    full.push(other);
                    full.extend_from_slice(args);
                    return self.call_value(mm, &full);
                }
                Err(LuaError::Runtime(format!(
                    "attempt to call a {} value",
                    other.type_name()
                )))
            }
        }
    }

    /// Protected call: errors below this boundary become `(false, msg)`.
    pub fn pcall_value(
        &mut self,
        func: LuaValue,
        args: &[LuaValue],
    ) -> Vec<LuaValue> {
        match self.call_value(func, args) {
            Ok(mut results) => {
                let mut out = vec![LuaValue::Boolean(true)];
                out.append(&mut results);
                out
            }
            Err(e) => {
                let msg = e.to_value(&mut self.strings);
                vec![LuaValue::Boolean(false), msg]
            }
        }
    }

    // ---- Upvalues ----

    /// Find or create the shared open upvalue for a stack slot.
    pub fn find_or_create_open_upval(&mut self, stack_idx: usize) -> GcIdx<UpVal> {
        for &(si, uv_idx) in &self.open_upvals {
            if si == stack_idx {
                return uv_idx;
            }
        }
        let uv_idx = self.gc.alloc_upval(UpValLocation::Open(stack_idx));
        self.open_upvals.push((stack_idx, uv_idx));
        self.open_upvals.sort_by(|a, b| b.0.cmp(&a.0));
        uv_idx
    }

    /// Close every open upvalue at or above `level`: copy the register
    /// into the upvalue's own cell and detach it. One-way transition.
    pub fn close_upvalues(&mut self, level: usize) {
        while let Some(&(stack_idx, uv_idx)) = self.open_upvals.first() {
            if stack_idx < level {
                break;
            }
            let val = self.stack[stack_idx];
            self.gc.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
            self.open_upvals.remove(0);
        }
    }

    pub fn get_upval_value(&self, uv_idx: GcIdx<UpVal>) -> LuaValue {
        match self.gc.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => self.stack[stack_idx],
            UpValLocation::Closed(val) => val,
        }
    }

    pub fn set_upval_value(&mut self, uv_idx: GcIdx<UpVal>, val: LuaValue) {
        match self.gc.get_upval(uv_idx).location {
            UpValLocation::Open(stack_idx) => self.stack[stack_idx] = val,
            UpValLocation::Closed(_) => {
                self.gc.get_upval_mut(uv_idx).location = UpValLocation::Closed(val);
            }
        }
    }

    /// Grow the register file; indices stay valid because everything
    /// holds absolute offsets, never pointers.
    pub fn ensure_stack(&mut self, base: usize, size: usize) {
        let needed = base + size;
        if needed > self.stack.len() {
            self.stack.resize(needed, LuaValue::Nil);
        }
    }

    // ---- Garbage collection ----

    /// Run a full mark-sweep cycle if the allocation debt crossed the
    /// threshold. Called only between instructions, so natives never need
    /// to root their temporaries.
    pub fn maybe_collect(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) -> usize {
        self.gc.mark_prepare();
        // Roots: the live stack, the globals, frames, open upvalues.
        let mut limit = self.stack_top;
        for ci in &self.call_stack {
            let proto = &self.gc.get_closure(ci.closure_idx).proto;
            limit = limit.max(ci.base + proto.max_stack_size as usize);
        }
        limit = limit.min(self.stack.len());
        for i in 0..limit {
            let v = self.stack[i];
            self.gc.mark_value(v);
        }
        let globals = self.globals;
        self.gc.mark_table(globals.index());
        let frame_closures: Vec<u32> = self
            .call_stack
            .iter()
            .map(|ci| ci.closure_idx.index())
            .collect();
        for idx in frame_closures {
            self.gc.mark_closure(idx);
        }
        let upvals: Vec<u32> = self.open_upvals.iter().map(|(_, uv)| uv.index()).collect();
        for uv in upvals {
            self.gc.mark_upval(uv);
        }
        if let Some(next_fn) = self.next_fn {
            self.gc.mark_value(next_fn);
        }
        self.gc.propagate();
        self.gc.sweep()
    }

    // ---- Errors & tracebacks ----

    /// Render the current frame chain, innermost first.
    pub fn build_traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for ci in self.call_stack.iter().rev() {
            let closure = self.gc.get_closure(ci.closure_idx);
            let proto = &closure.proto;
            let line = proto.get_line(ci.pc.saturating_sub(1));
            let source = self.chunk_id(proto);
            out.push_str(&format!("\n\t{source}:{line}: in function"));
        }
        out
    }

    /// Short chunk name for messages: `@file` drops the `@`, `=name`
    /// drops the `=`, plain source text gets quoted.
    pub fn chunk_id(&self, proto: &Proto) -> String {
        let Some(sid) = proto.source else {
            return "?".to_string();
        };
        let s = self.strings.get_str(sid);
        match s.as_bytes().first() {
            Some(b'@') | Some(b'=') => s[1..].to_string(),
            _ => format!("[string \"{}\"]", s.lines().next().unwrap_or("")),
        }
    }

    /// Position prefix `source:line:` for the active instruction at the
    /// given call depth (0 = innermost).
    pub fn position_at_level(&self, level: usize) -> Option<String> {
        let idx = self.call_stack.len().checked_sub(1 + level)?;
        let ci = self.call_stack.get(idx)?;
        let closure = self.gc.get_closure(ci.closure_idx);
        let line = closure.proto.get_line(ci.pc.saturating_sub(1));
        Some(format!("{}:{}", self.chunk_id(&closure.proto), line))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a value to its default display string (`tostring` without the
/// `__tostring` hook; dispatch and builtins apply the hook first).
pub fn format_value(val: LuaValue, _gc: &GcHeap, strings: &StringInterner) -> String {
    match val {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Float(f) => coerce::lua_format_float(f),
        LuaValue::Str(id) => strings.get_str(id).into_owned(),
        LuaValue::Table(idx) => format!("table: 0x{:08x}", idx.index()),
        LuaValue::Function(idx) => format!("function: 0x{:08x}", idx.index()),
        LuaValue::Native(id) => format!("function: builtin: 0x{:08x}", id.0),
    }
}
