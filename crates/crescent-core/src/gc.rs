//! GC heap with arena-based allocation, typed indices, and mark-sweep
//! collection.
//!
//! Tables, closures, and upvalues live in per-type arenas addressed by
//! `GcIdx<T>`. Indices are absolute and stable across arena growth, so
//! open upvalues and table keys can hold them safely. Cycles among
//! tables, closures, and upvalues are the norm in Lua, hence the tracing
//! collector; prototypes are shared through `Rc` because the proto tree
//! is acyclic.

use crate::proto::Proto;
use crate::table::{Table, TableKey};
use crate::value::LuaValue;
use std::marker::PhantomData;
use std::rc::Rc;

/// A typed index into an arena in the GcHeap.
#[derive(Debug)]
pub struct GcIdx<T>(u32, PhantomData<T>);

impl<T> Clone for GcIdx<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for GcIdx<T> {}

impl<T> PartialEq for GcIdx<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl<T> Eq for GcIdx<T> {}

impl<T> std::hash::Hash for GcIdx<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl<T> GcIdx<T> {
    pub fn from_raw(raw: u32) -> Self {
        GcIdx(raw, PhantomData)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// A Lua closure: a shared prototype plus captured upvalues.
///
/// Two closures created at the same CLOSURE site over the same outer local
/// share the same `GcIdx<UpVal>` entries.
#[derive(Debug)]
pub struct LuaClosure {
    pub proto: Rc<Proto>,
    pub upvalues: Vec<GcIdx<UpVal>>,
}

/// An upvalue cell.
#[derive(Debug)]
pub struct UpVal {
    pub location: UpValLocation,
}

/// Where an upvalue's value lives. The open -> closed transition is
/// one-way and happens at most once.
#[derive(Debug)]
pub enum UpValLocation {
    /// Absolute index into the VM register file.
    Open(usize),
    /// Owned cell, after the enclosing frame returned or CLOSE ran.
    Closed(LuaValue),
}

/// Bookkeeping for a mark-sweep cycle.
pub struct GcState {
    table_marks: Vec<bool>,
    closure_marks: Vec<bool>,
    upval_marks: Vec<bool>,
    gray_tables: Vec<u32>,
    gray_closures: Vec<u32>,
    gray_upvals: Vec<u32>,
    /// Approximate live bytes.
    pub total_alloc: usize,
    /// Allocation level that triggers the next collection.
    pub threshold: usize,
    /// Pause percentage: 200 means collect when allocation doubles.
    pub pause: u32,
    pub enabled: bool,
}

const GC_MIN_THRESHOLD: usize = 4096;

impl GcState {
    fn new() -> Self {
        GcState {
            table_marks: Vec::new(),
            closure_marks: Vec::new(),
            upval_marks: Vec::new(),
            gray_tables: Vec::new(),
            gray_closures: Vec::new(),
            gray_upvals: Vec::new(),
            total_alloc: 0,
            threshold: GC_MIN_THRESHOLD,
            pause: 200,
            enabled: true,
        }
    }
}

/// Arena-based GC heap.
pub struct GcHeap {
    tables: Vec<Option<Table>>,
    table_free: Vec<u32>,
    closures: Vec<Option<LuaClosure>>,
    closure_free: Vec<u32>,
    upvals: Vec<Option<UpVal>>,
    upval_free: Vec<u32>,
    pub gc_state: GcState,
}

impl GcHeap {
    pub fn new() -> Self {
        GcHeap {
            tables: Vec::new(),
            table_free: Vec::new(),
            closures: Vec::new(),
            closure_free: Vec::new(),
            upvals: Vec::new(),
            upval_free: Vec::new(),
            gc_state: GcState::new(),
        }
    }

    // ---- Allocation ----

    pub fn alloc_table(&mut self, array_hint: usize, hash_hint: usize) -> GcIdx<Table> {
        let size_est = 64 + array_hint * 16 + hash_hint * 32;
        self.gc_state.total_alloc += size_est;
        let table = Table::new(array_hint, hash_hint);
        if let Some(idx) = self.table_free.pop() {
            self.tables[idx as usize] = Some(table);
            GcIdx::from_raw(idx)
        } else {
            let idx = self.tables.len() as u32;
            self.tables.push(Some(table));
            GcIdx::from_raw(idx)
        }
    }

    pub fn alloc_closure(
        &mut self,
        proto: Rc<Proto>,
        upvalues: Vec<GcIdx<UpVal>>,
    ) -> GcIdx<LuaClosure> {
        self.gc_state.total_alloc += 32 + upvalues.len() * 8;
        let closure = LuaClosure { proto, upvalues };
        if let Some(idx) = self.closure_free.pop() {
            self.closures[idx as usize] = Some(closure);
            GcIdx::from_raw(idx)
        } else {
            let idx = self.closures.len() as u32;
            self.closures.push(Some(closure));
            GcIdx::from_raw(idx)
        }
    }

    pub fn alloc_upval(&mut self, location: UpValLocation) -> GcIdx<UpVal> {
        self.gc_state.total_alloc += 24;
        let upval = UpVal { location };
        if let Some(idx) = self.upval_free.pop() {
            self.upvals[idx as usize] = Some(upval);
            GcIdx::from_raw(idx)
        } else {
            let idx = self.upvals.len() as u32;
            self.upvals.push(Some(upval));
            GcIdx::from_raw(idx)
        }
    }

    // ---- Access ----

    pub fn get_table(&self, idx: GcIdx<Table>) -> &Table {
        self.tables[idx.0 as usize]
            .as_ref()
            .expect("table was freed")
    }

    pub fn get_table_mut(&mut self, idx: GcIdx<Table>) -> &mut Table {
        self.tables[idx.0 as usize]
            .as_mut()
            .expect("table was freed")
    }

    pub fn get_closure(&self, idx: GcIdx<LuaClosure>) -> &LuaClosure {
        self.closures[idx.0 as usize]
            .as_ref()
            .expect("closure was freed")
    }

    pub fn get_upval(&self, idx: GcIdx<UpVal>) -> &UpVal {
        self.upvals[idx.0 as usize]
            .as_ref()
            .expect("upval was freed")
    }

    pub fn get_upval_mut(&mut self, idx: GcIdx<UpVal>) -> &mut UpVal {
        self.upvals[idx.0 as usize]
            .as_mut()
            .expect("upval was freed")
    }

    pub fn live_tables(&self) -> usize {
        self.tables.iter().filter(|t| t.is_some()).count()
    }

    pub fn live_closures(&self) -> usize {
        self.closures.iter().filter(|c| c.is_some()).count()
    }

    pub fn live_upvals(&self) -> usize {
        self.upvals.iter().filter(|u| u.is_some()).count()
    }

    // ---- Collection ----

    /// True when allocation since the last sweep crossed the threshold.
    pub fn should_collect(&self) -> bool {
        self.gc_state.enabled && self.gc_state.total_alloc > self.gc_state.threshold
    }

    /// Reset mark bits for a new cycle.
    pub fn mark_prepare(&mut self) {
        let st = &mut self.gc_state;
        st.table_marks.clear();
        st.table_marks.resize(self.tables.len(), false);
        st.closure_marks.clear();
        st.closure_marks.resize(self.closures.len(), false);
        st.upval_marks.clear();
        st.upval_marks.resize(self.upvals.len(), false);
        st.gray_tables.clear();
        st.gray_closures.clear();
        st.gray_upvals.clear();
    }

    /// Mark a root value.
    pub fn mark_value(&mut self, val: LuaValue) {
        match val {
            LuaValue::Table(idx) => self.mark_table(idx.0),
            LuaValue::Function(idx) => self.mark_closure(idx.0),
            _ => {}
        }
    }

    pub fn mark_table(&mut self, idx: u32) {
        let i = idx as usize;
        if i < self.gc_state.table_marks.len() && !self.gc_state.table_marks[i] {
            self.gc_state.table_marks[i] = true;
            self.gc_state.gray_tables.push(idx);
        }
    }

    pub fn mark_closure(&mut self, idx: u32) {
        let i = idx as usize;
        if i < self.gc_state.closure_marks.len() && !self.gc_state.closure_marks[i] {
            self.gc_state.closure_marks[i] = true;
            self.gc_state.gray_closures.push(idx);
        }
    }

    pub fn mark_upval(&mut self, idx: u32) {
        let i = idx as usize;
        if i < self.gc_state.upval_marks.len() && !self.gc_state.upval_marks[i] {
            self.gc_state.upval_marks[i] = true;
            self.gc_state.gray_upvals.push(idx);
        }
    }

    /// Drain gray lists, marking children, until nothing is gray.
    pub fn propagate(&mut self) {
        loop {
            if let Some(idx) = self.gc_state.gray_tables.pop() {
                let mut children: Vec<LuaValue> = Vec::new();
                let mut mt = None;
                if let Some(table) = &self.tables[idx as usize] {
                    mt = table.metatable;
                    for &v in table.array_values() {
                        children.push(v);
                    }
                    for (key, &v) in table.hash_entries() {
                        children.push(v);
                        match key {
                            TableKey::Table(t) => children.push(LuaValue::Table(GcIdx::from_raw(*t))),
                            TableKey::Function(f) => {
                                children.push(LuaValue::Function(GcIdx::from_raw(*f)))
                            }
                            _ => {}
                        }
                    }
                }
                if let Some(mt_idx) = mt {
                    self.mark_table(mt_idx.0);
                }
                for child in children {
                    self.mark_value(child);
                }
                continue;
            }
            if let Some(idx) = self.gc_state.gray_closures.pop() {
                let upvals: Vec<u32> = self.closures[idx as usize]
                    .as_ref()
                    .map(|c| c.upvalues.iter().map(|u| u.0).collect())
                    .unwrap_or_default();
                for uv in upvals {
                    self.mark_upval(uv);
                }
                continue;
            }
            if let Some(idx) = self.gc_state.gray_upvals.pop() {
                let closed = match self.upvals[idx as usize].as_ref().map(|u| &u.location) {
                    Some(UpValLocation::Closed(v)) => Some(*v),
                    // Open upvalues point into the register file, which is
                    // itself a root.
                    _ => None,
                };
                if let Some(v) = closed {
                    self.mark_value(v);
                }
                continue;
            }
            break;
        }
    }

    /// Free everything unmarked. Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for i in 0..self.tables.len() {
            if self.tables[i].is_some() && !self.gc_state.table_marks[i] {
                self.tables[i] = None;
                self.table_free.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.closures.len() {
            if self.closures[i].is_some() && !self.gc_state.closure_marks[i] {
                self.closures[i] = None;
                self.closure_free.push(i as u32);
                freed += 1;
            }
        }
        for i in 0..self.upvals.len() {
            if self.upvals[i].is_some() && !self.gc_state.upval_marks[i] {
                self.upvals[i] = None;
                self.upval_free.push(i as u32);
                freed += 1;
            }
        }

        // Recompute the live estimate and the next threshold.
        let mut live = 0usize;
        for t in self.tables.iter().flatten() {
            live += 64 + t.approx_len() * 24;
        }
        for c in self.closures.iter().flatten() {
            live += 32 + c.upvalues.len() * 8;
        }
        live += self.live_upvals() * 24;
        self.gc_state.total_alloc = live;
        self.gc_state.threshold =
            ((live as u64 * self.gc_state.pause as u64) / 100).max(GC_MIN_THRESHOLD as u64) as usize;
        freed
    }
}

impl Default for GcHeap {
    fn default() -> Self {
        Self::new()
    }
}
