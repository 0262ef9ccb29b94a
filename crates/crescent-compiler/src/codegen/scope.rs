/// Register allocation and scope tracking for a single function.
use crescent_core::string::StringId;

/// Hard ceiling on live locals plus temporaries per function. PUC caps
/// declared variables at 200 (LUAI_MAXVARS) even though the A field
/// could address 255 registers.
pub const MAX_REGS: u16 = 200;

/// An active local variable.
#[derive(Clone, Debug)]
pub struct LocalVarInfo {
    pub name: StringId,
    pub reg: u8,
    /// First pc where the variable is live, for debug info.
    pub start_pc: u32,
}

/// A label defined in a block.
#[derive(Clone, Debug)]
pub struct LabelInfo {
    pub name: StringId,
    pub pc: usize,
    /// Active local count at the label.
    pub num_active: usize,
}

/// A forward goto waiting for its label.
#[derive(Clone, Debug)]
pub struct PendingGoto {
    pub name: StringId,
    /// pc of the placeholder JMP.
    pub pc: usize,
    pub line: u32,
    /// Active local count at the goto site.
    pub num_active: usize,
}

/// One lexical block.
#[derive(Debug)]
pub struct BlockScope {
    pub num_locals_on_entry: usize,
    pub first_free_reg_on_entry: u8,
    pub is_loop: bool,
    /// JMP pcs of `break`s targeting this loop.
    pub break_jumps: Vec<usize>,
    pub labels: Vec<LabelInfo>,
    pub pending_gotos: Vec<PendingGoto>,
    /// Set when a local declared in this block is captured by a closure;
    /// the block exit must then close upvalues.
    pub needs_close: bool,
}

/// Registers, locals, and blocks of the function being compiled.
pub struct ScopeManager {
    pub locals: Vec<LocalVarInfo>,
    pub blocks: Vec<BlockScope>,
    /// Next free register; temporaries are freed by lowering this.
    pub free_reg: u8,
    /// High-water mark, becomes the proto's max_stack_size.
    pub max_reg: u8,
}

impl ScopeManager {
    pub fn new() -> Self {
        ScopeManager {
            locals: Vec::new(),
            blocks: Vec::new(),
            free_reg: 0,
            max_reg: 0,
        }
    }

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockScope {
            num_locals_on_entry: self.locals.len(),
            first_free_reg_on_entry: self.free_reg,
            is_loop,
            break_jumps: Vec::new(),
            labels: Vec::new(),
            pending_gotos: Vec::new(),
            needs_close: false,
        });
    }

    /// Pop the innermost block; the caller handles close emission, break
    /// patching, and goto bubbling. Returns the block and the locals that
    /// just went out of scope.
    pub fn leave_block(&mut self) -> (BlockScope, Vec<LocalVarInfo>) {
        let block = self.blocks.pop().expect("unbalanced block");
        let dead = self.locals.split_off(block.num_locals_on_entry);
        self.free_reg = block.first_free_reg_on_entry;
        (block, dead)
    }

    /// Allocate one temporary register.
    pub fn alloc_reg(&mut self) -> Option<u8> {
        if self.free_reg as u16 >= MAX_REGS {
            return None;
        }
        let reg = self.free_reg;
        self.free_reg += 1;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        Some(reg)
    }

    /// Allocate `n` consecutive registers, returning the first.
    pub fn alloc_regs(&mut self, n: u16) -> Option<u8> {
        if self.free_reg as u16 + n > MAX_REGS {
            return None;
        }
        let first = self.free_reg;
        self.free_reg += n as u8;
        if self.free_reg > self.max_reg {
            self.max_reg = self.free_reg;
        }
        Some(first)
    }

    /// Free temporaries back down to `level`. Registers are released in
    /// reverse allocation order by construction.
    pub fn free_to(&mut self, level: u8) {
        debug_assert!(level <= self.free_reg);
        self.free_reg = level;
    }

    /// Bind `name` to an already-reserved register.
    pub fn declare_local(&mut self, name: StringId, reg: u8, start_pc: u32) {
        self.locals.push(LocalVarInfo {
            name,
            reg,
            start_pc,
        });
    }

    /// Innermost local with this name.
    pub fn resolve_local(&self, name: StringId) -> Option<&LocalVarInfo> {
        self.locals.iter().rev().find(|v| v.name == name)
    }

    /// Index of the innermost loop block, for `break`.
    pub fn innermost_loop(&self) -> Option<usize> {
        self.blocks.iter().rposition(|b| b.is_loop)
    }

    /// A local register got captured: flag the block that owns it so its
    /// exit closes upvalues.
    pub fn mark_capture(&mut self, reg: u8) {
        for block in self.blocks.iter_mut().rev() {
            if block.first_free_reg_on_entry <= reg {
                block.needs_close = true;
                return;
            }
        }
        if let Some(first) = self.blocks.first_mut() {
            first.needs_close = true;
        }
    }
}

impl Default for ScopeManager {
    fn default() -> Self {
        Self::new()
    }
}
