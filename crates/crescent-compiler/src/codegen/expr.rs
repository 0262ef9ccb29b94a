/// Expression descriptors: where an expression's value lives before it is
/// committed to a register.
use crescent_core::string::StringId;

/// Result of compiling an expression.
///
/// Literals stay symbolic until a consumer picks a slot; `Relocatable`
/// marks an emitted instruction whose destination register is patched by
/// the consumer; `Call`/`Vararg` are open multi-value producers whose
/// result counts are fixed up at the use site.
#[derive(Clone, Debug)]
pub enum ExprDesc {
    /// No value (only transiently).
    Void,
    Nil,
    True,
    False,
    Integer(i64),
    Float(f64),
    Str(StringId),
    /// Value already in a register (a local, or a committed temporary).
    Register(u8),
    /// Value in an upvalue slot.
    Upvalue(u8),
    /// Indexed access with the key already encoded as an RK operand.
    /// Globals resolve here too, as `_ENV[name]`.
    Indexed { obj: IndexedBase, key_rk: u32 },
    /// Instruction at pc writes its result to a register chosen later.
    Relocatable(usize),
    /// CALL at pc; result count still open.
    Call(usize),
    /// VARARG at pc; destination and count still open.
    Vararg(usize),
}

/// The base of an indexed access: a table in a register, or (for global
/// sugar) a table held in an upvalue.
#[derive(Clone, Copy, Debug)]
pub enum IndexedBase {
    Register(u8),
    Upvalue(u8),
}

impl ExprDesc {
    /// Can this expression still produce multiple values?
    pub fn is_open_multi(&self) -> bool {
        matches!(self, ExprDesc::Call(_) | ExprDesc::Vararg(_))
    }

    /// Is this a literal that needs no code until discharged?
    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            ExprDesc::Nil
                | ExprDesc::True
                | ExprDesc::False
                | ExprDesc::Integer(_)
                | ExprDesc::Float(_)
                | ExprDesc::Str(_)
        )
    }
}
