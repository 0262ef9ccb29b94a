//! Metamethod names and lookup.

use crescent_core::gc::GcHeap;
use crescent_core::string::{StringId, StringInterner};
use crescent_core::value::LuaValue;

/// How many `__index`/`__newindex` hops before the VM declares a loop.
pub const MAX_META_CHAIN: usize = 100;

/// Pre-interned metamethod name ids.
pub struct MetamethodNames {
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub mod_: StringId,
    pub pow: StringId,
    pub div: StringId,
    pub idiv: StringId,
    pub band: StringId,
    pub bor: StringId,
    pub bxor: StringId,
    pub shl: StringId,
    pub shr: StringId,
    pub unm: StringId,
    pub bnot: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub index: StringId,
    pub newindex: StringId,
    pub call: StringId,
    pub len: StringId,
    pub concat: StringId,
    pub tostring: StringId,
    pub metatable: StringId,
}

impl MetamethodNames {
    pub fn init(strings: &mut StringInterner) -> Self {
        MetamethodNames {
            add: strings.intern(b"__add"),
            sub: strings.intern(b"__sub"),
            mul: strings.intern(b"__mul"),
            mod_: strings.intern(b"__mod"),
            pow: strings.intern(b"__pow"),
            div: strings.intern(b"__div"),
            idiv: strings.intern(b"__idiv"),
            band: strings.intern(b"__band"),
            bor: strings.intern(b"__bor"),
            bxor: strings.intern(b"__bxor"),
            shl: strings.intern(b"__shl"),
            shr: strings.intern(b"__shr"),
            unm: strings.intern(b"__unm"),
            bnot: strings.intern(b"__bnot"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            tostring: strings.intern(b"__tostring"),
            metatable: strings.intern(b"__metatable"),
        }
    }

    /// Name id for an arithmetic event (from `ArithOp::event`).
    pub fn for_event(&self, event: &str) -> StringId {
        match event {
            "add" => self.add,
            "sub" => self.sub,
            "mul" => self.mul,
            "mod" => self.mod_,
            "pow" => self.pow,
            "div" => self.div,
            "idiv" => self.idiv,
            "band" => self.band,
            "bor" => self.bor,
            "bxor" => self.bxor,
            "shl" => self.shl,
            "shr" => self.shr,
            _ => self.add,
        }
    }
}

/// Look up a metamethod on a value. Only tables carry metatables here
/// (the string library and userdata are out of scope).
pub fn get_metamethod(val: LuaValue, name: StringId, gc: &GcHeap) -> Option<LuaValue> {
    let table_idx = val.as_table_idx()?;
    let mt_idx = gc.get_table(table_idx).metatable?;
    let mm = gc.get_table(mt_idx).raw_get_str(name);
    if mm.is_nil() {
        None
    } else {
        Some(mm)
    }
}
