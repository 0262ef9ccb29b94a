//! The Crescent virtual machine: executes Lua 5.3 prototypes against a
//! register file, with the runtime semantics (coercion, metamethods,
//! upvalues) and the binary chunk codec.

pub mod arith;
pub mod binary_chunk;
pub mod callinfo;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod metamethod;
pub mod vm;
