//! Core data model shared by the Crescent compiler, binary codec, and VM.

pub mod gc;
pub mod opcode;
pub mod proto;
pub mod string;
pub mod table;
pub mod value;
