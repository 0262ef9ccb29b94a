//! Runtime error types.

use crescent_core::string::StringInterner;
use crescent_core::value::LuaValue;
use std::fmt;

/// A Lua runtime error.
#[derive(Clone, Debug)]
pub enum LuaError {
    /// Runtime fault with a formatted `source:line: message` string.
    Runtime(String),
    /// Call depth limit exceeded.
    StackOverflow,
    /// `error()` raised an arbitrary value.
    Value(LuaValue),
}

impl LuaError {
    /// The value `pcall` hands back as its second result.
    pub fn to_value(&self, strings: &mut StringInterner) -> LuaValue {
        match self {
            LuaError::Runtime(msg) => LuaValue::Str(strings.intern(msg.as_bytes())),
            LuaError::StackOverflow => LuaValue::Str(strings.intern(b"stack overflow")),
            LuaError::Value(v) => *v,
        }
    }

    /// Message for the host, resolving error values through the interner.
    pub fn display(&self, strings: &StringInterner) -> String {
        match self {
            LuaError::Runtime(msg) => msg.clone(),
            LuaError::StackOverflow => "stack overflow".to_string(),
            LuaError::Value(LuaValue::Str(id)) => strings.get_str(*id).into_owned(),
            LuaError::Value(v) => format!("(error object is a {} value)", v.type_name()),
        }
    }
}

impl fmt::Display for LuaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Runtime(msg) => write!(f, "{msg}"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
            LuaError::Value(v) => write!(f, "error object: {v}"),
        }
    }
}

impl std::error::Error for LuaError {}

/// Binary chunk loading error.
#[derive(Clone, Debug)]
pub struct LoadError {
    pub message: String,
}

impl LoadError {
    pub fn new(message: impl Into<String>) -> Self {
        LoadError {
            message: message.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LoadError {}
