//! Crescent front end: source text in, Lua 5.3 prototypes out.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod token;

use crescent_core::proto::Proto;
use crescent_core::string::StringInterner;
use std::fmt;

/// Any error the front end can produce.
#[derive(Clone, Debug)]
pub enum CompileError {
    Lex(lexer::LexError),
    Parse(parser::ParseError),
    Codegen(codegen::CodegenError),
}

impl CompileError {
    pub fn line(&self) -> u32 {
        match self {
            CompileError::Lex(e) => e.line,
            CompileError::Parse(e) => e.line,
            CompileError::Codegen(e) => e.line,
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Lex(e) => write!(f, "{e}"),
            CompileError::Parse(e) => write!(f, "{e}"),
            CompileError::Codegen(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<lexer::LexError> for CompileError {
    fn from(e: lexer::LexError) -> Self {
        CompileError::Lex(e)
    }
}

impl From<parser::ParseError> for CompileError {
    fn from(e: parser::ParseError) -> Self {
        CompileError::Parse(e)
    }
}

impl From<codegen::CodegenError> for CompileError {
    fn from(e: codegen::CodegenError) -> Self {
        CompileError::Codegen(e)
    }
}

/// Compile a source chunk into a main prototype with a fresh interner.
pub fn compile(source: &[u8], chunk_name: &str) -> Result<(Proto, StringInterner), CompileError> {
    let mut strings = StringInterner::new();
    let proto = compile_into(source, chunk_name, &mut strings)?;
    Ok((proto, strings))
}

/// Compile a source chunk into an existing string interner (the VM
/// shares one across chunks). The interner survives failed compiles, so
/// previously handed-out ids stay valid.
pub fn compile_into(
    source: &[u8],
    chunk_name: &str,
    strings: &mut StringInterner,
) -> Result<Proto, CompileError> {
    let taken = std::mem::take(strings);
    let mut parser = parser::Parser::new(source, taken);
    let parsed = parser.parse_chunk();
    let mut recovered = parser.into_strings();
    let result = match parsed {
        Ok(block) => {
            let source_name = recovered.intern(chunk_name.as_bytes());
            codegen::generate(&block, source_name, &mut recovered).map_err(CompileError::from)
        }
        Err(e) => Err(CompileError::from(e)),
    };
    *strings = recovered;
    result
}
