//! Lua 5.3 binary chunk serialization (dump) and deserialization
//! (undump).
//!
//! The wire format matches PUC Lua 5.3 with the standard sizes (int 4,
//! size_t 8, Instruction 4, lua_Integer 8, lua_Number 8, little endian),
//! so chunks produced by `luac5.3` load here and vice versa.

use crate::error::LoadError;
use crescent_core::opcode::{Instruction, OpCode};
use crescent_core::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crescent_core::string::{StringId, StringInterner};
use std::rc::Rc;

pub const LUA_SIGNATURE: &[u8; 4] = b"\x1bLua";
const LUAC_VERSION: u8 = 0x53;
const LUAC_FORMAT: u8 = 0;
const LUAC_DATA: &[u8; 6] = b"\x19\x93\r\n\x1a\n";
const INT_SIZE: u8 = 4;
const SIZET_SIZE: u8 = 8;
const INSTRUCTION_SIZE: u8 = 4;
const LUA_INTEGER_SIZE: u8 = 8;
const LUA_NUMBER_SIZE: u8 = 8;
const LUAC_INT: i64 = 0x5678;
const LUAC_NUM: f64 = 370.5;

// Constant type tags (type | variant << 4).
const LUA_TNIL: u8 = 0x00;
const LUA_TBOOLEAN: u8 = 0x01;
const LUA_TNUMFLT: u8 = 0x03;
const LUA_TNUMINT: u8 = 0x13;
const LUA_TSHRSTR: u8 = 0x04;
const LUA_TLNGSTR: u8 = 0x14;

/// Longest string encoded with a single length byte (the stored size,
/// length+1, must stay below the 0xFF escape).
const SHORT_STR_MAX: usize = 0xFE - 1;
/// Boundary for the short/long string constant tag (LUAI_MAXSHORTLEN).
const SHORT_TAG_MAX: usize = 40;

// ─── Dumper ─────────────────────────────────────────────────────────────

/// Serialize a prototype tree into the `.luac` format. `strip` drops all
/// debug information.
pub fn dump(proto: &Proto, strings: &StringInterner, strip: bool) -> Vec<u8> {
    let mut out = Vec::new();
    write_header(&mut out);
    out.push(proto.upvalues.len() as u8);
    write_function(&mut out, proto, strings, strip, None);
    out
}

fn write_header(out: &mut Vec<u8>) {
    out.extend_from_slice(LUA_SIGNATURE);
    out.push(LUAC_VERSION);
    out.push(LUAC_FORMAT);
    out.extend_from_slice(LUAC_DATA);
    out.push(INT_SIZE);
    out.push(SIZET_SIZE);
    out.push(INSTRUCTION_SIZE);
    out.push(LUA_INTEGER_SIZE);
    out.push(LUA_NUMBER_SIZE);
    out.extend_from_slice(&LUAC_INT.to_le_bytes());
    out.extend_from_slice(&LUAC_NUM.to_le_bytes());
}

fn write_int(out: &mut Vec<u8>, n: i32) {
    out.extend_from_slice(&n.to_le_bytes());
}

/// Lua's short-string optimization: one length byte for short strings,
/// 0xFF plus a size_t for long ones, 0 for an absent string. The stored
/// length includes a virtual trailing NUL.
fn write_string(out: &mut Vec<u8>, s: Option<&[u8]>) {
    match s {
        None => out.push(0),
        Some(bytes) => {
            if bytes.len() <= SHORT_STR_MAX {
                out.push(bytes.len() as u8 + 1);
            } else {
                out.push(0xFF);
                out.extend_from_slice(&(bytes.len() as u64 + 1).to_le_bytes());
            }
            out.extend_from_slice(bytes);
        }
    }
}

fn write_function(
    out: &mut Vec<u8>,
    proto: &Proto,
    strings: &StringInterner,
    strip: bool,
    parent_source: Option<StringId>,
) {
    // Source name; absent when stripped or inherited from the parent.
    if strip || proto.source == parent_source {
        write_string(out, None);
    } else {
        write_string(out, proto.source.map(|sid| strings.get_bytes(sid)));
    }

    write_int(out, proto.line_defined as i32);
    write_int(out, proto.last_line_defined as i32);
    out.push(proto.num_params);
    out.push(proto.is_vararg as u8);
    out.push(proto.max_stack_size);

    write_int(out, proto.code.len() as i32);
    for inst in &proto.code {
        out.extend_from_slice(&inst.0.to_le_bytes());
    }

    write_int(out, proto.constants.len() as i32);
    for k in &proto.constants {
        match k {
            Constant::Nil => out.push(LUA_TNIL),
            Constant::Boolean(b) => {
                out.push(LUA_TBOOLEAN);
                out.push(*b as u8);
            }
            Constant::Float(f) => {
                out.push(LUA_TNUMFLT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Constant::Integer(i) => {
                out.push(LUA_TNUMINT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Constant::Str(sid) => {
                let bytes = strings.get_bytes(*sid);
                out.push(if bytes.len() <= SHORT_TAG_MAX {
                    LUA_TSHRSTR
                } else {
                    LUA_TLNGSTR
                });
                write_string(out, Some(bytes));
            }
        }
    }

    write_int(out, proto.upvalues.len() as i32);
    for uv in &proto.upvalues {
        out.push(uv.in_stack as u8);
        out.push(uv.index);
    }

    write_int(out, proto.protos.len() as i32);
    for child in &proto.protos {
        write_function(out, child, strings, strip, proto.source);
    }

    // Debug info: line map, locals, upvalue names.
    if strip {
        write_int(out, 0);
        write_int(out, 0);
        write_int(out, 0);
    } else {
        write_int(out, proto.line_info.len() as i32);
        for &line in &proto.line_info {
            write_int(out, line as i32);
        }
        write_int(out, proto.local_vars.len() as i32);
        for lv in &proto.local_vars {
            write_string(out, Some(strings.get_bytes(lv.name)));
            write_int(out, lv.start_pc as i32);
            write_int(out, lv.end_pc as i32);
        }
        write_int(out, proto.upvalues.len() as i32);
        for uv in &proto.upvalues {
            write_string(out, uv.name.map(|sid| strings.get_bytes(sid)));
        }
    }
}

// ─── Undumper ───────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn read_byte(&mut self) -> Result<u8, LoadError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| LoadError::new("truncated chunk"))?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        if self.pos + n > self.data.len() {
            return Err(LoadError::new("truncated chunk"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32_le(&mut self) -> Result<u32, LoadError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_int(&mut self) -> Result<i32, LoadError> {
        Ok(self.read_u32_le()? as i32)
    }

    fn read_u64_le(&mut self) -> Result<u64, LoadError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_i64_le(&mut self) -> Result<i64, LoadError> {
        Ok(self.read_u64_le()? as i64)
    }

    fn read_f64_le(&mut self) -> Result<f64, LoadError> {
        Ok(f64::from_bits(self.read_u64_le()?))
    }

    fn read_string(
        &mut self,
        strings: &mut StringInterner,
    ) -> Result<Option<StringId>, LoadError> {
        let first = self.read_byte()?;
        let size = if first == 0xFF {
            self.read_u64_le()? as usize
        } else {
            first as usize
        };
        if size == 0 {
            return Ok(None);
        }
        let bytes = self.read_bytes(size - 1)?;
        Ok(Some(strings.intern(bytes)))
    }
}

/// Decode a `.luac` chunk into its main prototype, validating the header.
pub fn undump(
    data: &[u8],
    name: &str,
    strings: &mut StringInterner,
) -> Result<Proto, LoadError> {
    let mut reader = Reader::new(data);
    check_header(&mut reader, name)?;
    let _main_upvalue_count = reader.read_byte()?;
    let mut proto = read_function(&mut reader, strings, None)?;
    if proto.source.is_none() {
        proto.source = Some(strings.intern(name.as_bytes()));
    }
    Ok(proto)
}

fn check_header(reader: &mut Reader, name: &str) -> Result<(), LoadError> {
    if reader.read_bytes(4)? != LUA_SIGNATURE {
        return Err(LoadError::new(format!("{name}: not a binary chunk")));
    }
    if reader.read_byte()? != LUAC_VERSION {
        return Err(LoadError::new(format!("{name}: version mismatch")));
    }
    if reader.read_byte()? != LUAC_FORMAT {
        return Err(LoadError::new(format!("{name}: format mismatch")));
    }
    if reader.read_bytes(6)? != LUAC_DATA {
        return Err(LoadError::new(format!("{name}: corrupted chunk")));
    }
    if reader.read_byte()? != INT_SIZE {
        return Err(LoadError::new(format!("{name}: int size mismatch")));
    }
    if reader.read_byte()? != SIZET_SIZE {
        return Err(LoadError::new(format!("{name}: size_t size mismatch")));
    }
    if reader.read_byte()? != INSTRUCTION_SIZE {
        return Err(LoadError::new(format!(
            "{name}: instruction size mismatch"
        )));
    }
    if reader.read_byte()? != LUA_INTEGER_SIZE {
        return Err(LoadError::new(format!("{name}: integer size mismatch")));
    }
    if reader.read_byte()? != LUA_NUMBER_SIZE {
        return Err(LoadError::new(format!("{name}: number size mismatch")));
    }
    if reader.read_i64_le()? != LUAC_INT {
        return Err(LoadError::new(format!("{name}: endianness mismatch")));
    }
    if reader.read_f64_le()? != LUAC_NUM {
        return Err(LoadError::new(format!("{name}: float format mismatch")));
    }
    Ok(())
}

fn read_function(
    reader: &mut Reader,
    strings: &mut StringInterner,
    parent_source: Option<StringId>,
) -> Result<Proto, LoadError> {
    let mut proto = Proto::new();

    proto.source = reader.read_string(strings)?.or(parent_source);
    proto.line_defined = reader.read_int()? as u32;
    proto.last_line_defined = reader.read_int()? as u32;
    proto.num_params = reader.read_byte()?;
    proto.is_vararg = reader.read_byte()? != 0;
    proto.max_stack_size = reader.read_byte()?;

    let code_len = reader.read_int()? as usize;
    proto.code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        let word = reader.read_u32_le()?;
        let inst = Instruction(word);
        if OpCode::from_u8(inst.raw_opcode()).is_none() {
            return Err(LoadError::new(format!(
                "invalid opcode {} in chunk",
                inst.raw_opcode()
            )));
        }
        proto.code.push(inst);
    }

    let const_len = reader.read_int()? as usize;
    proto.constants = Vec::with_capacity(const_len);
    for _ in 0..const_len {
        let tag = reader.read_byte()?;
        let k = match tag {
            LUA_TNIL => Constant::Nil,
            LUA_TBOOLEAN => Constant::Boolean(reader.read_byte()? != 0),
            LUA_TNUMFLT => Constant::Float(reader.read_f64_le()?),
            LUA_TNUMINT => Constant::Integer(reader.read_i64_le()?),
            LUA_TSHRSTR | LUA_TLNGSTR => {
                let sid = reader
                    .read_string(strings)?
                    .ok_or_else(|| LoadError::new("bad string constant"))?;
                Constant::Str(sid)
            }
            _ => return Err(LoadError::new(format!("unknown constant tag {tag:#04x}"))),
        };
        proto.constants.push(k);
    }

    let upval_len = reader.read_int()? as usize;
    proto.upvalues = Vec::with_capacity(upval_len);
    for _ in 0..upval_len {
        let in_stack = reader.read_byte()? != 0;
        let index = reader.read_byte()?;
        proto.upvalues.push(UpvalDesc {
            name: None, // filled from the debug section if present
            in_stack,
            index,
        });
    }

    let proto_len = reader.read_int()? as usize;
    proto.protos = Vec::with_capacity(proto_len);
    for _ in 0..proto_len {
        let child = read_function(reader, strings, proto.source)?;
        proto.protos.push(Rc::new(child));
    }

    // Debug info; any of it may be stripped to zero entries.
    let line_len = reader.read_int()? as usize;
    proto.line_info = Vec::with_capacity(line_len);
    for _ in 0..line_len {
        proto.line_info.push(reader.read_int()? as u32);
    }

    let local_len = reader.read_int()? as usize;
    proto.local_vars = Vec::with_capacity(local_len);
    for _ in 0..local_len {
        let name = reader
            .read_string(strings)?
            .ok_or_else(|| LoadError::new("bad local variable name"))?;
        let start_pc = reader.read_int()? as u32;
        let end_pc = reader.read_int()? as u32;
        proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc,
        });
    }

    let upval_name_len = reader.read_int()? as usize;
    for i in 0..upval_name_len {
        let name = reader.read_string(strings)?;
        if i < proto.upvalues.len() {
            proto.upvalues[i].name = name;
        }
    }

    Ok(proto)
}
