//! Typed constant pool: the value model, the decoder and a matching encoder.

use std::rc::Rc;

use byteorder::{LittleEndian, WriteBytesExt};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::reader::Reader;
use crate::version::{self, PyVersion, Width};
use crate::DepycError;

mod tag {
    pub const NULL: u8 = b'0';
    pub const NONE: u8 = b'N';
    pub const FALSE: u8 = b'F';
    pub const TRUE: u8 = b'T';
    pub const STOPITER: u8 = b'S';
    pub const ELLIPSIS: u8 = b'.';
    pub const INT: u8 = b'i';
    pub const INT64: u8 = b'I';
    pub const FLOAT: u8 = b'f';
    pub const BINARY_FLOAT: u8 = b'g';
    pub const COMPLEX: u8 = b'x';
    pub const BINARY_COMPLEX: u8 = b'y';
    pub const LONG: u8 = b'l';
    pub const STRING: u8 = b's';
    pub const INTERNED: u8 = b't';
    pub const STRINGREF: u8 = b'R';
    pub const TUPLE: u8 = b'(';
    pub const LIST: u8 = b'[';
    pub const DICT: u8 = b'{';
    pub const CODE: u8 = b'c';
    pub const CODE2: u8 = b'C';
    pub const UNICODE: u8 = b'u';
    pub const SET: u8 = b'<';
    pub const FROZENSET: u8 = b'>';
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringKind {
    Bytes,
    Interned,
    Unicode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PyString {
    pub kind: StringKind,
    pub data: Vec<u8>,
}

impl PyString {
    pub fn new(kind: StringKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    None,
    True,
    False,
    StopIteration,
    Ellipsis,
    Int(i32),
    Int64(i64),
    /// Sign plus little-endian base 2^15 digits.
    Long { negative: bool, digits: Vec<u16> },
    Float(String),
    Complex { real: String, imag: String },
    BinaryFloat(f64),
    BinaryComplex { real: f64, imag: f64 },
    String(PyString),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Set(Vec<Value>),
    FrozenSet(Vec<Value>),
    Code(Rc<Code>),
}

impl Value {
    pub fn as_code(&self) -> Option<&Rc<Code>> {
        match self {
            Value::Code(c) => Some(c),
            _ => None,
        }
    }

    /// Text of a string value, used for name tables.
    pub fn name_text(&self) -> String {
        match self {
            Value::String(s) => s.text(),
            _ => String::new(),
        }
    }

    /// Hex rendering of a long, e.g. `0x1FL`.
    pub fn long_repr(negative: bool, digits: &[u16]) -> String {
        let mut n = BigUint::default();
        for d in digits.iter().rev() {
            n = (n << 15u32) + BigUint::from(*d & 0x7FFF);
        }
        let sign = if negative { "-" } else { "" };
        format!("{sign}0x{n:X}L")
    }
}

pub const CO_VARARGS: u32 = 0x4;
pub const CO_VARKEYWORDS: u32 = 0x8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub arg_count: u32,
    pub kw_only_arg_count: u32,
    pub num_locals: u32,
    pub stack_size: u32,
    pub flags: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Value>,
    pub names: Vec<Value>,
    pub varnames: Option<Vec<Value>>,
    pub free_vars: Option<Vec<Value>>,
    pub cell_vars: Option<Vec<Value>>,
    pub filename: PyString,
    pub name: PyString,
    pub first_line: u32,
    pub lnotab: Vec<u8>,
}

impl Default for Code {
    fn default() -> Self {
        Self {
            arg_count: 0,
            kw_only_arg_count: 0,
            num_locals: 0,
            stack_size: 0,
            flags: 0,
            code: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Some(Vec::new()),
            free_vars: Some(Vec::new()),
            cell_vars: Some(Vec::new()),
            filename: PyString::new(StringKind::Bytes, ""),
            name: PyString::new(StringKind::Bytes, ""),
            first_line: 1,
            lnotab: Vec::new(),
        }
    }
}

impl Code {
    pub fn const_at(&self, idx: u32) -> Result<&Value, DepycError> {
        self.consts
            .get(idx as usize)
            .ok_or(DepycError::BadOperand("const", idx))
    }

    pub fn name_at(&self, idx: u32) -> Result<String, DepycError> {
        self.names
            .get(idx as usize)
            .map(Value::name_text)
            .ok_or(DepycError::BadOperand("name", idx))
    }

    /// Local names; before varnames existed the name table served both roles.
    pub fn varname_at(&self, idx: u32) -> Result<String, DepycError> {
        let table = self.varnames.as_ref().unwrap_or(&self.names);
        table
            .get(idx as usize)
            .map(Value::name_text)
            .ok_or(DepycError::BadOperand("varname", idx))
    }

    /// Cell variables are numbered first, free variables after them.
    pub fn cellvar_at(&self, idx: u32) -> Result<String, DepycError> {
        let empty = Vec::new();
        let cells = self.cell_vars.as_ref().unwrap_or(&empty);
        let frees = self.free_vars.as_ref().unwrap_or(&empty);
        let idx = idx as usize;
        let found = if idx < cells.len() {
            cells.get(idx)
        } else {
            frees.get(idx - cells.len())
        };
        found
            .map(Value::name_text)
            .ok_or(DepycError::BadOperand("cellvar", idx as u32))
    }
}

/// Containers and code objects nested past this depth fail the load.
pub const MAX_DEPTH: usize = 128;

/// Decoder state shared by one container: the version and the intern table.
pub struct Loader<'a> {
    reader: Reader<'a>,
    version: PyVersion,
    interns: Vec<PyString>,
    depth: usize,
}

impl<'a> Loader<'a> {
    pub(crate) fn new(reader: Reader<'a>, version: PyVersion) -> Self {
        Self {
            reader,
            version,
            interns: Vec::new(),
            depth: 0,
        }
    }

    pub(crate) fn reader(&mut self) -> &mut Reader<'a> {
        &mut self.reader
    }

    pub fn interns(&self) -> &[PyString] {
        &self.interns
    }

    pub fn read_value(&mut self) -> Result<Value, DepycError> {
        if self.depth >= MAX_DEPTH {
            return Err(DepycError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let v = self.read_tagged();
        self.depth -= 1;
        v
    }

    fn read_tagged(&mut self) -> Result<Value, DepycError> {
        let t = self.reader.get_u8()?;
        let v = match t {
            tag::NULL => Value::Null,
            tag::NONE => Value::None,
            tag::FALSE => Value::False,
            tag::TRUE => Value::True,
            tag::STOPITER => Value::StopIteration,
            tag::ELLIPSIS => Value::Ellipsis,
            tag::INT => Value::Int(self.reader.get_i32()?),
            tag::INT64 => Value::Int64(self.reader.get_i64()?),
            tag::FLOAT => Value::Float(self.read_short_text()?),
            tag::COMPLEX => {
                let real = self.read_short_text()?;
                let imag = self.read_short_text()?;
                Value::Complex { real, imag }
            }
            tag::BINARY_FLOAT => Value::BinaryFloat(self.reader.get_f64()?),
            tag::BINARY_COMPLEX => {
                let real = self.reader.get_f64()?;
                let imag = self.reader.get_f64()?;
                Value::BinaryComplex { real, imag }
            }
            tag::LONG => {
                let size = self.reader.get_i32()?;
                let mut digits = Vec::with_capacity(size.unsigned_abs() as usize);
                for _ in 0..size.unsigned_abs() {
                    digits.push(self.reader.get_u16()?);
                }
                Value::Long {
                    negative: size < 0,
                    digits,
                }
            }
            tag::STRING => Value::String(self.read_string(StringKind::Bytes)?),
            tag::UNICODE => Value::String(self.read_string(StringKind::Unicode)?),
            tag::INTERNED => {
                let s = self.read_string(StringKind::Interned)?;
                self.interns.push(s.clone());
                Value::String(s)
            }
            tag::STRINGREF => {
                let idx = self.reader.get_u32()?;
                let s = self
                    .interns
                    .get(idx as usize)
                    .cloned()
                    .ok_or(DepycError::InvalidStringRef(idx))?;
                Value::String(s)
            }
            tag::TUPLE => Value::Tuple(self.read_seq()?),
            tag::LIST => Value::List(self.read_seq()?),
            tag::SET => Value::Set(self.read_seq()?),
            tag::FROZENSET => Value::FrozenSet(self.read_seq()?),
            tag::DICT => {
                let mut pairs = Vec::new();
                loop {
                    let key = self.read_value()?;
                    if key == Value::Null {
                        break;
                    }
                    let value = self.read_value()?;
                    pairs.push((key, value));
                }
                Value::Dict(pairs)
            }
            tag::CODE | tag::CODE2 => Value::Code(Rc::new(self.read_code()?)),
            other => return Err(DepycError::UnsupportedTag(other)),
        };
        Ok(v)
    }

    fn read_short_text(&mut self) -> Result<String, DepycError> {
        let len = self.reader.get_u8()? as usize;
        let bytes = self.reader.get_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_string(&mut self, kind: StringKind) -> Result<PyString, DepycError> {
        let len = self.reader.get_u32()? as usize;
        let data = self.reader.get_bytes(len)?.to_vec();
        Ok(PyString { kind, data })
    }

    fn read_seq(&mut self) -> Result<Vec<Value>, DepycError> {
        let n = self.reader.get_u32()?;
        let mut out = Vec::with_capacity(n.min(1 << 16) as usize);
        for _ in 0..n {
            out.push(self.read_value()?);
        }
        Ok(out)
    }

    fn read_width(&mut self, width: Width) -> Result<u32, DepycError> {
        match width {
            Width::Absent => Ok(0),
            Width::U16 => Ok(self.reader.get_u16()? as u32),
            Width::U32 => self.reader.get_u32(),
        }
    }

    fn read_tuple_field(&mut self, field: &'static str) -> Result<Vec<Value>, DepycError> {
        match self.read_value()? {
            Value::Tuple(items) | Value::List(items) => Ok(items),
            _ => Err(DepycError::BadCodeField(field)),
        }
    }

    fn read_string_field(&mut self, field: &'static str) -> Result<PyString, DepycError> {
        match self.read_value()? {
            Value::String(s) => Ok(s),
            _ => Err(DepycError::BadCodeField(field)),
        }
    }

    fn read_code(&mut self) -> Result<Code, DepycError> {
        let f = version::features(self.version);
        let arg_count = self.read_width(f.count_width)?;
        let kw_only_arg_count = if f.kwonly_count {
            self.reader.get_u32()?
        } else {
            0
        };
        let num_locals = self.read_width(f.count_width)?;
        let stack_size = self.read_width(f.stack_width)?;
        let flags = self.read_width(f.count_width)?;
        let code = self.read_string_field("code")?.data;
        let consts = self.read_tuple_field("consts")?;
        let names = self.read_tuple_field("names")?;
        let varnames = if f.varnames {
            Some(self.read_tuple_field("varnames")?)
        } else {
            None
        };
        let (free_vars, cell_vars) = if f.free_cell_vars {
            let free = self.read_tuple_field("freevars")?;
            let cell = self.read_tuple_field("cellvars")?;
            (Some(free), Some(cell))
        } else {
            (None, None)
        };
        let filename = self.read_string_field("filename")?;
        let name = self.read_string_field("name")?;
        let first_line = self.read_width(f.stack_width)?;
        let lnotab = if f.lnotab {
            self.read_string_field("lnotab")?.data
        } else {
            Vec::new()
        };
        Ok(Code {
            arg_count,
            kw_only_arg_count,
            num_locals,
            stack_size,
            flags,
            code,
            consts,
            names,
            varnames,
            free_vars,
            cell_vars,
            filename,
            name,
            first_line,
            lnotab,
        })
    }
}

/// Decodes a single value from a bare marshal stream.
pub fn load_value(bytes: &[u8], version: PyVersion) -> Result<Value, DepycError> {
    Loader::new(Reader::new(bytes), version).read_value()
}

/// Serializes a value in the marshal layout of `version`.
///
/// Interned strings are always written in full, never as references.
pub fn dump_value(value: &Value, version: PyVersion) -> Vec<u8> {
    let mut out = Vec::new();
    write_value(&mut out, value, version);
    out
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    let _ = out.write_u32::<LittleEndian>(v);
}

fn write_width(out: &mut Vec<u8>, width: Width, v: u32) {
    match width {
        Width::Absent => {}
        Width::U16 => {
            let _ = out.write_u16::<LittleEndian>(v as u16);
        }
        Width::U32 => write_u32(out, v),
    }
}

fn write_short_text(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(255)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn write_string(out: &mut Vec<u8>, s: &PyString) {
    out.push(match s.kind {
        StringKind::Bytes => tag::STRING,
        StringKind::Interned => tag::INTERNED,
        StringKind::Unicode => tag::UNICODE,
    });
    write_u32(out, s.data.len() as u32);
    out.extend_from_slice(&s.data);
}

fn write_seq(out: &mut Vec<u8>, t: u8, items: &[Value], version: PyVersion) {
    out.push(t);
    write_u32(out, items.len() as u32);
    for item in items {
        write_value(out, item, version);
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value, version: PyVersion) {
    match value {
        Value::Null => out.push(tag::NULL),
        Value::None => out.push(tag::NONE),
        Value::True => out.push(tag::TRUE),
        Value::False => out.push(tag::FALSE),
        Value::StopIteration => out.push(tag::STOPITER),
        Value::Ellipsis => out.push(tag::ELLIPSIS),
        Value::Int(v) => {
            out.push(tag::INT);
            let _ = out.write_i32::<LittleEndian>(*v);
        }
        Value::Int64(v) => {
            out.push(tag::INT64);
            let _ = out.write_i64::<LittleEndian>(*v);
        }
        Value::Long { negative, digits } => {
            out.push(tag::LONG);
            let n = digits.len() as i32;
            let _ = out.write_i32::<LittleEndian>(if *negative { -n } else { n });
            for d in digits {
                let _ = out.write_u16::<LittleEndian>(*d);
            }
        }
        Value::Float(s) => {
            out.push(tag::FLOAT);
            write_short_text(out, s);
        }
        Value::Complex { real, imag } => {
            out.push(tag::COMPLEX);
            write_short_text(out, real);
            write_short_text(out, imag);
        }
        Value::BinaryFloat(v) => {
            out.push(tag::BINARY_FLOAT);
            let _ = out.write_f64::<LittleEndian>(*v);
        }
        Value::BinaryComplex { real, imag } => {
            out.push(tag::BINARY_COMPLEX);
            let _ = out.write_f64::<LittleEndian>(*real);
            let _ = out.write_f64::<LittleEndian>(*imag);
        }
        Value::String(s) => write_string(out, s),
        Value::Tuple(items) => write_seq(out, tag::TUPLE, items, version),
        Value::List(items) => write_seq(out, tag::LIST, items, version),
        Value::Set(items) => write_seq(out, tag::SET, items, version),
        Value::FrozenSet(items) => write_seq(out, tag::FROZENSET, items, version),
        Value::Dict(pairs) => {
            out.push(tag::DICT);
            for (k, v) in pairs {
                write_value(out, k, version);
                write_value(out, v, version);
            }
            out.push(tag::NULL);
        }
        Value::Code(code) => write_code(out, code, version),
    }
}

fn write_code(out: &mut Vec<u8>, code: &Code, version: PyVersion) {
    let f = version::features(version);
    out.push(tag::CODE);
    write_width(out, f.count_width, code.arg_count);
    if f.kwonly_count {
        write_u32(out, code.kw_only_arg_count);
    }
    write_width(out, f.count_width, code.num_locals);
    write_width(out, f.stack_width, code.stack_size);
    write_width(out, f.count_width, code.flags);
    write_string(out, &PyString::new(StringKind::Bytes, code.code.clone()));
    write_seq(out, tag::TUPLE, &code.consts, version);
    write_seq(out, tag::TUPLE, &code.names, version);
    let empty = Vec::new();
    if f.varnames {
        write_seq(out, tag::TUPLE, code.varnames.as_ref().unwrap_or(&empty), version);
    }
    if f.free_cell_vars {
        write_seq(out, tag::TUPLE, code.free_vars.as_ref().unwrap_or(&empty), version);
        write_seq(out, tag::TUPLE, code.cell_vars.as_ref().unwrap_or(&empty), version);
    }
    write_string(out, &code.filename);
    write_string(out, &code.name);
    write_width(out, f.stack_width, code.first_line);
    if f.lnotab {
        write_string(out, &PyString::new(StringKind::Bytes, code.lnotab.clone()));
    }
}
