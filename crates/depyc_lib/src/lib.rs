use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

mod reader;

pub mod ast;
pub mod builder;
pub mod disasm;
pub mod marshal;
pub mod module;
pub mod opcode;
pub mod render;
pub mod version;

pub use module::Module;
pub use version::PyVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Source,
    Disasm,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    /// Name shown in the output header; defaults to the code object's file name.
    pub display_name: Option<String>,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Source,
            display_name: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DepycError {
    #[error("unexpected end of input")]
    Eof,

    #[error("bad magic number: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported marshal tag: {0:#04x}")]
    UnsupportedTag(u8),

    #[error("invalid interned string reference: {0}")]
    InvalidStringRef(u32),

    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("top-level object is not a code object")]
    NotCode,

    #[error("malformed code object field: {0}")]
    BadCodeField(&'static str),

    #[error("truncated instruction at offset {offset}")]
    TruncatedInstruction { offset: usize },

    #[error("unsupported opcode {name} (0x{raw:02x}) at offset {offset}")]
    UnsupportedOpcode {
        name: &'static str,
        raw: u8,
        offset: usize,
    },

    #[error("invalid {0} index: {1}")]
    BadOperand(&'static str, u32),

    #[error("inconsistent decompiler state: {0}")]
    InconsistentState(&'static str),
}

pub fn decompile_with_mode(bytecode: &[u8], mode: DecompileMode) -> Result<String, DepycError> {
    decompile_with_options(
        bytecode,
        DecompileOptions {
            mode,
            display_name: None,
        },
    )
}

pub fn decompile_with_options(
    bytecode: &[u8],
    options: DecompileOptions,
) -> Result<String, DepycError> {
    let module = Module::parse(bytecode)?;
    debug!(
        version = %module.version,
        unicode = module.unicode,
        interns = module.interns.len(),
        "loaded module"
    );

    let name = match options.display_name {
        Some(name) => name,
        None => module.code.filename.text(),
    };
    Ok(match options.mode {
        DecompileMode::Source => render::render_module(&module, &name),
        DecompileMode::Disasm => disasm::dump_module(&module, &name),
    })
}

/// Structural dump and instruction listing of a `.pyc` image.
pub fn disassemble(bytecode: &[u8], display_name: &str) -> Result<String, DepycError> {
    decompile_with_options(
        bytecode,
        DecompileOptions {
            mode: DecompileMode::Disasm,
            display_name: Some(display_name.to_string()),
        },
    )
}

pub fn decompile(bytecode: &[u8]) -> Result<String, DepycError> {
    decompile_with_options(bytecode, DecompileOptions::default())
}
