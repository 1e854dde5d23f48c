//! Structural dump of a module's constant tree plus a linear listing of every routine.

use tracing::warn;

use crate::marshal::{Code, Value};
use crate::module::Module;
use crate::opcode::{Instr, Instructions};
use crate::render::{literal, quote, string_prefix};
use crate::version::{self, PyVersion};

const INDENT: &str = "    ";

static FLAG_NAMES: [&str; 19] = [
    "CO_OPTIMIZED",
    "CO_NEWLOCALS",
    "CO_VARARGS",
    "CO_VARKEYWORDS",
    "CO_NESTED",
    "CO_GENERATOR",
    "CO_NOFREE",
    "<0x80>",
    "<0x100>",
    "<0x200>",
    "<0x400>",
    "<0x800>",
    "CO_GENERATOR_ALLOWED",
    "CO_FUTURE_DIVISION",
    "CO_FUTURE_ABSOLUTE_IMPORT",
    "CO_FUTURE_WITH_STATEMENT",
    "CO_FUTURE_PRINT_FUNCTION",
    "CO_FUTURE_UNICODE_LITERALS",
    "CO_FUTURE_BARRY_AS_BDFL",
];

pub fn dump_module(module: &Module, display_name: &str) -> String {
    let mut out = String::new();
    let suffix = if module.version.major < 3 && module.unicode {
        " -U"
    } else {
        ""
    };
    out.push_str(&format!(
        "{} (Python {}{})\n",
        display_name, module.version, suffix
    ));
    let mut dumper = Dumper {
        version: module.version,
        out,
    };
    dumper.code(&module.code, 0);
    dumper.out
}

/// `A | B` for the set bits of a code object's flags.
pub fn flag_names(flags: u32) -> String {
    (0..32)
        .filter(|bit| flags & (1u32 << bit) != 0)
        .map(|bit| match FLAG_NAMES.get(bit) {
            Some(name) => name.to_string(),
            None => format!("<0x{:X}>", 1u32 << bit),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

struct Dumper {
    version: PyVersion,
    out: String,
}

impl Dumper {
    fn line(&mut self, indent: usize, text: &str) {
        self.out.push_str(&INDENT.repeat(indent));
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn code(&mut self, code: &Code, indent: usize) {
        self.line(indent, "[Code]");
        let field = indent + 1;
        self.line(field, &format!("File Name: {}", code.filename.text()));
        self.line(field, &format!("Object Name: {}", code.name.text()));
        self.line(field, &format!("Arg Count: {}", code.arg_count));
        if version::features(self.version).kwonly_count {
            self.line(field, &format!("KW Only Arg Count: {}", code.kw_only_arg_count));
        }
        self.line(field, &format!("Locals: {}", code.num_locals));
        self.line(field, &format!("Stack Size: {}", code.stack_size));
        if code.flags == 0 {
            self.line(field, "Flags: 0x00000000");
        } else {
            self.line(
                field,
                &format!("Flags: 0x{:08X} ({})", code.flags, flag_names(code.flags)),
            );
        }

        self.section(field, "[Names]", Some(code.names.as_slice()));
        self.section(field, "[Var Names]", code.varnames.as_deref());
        self.section(field, "[Free Vars]", code.free_vars.as_deref());
        self.section(field, "[Cell Vars]", code.cell_vars.as_deref());
        self.section(field, "[Constants]", Some(code.consts.as_slice()));

        self.line(field, "[Disassembly]");
        self.listing(code, field + 1);
    }

    fn section(&mut self, indent: usize, title: &str, items: Option<&[Value]>) {
        let Some(items) = items else {
            return;
        };
        self.line(indent, title);
        for item in items {
            self.object(item, indent + 1);
        }
    }

    fn object(&mut self, value: &Value, indent: usize) {
        match value {
            Value::Code(code) => self.code(code, indent),
            Value::String(s) => {
                let text = quote(s, string_prefix(s, self.version), false);
                self.line(indent, &text);
            }
            Value::Tuple(items) => self.sequence(indent, "(", ")", items),
            Value::List(items) => self.sequence(indent, "[", "]", items),
            Value::Set(items) | Value::FrozenSet(items) => self.sequence(indent, "{", "}", items),
            Value::Dict(pairs) => {
                self.line(indent, "{");
                for (key, value) in pairs {
                    self.object(key, indent + 1);
                    self.object(value, indent + 2);
                }
                self.line(indent, "}");
            }
            scalar => {
                let text = literal(scalar, self.version);
                self.line(indent, &text);
            }
        }
    }

    fn sequence(&mut self, indent: usize, open: &str, close: &str, items: &[Value]) {
        self.line(indent, open);
        for item in items {
            self.object(item, indent + 1);
        }
        self.line(indent, close);
    }

    fn listing(&mut self, code: &Code, indent: usize) {
        for instr in Instructions::new(&code.code, version::opcode_table(self.version)) {
            match instr {
                Ok(instr) => {
                    let text = self.instruction(code, &instr);
                    self.line(indent, &text);
                }
                Err(err) => {
                    warn!(routine = %code.name.text(), %err, "disassembly stopped");
                    break;
                }
            }
        }
    }

    fn instruction(&self, code: &Code, instr: &Instr) -> String {
        let Some(op) = instr.opcode.filter(|op| op.has_arg()) else {
            return format!("{:<7} {}", instr.offset, instr.name());
        };

        let n = instr.operand;
        let annotated = |found: Option<String>| match found {
            Some(text) => format!("{n}: {text}"),
            None => format!("{n}: <INVALID>"),
        };
        let operand = if op.is_const_arg() {
            annotated(code.const_at(n).ok().map(|v| literal(v, self.version)))
        } else if op.is_name_arg() {
            annotated(code.name_at(n).ok())
        } else if op.is_varname_arg() {
            annotated(code.varname_at(n).ok())
        } else if op.is_cell_arg() {
            annotated(code.cellvar_at(n).ok())
        } else if op.is_jump_offset_arg() {
            format!("{n} (to {})", instr.jump_target())
        } else {
            n.to_string()
        };
        format!("{:<7} {:<24}{}", instr.offset, instr.name(), operand)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{PyString, StringKind};
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn s(text: &str) -> Value {
        Value::String(PyString::new(StringKind::Interned, text))
    }

    #[test]
    fn flags_are_named_by_bit() {
        assert_eq!(flag_names(0x43), "CO_OPTIMIZED | CO_NEWLOCALS | CO_NOFREE");
        assert_eq!(flag_names(0x2000), "CO_FUTURE_DIVISION");
        assert_eq!(flag_names(0x0008_0080), "<0x80> | <0x80000>");
        assert_eq!(flag_names(0), "");
    }

    #[test]
    fn dumps_header_fields_and_listing() {
        let code = Code {
            stack_size: 1,
            flags: 0x40,
            // LOAD_NAME 0; POP_JUMP_IF_FALSE 12; LOAD_CONST 0; STORE_NAME 1;
            // LOAD_CONST 1; RETURN_VALUE
            code: vec![101, 0, 0, 114, 12, 0, 100, 0, 0, 90, 1, 0, 100, 1, 0, 83],
            consts: vec![Value::Int(1), Value::None],
            names: vec![s("a"), s("b")],
            varnames: Some(Vec::new()),
            free_vars: Some(Vec::new()),
            cell_vars: Some(Vec::new()),
            filename: PyString::new(StringKind::Bytes, "t.py"),
            name: PyString::new(StringKind::Interned, "<module>"),
            ..Code::default()
        };
        let module = Module::new(PyVersion::new(2, 7), false, code);
        let expected = "\
t.pyc (Python 2.7)
[Code]
    File Name: t.py
    Object Name: <module>
    Arg Count: 0
    Locals: 0
    Stack Size: 1
    Flags: 0x00000040 (CO_NOFREE)
    [Names]
        'a'
        'b'
    [Var Names]
    [Free Vars]
    [Cell Vars]
    [Constants]
        1
        None
    [Disassembly]
        0       LOAD_NAME               0: a
        3       POP_JUMP_IF_FALSE       12
        6       LOAD_CONST              0: 1
        9       STORE_NAME              1: b
        12      LOAD_CONST              1: None
        15      RETURN_VALUE
";
        assert_eq!(dump_module(&module, "t.pyc"), expected);
    }

    #[test]
    fn nested_code_and_containers() {
        let inner = Code {
            name: PyString::new(StringKind::Interned, "f"),
            // LOAD_CONST 0; RETURN_VALUE
            code: vec![100, 0, 0, 83],
            consts: vec![Value::None],
            ..Code::default()
        };
        let outer = Code {
            name: PyString::new(StringKind::Interned, "<module>"),
            consts: vec![
                Value::Code(Rc::new(inner)),
                Value::Tuple(vec![Value::Int(1), s("x")]),
                Value::Dict(vec![(s("k"), Value::True)]),
            ],
            // SETUP_LOOP 3; JUMP_ABSOLUTE 0
            code: vec![120, 3, 0, 113, 0, 0],
            ..Code::default()
        };
        let module = Module::new(PyVersion::new(2, 7), true, outer);
        let text = dump_module(&module, "m.pyc");

        assert!(text.starts_with("m.pyc (Python 2.7 -U)\n"));
        assert!(text.contains("        [Code]\n            File Name: \n            Object Name: f\n"));
        assert!(text.contains("        (\n            1\n            'x'\n        )\n"));
        assert!(text.contains("        {\n            'k'\n                True\n        }\n"));
        assert!(text.contains("        0       SETUP_LOOP              3 (to 6)\n"));
        assert!(text.contains("        3       JUMP_ABSOLUTE           0\n"));
    }

    #[test]
    fn out_of_range_operands_and_unknown_bytes() {
        let code = Code {
            // LOAD_CONST 7 (no such constant); byte 0xFF is undefined in 2.7
            code: vec![100, 7, 0, 0xFF],
            ..Code::default()
        };
        let module = Module::new(PyVersion::new(2, 7), false, code);
        let text = dump_module(&module, "x.pyc");
        assert!(text.contains("        0       LOAD_CONST              7: <INVALID>\n"));
        assert!(text.contains("        3       <INVALID>\n"));
    }

    #[test]
    fn three_x_shows_keyword_only_count_and_byte_prefix() {
        let code = Code {
            kw_only_arg_count: 2,
            consts: vec![Value::String(PyString::new(StringKind::Bytes, "raw"))],
            ..Code::default()
        };
        let module = Module::new(PyVersion::new(3, 2), true, code);
        let text = dump_module(&module, "k.pyc");
        assert!(text.starts_with("k.pyc (Python 3.2)\n"));
        assert!(text.contains("    KW Only Arg Count: 2\n"));
        assert!(text.contains("        b'raw'\n"));
    }
}
