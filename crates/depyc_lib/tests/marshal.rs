use std::rc::Rc;

use depyc_lib::marshal::{Code, PyString, StringKind, Value, dump_value, load_value};
use depyc_lib::{DepycError, Module, PyVersion, decompile, disassemble};
use pretty_assertions::assert_eq;

const PY27_MAGIC: u32 = 0x0A0D_F303;

fn word(out: &mut Vec<u8>, v: u32) {
    out.extend(v.to_le_bytes());
}

fn text(out: &mut Vec<u8>, tag: u8, s: &[u8]) {
    out.push(tag);
    word(out, s.len() as u32);
    out.extend_from_slice(s);
}

/// A 2.7 image whose names, code name and constant share one interned string.
fn image_with_string_refs() -> Vec<u8> {
    let mut b = Vec::new();
    word(&mut b, PY27_MAGIC);
    word(&mut b, 0);
    b.push(b'c');
    for field in [0, 0, 1, 0x40] {
        word(&mut b, field);
    }
    // LOAD_CONST 0; RETURN_VALUE
    text(&mut b, b's', &[100, 0, 0, 83]);
    b.push(b'(');
    word(&mut b, 1);
    text(&mut b, b't', b"hi");
    b.push(b'(');
    word(&mut b, 1);
    b.push(b'R');
    word(&mut b, 0);
    for _ in 0..3 {
        b.push(b'(');
        word(&mut b, 0);
    }
    text(&mut b, b's', b"r.py");
    b.push(b'R');
    word(&mut b, 0);
    word(&mut b, 1);
    text(&mut b, b's', b"");
    b
}

#[test]
fn string_references_resolve_in_a_module() {
    let bytes = image_with_string_refs();
    let module = Module::parse(&bytes).unwrap();
    assert_eq!(module.interns.len(), 1);
    assert_eq!(module.code.name.text(), "hi");
    assert_eq!(module.code.name_at(0).unwrap(), "hi");
    assert_eq!(module.code.filename.text(), "r.py");

    assert_eq!(
        decompile(&bytes).unwrap(),
        "# Source Generated with depyc\n# File: r.py (Python 2.7)\n\nreturn 'hi'\n"
    );
}

#[test]
fn dangling_reference_fails_the_load() {
    let mut bytes = image_with_string_refs();
    // The names tuple's reference sits right after the consts tuple.
    let at = bytes
        .windows(5)
        .position(|w| w == [b'R', 0, 0, 0, 0])
        .unwrap();
    bytes[at + 1] = 9;
    assert!(matches!(
        decompile(&bytes),
        Err(DepycError::InvalidStringRef(9))
    ));
}

#[test]
fn constant_pool_dump_formats_every_kind() {
    let consts = vec![
        Value::Long {
            negative: true,
            digits: vec![0, 1],
        },
        Value::Complex {
            real: "1.5".to_string(),
            imag: "2".to_string(),
        },
        Value::BinaryFloat(2.5),
        Value::Int64(1 << 40),
        Value::FrozenSet(vec![Value::Int(3)]),
        Value::List(vec![Value::Ellipsis]),
    ];
    let code = Code {
        consts,
        filename: PyString::new(StringKind::Bytes, "k.py"),
        ..Code::default()
    };
    let bytes = Module::new(PyVersion::new(2, 7), false, code)
        .to_bytes()
        .unwrap();
    let text = disassemble(&bytes, "k.pyc").unwrap();
    let expected = "    [Constants]
        -0x8000L
        (1.5+2j)
        2.5
        1099511627776
        {
            3
        }
        [
            Ellipsis
        ]
    [Disassembly]
";
    assert!(text.ends_with(expected), "{text}");
}

#[test]
fn nested_code_survives_encoding() {
    let inner = Code {
        name: PyString::new(StringKind::Interned, "inner"),
        consts: vec![Value::None],
        ..Code::default()
    };
    let outer = Value::Tuple(vec![
        Value::Code(Rc::new(inner)),
        Value::String(PyString::new(StringKind::Unicode, "ü")),
    ]);
    for version in [PyVersion::new(2, 2), PyVersion::new(2, 7), PyVersion::new(3, 2)] {
        let back = load_value(&dump_value(&outer, version), version).unwrap();
        assert_eq!(back, outer, "{version}");
    }
}

#[test]
fn containers_survive_encoding() {
    let key = |t: &str| Value::String(PyString::new(StringKind::Interned, t));
    let value = Value::Dict(vec![
        (
            key("list"),
            Value::List(vec![Value::Int(1), Value::List(vec![Value::None])]),
        ),
        (
            key("set"),
            Value::Set(vec![Value::Int(2), Value::FrozenSet(vec![Value::True])]),
        ),
        (
            key("dict"),
            Value::Dict(vec![(Value::Int(3), Value::Tuple(vec![Value::Ellipsis]))]),
        ),
        (key("empty"), Value::Dict(Vec::new())),
    ]);
    for version in [
        PyVersion::new(1, 0),
        PyVersion::new(1, 5),
        PyVersion::new(2, 2),
        PyVersion::new(2, 7),
        PyVersion::new(3, 2),
    ] {
        let back = load_value(&dump_value(&value, version), version).unwrap();
        assert_eq!(back, value, "{version}");
    }
}

#[test]
fn one_x_code_layouts_survive_encoding() {
    // 1.0 has no counts, varnames or line fields; 1.5 adds all but cells.
    let early = Code {
        code: vec![100, 0, 0, 83],
        consts: vec![Value::Dict(vec![(Value::Int(1), Value::None)])],
        varnames: None,
        free_vars: None,
        cell_vars: None,
        filename: PyString::new(StringKind::Bytes, "old.py"),
        name: PyString::new(StringKind::Bytes, "?"),
        first_line: 0,
        ..Code::default()
    };
    let later = Code {
        arg_count: 1,
        num_locals: 1,
        stack_size: 2,
        flags: 0x3,
        varnames: Some(vec![Value::String(PyString::new(StringKind::Bytes, "a"))]),
        first_line: 7,
        lnotab: vec![0, 1],
        ..early.clone()
    };
    for (code, version) in [(early, PyVersion::new(1, 0)), (later, PyVersion::new(1, 5))] {
        let value = Value::Code(Rc::new(code));
        let back = load_value(&dump_value(&value, version), version).unwrap();
        assert_eq!(back, value, "{version}");
    }
}
