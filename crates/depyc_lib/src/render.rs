//! Source renderer: turns rebuilt statement trees back into Python text.

use tracing::debug;

use crate::ast::{BinaryOp, Block, BlockExtra, BlockKind, KeywordKind, Node, ReturnKind, SliceOp, UnaryOp};
use crate::builder;
use crate::marshal::{CO_VARARGS, CO_VARKEYWORDS, Code, PyString, StringKind, Value};
use crate::module::Module;
use crate::version::PyVersion;

const INDENT: &str = "    ";

const ATOM: u8 = 20;
const ATTR: u8 = 16;
const UNARY: u8 = 13;
const COMPARE: u8 = 6;
const NOT: u8 = 5;
const LAMBDA: u8 = 1;

/// What kind of routine a body belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Module,
    Function,
    Class,
}

/// Renders a whole module with the `# Source Generated` banner.
pub fn render_module(module: &Module, display_name: &str) -> String {
    let mut renderer = Renderer::new(module.version);
    renderer.out.push_str("# Source Generated with depyc\n");
    renderer.out.push_str(&format!(
        "# File: {} ({})\n\n",
        display_name,
        module.version_label(" Unicode")
    ));
    renderer.routine(&module.code, 0, Scope::Module);
    renderer.finish()
}

pub struct Renderer {
    version: PyVersion,
    out: String,
    /// A `print` line is open and waits for more items or its newline.
    in_print: bool,
}

impl Renderer {
    pub fn new(version: PyVersion) -> Self {
        Self {
            version,
            out: String::new(),
            in_print: false,
        }
    }

    pub fn finish(mut self) -> String {
        self.end_print();
        self.out
    }

    /// Rebuilds and renders one routine's body at `indent`.
    pub fn routine(&mut self, code: &Code, indent: usize, scope: Scope) {
        let built = builder::build(code, self.version);
        debug!(
            routine = %code.name.text(),
            clean = built.clean,
            statements = built.nodes.len(),
            "render routine"
        );

        let mut nodes: &[Node] = &built.nodes;
        if built.clean {
            if let Some((first, rest)) = nodes.split_first() {
                if is_module_binding(first) {
                    nodes = rest;
                }
            }
            if let Some((last, rest)) = nodes.split_last() {
                if is_implicit_return(last) {
                    nodes = rest;
                }
            }
        }

        let mut wrote = false;
        if scope == Scope::Function {
            if let Some(Value::String(doc)) = code.consts.first() {
                if !doc.is_empty() {
                    let text = quote(doc, string_prefix(doc, self.version), true);
                    self.line(indent, &text);
                    wrote = true;
                }
            }
            for name in &built.globals {
                self.line(indent, &format!("global {name}"));
                wrote = true;
            }
        }
        if !self.statements(nodes, indent) && !wrote {
            self.line(indent, "pass");
        }
        if !built.clean {
            self.line(indent, "# WARNING: Decompyle incomplete");
        }
    }

    fn end_print(&mut self) {
        if self.in_print {
            self.out.push_str(",\n");
            self.in_print = false;
        }
    }

    fn line(&mut self, indent: usize, text: &str) {
        self.end_print();
        self.out.push_str(&INDENT.repeat(indent));
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn blank_line(&mut self) {
        self.end_print();
        self.out.push('\n');
    }

    /// Renders `nodes`; returns whether anything visible was written.
    fn statements(&mut self, nodes: &[Node], indent: usize) -> bool {
        let mut wrote = false;
        for node in nodes {
            match node {
                // Every backward jump leaves one of these behind.
                Node::Keyword(KeywordKind::Continue) => continue,
                Node::Block(blk) if blk.kind == BlockKind::Else && blk.is_empty() => continue,
                _ => {}
            }
            self.statement(node, indent);
            wrote = true;
        }
        self.end_print();
        wrote
    }

    fn body(&mut self, nodes: &[Node], indent: usize) {
        if !self.statements(nodes, indent) {
            self.line(indent, "pass");
        }
    }

    fn statement(&mut self, node: &Node, indent: usize) {
        match node {
            Node::Block(blk) => self.block(blk, indent),
            Node::Store { src, dest } => self.store(src, dest, indent),
            Node::Print { value, stream } => self.print(value, stream, indent),
            other => {
                let text = self.expr(other, indent);
                self.line(indent, &text);
            }
        }
    }

    fn block(&mut self, blk: &Block, indent: usize) {
        let keyword = blk.kind.keyword();
        let header = match blk.kind {
            BlockKind::Main | BlockKind::Container => {
                self.statements(&blk.nodes, indent);
                return;
            }
            BlockKind::Else if blk.is_empty() => return,
            BlockKind::If | BlockKind::Elif | BlockKind::While => {
                let cond = blk.cond_node().unwrap_or(&Node::Absent);
                if blk.kind == BlockKind::While && cond.is_absent() {
                    "while 1".to_string()
                } else if blk.negative() {
                    format!("{keyword} not {}", self.operand(cond, NOT, false, indent))
                } else {
                    format!("{keyword} {}", self.expr(cond, indent))
                }
            }
            BlockKind::For => match &blk.extra {
                BlockExtra::Iter { iter, index, .. } => format!(
                    "for {} in {}",
                    self.target(index, indent),
                    self.expr(iter, indent)
                ),
                _ => keyword.to_string(),
            },
            BlockKind::Except => match blk.cond_node() {
                Some(cond) if !cond.is_absent() => format!("except {}", self.expr(cond, indent)),
                _ => keyword.to_string(),
            },
            BlockKind::With => match &blk.extra {
                BlockExtra::With { expr, var } if !var.is_absent() => format!(
                    "with {} as {}",
                    self.expr(expr, indent),
                    self.target(var, indent)
                ),
                BlockExtra::With { expr, .. } => format!("with {}", self.expr(expr, indent)),
                _ => keyword.to_string(),
            },
            BlockKind::Else | BlockKind::Try | BlockKind::Finally => keyword.to_string(),
        };
        self.line(indent, &format!("{header}:"));
        self.body(&blk.nodes, indent + 1);
    }

    fn store(&mut self, src: &Node, dest: &Node, indent: usize) {
        match src {
            Node::Function { .. } => return self.function_def(src, dest, indent),
            Node::Class { .. } => return self.class_def(src, dest, indent),
            Node::Import { name, fromlist, .. } => {
                let text = self.import_store(name, fromlist, dest);
                self.line(indent, &text);
                return;
            }
            Node::Binary { op, left, right } if op.is_inplace() => {
                let text = format!(
                    "{}{}{}",
                    self.expr(left, indent),
                    op.text(),
                    self.expr(right, indent)
                );
                self.line(indent, &text);
                return;
            }
            _ => {}
        }

        if let (Some("__doc__"), Node::Object(Value::String(doc))) = (dest.as_name(), src) {
            let text = quote(doc, string_prefix(doc, self.version), true);
            self.line(indent, &text);
            return;
        }

        let text = format!(
            "{} = {}",
            self.target(dest, indent),
            self.expr(src, indent)
        );
        self.line(indent, &text);
    }

    fn import_store(&self, name: &str, fromlist: &Node, dest: &Node) -> String {
        if dest.is_absent() {
            return format!("from {name} import *");
        }
        match fromlist {
            Node::Object(Value::Tuple(items)) => {
                let names: Vec<String> = items.iter().map(Value::name_text).collect();
                format!("from {name} import {}", names.join(", "))
            }
            Node::Object(Value::String(item)) => format!("from {name} import {}", item.text()),
            _ => {
                let bound = self.expr(dest, 0);
                if bound == name || name.starts_with(&format!("{bound}.")) {
                    format!("import {name}")
                } else {
                    format!("import {name} as {bound}")
                }
            }
        }
    }

    fn print(&mut self, value: &Node, stream: &Node, indent: usize) {
        if value.is_absent() {
            if self.in_print {
                self.out.push('\n');
                self.in_print = false;
            } else if stream.is_absent() {
                self.line(indent, "print");
            } else {
                let text = format!("print >>{}", self.expr(stream, indent));
                self.line(indent, &text);
            }
            return;
        }

        let value = self.expr(value, indent);
        if self.in_print {
            self.out.push_str(&format!(", {value}"));
            return;
        }
        let pad = INDENT.repeat(indent);
        if stream.is_absent() {
            self.out.push_str(&format!("{pad}print {value}"));
        } else {
            let stream = self.expr(stream, indent);
            self.out.push_str(&format!("{pad}print >>{stream}, {value}"));
        }
        self.in_print = true;
    }

    fn function_def(&mut self, func: &Node, dest: &Node, indent: usize) {
        let Node::Function {
            code,
            defaults,
            kw_defaults,
        } = func
        else {
            return;
        };
        let name = self.expr(dest, indent);
        let Some(code) = code.as_code() else {
            let text = format!("{name} = {}", self.expr(func, indent));
            self.line(indent, &text);
            return;
        };

        let params = self.params(code, defaults, kw_defaults, indent);
        self.blank_line();
        if code.name.data == b"<lambda>" {
            let text = format!("{name} = {}", self.lambda(code, &params, indent));
            self.line(indent, &text);
            return;
        }
        self.line(indent, &format!("def {name}({params}):"));
        self.routine(code, indent + 1, Scope::Function);
    }

    fn class_def(&mut self, class: &Node, dest: &Node, indent: usize) {
        let Node::Class { code, bases, .. } = class else {
            return;
        };
        let bases = match &**bases {
            Node::Tuple(items) if !items.is_empty() => format!("({})", self.join(items, indent)),
            _ => String::new(),
        };
        let name = self.expr(dest, indent);
        self.blank_line();
        self.line(indent, &format!("class {name}{bases}:"));
        match class_code(code) {
            Some(code) => self.routine(code, indent + 1, Scope::Class),
            None => self.line(indent + 1, "pass"),
        }
    }

    /// `a, b = 1, *args, **kwargs` from the code object's signature.
    fn params(
        &self,
        code: &Code,
        defaults: &[Node],
        kw_defaults: &[(Node, Node)],
        indent: usize,
    ) -> String {
        let varname = |idx: usize| {
            code.varname_at(idx as u32)
                .unwrap_or_else(|_| format!("<arg{idx}>"))
        };

        let argc = code.arg_count as usize;
        let first_default = argc.saturating_sub(defaults.len());
        let mut parts = Vec::new();
        for i in 0..argc {
            let name = varname(i);
            if i >= first_default {
                let default = self.expr(&defaults[i - first_default], indent);
                parts.push(format!("{name} = {default}"));
            } else {
                parts.push(name);
            }
        }

        let kwonly = code.kw_only_arg_count as usize;
        let mut next = argc + kwonly;
        if code.flags & CO_VARARGS != 0 {
            parts.push(format!("*{}", varname(next)));
            next += 1;
        } else if kwonly > 0 {
            parts.push("*".to_string());
        }
        for i in argc..argc + kwonly {
            let name = varname(i);
            let default = kw_defaults.iter().find(|(key, _)| match key {
                Node::Object(Value::String(s)) => s.text() == name,
                other => other.as_name() == Some(name.as_str()),
            });
            match default {
                Some((_, value)) => parts.push(format!("{name} = {}", self.expr(value, indent))),
                None => parts.push(name),
            }
        }
        if code.flags & CO_VARKEYWORDS != 0 {
            parts.push(format!("**{}", varname(next)));
        }
        parts.join(", ")
    }

    fn lambda(&self, code: &Code, params: &str, indent: usize) -> String {
        let built = builder::build(code, self.version);
        let body = match built.nodes.first() {
            Some(Node::Return { value, .. }) => self.expr(value, indent),
            Some(other) => self.expr(other, indent),
            None => "None".to_string(),
        };
        if params.is_empty() {
            format!("lambda: {body}")
        } else {
            format!("lambda {params}: {body}")
        }
    }

    /// Assignment and loop targets: tuples print without parentheses.
    fn target(&self, node: &Node, indent: usize) -> String {
        match node {
            Node::Tuple(items) if items.len() == 1 => format!("{},", self.expr(&items[0], indent)),
            Node::Tuple(items) if !items.is_empty() => self.join(items, indent),
            _ => self.expr(node, indent),
        }
    }

    fn join(&self, items: &[Node], indent: usize) -> String {
        items
            .iter()
            .map(|item| self.expr(item, indent))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn operand(&self, node: &Node, parent: u8, paren_equal: bool, indent: usize) -> String {
        let text = self.expr(node, indent);
        let level = level(node);
        if level < parent || (paren_equal && level == parent) {
            format!("({text})")
        } else {
            text
        }
    }

    pub fn expr(&self, node: &Node, indent: usize) -> String {
        match node {
            Node::Absent => "None".to_string(),
            Node::Invalid => "<INVALID>".to_string(),
            Node::Pass => "pass".to_string(),
            Node::Locals => "locals()".to_string(),
            Node::Object(value) => literal(value, self.version),
            Node::Name(name) => name.clone(),
            Node::Binary { op, left, right } => {
                let level = binary_level(*op);
                // `**` groups to the right, everything else to the left.
                let power = *op == BinaryOp::Power;
                format!(
                    "{}{}{}",
                    self.operand(left, level, power, indent),
                    op.text(),
                    self.operand(right, level, !power, indent)
                )
            }
            Node::Unary { op, operand } => {
                format!("{}{}", op.text(), self.operand(operand, level(node), false, indent))
            }
            Node::Compare { op, left, right } => format!(
                "{}{}{}",
                self.operand(left, COMPARE, true, indent),
                op.text(),
                self.operand(right, COMPARE, true, indent)
            ),
            Node::Slice { op, left, right } => match op {
                SliceOp::Slice0 => ":".to_string(),
                SliceOp::Slice1 => format!("{}:", self.expr(left, indent)),
                SliceOp::Slice2 => format!(":{}", self.expr(right, indent)),
                SliceOp::Slice3 => {
                    format!("{}:{}", self.expr(left, indent), self.expr(right, indent))
                }
            },
            Node::Store { src, dest } => {
                format!("{} = {}", self.target(dest, indent), self.expr(src, indent))
            }
            Node::Return { kind, value } => {
                let keyword = match kind {
                    ReturnKind::Return => "return",
                    ReturnKind::Yield => "yield",
                };
                format!("{keyword} {}", self.expr(value, indent))
            }
            Node::Delete(target) => format!("del {}", self.expr(target, indent)),
            Node::Function {
                code,
                defaults,
                kw_defaults,
            } => match code.as_code() {
                Some(code) => {
                    let params = self.params(code, defaults, kw_defaults, indent);
                    self.lambda(code, &params, indent)
                }
                None => "<INVALID>".to_string(),
            },
            Node::Class { name, .. } => self.expr(name, indent),
            Node::Call {
                func,
                args,
                kwargs,
                var,
                kw,
            } => {
                let mut parts: Vec<String> = args.iter().map(|a| self.expr(a, indent)).collect();
                for (key, value) in kwargs {
                    let key = match key {
                        Node::Object(Value::String(s)) => s.text(),
                        other => self.expr(other, indent),
                    };
                    parts.push(format!("{key} = {}", self.expr(value, indent)));
                }
                if !var.is_absent() {
                    parts.push(format!("*{}", self.expr(var, indent)));
                }
                if !kw.is_absent() {
                    parts.push(format!("**{}", self.expr(kw, indent)));
                }
                format!(
                    "{}({})",
                    self.operand(func, ATTR, false, indent),
                    parts.join(", ")
                )
            }
            Node::Import { name, stores, .. } => {
                if stores.is_empty() {
                    return format!("import {name}");
                }
                let items: Vec<String> = stores
                    .iter()
                    .map(|(src, dest)| {
                        let (src, dest) = (self.expr(src, indent), self.expr(dest, indent));
                        if src == dest {
                            src
                        } else {
                            format!("{src} as {dest}")
                        }
                    })
                    .collect();
                format!("from {name} import {}", items.join(", "))
            }
            Node::Tuple(items) => match items.len() {
                1 => format!("({},)", self.expr(&items[0], indent)),
                _ => format!("({})", self.join(items, indent)),
            },
            Node::List(items) => format!("[{}]", self.join(items, indent)),
            Node::Map(pairs) => {
                if pairs.is_empty() {
                    return "{}".to_string();
                }
                let pad = INDENT.repeat(indent + 1);
                let entries: Vec<String> = pairs
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{pad}{}: {}",
                            self.expr(key, indent + 1),
                            self.expr(value, indent + 1)
                        )
                    })
                    .collect();
                format!("{{\n{} }}", entries.join(",\n"))
            }
            Node::Subscr { name, key } => format!(
                "{}[{}]",
                self.operand(name, ATTR, false, indent),
                self.expr(key, indent)
            ),
            Node::Print { value, stream } => {
                let mut text = "print".to_string();
                if !stream.is_absent() {
                    text.push_str(&format!(" >>{}", self.expr(stream, indent)));
                    if !value.is_absent() {
                        text.push(',');
                    }
                }
                if !value.is_absent() {
                    text.push_str(&format!(" {}", self.expr(value, indent)));
                }
                text
            }
            Node::Convert(inner) => format!("`{}`", self.expr(inner, indent)),
            Node::Keyword(keyword) => keyword.text().to_string(),
            Node::Raise(params) if params.is_empty() => "raise".to_string(),
            Node::Raise(params) => format!("raise {}", self.join(params, indent)),
            Node::Exec {
                stmt,
                globals,
                locals,
            } => {
                let mut text = format!("exec {}", self.expr(stmt, indent));
                if !globals.is_absent() {
                    text.push_str(&format!(" in {}", self.expr(globals, indent)));
                    if !locals.is_absent() && locals != globals {
                        text.push_str(&format!(", {}", self.expr(locals, indent)));
                    }
                }
                text
            }
            Node::Block(blk) => format!("<{}>", blk.kind.keyword()),
            Node::Comprehension { result, generators } => {
                let mut text = format!("[ {}", self.expr(result, indent));
                for generator in generators {
                    text.push_str(&format!(
                        " for {} in {}",
                        self.target(&generator.index, indent),
                        self.expr(&generator.iter, indent)
                    ));
                }
                text.push_str(" ]");
                text
            }
        }
    }
}

fn binary_level(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Attr => ATTR,
        BinaryOp::Power => 14,
        BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::FloorDivide | BinaryOp::Modulo => 12,
        BinaryOp::Add | BinaryOp::Subtract => 11,
        BinaryOp::LShift | BinaryOp::RShift => 10,
        BinaryOp::And => 9,
        BinaryOp::Xor => 8,
        BinaryOp::Or => 7,
        BinaryOp::LogAnd => 4,
        BinaryOp::LogOr => 3,
        _ => 2,
    }
}

/// Binding strength; a child weaker than its parent gets parentheses.
fn level(node: &Node) -> u8 {
    match node {
        Node::Binary { op, .. } => binary_level(*op),
        Node::Unary {
            op: UnaryOp::Not, ..
        } => NOT,
        Node::Unary { .. } => UNARY,
        Node::Compare { .. } => COMPARE,
        Node::Function { .. } => LAMBDA,
        Node::Object(value) if is_negative_number(value) => UNARY,
        _ => ATOM,
    }
}

fn is_negative_number(value: &Value) -> bool {
    match value {
        Value::Int(v) => *v < 0,
        Value::Int64(v) => *v < 0,
        Value::Long { negative, .. } => *negative,
        Value::Float(text) => text.starts_with('-'),
        Value::BinaryFloat(v) => v.is_sign_negative(),
        _ => false,
    }
}

/// `__module__ = __name__`, emitted at the top of every class body.
fn is_module_binding(node: &Node) -> bool {
    matches!(
        node,
        Node::Store { src, dest }
            if src.as_name() == Some("__name__") && dest.as_name() == Some("__module__")
    )
}

/// The `return None` / `return locals()` every routine ends with.
fn is_implicit_return(node: &Node) -> bool {
    matches!(
        node,
        Node::Return { kind: ReturnKind::Return, value }
            if matches!(**value, Node::Absent | Node::Locals)
    )
}

/// Class body code, found inside the `Call(Function(code))` that builds it.
fn class_code(node: &Node) -> Option<&Code> {
    match node {
        Node::Call { func, .. } => match &**func {
            Node::Function { code, .. } => code.as_code(),
            _ => None,
        },
        Node::Function { code, .. } => code.as_code(),
        other => other.as_code(),
    }
}

/// `b` for byte strings under 3.x, `u` for unicode under 2.x.
pub fn string_prefix(s: &PyString, version: PyVersion) -> Option<char> {
    match (s.kind, version.major >= 3) {
        (StringKind::Unicode, false) => Some('u'),
        (StringKind::Bytes | StringKind::Interned, true) => Some('b'),
        _ => None,
    }
}

/// Quotes a string literal the way the interpreter would accept it back.
pub fn quote(s: &PyString, prefix: Option<char>, triple: bool) -> String {
    let units: Vec<char> = match s.kind {
        StringKind::Unicode => s.text().chars().collect(),
        StringKind::Bytes | StringKind::Interned => s.data.iter().map(|&b| b as char).collect(),
    };
    let escape_high = s.kind != StringKind::Unicode;

    let has_single = units.contains(&'\'');
    let has_double = units.contains(&'"');
    let mark = if has_single && !has_double { '"' } else { '\'' };

    let mut out = String::new();
    if let Some(prefix) = prefix {
        out.push(prefix);
    }
    let delim = if triple {
        mark.to_string().repeat(3)
    } else {
        mark.to_string()
    };
    out.push_str(&delim);
    for c in units {
        match c {
            '\r' => out.push_str("\\r"),
            '\n' if triple => out.push('\n'),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\\' => out.push_str("\\\\"),
            c if c == mark => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7F => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c if escape_high && (c as u32) >= 0x80 => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push_str(&delim);
    out
}

/// Source text of a constant.
pub fn literal(value: &Value, version: PyVersion) -> String {
    let seq = |items: &[Value]| {
        items
            .iter()
            .map(|item| literal(item, version))
            .collect::<Vec<_>>()
            .join(", ")
    };

    match value {
        Value::Null => "<NULL>".to_string(),
        Value::None => "None".to_string(),
        Value::True => "True".to_string(),
        Value::False => "False".to_string(),
        Value::StopIteration => "StopIteration".to_string(),
        Value::Ellipsis => "Ellipsis".to_string(),
        Value::Int(v) => v.to_string(),
        Value::Int64(v) => v.to_string(),
        Value::Long { negative, digits } => Value::long_repr(*negative, digits),
        Value::Float(text) => text.clone(),
        Value::Complex { real, imag } => format!("({real}+{imag}j)"),
        Value::BinaryFloat(v) => format!("{v:?}"),
        Value::BinaryComplex { real, imag } => format!("({real:?}+{imag:?}j)"),
        Value::String(s) => quote(s, string_prefix(s, version), false),
        Value::Tuple(items) if items.len() == 1 => format!("({},)", seq(items)),
        Value::Tuple(items) => format!("({})", seq(items)),
        Value::List(items) => format!("[{}]", seq(items)),
        Value::Dict(pairs) => {
            let entries: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}: {}", literal(k, version), literal(v, version)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Value::Set(items) => format!("{{{}}}", seq(items)),
        Value::FrozenSet(items) => format!("frozenset({{{}}})", seq(items)),
        Value::Code(code) => format!("<CODE> {}", code.name.text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CompareOp, Generator};
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    const PY27: PyVersion = PyVersion::new(2, 7);

    fn n(name: &str) -> Node {
        Node::name(name)
    }

    fn bin(left: Node, op: BinaryOp, right: Node) -> Node {
        Node::binary(left, right, op)
    }

    fn bytes(text: &str) -> PyString {
        PyString::new(StringKind::Bytes, text)
    }

    fn expr(node: &Node) -> String {
        Renderer::new(PY27).expr(node, 0)
    }

    fn render(nodes: &[Node]) -> String {
        let mut renderer = Renderer::new(PY27);
        renderer.statements(nodes, 0);
        renderer.finish()
    }

    #[test]
    fn parentheses_follow_binding_strength() {
        let cases = [
            (bin(bin(n("a"), BinaryOp::Add, n("b")), BinaryOp::Multiply, n("c")), "(a + b) * c"),
            (bin(n("a"), BinaryOp::Subtract, bin(n("b"), BinaryOp::Subtract, n("c"))), "a - (b - c)"),
            (bin(bin(n("a"), BinaryOp::Subtract, n("b")), BinaryOp::Subtract, n("c")), "a - b - c"),
            (bin(bin(n("a"), BinaryOp::Power, n("b")), BinaryOp::Power, n("c")), "(a ** b) ** c"),
            (bin(n("a"), BinaryOp::Power, bin(n("b"), BinaryOp::Power, n("c"))), "a ** b ** c"),
            (Node::unary(bin(n("a"), BinaryOp::Power, n("b")), UnaryOp::Negative), "-a ** b"),
            (bin(Node::unary(n("a"), UnaryOp::Negative), BinaryOp::Power, n("b")), "(-a) ** b"),
            (Node::unary(bin(n("a"), BinaryOp::LogAnd, n("b")), UnaryOp::Not), "not (a and b)"),
            (bin(bin(n("a"), BinaryOp::Add, n("b")), BinaryOp::Attr, n("c")), "(a + b).c"),
            (bin(bin(n("a"), BinaryOp::Attr, n("b")), BinaryOp::Attr, n("c")), "a.b.c"),
            (bin(bin(n("a"), BinaryOp::LogAnd, n("b")), BinaryOp::LogOr, n("c")), "a and b or c"),
            (bin(Node::Object(Value::Int(-1)), BinaryOp::Power, n("x")), "(-1) ** x"),
        ];
        for (node, text) in cases {
            assert_eq!(expr(&node), text);
        }

        let chained = Node::Compare {
            op: CompareOp::Less,
            left: Box::new(Node::Compare {
                op: CompareOp::Less,
                left: Box::new(n("a")),
                right: Box::new(n("b")),
            }),
            right: Box::new(n("c")),
        };
        assert_eq!(expr(&chained), "(a < b) < c");
    }

    #[test]
    fn calls_and_subscripts() {
        let call = Node::Call {
            func: Box::new(bin(n("os"), BinaryOp::Attr, n("walk"))),
            args: vec![n("top")],
            kwargs: vec![(
                Node::Object(Value::String(bytes("topdown"))),
                Node::Object(Value::False),
            )],
            var: Box::new(n("rest")),
            kw: Box::new(n("opts")),
        };
        assert_eq!(expr(&call), "os.walk(top, topdown = False, *rest, **opts)");

        let sliced = Node::subscr(
            n("s"),
            Node::slice(SliceOp::Slice1, Node::Object(Value::Int(1)), Node::Absent),
        );
        assert_eq!(expr(&sliced), "s[1:]");

        let stepped = Node::slice(
            SliceOp::Slice3,
            Node::slice(SliceOp::Slice0, Node::Absent, Node::Absent),
            Node::Object(Value::Int(2)),
        );
        assert_eq!(expr(&Node::subscr(n("s"), stepped)), "s[::2]");
        assert_eq!(expr(&Node::Convert(Box::new(n("x")))), "`x`");
    }

    #[test]
    fn string_quoting() {
        assert_eq!(quote(&bytes("plain"), None, false), "'plain'");
        assert_eq!(quote(&bytes("it's"), None, false), "\"it's\"");
        assert_eq!(quote(&bytes("say \"hi\""), None, false), "'say \"hi\"'");
        assert_eq!(quote(&bytes("it's \"x\""), None, false), "'it\\'s \"x\"'");
        assert_eq!(quote(&bytes("a\tb\r\n\x01"), None, false), "'a\\tb\\r\\n\\x01'");
        assert_eq!(quote(&bytes("back\\slash"), None, false), "'back\\\\slash'");
        assert_eq!(quote(&bytes("two\nlines"), None, true), "'''two\nlines'''");

        let high = PyString::new(StringKind::Bytes, vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(quote(&high, None, false), "'caf\\xe9'");
        let unicode = PyString::new(StringKind::Unicode, "café");
        assert_eq!(quote(&unicode, Some('u'), false), "u'café'");
    }

    #[test]
    fn string_prefix_depends_on_version() {
        let unicode = PyString::new(StringKind::Unicode, "x");
        let raw = bytes("x");
        assert_eq!(string_prefix(&unicode, PY27), Some('u'));
        assert_eq!(string_prefix(&raw, PY27), None);
        assert_eq!(string_prefix(&unicode, PyVersion::new(3, 2)), None);
        assert_eq!(string_prefix(&raw, PyVersion::new(3, 2)), Some('b'));
    }

    #[test]
    fn constant_literals() {
        let cases = [
            (Value::Tuple(vec![Value::Int(1)]), "(1,)"),
            (Value::Tuple(vec![Value::Int(1), Value::None]), "(1, None)"),
            (Value::Long { negative: false, digits: vec![31] }, "0x1FL"),
            (Value::Complex { real: "1.5".into(), imag: "2".into() }, "(1.5+2j)"),
            (Value::BinaryFloat(0.5), "0.5"),
            (Value::Float("3.25".into()), "3.25"),
            (
                Value::Dict(vec![(Value::String(bytes("k")), Value::Int(7))]),
                "{'k': 7}",
            ),
        ];
        for (value, text) in cases {
            assert_eq!(literal(&value, PY27), text);
        }

        let code = Code {
            name: bytes("helper"),
            ..Code::default()
        };
        assert_eq!(literal(&Value::Code(Rc::new(code)), PY27), "<CODE> helper");
    }

    #[test]
    fn print_items_share_a_line() {
        let nodes = [
            Node::print(n("a"), Node::Absent),
            Node::print(n("b"), Node::Absent),
            Node::print(Node::Absent, Node::Absent),
            Node::print(n("c"), Node::Absent),
        ];
        assert_eq!(render(&nodes), "print a, b\nprint c,\n");

        let to_stream = [
            Node::print(n("x"), n("log")),
            Node::print(Node::Absent, n("log")),
            Node::print(Node::Absent, n("log")),
        ];
        assert_eq!(render(&to_stream), "print >>log, x\nprint >>log\n");
    }

    #[test]
    fn assignments() {
        let nodes = [
            Node::store(n("c"), Node::Tuple(vec![n("a"), n("b")])),
            Node::store(n("c"), Node::Tuple(vec![n("a")])),
            Node::store(
                bin(n("x"), BinaryOp::IpAdd, Node::Object(Value::Int(1))),
                n("x"),
            ),
            Node::store(Node::Object(Value::String(bytes("Docs."))), n("__doc__")),
            Node::Delete(Box::new(Node::subscr(n("d"), n("k")))),
        ];
        assert_eq!(
            render(&nodes),
            "a, b = c\na, = c\nx += 1\n'''Docs.'''\ndel d[k]\n"
        );
    }

    #[test]
    fn import_forms() {
        let import = |name: &str, fromlist: Node| Node::Import {
            name: name.to_string(),
            fromlist: Box::new(fromlist),
            stores: Vec::new(),
        };
        let star = Value::Tuple(vec![Value::String(bytes("*"))]);
        let nodes = [
            Node::store(import("os", Node::Absent), n("os")),
            Node::store(import("os.path", Node::Absent), n("os")),
            Node::store(import("os.path", Node::Absent), n("p")),
            Node::store(import("x", Node::Object(star)), Node::Absent),
            Node::Import {
                name: "y".to_string(),
                fromlist: Box::new(Node::Absent),
                stores: vec![(n("a"), n("a")), (n("b"), n("c"))],
            },
        ];
        assert_eq!(
            render(&nodes),
            "import os\nimport os.path\nimport os.path as p\nfrom x import *\nfrom y import a, b as c\n"
        );
    }

    #[test]
    fn block_headers() {
        let mut if_blk = Block::cond(
            BlockKind::If,
            0,
            bin(n("a"), BinaryOp::LogOr, n("b")),
            true,
        );
        if_blk.append(Node::Keyword(KeywordKind::Continue));
        let empty_else = Block::new(BlockKind::Else, 0);
        let forever = Block::cond(BlockKind::While, 0, Node::Absent, false);
        let mut for_blk = Block::iter(0, n("pairs"), false);
        for_blk.set_index(Node::Tuple(vec![n("k"), n("v")]));
        for_blk.append(Node::Keyword(KeywordKind::Break));
        let mut except = Block::cond(BlockKind::Except, 0, Node::Absent, false);
        except.append(Node::Raise(Vec::new()));
        let mut with_blk = Block::with(0);
        with_blk.set_expr(Node::Call {
            func: Box::new(n("open")),
            args: vec![n("p")],
            kwargs: Vec::new(),
            var: Box::new(Node::Absent),
            kw: Box::new(Node::Absent),
        });
        with_blk.set_var(n("f"));

        let nodes = [
            Node::Block(if_blk),
            Node::Block(empty_else),
            Node::Block(forever),
            Node::Block(for_blk),
            Node::Block(except),
            Node::Block(with_blk),
        ];
        assert_eq!(
            render(&nodes),
            "if not (a or b):\n    pass\n\
             while 1:\n    pass\n\
             for k, v in pairs:\n    break\n\
             except:\n    raise\n\
             with open(p) as f:\n    pass\n"
        );
    }

    #[test]
    fn maps_and_comprehensions() {
        let map = Node::Map(vec![
            (Node::Object(Value::String(bytes("a"))), Node::Object(Value::Int(1))),
            (Node::Object(Value::String(bytes("b"))), n("x")),
        ]);
        assert_eq!(expr(&map), "{\n    'a': 1,\n    'b': x }");
        assert_eq!(expr(&Node::Map(Vec::new())), "{}");

        let comp = Node::Comprehension {
            result: Box::new(bin(n("x"), BinaryOp::Multiply, n("x"))),
            generators: vec![Generator {
                index: n("x"),
                iter: n("xs"),
            }],
        };
        assert_eq!(expr(&comp), "[ x * x for x in xs ]");
    }

    #[test]
    fn function_definition_with_docstring_and_defaults() {
        let code = Code {
            arg_count: 2,
            flags: CO_VARARGS,
            varnames: Some(
                ["x", "y", "rest"]
                    .iter()
                    .map(|v| Value::String(bytes(v)))
                    .collect(),
            ),
            consts: vec![Value::String(bytes("Adds.")), Value::None],
            // LOAD_CONST 1; RETURN_VALUE
            code: vec![100, 1, 0, 83],
            name: bytes("f"),
            ..Code::default()
        };
        let func = Node::Function {
            code: Box::new(Node::Object(Value::Code(Rc::new(code)))),
            defaults: vec![Node::Object(Value::Int(1))],
            kw_defaults: Vec::new(),
        };
        assert_eq!(
            render(&[Node::store(func, n("f"))]),
            "\ndef f(x, y = 1, *rest):\n    '''Adds.'''\n"
        );
    }

    #[test]
    fn lambda_assignment() {
        let code = Code {
            arg_count: 1,
            varnames: Some(vec![Value::String(bytes("v"))]),
            consts: vec![Value::Int(2)],
            // LOAD_FAST 0; LOAD_CONST 0; BINARY_MULTIPLY; RETURN_VALUE
            code: vec![124, 0, 0, 100, 0, 0, 20, 83],
            name: bytes("<lambda>"),
            ..Code::default()
        };
        let func = Node::Function {
            code: Box::new(Node::Object(Value::Code(Rc::new(code)))),
            defaults: Vec::new(),
            kw_defaults: Vec::new(),
        };
        assert_eq!(
            render(&[Node::store(func, n("double"))]),
            "\ndouble = lambda v: v * 2\n"
        );
    }
}
