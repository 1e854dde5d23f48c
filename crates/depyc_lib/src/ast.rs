//! Syntax tree shared by the builder and the renderer.

use crate::marshal::{Code, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Attr,
    Power,
    Multiply,
    Divide,
    FloorDivide,
    Modulo,
    Add,
    Subtract,
    LShift,
    RShift,
    And,
    Xor,
    Or,
    LogAnd,
    LogOr,
    IpAdd,
    IpSubtract,
    IpMultiply,
    IpDivide,
    IpModulo,
    IpPower,
    IpLShift,
    IpRShift,
    IpAnd,
    IpXor,
    IpOr,
    IpFloorDivide,
}

impl BinaryOp {
    pub fn text(self) -> &'static str {
        match self {
            BinaryOp::Attr => ".",
            BinaryOp::Power => " ** ",
            BinaryOp::Multiply => " * ",
            BinaryOp::Divide => " / ",
            BinaryOp::FloorDivide => " // ",
            BinaryOp::Modulo => " % ",
            BinaryOp::Add => " + ",
            BinaryOp::Subtract => " - ",
            BinaryOp::LShift => " << ",
            BinaryOp::RShift => " >> ",
            BinaryOp::And => " & ",
            BinaryOp::Xor => " ^ ",
            BinaryOp::Or => " | ",
            BinaryOp::LogAnd => " and ",
            BinaryOp::LogOr => " or ",
            BinaryOp::IpAdd => " += ",
            BinaryOp::IpSubtract => " -= ",
            BinaryOp::IpMultiply => " *= ",
            BinaryOp::IpDivide => " /= ",
            BinaryOp::IpModulo => " %= ",
            BinaryOp::IpPower => " **= ",
            BinaryOp::IpLShift => " <<= ",
            BinaryOp::IpRShift => " >>= ",
            BinaryOp::IpAnd => " &= ",
            BinaryOp::IpXor => " ^= ",
            BinaryOp::IpOr => " |= ",
            BinaryOp::IpFloorDivide => " //= ",
        }
    }

    pub fn is_inplace(self) -> bool {
        matches!(
            self,
            BinaryOp::IpAdd
                | BinaryOp::IpSubtract
                | BinaryOp::IpMultiply
                | BinaryOp::IpDivide
                | BinaryOp::IpModulo
                | BinaryOp::IpPower
                | BinaryOp::IpLShift
                | BinaryOp::IpRShift
                | BinaryOp::IpAnd
                | BinaryOp::IpXor
                | BinaryOp::IpOr
                | BinaryOp::IpFloorDivide
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Positive,
    Negative,
    Invert,
    Not,
}

impl UnaryOp {
    pub fn text(self) -> &'static str {
        match self {
            UnaryOp::Positive => "+",
            UnaryOp::Negative => "-",
            UnaryOp::Invert => "~",
            UnaryOp::Not => "not ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    Greater,
    GreaterEqual,
    In,
    NotIn,
    Is,
    IsNot,
    /// `except` clause type test.
    Exception,
    Bad,
}

impl CompareOp {
    pub fn from_operand(operand: u32) -> Self {
        match operand {
            0 => CompareOp::Less,
            1 => CompareOp::LessEqual,
            2 => CompareOp::Equal,
            3 => CompareOp::NotEqual,
            4 => CompareOp::Greater,
            5 => CompareOp::GreaterEqual,
            6 => CompareOp::In,
            7 => CompareOp::NotIn,
            8 => CompareOp::Is,
            9 => CompareOp::IsNot,
            10 => CompareOp::Exception,
            _ => CompareOp::Bad,
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            CompareOp::Less => " < ",
            CompareOp::LessEqual => " <= ",
            CompareOp::Equal => " == ",
            CompareOp::NotEqual => " != ",
            CompareOp::Greater => " > ",
            CompareOp::GreaterEqual => " >= ",
            CompareOp::In => " in ",
            CompareOp::NotIn => " not in ",
            CompareOp::Is => " is ",
            CompareOp::IsNot => " is not ",
            CompareOp::Exception => " <EXCEPTION MATCH> ",
            CompareOp::Bad => " <BAD> ",
        }
    }
}

/// Which bounds of `lo:hi` are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOp {
    Slice0,
    Slice1,
    Slice2,
    Slice3,
}

impl SliceOp {
    pub fn from_bounds(lower: &Node, upper: &Node) -> Self {
        match (lower.is_absent(), upper.is_absent()) {
            (true, true) => SliceOp::Slice0,
            (false, true) => SliceOp::Slice1,
            (true, false) => SliceOp::Slice2,
            (false, false) => SliceOp::Slice3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    Pass,
    Break,
    Continue,
}

impl KeywordKind {
    pub fn text(self) -> &'static str {
        match self {
            KeywordKind::Pass => "pass",
            KeywordKind::Break => "break",
            KeywordKind::Continue => "continue",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Return,
    Yield,
}

/// One `for index in iter` clause of a comprehension.
#[derive(Debug, Clone, PartialEq)]
pub struct Generator {
    pub index: Node,
    pub iter: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// No value: a `None` constant, an omitted slice bound, a bare `except`.
    Absent,
    /// Popped from an empty operand stack.
    Invalid,
    Pass,
    Locals,
    Object(Value),
    Name(String),
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Compare {
        op: CompareOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Slice {
        op: SliceOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Store {
        src: Box<Node>,
        dest: Box<Node>,
    },
    Return {
        kind: ReturnKind,
        value: Box<Node>,
    },
    Delete(Box<Node>),
    Function {
        code: Box<Node>,
        defaults: Vec<Node>,
        /// `(name, value)` defaults of keyword-only parameters.
        kw_defaults: Vec<(Node, Node)>,
    },
    Class {
        code: Box<Node>,
        bases: Box<Node>,
        name: Box<Node>,
    },
    Call {
        func: Box<Node>,
        args: Vec<Node>,
        kwargs: Vec<(Node, Node)>,
        var: Box<Node>,
        kw: Box<Node>,
    },
    Import {
        name: String,
        fromlist: Box<Node>,
        /// `(imported, bound)` pairs of a `from` import.
        stores: Vec<(Node, Node)>,
    },
    Tuple(Vec<Node>),
    List(Vec<Node>),
    Map(Vec<(Node, Node)>),
    Subscr {
        name: Box<Node>,
        key: Box<Node>,
    },
    Print {
        value: Box<Node>,
        stream: Box<Node>,
    },
    Convert(Box<Node>),
    Keyword(KeywordKind),
    Raise(Vec<Node>),
    Exec {
        stmt: Box<Node>,
        globals: Box<Node>,
        locals: Box<Node>,
    },
    Block(Block),
    Comprehension {
        result: Box<Node>,
        generators: Vec<Generator>,
    },
}

impl Node {
    pub fn name(name: impl Into<String>) -> Self {
        Node::Name(name.into())
    }

    pub fn binary(left: Node, right: Node, op: BinaryOp) -> Self {
        Node::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(operand: Node, op: UnaryOp) -> Self {
        Node::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn slice(op: SliceOp, left: Node, right: Node) -> Self {
        Node::Slice {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn store(src: Node, dest: Node) -> Self {
        Node::Store {
            src: Box::new(src),
            dest: Box::new(dest),
        }
    }

    pub fn subscr(name: Node, key: Node) -> Self {
        Node::Subscr {
            name: Box::new(name),
            key: Box::new(key),
        }
    }

    pub fn ret(kind: ReturnKind, value: Node) -> Self {
        Node::Return {
            kind,
            value: Box::new(value),
        }
    }

    pub fn print(value: Node, stream: Node) -> Self {
        Node::Print {
            value: Box::new(value),
            stream: Box::new(stream),
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Node::Absent)
    }

    pub fn is_exception_match(&self) -> bool {
        matches!(
            self,
            Node::Compare {
                op: CompareOp::Exception,
                ..
            }
        )
    }

    /// Code object carried by a constant node.
    pub fn as_code(&self) -> Option<&Code> {
        match self {
            Node::Object(Value::Code(code)) => Some(code),
            _ => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Node::Name(name) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Main,
    If,
    Else,
    Elif,
    Try,
    Container,
    Except,
    Finally,
    While,
    For,
    With,
}

impl BlockKind {
    pub fn keyword(self) -> &'static str {
        match self {
            BlockKind::Main => "",
            BlockKind::If => "if",
            BlockKind::Else => "else",
            BlockKind::Elif => "elif",
            BlockKind::Try => "try",
            BlockKind::Container => "CONTAINER",
            BlockKind::Except => "except",
            BlockKind::Finally => "finally",
            BlockKind::While => "while",
            BlockKind::For => "for",
            BlockKind::With => "with",
        }
    }
}

/// How much of a block's header has been consumed from the operand stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninited,
    /// The condition was popped by the jump itself.
    PrePopped,
    Popped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockExtra {
    None,
    Cond {
        cond: Box<Node>,
        negative: bool,
    },
    Iter {
        iter: Box<Node>,
        index: Box<Node>,
        comprehension: bool,
    },
    Container {
        except: usize,
        finally: usize,
    },
    With {
        expr: Box<Node>,
        var: Box<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    /// Bytecode offset where the block's extent ends; 0 when unknown.
    pub end: usize,
    pub init: InitState,
    pub nodes: Vec<Node>,
    pub extra: BlockExtra,
}

impl Block {
    pub fn new(kind: BlockKind, end: usize) -> Self {
        Self {
            kind,
            end,
            init: InitState::Uninited,
            nodes: Vec::new(),
            extra: BlockExtra::None,
        }
    }

    pub fn inited(kind: BlockKind, end: usize) -> Self {
        Self {
            init: InitState::Popped,
            ..Self::new(kind, end)
        }
    }

    pub fn cond(kind: BlockKind, end: usize, cond: Node, negative: bool) -> Self {
        Self {
            extra: BlockExtra::Cond {
                cond: Box::new(cond),
                negative,
            },
            ..Self::new(kind, end)
        }
    }

    pub fn iter(end: usize, iter: Node, comprehension: bool) -> Self {
        Self {
            extra: BlockExtra::Iter {
                iter: Box::new(iter),
                index: Box::new(Node::Absent),
                comprehension,
            },
            ..Self::new(BlockKind::For, end)
        }
    }

    pub fn container(finally: usize, except: usize) -> Self {
        Self {
            extra: BlockExtra::Container { except, finally },
            ..Self::inited(BlockKind::Container, 0)
        }
    }

    pub fn with(end: usize) -> Self {
        Self {
            extra: BlockExtra::With {
                expr: Box::new(Node::Absent),
                var: Box::new(Node::Absent),
            },
            ..Self::new(BlockKind::With, end)
        }
    }

    pub fn is_inited(&self) -> bool {
        self.init != InitState::Uninited
    }

    pub fn init(&mut self, state: InitState) {
        self.init = state;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn append(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn cond_node(&self) -> Option<&Node> {
        match &self.extra {
            BlockExtra::Cond { cond, .. } => Some(cond),
            _ => None,
        }
    }

    pub fn negative(&self) -> bool {
        matches!(self.extra, BlockExtra::Cond { negative: true, .. })
    }

    pub fn is_comprehension(&self) -> bool {
        matches!(
            self.extra,
            BlockExtra::Iter {
                comprehension: true,
                ..
            }
        )
    }

    pub fn has_except(&self) -> bool {
        matches!(self.extra, BlockExtra::Container { except, .. } if except != 0)
    }

    pub fn has_finally(&self) -> bool {
        matches!(self.extra, BlockExtra::Container { finally, .. } if finally != 0)
    }

    pub fn set_except(&mut self, offset: usize) {
        if let BlockExtra::Container { except, .. } = &mut self.extra {
            *except = offset;
        }
    }

    /// Binds the loop variable; this completes a `for` header.
    pub fn set_index(&mut self, node: Node) {
        if let BlockExtra::Iter { index, .. } = &mut self.extra {
            **index = node;
        }
        self.init = InitState::Popped;
    }

    /// Sets the context expression; this completes a `with` header.
    pub fn set_expr(&mut self, node: Node) {
        if let BlockExtra::With { expr, .. } = &mut self.extra {
            **expr = node;
        }
        self.init = InitState::Popped;
    }

    pub fn set_var(&mut self, node: Node) {
        if let BlockExtra::With { var, .. } = &mut self.extra {
            **var = node;
        }
    }

    /// The `for` clause this block contributes to a comprehension.
    pub fn generator(&self) -> Option<Generator> {
        match &self.extra {
            BlockExtra::Iter { iter, index, .. } => Some(Generator {
                index: (**index).clone(),
                iter: (**iter).clone(),
            }),
            _ => None,
        }
    }
}
