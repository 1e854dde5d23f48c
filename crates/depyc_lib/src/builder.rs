//! Rebuilds nested statements from a routine's flat instruction stream.
//!
//! The builder simulates the operand stack and keeps a stack of open
//! blocks. Jumps open and close blocks; snapshots of the operand stack are
//! saved at branch points and restored where the branches merge.

use tracing::{debug, trace, warn};

use crate::DepycError;
use crate::ast::{
    self, BinaryOp, Block, BlockKind, InitState, KeywordKind, Node, ReturnKind, SliceOp, UnaryOp,
};
use crate::marshal::{Code, Value};
use crate::opcode::{Instr, Instructions, Opcode};
use crate::version::{self, Features, PyVersion};

/// Result of rebuilding one routine.
#[derive(Debug, Clone, PartialEq)]
pub struct Build {
    pub nodes: Vec<Node>,
    /// False when an instruction could not be handled; `nodes` is then partial.
    pub clean: bool,
    /// Names stored or deleted through the global scope, in first-seen order.
    pub globals: Vec<String>,
}

/// Rebuilds the statement list of `code`.
///
/// Never fails: errors abort the routine, are logged, and yield a dirty
/// partial result with every open block reattached to its parent.
pub fn build(code: &Code, version: PyVersion) -> Build {
    let mut builder = Builder::new(code, version);
    let clean = match builder.run() {
        Ok(()) => true,
        Err(err) => {
            warn!(routine = %code.name.text(), %err, "routine decompiled partially");
            false
        }
    };
    builder.finish(clean)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Next,
    /// The following instruction belongs to the statement just emitted.
    SkipNext,
}

struct Builder<'a> {
    code: &'a Code,
    version: PyVersion,
    features: &'static Features,
    stack: Vec<Node>,
    history: Vec<Vec<Node>>,
    main: Block,
    blocks: Vec<Block>,
    unpack: u32,
    else_pop: bool,
    need_try: bool,
    globals: Vec<String>,
}

fn binary_op(op: Opcode) -> Option<BinaryOp> {
    use Opcode::*;
    Some(match op {
        BinaryPower => BinaryOp::Power,
        BinaryMultiply => BinaryOp::Multiply,
        BinaryDivide | BinaryTrueDivide => BinaryOp::Divide,
        BinaryFloorDivide => BinaryOp::FloorDivide,
        BinaryModulo => BinaryOp::Modulo,
        BinaryAdd => BinaryOp::Add,
        BinarySubtract => BinaryOp::Subtract,
        BinaryLshift => BinaryOp::LShift,
        BinaryRshift => BinaryOp::RShift,
        BinaryAnd => BinaryOp::And,
        BinaryXor => BinaryOp::Xor,
        BinaryOr => BinaryOp::Or,
        InplaceAdd => BinaryOp::IpAdd,
        InplaceSubtract => BinaryOp::IpSubtract,
        InplaceMultiply => BinaryOp::IpMultiply,
        InplaceDivide | InplaceTrueDivide => BinaryOp::IpDivide,
        InplaceFloorDivide => BinaryOp::IpFloorDivide,
        InplaceModulo => BinaryOp::IpModulo,
        InplacePower => BinaryOp::IpPower,
        InplaceLshift => BinaryOp::IpLShift,
        InplaceRshift => BinaryOp::IpRShift,
        InplaceAnd => BinaryOp::IpAnd,
        InplaceXor => BinaryOp::IpXor,
        InplaceOr => BinaryOp::IpOr,
        _ => return None,
    })
}

fn unary_op(op: Opcode) -> Option<UnaryOp> {
    match op {
        Opcode::UnaryPositive => Some(UnaryOp::Positive),
        Opcode::UnaryNegative => Some(UnaryOp::Negative),
        Opcode::UnaryInvert => Some(UnaryOp::Invert),
        Opcode::UnaryNot => Some(UnaryOp::Not),
        _ => None,
    }
}

fn except_block(end: usize, cond: Node) -> Block {
    let mut blk = Block::cond(BlockKind::Except, end, cond, false);
    blk.init(InitState::Popped);
    blk
}

impl<'a> Builder<'a> {
    fn new(code: &'a Code, version: PyVersion) -> Self {
        Self {
            code,
            version,
            features: version::features(version),
            stack: Vec::new(),
            history: Vec::new(),
            main: Block::inited(BlockKind::Main, 0),
            blocks: Vec::new(),
            unpack: 0,
            else_pop: false,
            need_try: false,
            globals: Vec::new(),
        }
    }

    fn cur(&mut self) -> &mut Block {
        match self.blocks.last_mut() {
            Some(blk) => blk,
            None => &mut self.main,
        }
    }

    fn cur_ref(&self) -> &Block {
        self.blocks.last().unwrap_or(&self.main)
    }

    fn append(&mut self, node: Node) {
        self.cur().append(node);
    }

    /// Pops the innermost open block into its parent.
    fn close_block(&mut self) {
        if let Some(blk) = self.blocks.pop() {
            debug!(kind = ?blk.kind, end = blk.end, "close block");
            self.cur().append(Node::Block(blk));
        }
    }

    fn push_block(&mut self, blk: Block) {
        debug!(kind = ?blk.kind, end = blk.end, init = ?blk.init, "open block");
        self.blocks.push(blk);
    }

    fn push(&mut self, node: Node) {
        self.stack.push(node);
    }

    fn pop(&mut self) -> Node {
        self.stack.pop().unwrap_or(Node::Invalid)
    }

    fn top(&self) -> Node {
        self.stack.last().cloned().unwrap_or(Node::Invalid)
    }

    /// Pops `n` values, returned in push order.
    fn pop_n(&mut self, n: u32) -> Vec<Node> {
        let mut out: Vec<Node> = (0..n).map(|_| self.pop()).collect();
        out.reverse();
        out
    }

    fn save(&mut self) {
        self.history.push(self.stack.clone());
    }

    fn restore(&mut self) {
        if let Some(stack) = self.history.pop() {
            self.stack = stack;
        }
    }

    fn mark_global(&mut self, name: &str) {
        if !self.globals.iter().any(|g| g == name) {
            self.globals.push(name.to_string());
        }
    }

    fn run(&mut self) -> Result<(), DepycError> {
        let mut instrs = Instructions::new(&self.code.code, version::opcode_table(self.version));
        while let Some(instr) = instrs.next() {
            let instr = instr?;
            let op = instr.opcode.ok_or(DepycError::UnsupportedOpcode {
                name: instr.name(),
                raw: instr.raw,
                offset: instr.offset,
            })?;
            trace!(
                offset = instr.offset,
                op = op.name(),
                operand = instr.operand,
                depth = self.stack.len(),
                block = ?self.cur_ref().kind,
                "step"
            );

            let mut pos = instr.next;
            self.settle_pending(op, pos);
            if self.step(op, &instr)? == Flow::SkipNext {
                if let Some(skipped) = instrs.next() {
                    pos = skipped?.next;
                }
            }

            let cur = self.cur_ref();
            self.else_pop =
                matches!(cur.kind, BlockKind::Else | BlockKind::If | BlockKind::Elif)
                    && cur.end == pos;
        }
        Ok(())
    }

    /// Materializes a pending try block, or closes blocks whose extent ended.
    fn settle_pending(&mut self, op: Opcode, pos: usize) {
        use Opcode::*;
        if self.need_try && op != SetupExcept {
            self.need_try = false;
            self.save();
            let end = self.cur_ref().end;
            self.push_block(Block::inited(BlockKind::Try, end));
        } else if self.else_pop
            && !matches!(
                op,
                JumpForward
                    | JumpIfFalse
                    | JumpIfTrue
                    | JumpIfFalseOrPop
                    | JumpIfTrueOrPop
                    | PopJumpIfFalse
                    | PopJumpIfTrue
                    | PopBlock
            )
        {
            self.else_pop = false;
            while let Some(prev) = self.blocks.last() {
                if prev.end >= pos {
                    break;
                }
                if prev.kind != BlockKind::Container {
                    if prev.end == 0 {
                        break;
                    }
                    self.history.pop();
                }
                self.close_block();
            }
        }
    }

    fn step(&mut self, op: Opcode, instr: &Instr) -> Result<Flow, DepycError> {
        use Opcode::*;

        let operand = instr.operand;
        let pos = instr.next;

        if let Some(bop) = binary_op(op) {
            let right = self.pop();
            let left = self.pop();
            self.push(Node::binary(left, right, bop));
            return Ok(Flow::Next);
        }
        if let Some(uop) = unary_op(op) {
            let arg = self.pop();
            self.push(Node::unary(arg, uop));
            return Ok(Flow::Next);
        }

        match op {
            BinarySubscr => {
                let key = self.pop();
                let name = self.pop();
                self.push(Node::subscr(name, key));
            }
            UnaryConvert => {
                let name = self.pop();
                self.push(Node::Convert(Box::new(name)));
            }
            BreakLoop => self.append(Node::Keyword(KeywordKind::Break)),
            ContinueLoop => self.append(Node::Keyword(KeywordKind::Continue)),
            BuildClass => {
                let code = self.pop();
                let bases = self.pop();
                let name = self.pop();
                self.push(Node::Class {
                    code: Box::new(code),
                    bases: Box::new(bases),
                    name: Box::new(name),
                });
            }
            BuildList => {
                let items = self.pop_n(operand);
                self.push(Node::List(items));
            }
            BuildTuple => {
                let items = self.pop_n(operand);
                self.push(Node::Tuple(items));
            }
            BuildMap => self.push(Node::Map(Vec::new())),
            StoreMap => {
                let key = self.pop();
                let value = self.pop();
                match self.stack.last_mut() {
                    Some(Node::Map(pairs)) => pairs.push((key, value)),
                    _ => return Err(DepycError::InconsistentState("STORE_MAP without a map")),
                }
            }
            BuildSlice => {
                let step = (operand == 3).then(|| self.pop());
                let end = self.pop();
                let start = self.pop();
                let inner = Node::slice(SliceOp::from_bounds(&start, &end), start, end);
                let node = match step {
                    None => inner,
                    Some(step) if step.is_absent() => Node::slice(SliceOp::Slice1, inner, step),
                    Some(step) => Node::slice(SliceOp::Slice3, inner, step),
                };
                self.push(node);
            }
            CallFunction | CallFunctionVar | CallFunctionKw | CallFunctionVarKw => {
                self.call(op, operand);
            }
            CompareOp => {
                let right = self.pop();
                let left = self.pop();
                self.push(Node::Compare {
                    op: ast::CompareOp::from_operand(operand),
                    left: Box::new(left),
                    right: Box::new(right),
                });
            }
            DeleteAttr => {
                let attr = self.code.name_at(operand)?;
                let obj = self.pop();
                let target = Node::binary(obj, Node::Name(attr), BinaryOp::Attr);
                self.append(Node::Delete(Box::new(target)));
            }
            DeleteGlobal | DeleteName => {
                let name = self.code.name_at(operand)?;
                if op == DeleteGlobal {
                    self.mark_global(&name);
                }
                self.delete_name(name);
            }
            DeleteFast => {
                let name = self.code.varname_at(operand)?;
                self.delete_name(name);
            }
            DeleteDeref => {
                let name = self.code.cellvar_at(operand)?;
                self.delete_name(name);
            }
            DeleteSlice0 | DeleteSlice1 | DeleteSlice2 | DeleteSlice3 => {
                let target = self.slice_subscr(op);
                self.append(Node::Delete(Box::new(target)));
            }
            DeleteSubscr => {
                let key = self.pop();
                let name = self.pop();
                self.append(Node::Delete(Box::new(Node::subscr(name, key))));
            }
            DupTop => {
                let top = self.top();
                self.push(top);
            }
            DupTopTwo => {
                let first = self.pop();
                let second = self.top();
                self.push(first.clone());
                self.push(second);
                self.push(first);
            }
            DupTopx => {
                let start = self.stack.len().saturating_sub(operand as usize);
                let dup = self.stack[start..].to_vec();
                self.stack.extend(dup);
            }
            EndFinally => self.end_finally(pos),
            ExecStmt => {
                let locals = self.pop();
                let globals = self.pop();
                let stmt = self.pop();
                self.append(Node::Exec {
                    stmt: Box::new(stmt),
                    globals: Box::new(globals),
                    locals: Box::new(locals),
                });
            }
            ForIter => {
                let iter = self.pop();
                let (end, comprehension) = match self.blocks.last() {
                    Some(top) if top.kind == BlockKind::While => {
                        let end = top.end;
                        self.blocks.pop();
                        (end, false)
                    }
                    _ => (self.cur_ref().end, true),
                };
                self.push_block(Block::iter(end, iter, comprehension));
                self.push(Node::Absent);
            }
            GetIter | Nop | PopExcept => {}
            ImportName => {
                let name = self.code.name_at(operand)?;
                let fromlist = if self.version.major == 1 {
                    Node::Absent
                } else {
                    let fromlist = self.pop();
                    if self.features.import_level {
                        self.pop();
                    }
                    fromlist
                };
                self.push(Node::Import {
                    name,
                    fromlist: Box::new(fromlist),
                    stores: Vec::new(),
                });
            }
            ImportFrom => {
                let name = self.code.name_at(operand)?;
                self.push(Node::Name(name));
            }
            ImportStar => {
                let import = self.pop();
                self.append(Node::store(import, Node::Absent));
            }
            JumpIfFalse | JumpIfTrue | JumpIfFalseOrPop | JumpIfTrueOrPop | PopJumpIfFalse
            | PopJumpIfTrue => self.cond_jump(op, instr),
            JumpAbsolute => {
                let target = operand as usize;
                if target < pos {
                    let cur = self.cur_ref();
                    if cur.kind == BlockKind::For && cur.is_comprehension() {
                        self.fold_comprehension();
                        return Ok(Flow::Next);
                    }
                    match cur.kind {
                        BlockKind::Container | BlockKind::Except => {}
                        BlockKind::Else => {
                            self.restore();
                            self.close_block();
                            let cur = self.cur_ref();
                            if cur.kind == BlockKind::Container && !cur.has_finally() {
                                self.close_block();
                            }
                            return Ok(Flow::Next);
                        }
                        _ => {
                            self.append(Node::Keyword(KeywordKind::Continue));
                            return Ok(Flow::Next);
                        }
                    }
                }
                self.leave_block(target, false, pos)?;
            }
            JumpForward => self.leave_block(instr.jump_target(), true, pos)?,
            ListAppend | ListAppendArg => {
                let value = self.pop();
                let list = if op == ListAppend {
                    self.pop()
                } else {
                    self.top()
                };
                let cur = self.cur_ref();
                if cur.kind == BlockKind::For && cur.is_comprehension() {
                    self.push(Node::Comprehension {
                        result: Box::new(value),
                        generators: Vec::new(),
                    });
                } else {
                    self.push(Node::subscr(list, value));
                }
            }
            LoadAttr => {
                if !matches!(self.stack.last(), Some(Node::Import { .. })) {
                    let attr = self.code.name_at(operand)?;
                    let obj = self.pop();
                    self.push(Node::binary(obj, Node::Name(attr), BinaryOp::Attr));
                }
            }
            LoadClosure | LoadDeref => {
                let name = self.code.cellvar_at(operand)?;
                self.push(Node::Name(name));
            }
            LoadConst => {
                let node = match self.code.const_at(operand)? {
                    Value::Tuple(items) if items.is_empty() => Node::Tuple(Vec::new()),
                    Value::None => Node::Absent,
                    value => Node::Object(value.clone()),
                };
                self.push(node);
            }
            LoadFast => {
                let name = self.code.varname_at(operand)?;
                self.push(Node::Name(name));
            }
            LoadGlobal | LoadName => {
                let name = self.code.name_at(operand)?;
                self.push(Node::Name(name));
            }
            LoadLocals => self.push(Node::Locals),
            MakeFunction | MakeClosure => {
                let code = self.pop();
                if op == MakeClosure {
                    self.pop();
                }
                let defaults = self.pop_n(operand & 0xFF);
                let mut kw_defaults = Vec::new();
                for _ in 0..(operand >> 8) & 0xFF {
                    let value = self.pop();
                    let key = self.pop();
                    kw_defaults.insert(0, (key, value));
                }
                self.push(Node::Function {
                    code: Box::new(code),
                    defaults,
                    kw_defaults,
                });
            }
            PopBlock => self.pop_block(pos)?,
            PopTop => self.pop_top(),
            PrintItem => {
                let value = self.pop();
                self.append(Node::print(value, Node::Absent));
            }
            PrintItemTo => {
                let stream = self.pop();
                let value = self.pop();
                self.append(Node::print(value, stream));
            }
            PrintNewline => self.append(Node::print(Node::Absent, Node::Absent)),
            PrintNewlineTo => {
                let stream = self.pop();
                self.append(Node::print(Node::Absent, stream));
            }
            RaiseVarargs => {
                let params = self.pop_n(operand);
                self.append(Node::Raise(params));
                if self.exit_closes_branch() {
                    return Ok(Flow::SkipNext);
                }
            }
            ReturnValue => {
                let value = self.pop();
                self.append(Node::ret(ReturnKind::Return, value));
                self.exit_closes_branch();
            }
            YieldValue => {
                let value = self.pop();
                self.append(Node::ret(ReturnKind::Yield, value));
            }
            RotTwo => {
                let one = self.pop();
                let two = self.pop();
                self.push(one);
                self.push(two);
            }
            RotThree => {
                let one = self.pop();
                let two = self.pop();
                let three = self.pop();
                self.push(one);
                self.push(three);
                self.push(two);
            }
            RotFour => {
                let one = self.pop();
                let two = self.pop();
                let three = self.pop();
                let four = self.pop();
                self.push(one);
                self.push(four);
                self.push(three);
                self.push(two);
            }
            SetupWith => self.push_block(Block::with(instr.jump_target())),
            WithCleanup => {
                if !self.pop().is_absent() {
                    return Err(DepycError::InconsistentState(
                        "WITH_CLEANUP without a pending None",
                    ));
                }
                let cur = self.cur_ref();
                if cur.kind == BlockKind::With && cur.end == instr.offset {
                    self.close_block();
                } else {
                    return Err(DepycError::InconsistentState(
                        "no with block ends at WITH_CLEANUP",
                    ));
                }
            }
            SetupExcept => {
                let target = instr.jump_target();
                if self.cur_ref().kind == BlockKind::Container {
                    self.cur().set_except(target);
                } else {
                    self.push_block(Block::container(0, target));
                }
                self.save();
                self.push_block(Block::inited(BlockKind::Try, target));
                self.need_try = false;
            }
            SetupFinally => {
                self.push_block(Block::container(instr.jump_target(), 0));
                self.need_try = true;
            }
            SetupLoop => {
                self.push_block(Block::cond(
                    BlockKind::While,
                    instr.jump_target(),
                    Node::Absent,
                    false,
                ));
            }
            Slice0 | Slice1 | Slice2 | Slice3 => {
                let node = self.slice_subscr(op);
                self.push(node);
            }
            StoreSlice0 | StoreSlice1 | StoreSlice2 | StoreSlice3 => {
                let dest = self.slice_subscr(op);
                let value = self.pop();
                self.append(Node::store(value, dest));
            }
            StoreAttr => {
                let attr = self.code.name_at(operand)?;
                let obj = self.pop();
                let dest = Node::binary(obj, Node::Name(attr), BinaryOp::Attr);
                if self.unpack > 0 {
                    self.unpack_into(dest)?;
                } else {
                    let value = self.pop();
                    self.append(Node::store(value, dest));
                }
            }
            StoreDeref => {
                let name = self.code.cellvar_at(operand)?;
                self.store_name(name)?;
            }
            StoreFast => {
                let name = self.code.varname_at(operand)?;
                self.store_name(name)?;
            }
            StoreGlobal => {
                let name = self.code.name_at(operand)?;
                self.mark_global(&name);
                self.store_name(name)?;
            }
            StoreName => {
                let name = self.code.name_at(operand)?;
                self.store_name(name)?;
            }
            StoreSubscr => {
                let key = self.pop();
                let dest = self.pop();
                if self.unpack > 0 {
                    self.unpack_into(Node::subscr(dest, key))?;
                } else {
                    let src = self.pop();
                    if matches!(dest, Node::Map(_)) {
                        // The map was duplicated; fill the copy still on the stack.
                        match self.stack.last_mut() {
                            Some(Node::Map(pairs)) => pairs.push((key, src)),
                            _ => {
                                return Err(DepycError::InconsistentState(
                                    "map item store without the map on the stack",
                                ));
                            }
                        }
                    } else {
                        self.append(Node::store(src, Node::subscr(dest, key)));
                    }
                }
            }
            UnpackSequence => {
                self.unpack = operand;
                self.push(Node::Tuple(Vec::new()));
            }
            _ => {
                return Err(DepycError::UnsupportedOpcode {
                    name: op.name(),
                    raw: instr.raw,
                    offset: instr.offset,
                });
            }
        }
        Ok(Flow::Next)
    }

    fn call(&mut self, op: Opcode, operand: u32) {
        let kw = if matches!(op, Opcode::CallFunctionKw | Opcode::CallFunctionVarKw) {
            self.pop()
        } else {
            Node::Absent
        };
        let var = if matches!(op, Opcode::CallFunctionVar | Opcode::CallFunctionVarKw) {
            self.pop()
        } else {
            Node::Absent
        };

        let kw_count = (operand >> 8) & 0xFF;
        let pos_count = operand & 0xFF;
        let mut kwargs = Vec::with_capacity(kw_count as usize);
        for _ in 0..kw_count {
            let value = self.pop();
            let key = self.pop();
            kwargs.insert(0, (key, value));
        }
        let mut args = Vec::with_capacity(pos_count as usize);
        for _ in 0..pos_count {
            let mut param = self.pop();
            if op == Opcode::CallFunction {
                param = self.decorated(param);
            }
            args.insert(0, param);
        }
        let func = self.pop();
        self.push(Node::Call {
            func: Box::new(func),
            args,
            kwargs,
            var: Box::new(var),
            kw: Box::new(kw),
        });
    }

    /// A named function passed straight to a call is a decorator target:
    /// define it first and pass its name.
    fn decorated(&mut self, param: Node) -> Node {
        let fname = match &param {
            Node::Function { code, .. } => match code.as_code() {
                Some(code) if code.name.data != b"<lambda>" => code.name.text(),
                _ => return param,
            },
            _ => return param,
        };
        self.append(Node::store(param, Node::Name(fname.clone())));
        Node::Name(fname)
    }

    fn delete_name(&mut self, name: String) {
        // Temporaries of list comprehensions.
        if name.starts_with("_[") {
            return;
        }
        self.append(Node::Delete(Box::new(Node::Name(name))));
    }

    /// `name[lo:hi]` for the SLICE, STORE_SLICE and DELETE_SLICE families.
    fn slice_subscr(&mut self, op: Opcode) -> Node {
        use Opcode::*;
        let (lower, upper) = match op {
            Slice1 | StoreSlice1 | DeleteSlice1 => (self.pop(), Node::Absent),
            Slice2 | StoreSlice2 | DeleteSlice2 => (Node::Absent, self.pop()),
            Slice3 | StoreSlice3 | DeleteSlice3 => {
                let upper = self.pop();
                (self.pop(), upper)
            }
            _ => (Node::Absent, Node::Absent),
        };
        let name = self.pop();
        let slice = Node::slice(SliceOp::from_bounds(&lower, &upper), lower, upper);
        Node::subscr(name, slice)
    }

    fn store_name(&mut self, name: String) -> Result<(), DepycError> {
        if self.unpack > 0 {
            return self.unpack_into(Node::Name(name));
        }

        let value = self.pop();
        if name.starts_with("_[") {
            return Ok(());
        }
        let import_on_stack = matches!(self.stack.last(), Some(Node::Import { .. }));
        let cur = self.cur_ref();
        let (kind, inited) = (cur.kind, cur.is_inited());

        if kind == BlockKind::For && !inited {
            self.cur().set_index(Node::Name(name));
        } else if import_on_stack {
            if let Some(Node::Import { stores, .. }) = self.stack.last_mut() {
                stores.push((value, Node::Name(name)));
            }
        } else if kind == BlockKind::With && !inited {
            let cur = self.cur();
            cur.set_expr(value);
            cur.set_var(Node::Name(name));
        } else {
            self.append(Node::store(value, Node::Name(name)));
        }
        Ok(())
    }

    /// Adds one destructuring target; the last one emits the assignment.
    fn unpack_into(&mut self, target: Node) -> Result<(), DepycError> {
        match self.stack.last_mut() {
            Some(Node::Tuple(items)) => items.push(target),
            _ => {
                return Err(DepycError::InconsistentState(
                    "unpack target without a pending tuple",
                ));
            }
        }
        self.unpack -= 1;
        if self.unpack == 0 {
            let tuple = self.pop();
            let seq = self.pop();
            let cur = self.cur();
            if cur.kind == BlockKind::For && !cur.is_inited() {
                cur.set_index(tuple);
            } else {
                cur.append(Node::store(seq, tuple));
            }
        }
        Ok(())
    }

    fn cond_jump(&mut self, op: Opcode, instr: &Instr) {
        use Opcode::*;

        let cond = self.top();
        let mut popped = InitState::Uninited;
        if matches!(op, PopJumpIfFalse | PopJumpIfTrue) {
            self.pop();
            popped = InitState::PrePopped;
        }
        self.save();
        if matches!(op, JumpIfFalseOrPop | JumpIfTrueOrPop) {
            self.pop();
            popped = InitState::Popped;
        }

        // Jumping when true means the body runs when false.
        let negative = matches!(op, JumpIfTrue | JumpIfTrueOrPop | PopJumpIfTrue);
        let offs = if matches!(op, JumpIfFalse | JumpIfTrue) {
            instr.jump_target()
        } else {
            instr.operand as usize
        };

        let cur = self.cur_ref();
        let mut blk = if let Node::Compare {
            op: ast::CompareOp::Exception,
            right,
            ..
        } = &cond
        {
            if cur.kind == BlockKind::Except && cur.cond_node().is_some_and(Node::is_absent) {
                self.blocks.pop();
                self.history.pop();
            }
            Block::cond(BlockKind::Except, offs, (**right).clone(), false)
        } else if cur.kind == BlockKind::Else && cur.is_empty() {
            self.blocks.pop();
            self.restore();
            Block::cond(BlockKind::Elif, offs, cond, negative)
        } else if cur.kind == BlockKind::While && cur.is_empty() && !cur.is_inited() {
            // First test of a loop fills in its condition.
            self.blocks.pop();
            self.history.pop();
            Block::cond(BlockKind::While, offs, cond, negative)
        } else if cur.is_empty()
            && cur.end <= offs
            && matches!(cur.kind, BlockKind::If | BlockKind::Elif | BlockKind::While)
        {
            // A second test into an untouched block: short-circuit condition.
            let (kind, end, outer_negative) = (cur.kind, cur.end, cur.negative());
            let first = cur.cond_node().cloned().unwrap_or(Node::Invalid);
            self.blocks.pop();
            if kind == BlockKind::While {
                self.history.pop();
            } else if let Some(latest) = self.history.pop() {
                self.history.pop();
                self.history.push(latest);
            }
            let logic = if (end == offs || end == instr.offset) && !outer_negative {
                BinaryOp::LogAnd
            } else {
                BinaryOp::LogOr
            };
            Block::cond(kind, offs, Node::binary(first, cond, logic), negative)
        } else if cur.kind == BlockKind::For && cur.len() == 1 {
            Block::cond(BlockKind::Elif, offs, cond, negative)
        } else {
            Block::cond(BlockKind::If, offs, cond, negative)
        };

        if popped != InitState::Uninited {
            blk.init(popped);
        }
        self.push_block(blk);
    }

    /// Folds a finished comprehension loop into the accumulator on the stack.
    fn fold_comprehension(&mut self) {
        let Some(blk) = self.blocks.pop() else {
            return;
        };
        if let (Some(Node::Comprehension { generators, .. }), Some(generator)) =
            (self.stack.last_mut(), blk.generator())
        {
            generators.insert(0, generator);
        }
        let n = self.stack.len();
        if n >= 2
            && matches!(self.stack[n - 1], Node::Comprehension { .. })
            && matches!(self.stack[n - 2], Node::List(_))
        {
            self.stack.remove(n - 2);
        }
    }

    /// A jump out of the current block: closes it and opens the `else` or
    /// `except` continuation that the jump skips over.
    fn leave_block(&mut self, target: usize, forward: bool, pos: usize) -> Result<(), DepycError> {
        if self.cur_ref().kind == BlockKind::Container {
            if self.cur_ref().has_except() {
                self.save();
                self.cur().end = target;
                self.push_block(except_block(target, Node::Absent));
            }
            return Ok(());
        }

        if forward {
            let cur = self.cur_ref();
            if (cur.kind == BlockKind::While && !cur.is_inited())
                || (cur.kind == BlockKind::If && cur.is_empty())
            {
                // `while 1:` and friends jump over an always-true test.
                self.push(Node::Object(Value::Int(1)));
                return Ok(());
            }
        }

        self.restore();
        let mut push = true;
        while let Some(prev) = self.blocks.pop() {
            let (kind, init, end) = (prev.kind, prev.init, prev.end);
            debug!(kind = ?kind, end, target, "leave block");
            self.cur().append(Node::Block(prev));
            match kind {
                BlockKind::If | BlockKind::Elif => {
                    if forward && target == pos {
                        break;
                    }
                    if push {
                        self.save();
                    }
                    let else_end = if forward { target } else { self.cur_ref().end };
                    let mut next = Block::new(BlockKind::Else, else_end);
                    if init == InitState::PrePopped {
                        next.init(InitState::PrePopped);
                    }
                    self.push_block(next);
                    break;
                }
                BlockKind::Except => {
                    if forward && target == pos {
                        break;
                    }
                    if push {
                        self.save();
                    }
                    let except_end = if forward { target } else { self.cur_ref().end };
                    self.push_block(except_block(except_end, Node::Absent));
                    break;
                }
                BlockKind::Else => {
                    // Keep unwinding into the parent; only the first else keeps its snapshot.
                    if !push {
                        self.restore();
                    }
                    push = false;
                }
                BlockKind::Try if forward && end < target => {
                    let mut stack = self.history.last().cloned().unwrap_or_default();
                    stack.pop();
                    self.stack = stack;
                    let cur = self.cur_ref();
                    if cur.kind != BlockKind::Container {
                        return Err(DepycError::InconsistentState(
                            "try block outside an exception container",
                        ));
                    }
                    if cur.has_except() {
                        if push {
                            self.save();
                        }
                        self.push_block(except_block(target, Node::Absent));
                    }
                    break;
                }
                _ => break,
            }
        }

        if self.cur_ref().kind == BlockKind::Except {
            self.cur().end = target;
        }
        Ok(())
    }

    fn pop_block(&mut self, pos: usize) -> Result<(), DepycError> {
        let kind = self.cur_ref().kind;
        // Containers close on END_FINALLY, with blocks on WITH_CLEANUP.
        if matches!(kind, BlockKind::Container | BlockKind::Finally | BlockKind::With) {
            return Ok(());
        }
        if matches!(self.cur_ref().nodes.last(), Some(Node::Keyword(_))) {
            self.cur().nodes.pop();
        }
        if matches!(
            kind,
            BlockKind::If
                | BlockKind::Elif
                | BlockKind::Else
                | BlockKind::Try
                | BlockKind::Except
                | BlockKind::Finally
        ) {
            self.restore();
        }

        let tmp = self
            .blocks
            .pop()
            .ok_or(DepycError::InconsistentState("POP_BLOCK with no open block"))?;
        let (mut tmp_kind, tmp_end) = (tmp.kind, tmp.end);
        if !(tmp_kind == BlockKind::Else && tmp.is_empty()) {
            self.append(Node::Block(tmp));
        }

        if tmp_kind == BlockKind::For && tmp_end >= pos {
            self.save();
            self.push_block(Block::inited(BlockKind::Else, tmp_end));
        }

        if self.cur_ref().kind == BlockKind::Try
            && !matches!(tmp_kind, BlockKind::For | BlockKind::While)
        {
            self.restore();
            if let Some(try_blk) = self.blocks.pop() {
                tmp_kind = try_blk.kind;
                self.append(Node::Block(try_blk));
            }
        }

        let cur = self.cur_ref();
        if cur.kind == BlockKind::Container {
            if tmp_kind == BlockKind::Else && !cur.has_finally() {
                self.close_block();
            } else if (tmp_kind == BlockKind::Else && cur.has_finally())
                || (tmp_kind == BlockKind::Try && !cur.has_except())
            {
                self.save();
                self.push_block(Block::inited(BlockKind::Finally, 0));
            }
        }

        let cur = self.cur_ref();
        if cur.kind == BlockKind::For && cur.end == pos {
            self.close_block();
        }
        Ok(())
    }

    fn pop_top(&mut self) {
        let Some(value) = self.stack.pop() else {
            return;
        };
        let cur = self.cur();
        if !cur.is_inited() {
            if cur.kind == BlockKind::With {
                cur.set_expr(value);
            } else {
                cur.init(InitState::Popped);
            }
            return;
        }
        if matches!(
            value,
            Node::Absent | Node::Invalid | Node::Binary { .. } | Node::Name(_)
        ) || value.is_exception_match()
        {
            return;
        }

        let comprehension_item = match &value {
            Node::Call { args, .. } if cur.kind == BlockKind::For && cur.is_comprehension() => {
                args.first().cloned()
            }
            _ => None,
        };
        if !matches!(value, Node::Object(_)) {
            cur.append(value);
        }
        if let Some(item) = comprehension_item {
            self.push(Node::Comprehension {
                result: Box::new(item),
                generators: Vec::new(),
            });
        }
    }

    fn end_finally(&mut self, pos: usize) {
        let mut is_finally = false;
        match self.cur_ref().kind {
            BlockKind::Finally => {
                self.restore();
                self.close_block();
                is_finally = true;
            }
            BlockKind::Except => {
                // A trailing except turns into the try's else clause.
                if let Some(prev) = self.blocks.pop() {
                    let prev_end = prev.end;
                    if !prev.is_empty() {
                        self.append(Node::Block(prev));
                    }
                    let cur = self.cur_ref();
                    if cur.end != pos || cur.has_finally() {
                        self.push_block(Block::inited(BlockKind::Else, prev_end));
                    } else {
                        self.restore();
                    }
                }
            }
            _ => {}
        }

        let cur = self.cur_ref();
        if cur.kind == BlockKind::Container && (!cur.has_finally() || is_finally) {
            self.close_block();
        }
    }

    /// A `return` or `raise` ends an `if`/`else` branch from 2.6 on.
    fn exit_closes_branch(&mut self) -> bool {
        let kind = self.cur_ref().kind;
        if matches!(kind, BlockKind::If | BlockKind::Else)
            && !self.history.is_empty()
            && self.features.flow_exit_closes_branch
        {
            self.restore();
            self.close_block();
            true
        } else {
            false
        }
    }

    fn finish(mut self, clean: bool) -> Build {
        if clean {
            if !self.stack.is_empty() {
                warn!(
                    routine = %self.code.name.text(),
                    depth = self.stack.len(),
                    "operand stack not empty at end of routine"
                );
            }
            if !self.history.is_empty() {
                warn!(
                    routine = %self.code.name.text(),
                    depth = self.history.len(),
                    "stack history not empty at end of routine"
                );
            }
            if !self.blocks.is_empty() {
                warn!(
                    routine = %self.code.name.text(),
                    open = self.blocks.len(),
                    "unclosed blocks at end of routine"
                );
            }
        }
        while !self.blocks.is_empty() {
            self.close_block();
        }
        Build {
            nodes: self.main.nodes,
            clean,
            globals: self.globals,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{PyString, StringKind};
    use crate::opcode::PYTHON_27;
    use pretty_assertions::assert_eq;
    use Opcode::*;

    const PY27: PyVersion = PyVersion::new(2, 7);

    fn asm(ops: &[(Opcode, u16)]) -> Vec<u8> {
        let mut out = Vec::new();
        for &(op, arg) in ops {
            let byte = PYTHON_27
                .iter()
                .find(|(_, o)| *o == op)
                .map(|(b, _)| *b)
                .unwrap();
            out.push(byte);
            if op.has_arg() {
                out.extend(arg.to_le_bytes());
            }
        }
        out
    }

    fn routine(ops: &[(Opcode, u16)], consts: Vec<Value>, names: &[&str]) -> Code {
        Code {
            code: asm(ops),
            consts,
            names: names
                .iter()
                .map(|n| Value::String(PyString::new(StringKind::Interned, *n)))
                .collect(),
            name: PyString::new(StringKind::Interned, "<module>"),
            ..Code::default()
        }
    }

    fn name(n: &str) -> Node {
        Node::name(n)
    }

    fn block(node: &Node) -> &Block {
        match node {
            Node::Block(blk) => blk,
            other => panic!("expected a block, got {other:?}"),
        }
    }

    fn ret_none() -> Node {
        Node::ret(ReturnKind::Return, Node::Absent)
    }

    #[test]
    fn simple_expression_return() {
        let code = routine(
            &[(LoadConst, 0), (LoadConst, 1), (BinaryAdd, 0), (ReturnValue, 0)],
            vec![Value::Int(1), Value::Int(2)],
            &[],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        assert_eq!(
            out.nodes,
            vec![Node::ret(
                ReturnKind::Return,
                Node::binary(
                    Node::Object(Value::Int(1)),
                    Node::Object(Value::Int(2)),
                    BinaryOp::Add
                )
            )]
        );
    }

    #[test]
    fn bare_if_closes_at_its_target() {
        // if a: b = 1
        let code = routine(
            &[
                (LoadName, 0),
                (PopJumpIfFalse, 12),
                (LoadConst, 0),
                (StoreName, 1),
                (LoadConst, 1),
                (ReturnValue, 0),
            ],
            vec![Value::Int(1), Value::None],
            &["a", "b"],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        assert_eq!(out.nodes.len(), 2);
        let if_blk = block(&out.nodes[0]);
        assert_eq!(if_blk.kind, BlockKind::If);
        assert_eq!(if_blk.cond_node(), Some(&name("a")));
        assert_eq!(
            if_blk.nodes,
            vec![Node::store(Node::Object(Value::Int(1)), name("b"))]
        );
        assert_eq!(out.nodes[1], ret_none());
    }

    #[test]
    fn while_with_short_circuit_condition() {
        // while a and b: c()
        let code = routine(
            &[
                (SetupLoop, 23),
                (LoadName, 0),
                (PopJumpIfFalse, 25),
                (LoadName, 1),
                (PopJumpIfFalse, 25),
                (LoadName, 2),
                (CallFunction, 0),
                (PopTop, 0),
                (JumpAbsolute, 3),
                (PopBlock, 0),
                (LoadConst, 0),
                (ReturnValue, 0),
            ],
            vec![Value::None],
            &["a", "b", "c"],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        let loop_blk = block(&out.nodes[0]);
        assert_eq!(loop_blk.kind, BlockKind::While);
        assert_eq!(
            loop_blk.cond_node(),
            Some(&Node::binary(name("a"), name("b"), BinaryOp::LogAnd))
        );
        assert_eq!(loop_blk.len(), 1);
        assert!(matches!(loop_blk.nodes[0], Node::Call { .. }));
    }

    #[test]
    fn for_loop_binds_index_and_drops_continue() {
        // for i in x: print i
        let code = routine(
            &[
                (SetupLoop, 19),
                (LoadName, 0),
                (GetIter, 0),
                (ForIter, 11),
                (StoreName, 1),
                (LoadName, 1),
                (PrintItem, 0),
                (PrintNewline, 0),
                (JumpAbsolute, 7),
                (PopBlock, 0),
                (LoadConst, 0),
                (ReturnValue, 0),
            ],
            vec![Value::None],
            &["x", "i"],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        let for_blk = block(&out.nodes[0]);
        assert_eq!(for_blk.kind, BlockKind::For);
        assert!(!for_blk.is_comprehension());
        let generator = for_blk.generator().unwrap();
        assert_eq!(generator.index, name("i"));
        assert_eq!(generator.iter, name("x"));
        assert_eq!(
            for_blk.nodes,
            vec![
                Node::print(name("i"), Node::Absent),
                Node::print(Node::Absent, Node::Absent),
            ]
        );
        // The loop's empty else is closed as soon as its extent ends.
        let else_blk = block(&out.nodes[1]);
        assert_eq!(else_blk.kind, BlockKind::Else);
        assert!(else_blk.is_empty());
        assert_eq!(out.nodes[2], ret_none());
    }

    #[test]
    fn list_comprehension_folds_into_one_expression() {
        // y = [x for x in z]
        let code = routine(
            &[
                (BuildList, 0),
                (LoadName, 0),
                (GetIter, 0),
                (ForIter, 12),
                (StoreName, 1),
                (LoadName, 1),
                (ListAppendArg, 2),
                (JumpAbsolute, 7),
                (StoreName, 2),
                (LoadConst, 0),
                (ReturnValue, 0),
            ],
            vec![Value::None],
            &["z", "x", "y"],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        assert_eq!(
            out.nodes[0],
            Node::store(
                Node::Comprehension {
                    result: Box::new(name("x")),
                    generators: vec![crate::ast::Generator {
                        index: name("x"),
                        iter: name("z"),
                    }],
                },
                name("y")
            )
        );
    }

    #[test]
    fn unpack_emits_one_store_per_sequence() {
        for n in [1u16, 2, 5] {
            let targets: Vec<String> = (0..n).map(|i| format!("v{i}")).collect();
            let mut names = vec!["seq"];
            names.extend(targets.iter().map(String::as_str));
            let mut ops = vec![(LoadName, 0), (UnpackSequence, n)];
            ops.extend((1..=n).map(|i| (StoreName, i)));
            ops.extend([(LoadConst, 0), (ReturnValue, 0)]);

            let out = build(&routine(&ops, vec![Value::None], &names), PY27);
            assert!(out.clean);
            let expected = Node::Tuple(targets.iter().map(|t| name(t)).collect());
            assert_eq!(out.nodes[0], Node::store(name("seq"), expected), "n = {n}");
            assert_eq!(out.nodes.len(), 2);
        }
    }

    #[test]
    fn except_clause_with_type() {
        // try: a()
        // except E: b()
        let code = routine(
            &[
                (SetupExcept, 11),
                (LoadName, 0),
                (CallFunction, 0),
                (PopTop, 0),
                (PopBlock, 0),
                (JumpForward, 24),
                (DupTop, 0),
                (LoadName, 1),
                (Opcode::CompareOp, 10),
                (PopJumpIfFalse, 37),
                (PopTop, 0),
                (PopTop, 0),
                (PopTop, 0),
                (LoadName, 2),
                (CallFunction, 0),
                (PopTop, 0),
                (JumpForward, 1),
                (EndFinally, 0),
                (LoadConst, 0),
                (ReturnValue, 0),
            ],
            vec![Value::None],
            &["a", "E", "b"],
        );
        let out = build(&code, PY27);
        assert!(out.clean);
        let container = block(&out.nodes[0]);
        assert_eq!(container.kind, BlockKind::Container);
        let kinds: Vec<BlockKind> = container.nodes.iter().map(|n| block(n).kind).collect();
        assert_eq!(kinds, vec![BlockKind::Try, BlockKind::Except]);
        assert_eq!(block(&container.nodes[1]).cond_node(), Some(&name("E")));
    }

    #[test]
    fn globals_are_collected_once() {
        let code = routine(
            &[
                (LoadConst, 0),
                (StoreGlobal, 0),
                (LoadConst, 0),
                (StoreGlobal, 0),
                (DeleteGlobal, 1),
                (LoadConst, 1),
                (ReturnValue, 0),
            ],
            vec![Value::Int(3), Value::None],
            &["g", "h"],
        );
        let out = build(&code, PY27);
        assert_eq!(out.globals, vec!["g".to_string(), "h".to_string()]);
    }

    #[test]
    fn unsupported_opcode_keeps_partial_tree() {
        let mut code = routine(
            &[(LoadName, 0), (PrintItem, 0), (PrintNewline, 0)],
            vec![],
            &["x"],
        );
        code.code.push(200);
        let out = build(&code, PY27);
        assert!(!out.clean);
        assert_eq!(
            out.nodes,
            vec![
                Node::print(name("x"), Node::Absent),
                Node::print(Node::Absent, Node::Absent),
            ]
        );
    }

    #[test]
    fn open_blocks_are_reattached_on_abort() {
        let mut code = routine(&[(SetupLoop, 10)], vec![], &[]);
        code.code.push(200);
        let out = build(&code, PY27);
        assert!(!out.clean);
        assert_eq!(block(&out.nodes[0]).kind, BlockKind::While);
    }

    #[test]
    fn rebuilding_is_deterministic() {
        let code = routine(
            &[
                (LoadName, 0),
                (PopJumpIfFalse, 15),
                (LoadConst, 0),
                (StoreName, 1),
                (JumpForward, 6),
                (LoadConst, 1),
                (StoreName, 1),
                (LoadConst, 2),
                (ReturnValue, 0),
            ],
            vec![Value::Int(1), Value::Int(2), Value::None],
            &["a", "b"],
        );
        let first = build(&code, PY27);
        let second = build(&code, PY27);
        assert_eq!(first, second);
        assert_eq!(block(&first.nodes[1]).kind, BlockKind::Else);
    }

    #[test]
    fn stack_underflow_is_not_fatal() {
        let code = routine(&[(BinaryAdd, 0), (ReturnValue, 0)], vec![], &[]);
        let out = build(&code, PY27);
        assert!(out.clean);
        assert_eq!(
            out.nodes,
            vec![Node::ret(
                ReturnKind::Return,
                Node::binary(Node::Invalid, Node::Invalid, BinaryOp::Add)
            )]
        );
    }
}
