//! AST lowering.
//!
//! Walks the tree once per frame and emits [`AsmLine`]s. How a node is emitted
//! depends on where it appears, which is tracked on an explicit state stack:
//!
//! - the context (load or store) decides between `LOAD_*` and `STORE_*`,
//! - the side tells an assignment whether its value is consumed by an
//!   enclosing expression (and must be duplicated before the store),
//! - the call disposition tells a statement-level call to drop its result.
//!
//! Method bodies are lowered into their own frames, named `frame_NNN` in
//! creation order after the main frame.

use ahash::AHashSet;
use indexmap::IndexMap;
use smallvec::{SmallVec, smallvec};

use super::{
    CompileError,
    asm::{AsmFrame, AsmLine, AsmProgram, Operand},
};
use crate::{
    ast::{
        Access, AttribKind, AttributeDecl, BinaryOp, BoolOp, CatchClause, ClassDecl, CompareOp, DataElement, Modifiers, Node,
        NodeKind, Param, SwitchCase, Visibility,
    },
    bytecode::{MAX_BLOCK_DEPTH, Opcode},
};

type Result<T> = std::result::Result<T, CompileError>;

/// Lowers a whole compilation unit.
pub(super) fn lower_program(ast: &Node, main: &str) -> Result<AsmProgram> {
    let (imports, body): (&[Node], &[Node]) = match &ast.kind {
        NodeKind::Program { imports, body } => (imports, body),
        NodeKind::Block { statements } => (&[], statements),
        _ => return Err(CompileError::NotAProgram { line: ast.line }),
    };

    let mut unit = Unit::default();
    unit.frames.insert(main.to_owned(), AsmFrame::default());

    let mut builder = FrameBuilder::new(&mut unit, ast.line);
    for import in imports {
        builder.statement(import)?;
    }
    builder.scoped(body)?;
    if !body.last().is_some_and(Node::is_terminator) {
        builder.op1(Opcode::LoadConst, Operand::Num(0));
        builder.op(Opcode::Return);
    }
    let lines = builder.finish();
    unit.frames.insert(main.to_owned(), AsmFrame { lines });

    tracing::debug!(frames = unit.frames.len(), "lowered program");
    Ok(AsmProgram {
        main: main.to_owned(),
        frames: unit.frames,
    })
}

/// Program-wide lowering state shared by every frame builder.
#[derive(Debug, Default)]
struct Unit {
    frames: IndexMap<String, AsmFrame>,
    frame_counter: u32,
    scope_counter: u32,
}

impl Unit {
    /// Reserves the next frame name so frames are listed in creation order.
    fn reserve_frame(&mut self) -> String {
        self.frame_counter += 1;
        let name = format!("frame_{:03}", self.frame_counter);
        self.frames.insert(name.clone(), AsmFrame::default());
        name
    }

    fn next_scope(&mut self) -> u32 {
        self.scope_counter += 1;
        self.scope_counter
    }
}

// ============================================================================
// Walk state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Context {
    Load,
    Store,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    /// Top of a statement: nothing consumes the value.
    None,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallResult {
    /// The call is a statement; its result is popped.
    Pop,
    /// The result stays on the stack for the enclosing expression.
    Stay,
}

#[derive(Debug, Clone, Copy)]
struct State {
    context: Context,
    side: Side,
    call: CallResult,
}

impl State {
    const STATEMENT: Self = Self {
        context: Context::Load,
        side: Side::None,
        call: CallResult::Pop,
    };

    fn load(side: Side) -> Self {
        Self {
            context: Context::Load,
            side,
            call: CallResult::Stay,
        }
    }

    const STORE: Self = Self {
        context: Context::Store,
        side: Side::Left,
        call: CallResult::Stay,
    };
}

/// An entry of the compile-time block stack.
#[derive(Debug, Clone)]
enum BlockEntry {
    /// A loop or a switch. Switches have no continue target.
    Loop { continue_label: Option<String> },
    Try,
}

#[derive(Debug)]
struct LabelScope {
    id: u32,
    names: AHashSet<String>,
}

// ============================================================================
// Frame builder
// ============================================================================

struct FrameBuilder<'u> {
    unit: &'u mut Unit,
    lines: Vec<AsmLine>,
    line: u32,
    counter: u32,
    states: Vec<State>,
    blocks: Vec<BlockEntry>,
    scopes: Vec<LabelScope>,
}

impl<'u> FrameBuilder<'u> {
    fn new(unit: &'u mut Unit, line: u32) -> Self {
        Self {
            unit,
            lines: Vec::new(),
            line,
            counter: 0,
            states: Vec::new(),
            blocks: Vec::new(),
            scopes: Vec::new(),
        }
    }

    fn finish(self) -> Vec<AsmLine> {
        self.lines
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit(&mut self, opcode: Opcode, operands: SmallVec<[Operand; 3]>) {
        self.lines.push(AsmLine::Code {
            opcode,
            line: self.line,
            operands,
        });
    }

    fn op(&mut self, opcode: Opcode) {
        self.emit(opcode, SmallVec::new());
    }

    fn op1(&mut self, opcode: Opcode, operand: Operand) {
        self.emit(opcode, smallvec![operand]);
    }

    fn op2(&mut self, opcode: Opcode, a: Operand, b: Operand) {
        self.emit(opcode, smallvec![a, b]);
    }

    fn jump(&mut self, opcode: Opcode, label: &str) {
        self.op1(opcode, Operand::Label(label.to_owned()));
    }

    fn label(&mut self, name: &str) {
        self.lines.push(AsmLine::Label(name.to_owned()));
    }

    fn load_id(&mut self, name: &str) {
        self.op1(Opcode::LoadId, Operand::Id(name.to_owned()));
    }

    fn load_str(&mut self, value: &str) {
        self.op1(Opcode::LoadConst, Operand::Str(value.to_owned()));
    }

    fn load_num(&mut self, value: i64) {
        self.op1(Opcode::LoadConst, Operand::Num(value));
    }

    /// Next label stem for a construct, e.g. `while_007`.
    fn fresh(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}_{:03}", self.counter)
    }

    fn count(&self, n: usize, what: &'static str) -> Result<Operand> {
        u16::try_from(n)
            .map(Operand::Imm)
            .map_err(|_| CompileError::TooMany { line: self.line, what })
    }

    // ------------------------------------------------------------------
    // State stack
    // ------------------------------------------------------------------

    fn state(&self) -> State {
        self.states.last().copied().unwrap_or(State::STATEMENT)
    }

    fn with_state(&mut self, state: State, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.states.push(state);
        let result = f(self);
        self.states.pop();
        result
    }

    /// Lowers `node` so that it leaves exactly one value on the stack.
    fn value(&mut self, node: &Node) -> Result<()> {
        self.with_state(State::load(Side::Right), |b| b.expr(node))
    }

    fn operand(&mut self, node: &Node, side: Side) -> Result<()> {
        self.with_state(State::load(side), |b| b.expr(node))
    }

    /// Lowers `node` as an assignment target consuming the top of the stack.
    fn store(&mut self, node: &Node) -> Result<()> {
        self.with_state(State::STORE, |b| b.expr(node))
    }

    fn value_or_null(&mut self, node: Option<&Node>) -> Result<()> {
        match node {
            Some(node) => self.value(node),
            None => {
                self.load_id("null");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Block stack
    // ------------------------------------------------------------------

    fn push_block(&mut self, entry: BlockEntry) -> Result<()> {
        if self.blocks.len() >= MAX_BLOCK_DEPTH {
            return Err(CompileError::BlockDepth { line: self.line });
        }
        self.blocks.push(entry);
        Ok(())
    }

    fn in_block(&mut self, entry: BlockEntry, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        self.push_block(entry)?;
        let result = f(self);
        self.blocks.pop();
        result
    }

    fn at_line(&mut self, node: &Node, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        let saved = self.line;
        if node.line != 0 {
            self.line = node.line;
        }
        let result = f(self);
        self.line = saved;
        result
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Lowers a statement list with its own label scope.
    fn scoped(&mut self, statements: &[Node]) -> Result<()> {
        let mut names = AHashSet::new();
        for statement in statements {
            if let NodeKind::Label { name } = &statement.kind
                && !names.insert(name.clone())
            {
                return Err(CompileError::DuplicateLabel {
                    line: statement.line,
                    label: name.clone(),
                });
            }
        }
        let id = self.unit.next_scope();
        self.scopes.push(LabelScope { id, names });
        let result = statements.iter().try_for_each(|statement| self.statement(statement));
        self.scopes.pop();
        result
    }

    /// Lowers the body of a control-flow construct.
    fn body(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Block { statements } => self.at_line(node, |b| b.scoped(statements)),
            _ => self.scoped(std::slice::from_ref(node)),
        }
    }

    fn statement(&mut self, node: &Node) -> Result<()> {
        self.at_line(node, |b| b.statement_inner(node))
    }

    fn statement_inner(&mut self, node: &Node) -> Result<()> {
        match &node.kind {
            NodeKind::Block { statements } => self.scoped(statements),
            NodeKind::Nop | NodeKind::Null => Ok(()),
            NodeKind::Label { name } => {
                let label = self.user_label(name).ok_or_else(|| CompileError::UndefinedLabel {
                    line: node.line,
                    label: name.clone(),
                })?;
                self.label(&label);
                Ok(())
            }
            NodeKind::Goto { label } => {
                let target = self.user_label(label).ok_or_else(|| CompileError::UndefinedLabel {
                    line: node.line,
                    label: label.clone(),
                })?;
                self.jump(Opcode::JumpAbsolute, &target);
                Ok(())
            }
            NodeKind::If {
                condition,
                then,
                otherwise,
            } => self.if_statement(condition, then, otherwise.as_deref()),
            NodeKind::While {
                condition,
                body,
                otherwise,
            } => self.while_statement(condition, body, otherwise.as_deref()),
            NodeKind::DoWhile { body, condition } => self.do_while_statement(body, condition),
            NodeKind::For {
                init,
                condition,
                step,
                body,
            } => self.for_statement(init.as_deref(), condition.as_deref(), step.as_deref(), body),
            NodeKind::Foreach {
                source,
                key,
                value,
                body,
                otherwise,
            } => self.foreach_statement(source, key.as_deref(), value, body, otherwise.as_deref()),
            NodeKind::Switch { subject, cases } => self.switch_statement(node.line, subject, cases),
            NodeKind::Try { body, catches, finally } => self.try_statement(body, catches, finally.as_deref()),
            NodeKind::Throw { value } => {
                self.value(value)?;
                self.op(Opcode::Throw);
                Ok(())
            }
            NodeKind::Return { value } => {
                self.value_or_null(value.as_deref())?;
                self.op(Opcode::Return);
                Ok(())
            }
            NodeKind::Break | NodeKind::BreakElse => {
                if !self.blocks.iter().any(|b| matches!(b, BlockEntry::Loop { .. })) {
                    return Err(CompileError::BreakOutsideLoop { line: node.line });
                }
                let opcode = if matches!(node.kind, NodeKind::Break) {
                    Opcode::BreakLoop
                } else {
                    Opcode::BreakelseLoop
                };
                self.op(opcode);
                Ok(())
            }
            NodeKind::Continue => {
                let target = self
                    .blocks
                    .iter()
                    .rev()
                    .find_map(|b| match b {
                        BlockEntry::Loop { continue_label } => continue_label.clone(),
                        BlockEntry::Try => None,
                    })
                    .ok_or(CompileError::ContinueOutsideLoop { line: node.line })?;
                self.jump(Opcode::ContinueLoop, &target);
                Ok(())
            }
            NodeKind::Import { class, alias, module } => {
                self.load_str(class);
                self.load_str(module);
                self.op(Opcode::Import);
                self.op1(Opcode::StoreId, Operand::Id(alias.as_ref().unwrap_or(class).clone()));
                Ok(())
            }
            NodeKind::Class(decl) => self.class(node.line, decl, false),
            NodeKind::Interface(decl) => self.class(node.line, decl, true),
            NodeKind::Program { .. } => Err(CompileError::InvalidExpression {
                line: node.line,
                what: "a nested program",
            }),
            _ => {
                self.with_state(State::STATEMENT, |b| b.expr(node))?;
                if !matches!(node.kind, NodeKind::Call { .. } | NodeKind::Assignment { .. }) {
                    self.op(Opcode::PopTop);
                }
                Ok(())
            }
        }
    }

    fn user_label(&self, name: &str) -> Option<String> {
        self.scopes
            .iter()
            .rev()
            .find(|scope| scope.names.contains(name))
            .map(|scope| format!("userlabel_{}_{name}", scope.id))
    }

    fn if_statement(&mut self, condition: &Node, then: &Node, otherwise: Option<&Node>) -> Result<()> {
        let stem = self.fresh("if");
        let else_label = format!("{stem}_else");
        let end_label = format!("{stem}_end");

        self.value(condition)?;
        self.jump(Opcode::JumpIfFalse, &else_label);
        self.op(Opcode::PopTop);
        self.body(then)?;
        self.jump(Opcode::JumpAbsolute, &end_label);
        self.label(&else_label);
        self.op(Opcode::PopTop);
        if let Some(otherwise) = otherwise {
            self.body(otherwise)?;
        }
        self.label(&end_label);
        Ok(())
    }

    /// Emits the `SETUP_LOOP` or `SETUP_ELSE_LOOP` opening a loop.
    fn setup_loop(&mut self, end: &str, otherwise: Option<&str>) {
        match otherwise {
            Some(otherwise) => self.op2(
                Opcode::SetupElseLoop,
                Operand::Label(end.to_owned()),
                Operand::Label(otherwise.to_owned()),
            ),
            None => self.jump(Opcode::SetupLoop, end),
        }
    }

    fn while_statement(&mut self, condition: &Node, body: &Node, otherwise: Option<&Node>) -> Result<()> {
        let head = self.fresh("while");
        let end = format!("{head}_end");
        let pre_end = format!("{head}_pre_end");
        let else_label = format!("{head}_else");
        let pre_else = format!("{head}_pre_else");

        self.setup_loop(&end, otherwise.map(|_| else_label.as_str()));
        self.label(&head);
        self.in_block(
            BlockEntry::Loop {
                continue_label: Some(head.clone()),
            },
            |b| {
                b.value(condition)?;
                if otherwise.is_some() {
                    b.jump(Opcode::JumpIfFirstFalse, &pre_else);
                }
                b.jump(Opcode::JumpIfFalse, &pre_end);
                b.op(Opcode::PopTop);
                b.body(body)?;
                b.jump(Opcode::JumpAbsolute, &head);
                Ok(())
            },
        )?;

        if let Some(otherwise) = otherwise {
            self.label(&pre_else);
            self.op(Opcode::PopTop);
            self.op(Opcode::PopBlock);
            self.label(&else_label);
            self.body(otherwise)?;
            self.jump(Opcode::JumpAbsolute, &end);
        }
        self.label(&pre_end);
        self.op(Opcode::PopTop);
        self.op(Opcode::PopBlock);
        self.label(&end);
        Ok(())
    }

    fn do_while_statement(&mut self, body: &Node, condition: &Node) -> Result<()> {
        let head = self.fresh("do");
        let compare = format!("{head}_cmp");
        let pre_end = format!("{head}_pre_end");
        let end = format!("{head}_end");

        self.jump(Opcode::SetupLoop, &end);
        self.label(&head);
        self.in_block(
            BlockEntry::Loop {
                continue_label: Some(compare.clone()),
            },
            |b| {
                b.body(body)?;
                b.label(&compare);
                b.value(condition)?;
                b.jump(Opcode::JumpIfFalse, &pre_end);
                b.op(Opcode::PopTop);
                b.jump(Opcode::JumpAbsolute, &head);
                Ok(())
            },
        )?;
        self.label(&pre_end);
        self.op(Opcode::PopTop);
        self.op(Opcode::PopBlock);
        self.label(&end);
        Ok(())
    }

    fn for_statement(
        &mut self,
        init: Option<&Node>,
        condition: Option<&Node>,
        step: Option<&Node>,
        body: &Node,
    ) -> Result<()> {
        if let Some(init) = init {
            self.statement(init)?;
        }
        let head = self.fresh("for");
        let step_label = format!("{head}_step");
        let pre_end = format!("{head}_pre_end");
        let end = format!("{head}_end");

        self.jump(Opcode::SetupLoop, &end);
        self.label(&head);
        self.in_block(
            BlockEntry::Loop {
                continue_label: Some(step_label.clone()),
            },
            |b| {
                match condition {
                    Some(condition) => b.value(condition)?,
                    None => b.load_id("true"),
                }
                b.jump(Opcode::JumpIfFalse, &pre_end);
                b.op(Opcode::PopTop);
                b.body(body)?;
                b.label(&step_label);
                if let Some(step) = step {
                    b.statement(step)?;
                }
                b.jump(Opcode::JumpAbsolute, &head);
                Ok(())
            },
        )?;
        self.label(&pre_end);
        self.op(Opcode::PopTop);
        self.op(Opcode::PopBlock);
        self.label(&end);
        Ok(())
    }

    fn foreach_statement(
        &mut self,
        source: &Node,
        key: Option<&str>,
        value: &str,
        body: &Node,
        otherwise: Option<&Node>,
    ) -> Result<()> {
        let head = self.fresh("foreach");
        let end = format!("{head}_end");
        let pre_end = format!("{head}_pre_end");
        let else_label = format!("{head}_else");
        let pre_else = format!("{head}_pre_else");

        self.value(source)?;
        self.op(Opcode::IterReset);
        self.setup_loop(&end, otherwise.map(|_| else_label.as_str()));
        self.label(&head);
        self.in_block(
            BlockEntry::Loop {
                continue_label: Some(head.clone()),
            },
            |b| {
                b.op(Opcode::IterFetch);
                if otherwise.is_some() {
                    b.jump(Opcode::JumpIfFirstFalse, &pre_else);
                }
                b.jump(Opcode::JumpIfFalse, &pre_end);
                b.op(Opcode::PopTop);
                b.op1(Opcode::StoreId, Operand::Id(value.to_owned()));
                match key {
                    Some(key) => b.op1(Opcode::StoreId, Operand::Id(key.to_owned())),
                    None => b.op(Opcode::PopTop),
                }
                b.body(body)?;
                b.jump(Opcode::JumpAbsolute, &head);
                Ok(())
            },
        )?;

        if let Some(otherwise) = otherwise {
            self.label(&pre_else);
            for _ in 0..3 {
                self.op(Opcode::PopTop);
            }
            self.op(Opcode::PopBlock);
            self.label(&else_label);
            self.body(otherwise)?;
            self.jump(Opcode::JumpAbsolute, &end);
        }
        self.label(&pre_end);
        for _ in 0..3 {
            self.op(Opcode::PopTop);
        }
        self.op(Opcode::PopBlock);
        self.label(&end);
        // the iterator
        self.op(Opcode::PopTop);
        Ok(())
    }

    /// Cases are tested in order; a matching case falls through into the
    /// following bodies. The default body is always laid out last, and is also
    /// the target of `breakelse`.
    fn switch_statement(&mut self, line: u32, subject: &Node, cases: &[SwitchCase]) -> Result<()> {
        let mut default = None;
        let mut tests = Vec::with_capacity(cases.len());
        for case in cases {
            match &case.test {
                Some(test) => tests.push((test, case.body.as_slice())),
                None if default.is_some() => return Err(CompileError::DuplicateDefault { line }),
                None => default = Some(case.body.as_slice()),
            }
        }

        let stem = self.fresh("switch");
        let end = format!("{stem}_end");
        let else_label = format!("{stem}_else");
        let default_label = format!("{stem}_default");

        self.value(subject)?;
        self.op2(
            Opcode::SetupElseLoop,
            Operand::Label(end.clone()),
            Operand::Label(else_label.clone()),
        );
        self.in_block(BlockEntry::Loop { continue_label: None }, |b| {
            for (i, (test, body)) in tests.iter().enumerate() {
                let next = format!("{stem}_next_{i}");
                let fallthrough = if i + 1 < tests.len() {
                    format!("{stem}_body_{}", i + 1)
                } else {
                    default_label.clone()
                };
                b.label(&format!("{stem}_case_{i}"));
                b.op(Opcode::DupTop);
                b.value(test)?;
                b.op1(Opcode::CompareOp, Operand::Compare(CompareOp::Eq));
                b.jump(Opcode::JumpIfFalse, &next);
                b.op(Opcode::PopTop);
                b.label(&format!("{stem}_body_{i}"));
                b.scoped(body)?;
                b.jump(Opcode::JumpAbsolute, &fallthrough);
                b.label(&next);
                b.op(Opcode::PopTop);
            }
            b.label(&default_label);
            if let Some(body) = default {
                b.scoped(body)?;
            }
            Ok(())
        })?;
        self.op(Opcode::PopBlock);
        self.jump(Opcode::JumpForward, &end);
        // breakelse lands here with the block already popped; re-enter it and run the default
        self.label(&else_label);
        self.jump(Opcode::SetupLoop, &end);
        self.jump(Opcode::JumpAbsolute, &default_label);
        self.label(&end);
        self.op(Opcode::PopTop);
        Ok(())
    }

    fn try_statement(&mut self, body: &Node, catches: &[CatchClause], finally: Option<&Node>) -> Result<()> {
        let stem = self.fresh("try");
        let catch_label = format!("{stem}_catch");
        let finally_label = format!("{stem}_finally");
        let end_finally = format!("{stem}_end_finally");

        self.emit(
            Opcode::SetupExcept,
            smallvec![
                Operand::Label(catch_label.clone()),
                Operand::Label(finally_label.clone()),
                Operand::Label(end_finally.clone()),
            ],
        );
        self.in_block(BlockEntry::Try, |b| {
            b.body(body)?;
            b.jump(Opcode::JumpForward, &finally_label);

            // The in-flight exception is on the stack at every catch test.
            b.label(&catch_label);
            for (i, clause) in catches.iter().enumerate() {
                let no_match = format!("{stem}_nomatch_{i}");
                if i > 0 {
                    b.op(Opcode::PopTop);
                }
                b.op(Opcode::DupTop);
                b.load_id(&clause.class);
                b.op(Opcode::RotTwo);
                b.op1(Opcode::CompareOp, Operand::Compare(CompareOp::Ex));
                b.jump(Opcode::JumpIfFalse, &no_match);
                b.op(Opcode::PopTop);
                b.op1(Opcode::StoreId, Operand::Id(clause.var.clone()));
                b.body(&clause.body)?;
                b.jump(Opcode::JumpForward, &finally_label);
                b.label(&no_match);
            }
            if !catches.is_empty() {
                b.op(Opcode::PopTop);
            }
            // unmatched: the exception stays on the stack and END_FINALLY rethrows it
            b.jump(Opcode::JumpForward, &finally_label);

            b.label(&finally_label);
            if let Some(finally) = finally {
                b.body(finally)?;
            }
            b.label(&end_finally);
            b.op(Opcode::EndFinally);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Classes
    // ------------------------------------------------------------------

    fn class(&mut self, line: u32, decl: &ClassDecl, interface: bool) -> Result<()> {
        check_class_modifiers(line, decl, interface)?;

        for attr in &decl.attributes {
            self.attribute(attr, interface)?;
            self.load_str(&attr.name);
        }
        self.value_or_null(decl.extends.as_deref())?;
        for iface in &decl.implements {
            self.value(iface)?;
        }
        self.load_num(i64::from(decl.modifiers.bits()));
        self.load_str(&decl.name);
        let attrs = self.count(decl.attributes.len(), "attributes")?;
        let ifaces = self.count(decl.implements.len(), "interfaces")?;
        let opcode = if interface {
            Opcode::BuildInterface
        } else {
            Opcode::BuildClass
        };
        self.op2(opcode, attrs, ifaces);
        self.op1(Opcode::StoreId, Operand::Id(decl.name.clone()));
        Ok(())
    }

    fn attribute(&mut self, attr: &AttributeDecl, interface: bool) -> Result<()> {
        match attr.kind {
            AttribKind::Method => {
                for param in attr.params.iter().rev() {
                    self.parameter(param)?;
                }
                let mut flags = attr.modifiers.bits();
                if interface {
                    flags |= Modifiers::ABSTRACT;
                }
                self.load_num(i64::from(flags));
                match &attr.body {
                    Some(body) => {
                        let frame = self.method_frame(body)?;
                        self.op1(Opcode::LoadConst, Operand::Code(frame));
                    }
                    None => self.load_id("null"),
                }
                self.load_num(attr.visibility as i64);
                self.load_num(attr.access as i64);
                let argc = self.count(attr.params.len(), "parameters")?;
                self.op2(Opcode::BuildAttrib, Operand::Kind(AttribKind::Method), argc);
            }
            AttribKind::Property | AttribKind::Constant => {
                self.value_or_null(attr.value.as_deref())?;
                self.load_num(attr.visibility as i64);
                self.load_num(attr.access as i64);
                self.op2(Opcode::BuildAttrib, Operand::Kind(attr.kind), Operand::Imm(0));
            }
        }
        Ok(())
    }

    fn parameter(&mut self, param: &Param) -> Result<()> {
        match &param.typehint {
            Some(hint) => self.load_str(hint),
            None => self.load_id("null"),
        }
        self.load_str(&param.name);
        self.value_or_null(param.default.as_deref())
    }

    /// Lowers a method body into a new frame and returns its name.
    fn method_frame(&mut self, body: &Node) -> Result<String> {
        let name = self.unit.reserve_frame();
        let mut child = FrameBuilder::new(self.unit, body.line);
        child.body(body)?;
        if !body.is_terminator() {
            child.load_id("self");
            child.op(Opcode::Return);
        }
        let lines = child.finish();
        tracing::debug!(frame = %name, lines = lines.len(), "lowered method frame");
        self.unit.frames.insert(name.clone(), AsmFrame { lines });
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self, node: &Node) -> Result<()> {
        self.at_line(node, |b| b.expr_inner(node))
    }

    fn expr_inner(&mut self, node: &Node) -> Result<()> {
        let state = self.state();
        let line = node.line;
        if state.context == Context::Store
            && !matches!(
                node.kind,
                NodeKind::Identifier { .. } | NodeKind::Property { .. } | NodeKind::Subscript { .. } | NodeKind::Group { .. }
            )
        {
            return Err(CompileError::InvalidTarget { line });
        }

        match &node.kind {
            NodeKind::Null => self.load_id("null"),
            NodeKind::Number { value } => self.load_num(*value),
            NodeKind::String { value } => self.load_str(value),
            NodeKind::Regex { pattern } => self.op1(Opcode::LoadConst, Operand::Regex(pattern.clone())),
            NodeKind::Identifier { name } => {
                let opcode = match state.context {
                    Context::Load => Opcode::LoadId,
                    Context::Store => Opcode::StoreId,
                };
                self.op1(opcode, Operand::Id(name.clone()));
            }
            NodeKind::Operator { op, left, right } => {
                self.operand(left, Side::Left)?;
                self.operand(right, Side::Right)?;
                self.op1(Opcode::Operator, Operand::Operator(*op));
            }
            NodeKind::Comparison { op, left, right } => {
                self.operand(right, Side::Right)?;
                self.operand(left, Side::Left)?;
                self.op1(Opcode::CompareOp, Operand::Compare(*op));
            }
            NodeKind::Boolean { op, left, right } => {
                let end = format!("{}_end", self.fresh("bool"));
                self.operand(left, Side::Left)?;
                let opcode = match op {
                    BoolOp::And => Opcode::JumpIfFalse,
                    BoolOp::Or => Opcode::JumpIfTrue,
                };
                self.jump(opcode, &end);
                self.op(Opcode::PopTop);
                self.operand(right, Side::Right)?;
                self.label(&end);
            }
            NodeKind::Assignment { op, target, value } => self.assignment(line, *op, target, value, state.side)?,
            NodeKind::Property { object, name } => {
                self.value(object)?;
                let opcode = match state.context {
                    Context::Load => Opcode::LoadAttrib,
                    Context::Store => Opcode::StoreAttrib,
                };
                self.op1(opcode, Operand::Str(name.clone()));
            }
            NodeKind::Subscript {
                object,
                start,
                end,
                slice,
            } => self.subscript(line, state.context, object, start.as_deref(), end.as_deref(), *slice)?,
            NodeKind::Group { items } => match state.context {
                Context::Load => {
                    for item in items {
                        self.value(item)?;
                    }
                    let n = self.count(items.len(), "tuple items")?;
                    self.op1(Opcode::BuildTuple, n);
                }
                // one value per item is on the stack, the last item's on top
                Context::Store => {
                    for item in items.iter().rev() {
                        self.store(item)?;
                    }
                }
            },
            NodeKind::Call { callee, args } => {
                for arg in args {
                    self.value(arg)?;
                }
                self.value(callee)?;
                let n = self.count(args.len(), "arguments")?;
                self.op1(Opcode::Call, n);
                if state.call == CallResult::Pop {
                    self.op(Opcode::PopTop);
                }
            }
            NodeKind::DataStructure { class, elements } => self.data_structure(class, elements)?,
            NodeKind::Ternary {
                condition,
                then,
                otherwise,
            } => {
                let stem = self.fresh("ternary");
                let else_label = format!("{stem}_else");
                let end = format!("{stem}_end");
                self.value(condition)?;
                self.jump(Opcode::JumpIfFalse, &else_label);
                self.op(Opcode::PopTop);
                self.value(then)?;
                self.jump(Opcode::JumpAbsolute, &end);
                self.label(&else_label);
                self.op(Opcode::PopTop);
                self.value(otherwise)?;
                self.label(&end);
            }
            NodeKind::Coalesce { left, right } => {
                let end = format!("{}_end", self.fresh("coalesce"));
                self.value(left)?;
                self.jump(Opcode::JumpIfTrue, &end);
                self.op(Opcode::PopTop);
                self.value(right)?;
                self.label(&end);
            }
            other => {
                return Err(CompileError::InvalidExpression {
                    line,
                    what: statement_name(other),
                });
            }
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        line: u32,
        op: Option<BinaryOp>,
        target: &Node,
        value: &Node,
        side: Side,
    ) -> Result<()> {
        let keep = side != Side::None;

        if let NodeKind::Group { items: targets } = &target.kind {
            if op.is_some() {
                return Err(CompileError::InvalidTarget { line });
            }
            let NodeKind::Group { items: values } = &value.kind else {
                return Err(CompileError::Destructure {
                    line,
                    targets: targets.len(),
                    values: 1,
                });
            };
            if targets.len() != values.len() {
                return Err(CompileError::Destructure {
                    line,
                    targets: targets.len(),
                    values: values.len(),
                });
            }
            for item in values {
                self.value(item)?;
            }
            self.store(target)?;
            if keep {
                self.value(target)?;
            }
            return Ok(());
        }

        match op {
            None => self.value(value)?,
            Some(op) => {
                if let NodeKind::Subscript { start: None, .. } | NodeKind::Subscript { slice: true, .. } = &target.kind {
                    return Err(CompileError::InvalidTarget { line });
                }
                self.value(target)?;
                self.value(value)?;
                self.op1(Opcode::InplaceOpr, Operand::Operator(op));
            }
        }
        if keep {
            self.op(Opcode::DupTop);
        }
        self.store(target)
    }

    fn subscript(
        &mut self,
        line: u32,
        context: Context,
        object: &Node,
        start: Option<&Node>,
        end: Option<&Node>,
        slice: bool,
    ) -> Result<()> {
        match (context, slice, start) {
            (Context::Load, true, _) => {
                self.value_or_null(start)?;
                self.value_or_null(end)?;
                self.value(object)?;
                self.op1(Opcode::LoadAttrib, Operand::Str("splice".to_owned()));
                self.op1(Opcode::Call, Operand::Imm(2));
            }
            (Context::Load, false, Some(key)) => {
                self.value(key)?;
                self.value(object)?;
                self.op1(Opcode::LoadAttrib, Operand::Str("get".to_owned()));
                self.op1(Opcode::Call, Operand::Imm(1));
            }
            (Context::Load, false, None) => return Err(CompileError::EmptySubscript { line }),
            (Context::Store, true, _) => return Err(CompileError::InvalidTarget { line }),
            (Context::Store, false, Some(key)) => {
                self.value(key)?;
                self.op(Opcode::RotTwo);
                self.value(object)?;
                self.op1(Opcode::LoadAttrib, Operand::Str("set".to_owned()));
                self.op1(Opcode::Call, Operand::Imm(2));
                self.op(Opcode::PopTop);
            }
            (Context::Store, false, None) => {
                self.value(object)?;
                self.op1(Opcode::LoadAttrib, Operand::Str("push".to_owned()));
                self.op1(Opcode::Call, Operand::Imm(1));
                self.op(Opcode::PopTop);
            }
        }
        Ok(())
    }

    fn data_structure(&mut self, class: &Node, elements: &[DataElement]) -> Result<()> {
        self.value(class)?;
        for element in elements {
            let width = match &element.key {
                Some(key) => {
                    self.value(key)?;
                    2
                }
                None => 1,
            };
            self.value(&element.value)?;
            self.op1(Opcode::BuildTuple, Operand::Imm(width));
        }
        let n = self.count(elements.len(), "elements")?;
        self.op1(Opcode::BuildDatastruct, n);
        Ok(())
    }
}

fn statement_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::Program { .. } => "a program",
        NodeKind::Block { .. } => "a block",
        NodeKind::Nop => "an empty statement",
        NodeKind::Class(_) => "a class declaration",
        NodeKind::Interface(_) => "an interface declaration",
        NodeKind::If { .. } => "'if'",
        NodeKind::While { .. } => "'while'",
        NodeKind::DoWhile { .. } => "'do'",
        NodeKind::For { .. } => "'for'",
        NodeKind::Foreach { .. } => "'foreach'",
        NodeKind::Switch { .. } => "'switch'",
        NodeKind::Try { .. } => "'try'",
        NodeKind::Throw { .. } => "'throw'",
        NodeKind::Return { .. } => "'return'",
        NodeKind::Break => "'break'",
        NodeKind::BreakElse => "'breakelse'",
        NodeKind::Continue => "'continue'",
        NodeKind::Goto { .. } => "'goto'",
        NodeKind::Label { .. } => "a label",
        NodeKind::Import { .. } => "'import'",
        _ => "this node",
    }
}

// ============================================================================
// Modifier rules
// ============================================================================

fn check_class_modifiers(line: u32, decl: &ClassDecl, interface: bool) -> Result<()> {
    let fail = |name: &str, reason: &'static str| CompileError::Modifiers {
        line,
        name: name.to_owned(),
        reason,
    };

    if decl.modifiers.is_abstract && decl.modifiers.is_final {
        return Err(fail(&decl.name, "cannot be both abstract and final"));
    }

    for attr in &decl.attributes {
        let m = attr.modifiers;
        let is_method = attr.kind == AttribKind::Method;
        if m.is_abstract && m.is_final {
            return Err(fail(&attr.name, "cannot be both abstract and final"));
        }
        if interface {
            if attr.visibility != Visibility::Public {
                return Err(fail(&attr.name, "must be public in an interface"));
            }
            if attr.kind == AttribKind::Property {
                return Err(fail(&attr.name, "is a property; interfaces cannot declare properties"));
            }
            if is_method && attr.body.is_some() {
                return Err(fail(&attr.name, "is an interface method and cannot have a body"));
            }
            continue;
        }
        if m.is_abstract {
            if !is_method {
                return Err(fail(&attr.name, "only methods can be abstract"));
            }
            if attr.visibility == Visibility::Private {
                return Err(fail(&attr.name, "cannot be both abstract and private"));
            }
            if !decl.modifiers.is_abstract {
                return Err(fail(&attr.name, "is abstract but the class is not"));
            }
            if attr.body.is_some() {
                return Err(fail(&attr.name, "is abstract and cannot have a body"));
            }
        } else if is_method && attr.body.is_none() {
            return Err(fail(&attr.name, "is not abstract and needs a body"));
        }
    }
    Ok(())
}
