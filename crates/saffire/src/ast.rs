//! Abstract syntax tree consumed by the compiler.
//!
//! The tree is produced by an external parser and handed over as a serde value
//! (the CLI reads it as JSON). Every node carries the source line it came from.
//!
//! ```json
//! {"line": 1, "node": "assignment",
//!  "target": {"line": 1, "node": "identifier", "name": "a"},
//!  "value":  {"line": 1, "node": "number", "value": 4660}}
//! ```

use serde::{Deserialize, Serialize};
use strum::{Display, FromRepr};

/// A node of the syntax tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub line: u32,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// Every syntactic construct the compiler knows how to lower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeKind {
    /// Root of a compilation unit.
    Program {
        #[serde(default)]
        imports: Vec<Node>,
        body: Vec<Node>,
    },
    /// A braced statement list; user labels are scoped to it.
    Block { statements: Vec<Node> },
    /// An absent expression. Evaluates to `null`.
    Null,
    /// The empty statement.
    Nop,

    Number { value: i64 },
    String { value: String },
    Regex { pattern: String },
    Identifier { name: String },

    Operator { op: BinaryOp, left: Box<Node>, right: Box<Node> },
    Boolean { op: BoolOp, left: Box<Node>, right: Box<Node> },
    Comparison { op: CompareOp, left: Box<Node>, right: Box<Node> },
    /// `target = value`, or `target op= value` when `op` is set.
    Assignment {
        #[serde(default)]
        op: Option<BinaryOp>,
        target: Box<Node>,
        value: Box<Node>,
    },
    /// `object.name`
    Property { object: Box<Node>, name: String },
    /// `object[start]`, or `object[start:end]` when `slice` is set.
    Subscript {
        object: Box<Node>,
        #[serde(default)]
        start: Option<Box<Node>>,
        #[serde(default)]
        end: Option<Box<Node>>,
        #[serde(default)]
        slice: bool,
    },
    /// `(a, b, ...)`: a tuple value, or a destructuring target.
    Group { items: Vec<Node> },
    Call { callee: Box<Node>, args: Vec<Node> },
    /// `list[1, 2]`, `hash["a": 1]`; `class` names the datastructure class.
    DataStructure { class: Box<Node>, elements: Vec<DataElement> },
    Ternary { condition: Box<Node>, then: Box<Node>, otherwise: Box<Node> },
    /// `left ?: right`
    Coalesce { left: Box<Node>, right: Box<Node> },

    Class(ClassDecl),
    Interface(ClassDecl),

    If {
        condition: Box<Node>,
        then: Box<Node>,
        #[serde(default)]
        otherwise: Option<Box<Node>>,
    },
    While {
        condition: Box<Node>,
        body: Box<Node>,
        #[serde(default)]
        otherwise: Option<Box<Node>>,
    },
    DoWhile { body: Box<Node>, condition: Box<Node> },
    For {
        #[serde(default)]
        init: Option<Box<Node>>,
        #[serde(default)]
        condition: Option<Box<Node>>,
        #[serde(default)]
        step: Option<Box<Node>>,
        body: Box<Node>,
    },
    Foreach {
        source: Box<Node>,
        #[serde(default)]
        key: Option<String>,
        value: String,
        body: Box<Node>,
        #[serde(default)]
        otherwise: Option<Box<Node>>,
    },
    Switch { subject: Box<Node>, cases: Vec<SwitchCase> },
    Try {
        body: Box<Node>,
        #[serde(default)]
        catches: Vec<CatchClause>,
        #[serde(default)]
        finally: Option<Box<Node>>,
    },
    Throw { value: Box<Node> },
    Return {
        #[serde(default)]
        value: Option<Box<Node>>,
    },
    Break,
    BreakElse,
    Continue,
    Goto { label: String },
    Label { name: String },
    /// `import class as alias from module`
    Import {
        class: String,
        #[serde(default)]
        alias: Option<String>,
        module: String,
    },
}

/// One element of a datastructure literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataElement {
    #[serde(default)]
    pub key: Option<Node>,
    pub value: Node,
}

/// One `case` (or the `default`, when `test` is absent) of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchCase {
    #[serde(default)]
    pub test: Option<Node>,
    pub body: Vec<Node>,
}

/// `catch (Class var) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatchClause {
    pub class: String,
    pub var: String,
    pub body: Box<Node>,
}

/// A class or interface declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDecl {
    pub name: String,
    #[serde(default)]
    pub modifiers: Modifiers,
    #[serde(default)]
    pub extends: Option<Box<Node>>,
    #[serde(default)]
    pub implements: Vec<Node>,
    #[serde(default)]
    pub attributes: Vec<AttributeDecl>,
}

/// A method, property or constant declared inside a class body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDecl {
    pub name: String,
    pub kind: AttribKind,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub access: Access,
    #[serde(default)]
    pub modifiers: Modifiers,
    /// Initial value of a property or constant.
    #[serde(default)]
    pub value: Option<Box<Node>>,
    #[serde(default)]
    pub params: Vec<Param>,
    /// Method body; absent for abstract and interface methods.
    #[serde(default)]
    pub body: Option<Box<Node>>,
}

/// A method parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default)]
    pub typehint: Option<String>,
    #[serde(default)]
    pub default: Option<Box<Node>>,
}

/// `static`, `abstract` and `final` modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modifiers {
    #[serde(default, rename = "static")]
    pub is_static: bool,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default, rename = "final")]
    pub is_final: bool,
}

impl Modifiers {
    pub const STATIC: u16 = 0x01;
    pub const ABSTRACT: u16 = 0x02;
    pub const FINAL: u16 = 0x04;

    /// Packs the modifiers into the flag word carried in bytecode.
    #[must_use]
    pub fn bits(self) -> u16 {
        let mut bits = 0;
        if self.is_static {
            bits |= Self::STATIC;
        }
        if self.is_abstract {
            bits |= Self::ABSTRACT;
        }
        if self.is_final {
            bits |= Self::FINAL;
        }
        bits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum AttribKind {
    #[strum(serialize = "method")]
    Method = 0,
    #[strum(serialize = "property")]
    Property = 1,
    #[strum(serialize = "constant")]
    Constant = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    #[strum(serialize = "public")]
    Public = 0,
    #[strum(serialize = "protected")]
    Protected = 1,
    #[strum(serialize = "private")]
    Private = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    #[default]
    #[strum(serialize = "readwrite")]
    ReadWrite = 0,
    #[strum(serialize = "readonly")]
    ReadOnly = 1,
}

/// Arithmetic and bitwise operators, carried as the `OPERATOR` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum BinaryOp {
    #[serde(rename = "+")]
    #[strum(serialize = "ADD")]
    Add = 0,
    #[serde(rename = "-")]
    #[strum(serialize = "SUB")]
    Sub = 1,
    #[serde(rename = "*")]
    #[strum(serialize = "MUL")]
    Mul = 2,
    #[serde(rename = "/")]
    #[strum(serialize = "DIV")]
    Div = 3,
    #[serde(rename = "%")]
    #[strum(serialize = "MOD")]
    Mod = 4,
    #[serde(rename = "&")]
    #[strum(serialize = "AND")]
    And = 5,
    #[serde(rename = "|")]
    #[strum(serialize = "OR")]
    Or = 6,
    #[serde(rename = "^")]
    #[strum(serialize = "XOR")]
    Xor = 7,
    #[serde(rename = "<<")]
    #[strum(serialize = "SHL")]
    Shl = 8,
    #[serde(rename = ">>")]
    #[strum(serialize = "SHR")]
    Shr = 9,
}

impl BinaryOp {
    /// Name of the method a user class defines to overload this operator.
    #[must_use]
    pub fn method_name(self) -> &'static str {
        match self {
            Self::Add => "__opr_add",
            Self::Sub => "__opr_sub",
            Self::Mul => "__opr_mul",
            Self::Div => "__opr_div",
            Self::Mod => "__opr_mod",
            Self::And => "__opr_and",
            Self::Or => "__opr_or",
            Self::Xor => "__opr_xor",
            Self::Shl => "__opr_shl",
            Self::Shr => "__opr_shr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BoolOp {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
}

/// Comparison codes, carried as the `COMPARE_OP` operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompareOp {
    #[serde(rename = "==")]
    #[strum(serialize = "EQ")]
    Eq = 0,
    #[serde(rename = "!=")]
    #[strum(serialize = "NE")]
    Ne = 1,
    #[serde(rename = "<")]
    #[strum(serialize = "LT")]
    Lt = 2,
    #[serde(rename = "<=")]
    #[strum(serialize = "LE")]
    Le = 3,
    #[serde(rename = ">")]
    #[strum(serialize = "GT")]
    Gt = 4,
    #[serde(rename = ">=")]
    #[strum(serialize = "GE")]
    Ge = 5,
    #[serde(rename = "in")]
    #[strum(serialize = "IN")]
    In = 6,
    #[serde(rename = "!in")]
    #[strum(serialize = "NI")]
    NotIn = 7,
    /// Instance-of test used by `catch` clauses.
    #[serde(rename = "instanceof")]
    #[strum(serialize = "EX")]
    Ex = 8,
}

impl Node {
    #[must_use]
    pub fn new(line: u32, kind: NodeKind) -> Self {
        Self { line, kind }
    }

    /// Parses a tree from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn program(body: Vec<Self>) -> Self {
        Self::new(0, NodeKind::Program { imports: Vec::new(), body })
    }

    #[must_use]
    pub fn block(line: u32, statements: Vec<Self>) -> Self {
        Self::new(line, NodeKind::Block { statements })
    }

    #[must_use]
    pub fn number(line: u32, value: i64) -> Self {
        Self::new(line, NodeKind::Number { value })
    }

    #[must_use]
    pub fn string(line: u32, value: impl Into<String>) -> Self {
        Self::new(line, NodeKind::String { value: value.into() })
    }

    #[must_use]
    pub fn ident(line: u32, name: impl Into<String>) -> Self {
        Self::new(line, NodeKind::Identifier { name: name.into() })
    }

    #[must_use]
    pub fn assign(line: u32, target: Self, value: Self) -> Self {
        Self::new(
            line,
            NodeKind::Assignment {
                op: None,
                target: Box::new(target),
                value: Box::new(value),
            },
        )
    }

    #[must_use]
    pub fn call(line: u32, callee: Self, args: Vec<Self>) -> Self {
        Self::new(
            line,
            NodeKind::Call {
                callee: Box::new(callee),
                args,
            },
        )
    }

    #[must_use]
    pub fn binary(line: u32, op: BinaryOp, left: Self, right: Self) -> Self {
        Self::new(
            line,
            NodeKind::Operator {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    #[must_use]
    pub fn compare(line: u32, op: CompareOp, left: Self, right: Self) -> Self {
        Self::new(
            line,
            NodeKind::Comparison {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
        )
    }

    /// Returns true if this statement always leaves the frame (`return` or `throw`).
    #[must_use]
    pub fn is_terminator(&self) -> bool {
        match &self.kind {
            NodeKind::Return { .. } | NodeKind::Throw { .. } => true,
            NodeKind::Block { statements } => statements.last().is_some_and(Self::is_terminator),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_from_json() {
        let json = r#"{"line": 3, "node": "assignment",
            "target": {"line": 3, "node": "identifier", "name": "a"},
            "value": {"line": 3, "node": "operator", "op": "+",
                "left": {"line": 3, "node": "number", "value": 1},
                "right": {"line": 3, "node": "number", "value": 2}}}"#;
        let node = Node::from_json(json).unwrap();
        let expected = Node::assign(
            3,
            Node::ident(3, "a"),
            Node::binary(3, BinaryOp::Add, Node::number(3, 1), Node::number(3, 2)),
        );
        assert_eq!(node, expected);
    }

    #[test]
    fn test_parse_class_with_defaults() {
        let json = r#"{"line": 1, "node": "class", "name": "Foo",
            "attributes": [{"name": "bar", "kind": "method", "visibility": "private",
                            "modifiers": {"static": true}, "params": [{"name": "x"}],
                            "body": {"line": 2, "node": "block", "statements": []}}]}"#;
        let node = Node::from_json(json).unwrap();
        let NodeKind::Class(decl) = node.kind else {
            panic!("expected class node");
        };
        assert_eq!(decl.name, "Foo");
        assert!(decl.extends.is_none());
        let attr = &decl.attributes[0];
        assert_eq!(attr.visibility, Visibility::Private);
        assert_eq!(attr.access, Access::ReadWrite);
        assert_eq!(attr.modifiers.bits(), Modifiers::STATIC);
        assert_eq!(attr.params[0].typehint, None);
    }

    #[test]
    fn test_terminator_detection() {
        let ret = Node::new(1, NodeKind::Return { value: None });
        assert!(ret.is_terminator());
        assert!(Node::block(1, vec![Node::number(1, 1), ret]).is_terminator());
        assert!(!Node::block(1, vec![]).is_terminator());
    }
}
