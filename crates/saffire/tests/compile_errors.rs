//! Trees the compiler must reject, checked through the public `Runner` API.

use pretty_assertions::assert_eq;
use saffire::{CompileError, CompileOptions, Error, Runner, ast::Node};
use serde_json::{Value, json};

fn id(name: &str) -> Value {
    json!({"node": "identifier", "name": name})
}

fn num(value: i64) -> Value {
    json!({"node": "number", "value": value})
}

/// Compiles `body`, expecting a compile error.
fn compile_error(body: Vec<Value>) -> CompileError {
    let ast: Node = serde_json::from_value(json!({"node": "program", "body": body})).expect("valid tree");
    match Runner::new(&ast, &CompileOptions::default()) {
        Ok(_) => panic!("tree should not compile"),
        Err(Error::Compile(err)) => err,
        Err(other) => panic!("expected a compile error, got {other:?}"),
    }
}

// =============================================================================
// 1. Control flow
// =============================================================================

#[test]
fn break_and_continue_need_a_loop() {
    assert_eq!(
        compile_error(vec![json!({"line": 3, "node": "break"})]),
        CompileError::BreakOutsideLoop { line: 3 }
    );
    assert_eq!(
        compile_error(vec![json!({"line": 4, "node": "continue"})]),
        CompileError::ContinueOutsideLoop { line: 4 }
    );
}

#[test]
fn goto_needs_a_label_in_scope() {
    let err = compile_error(vec![json!({"line": 2, "node": "goto", "label": "nowhere"})]);
    assert_eq!(
        err,
        CompileError::UndefinedLabel {
            line: 2,
            label: "nowhere".to_owned()
        }
    );
    assert_eq!(err.to_string(), "line 2: no label 'nowhere' in scope");
}

#[test]
fn switch_allows_one_default() {
    let err = compile_error(vec![json!({"line": 6, "node": "switch", "subject": num(1), "cases": [
        {"body": []},
        {"test": num(1), "body": []},
        {"body": []},
    ]})]);
    assert_eq!(err, CompileError::DuplicateDefault { line: 6 });
}

// =============================================================================
// 2. Assignments
// =============================================================================

#[test]
fn destructuring_counts_must_match() {
    let err = compile_error(vec![json!({
        "line": 7,
        "node": "assignment",
        "target": {"node": "group", "items": [id("a"), id("b"), id("c")]},
        "value": {"node": "group", "items": [num(1), num(2)]},
    })]);
    assert_eq!(
        err,
        CompileError::Destructure {
            line: 7,
            targets: 3,
            values: 2
        }
    );
}

#[test]
fn literals_cannot_be_assigned() {
    let err = compile_error(vec![json!({"line": 1, "node": "assignment", "target": num(1), "value": num(2)})]);
    assert!(matches!(err, CompileError::InvalidTarget { .. }), "got {err:?}");
}

// =============================================================================
// 3. Declarations
// =============================================================================

#[test]
fn class_modifiers_are_validated() {
    let err = compile_error(vec![json!({
        "line": 9,
        "node": "class",
        "name": "Odd",
        "modifiers": {"abstract": true, "final": true},
    })]);
    assert!(
        matches!(&err, CompileError::Modifiers { line: 9, name, .. } if name == "Odd"),
        "got {err:?}"
    );

    let err = compile_error(vec![json!({
        "line": 10,
        "node": "class",
        "name": "Concrete",
        "attributes": [{"name": "run", "kind": "method"}],
    })]);
    assert!(
        matches!(&err, CompileError::Modifiers { name, .. } if name == "run"),
        "method without a body in a concrete class: {err:?}"
    );
}

#[test]
fn interfaces_cannot_hold_properties() {
    let err = compile_error(vec![json!({
        "line": 11,
        "node": "interface",
        "name": "Shape",
        "attributes": [{"name": "sides", "kind": "property", "value": num(3)}],
    })]);
    assert!(
        matches!(&err, CompileError::Modifiers { name, .. } if name == "sides"),
        "got {err:?}"
    );
}

#[test]
fn root_must_be_a_program() {
    let ast: Node = serde_json::from_value(num(1)).expect("valid tree");
    let err = Runner::new(&ast, &CompileOptions::default()).expect_err("a number is not a program");
    assert!(matches!(err, Error::Compile(CompileError::NotAProgram { .. })), "got {err:?}");
}
