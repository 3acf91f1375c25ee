//! End-to-end tests that compile syntax trees and run them.
//!
//! Trees are written in their JSON form, the same shape the CLI reads, and the
//! assertions check what `print` wrote and the exit code the main frame
//! returned.

use pretty_assertions::assert_eq;
use saffire::{CollectStringPrint, CompileOptions, NoLimitTracker, Runner, ast::Node};
use serde_json::{Value, json};

fn id(name: &str) -> Value {
    json!({"node": "identifier", "name": name})
}

fn num(value: i64) -> Value {
    json!({"node": "number", "value": value})
}

fn string(value: &str) -> Value {
    json!({"node": "string", "value": value})
}

fn assign(name: &str, value: Value) -> Value {
    json!({"node": "assignment", "target": id(name), "value": value})
}

fn add_assign(name: &str, value: Value) -> Value {
    json!({"node": "assignment", "op": "+", "target": id(name), "value": value})
}

fn print(args: Vec<Value>) -> Value {
    json!({"node": "call", "callee": id("print"), "args": args})
}

fn op(op: &str, left: Value, right: Value) -> Value {
    json!({"node": "operator", "op": op, "left": left, "right": right})
}

fn cmp(op: &str, left: Value, right: Value) -> Value {
    json!({"node": "comparison", "op": op, "left": left, "right": right})
}

fn block(statements: Vec<Value>) -> Value {
    json!({"node": "block", "statements": statements})
}

fn list(items: Vec<Value>) -> Value {
    let elements: Vec<Value> = items.into_iter().map(|value| json!({"value": value})).collect();
    json!({"node": "data_structure", "class": id("list"), "elements": elements})
}

fn method_call(object: Value, name: &str, args: Vec<Value>) -> Value {
    json!({
        "node": "call",
        "callee": {"node": "property", "object": object, "name": name},
        "args": args,
    })
}

/// Compiles and runs a program body, returning the exit code and printed output.
fn run_program(body: Vec<Value>) -> (i64, String) {
    let ast: Node = serde_json::from_value(json!({"node": "program", "body": body})).expect("valid tree");
    let runner = Runner::new(&ast, &CompileOptions::default()).expect("program should compile");
    let mut print = CollectStringPrint::new();
    let code = runner.run(NoLimitTracker, &mut print).expect("program should run");
    (code, print.into_output())
}

// =============================================================================
// 1. Assignment and expressions
// =============================================================================

/// Group assignment evaluates every value before storing any target, so it swaps.
#[test]
fn group_assignment_swaps_values() {
    let (code, output) = run_program(vec![
        assign("a", num(0x1234)),
        assign("b", num(0x5678)),
        print(vec![id("a")]),
        print(vec![id("b")]),
        json!({
            "node": "assignment",
            "target": {"node": "group", "items": [id("a"), id("b")]},
            "value": {"node": "group", "items": [id("b"), id("a")]},
        }),
        print(vec![id("a")]),
        print(vec![id("b")]),
    ]);
    assert_eq!(output, "4660\n22136\n22136\n4660\n");
    assert_eq!(code, 0, "a program without return exits with 0");
}

#[test]
fn arithmetic_follows_the_tree() {
    let (_, output) = run_program(vec![
        print(vec![op("+", num(2), op("*", num(3), num(4)))]),
        print(vec![op("-", op("<<", num(1), num(4)), num(1))]),
        print(vec![op("^", num(6), num(3)), op("&", num(6), num(3)), op("|", num(6), num(3))]),
        print(vec![op("/", num(17), num(5)), op("%", num(17), num(5))]),
    ]);
    assert_eq!(output, "14\n15\n5 2 7\n3 2\n");
}

#[test]
fn compound_assignment_updates_identifier() {
    let (_, output) = run_program(vec![
        assign("total", num(10)),
        add_assign("total", num(5)),
        json!({"node": "assignment", "op": "*", "target": id("total"), "value": num(2)}),
        print(vec![id("total")]),
    ]);
    assert_eq!(output, "30\n");
}

#[test]
fn strings_concatenate_with_plus() {
    let (_, output) = run_program(vec![
        assign("greeting", op("+", string("hello, "), string("world"))),
        print(vec![id("greeting")]),
    ]);
    assert_eq!(output, "hello, world\n");
}

/// Top-level strings print raw; strings nested in containers are quoted.
#[test]
fn print_formats_values() {
    let (_, output) = run_program(vec![
        print(vec![string("x"), num(1), id("true"), json!({"node": "null"})]),
        print(vec![list(vec![num(1), string("a")])]),
        print(vec![json!({"node": "group", "items": [num(1), num(2)]})]),
        print(vec![json!({
            "node": "data_structure",
            "class": id("hash"),
            "elements": [{"key": string("k"), "value": num(3)}],
        })]),
        print(vec![]),
    ]);
    assert_eq!(output, "x 1 true null\n[1, \"a\"]\n(1, 2)\n{\"k\": 3}\n\n");
}

#[test]
fn ternary_and_coalesce() {
    let (_, output) = run_program(vec![
        print(vec![json!({
            "node": "ternary",
            "condition": cmp(">", num(2), num(1)),
            "then": string("yes"),
            "otherwise": string("no"),
        })]),
        print(vec![json!({"node": "coalesce", "left": {"node": "null"}, "right": num(7)})]),
        print(vec![json!({"node": "coalesce", "left": num(3), "right": num(7)})]),
    ]);
    assert_eq!(output, "yes\n7\n3\n");
}

/// `&&` and `||` leave the deciding operand, not a boolean.
#[test]
fn boolean_operators_short_circuit() {
    let (_, output) = run_program(vec![
        print(vec![json!({"node": "boolean", "op": "||", "left": num(0), "right": string("fallback")})]),
        print(vec![json!({"node": "boolean", "op": "&&", "left": num(0), "right": string("unused")})]),
        print(vec![json!({"node": "boolean", "op": "&&", "left": num(1), "right": num(2)})]),
    ]);
    assert_eq!(output, "fallback\n0\n2\n");
}

#[test]
fn comparisons_produce_booleans() {
    let (_, output) = run_program(vec![
        print(vec![cmp("==", num(3), num(3)), cmp("!=", num(3), num(3))]),
        print(vec![cmp("<", string("abc"), string("abd")), cmp(">=", num(1), num(2))]),
        print(vec![cmp("in", num(2), list(vec![num(1), num(2)])), cmp("!in", string("z"), string("xyz"))]),
    ]);
    assert_eq!(output, "true false\ntrue false\ntrue false\n");
}

// =============================================================================
// 2. Control flow
// =============================================================================

#[test]
fn while_loop_counts() {
    let (_, output) = run_program(vec![
        assign("i", num(0)),
        json!({
            "node": "while",
            "condition": cmp("<", id("i"), num(3)),
            "body": block(vec![print(vec![id("i")]), add_assign("i", num(1))]),
        }),
    ]);
    assert_eq!(output, "0\n1\n2\n");
}

/// The else branch of a while runs only when the body never ran.
#[test]
fn while_else_runs_when_body_never_runs() {
    let (_, output) = run_program(vec![
        assign("i", num(5)),
        json!({
            "node": "while",
            "condition": cmp("<", id("i"), num(3)),
            "body": block(vec![print(vec![string("body")])]),
            "otherwise": block(vec![print(vec![string("else")])]),
        }),
        assign("j", num(0)),
        json!({
            "node": "while",
            "condition": cmp("<", id("j"), num(2)),
            "body": block(vec![add_assign("j", num(1))]),
            "otherwise": block(vec![print(vec![string("not reached")])]),
        }),
        print(vec![string("done"), id("j")]),
    ]);
    assert_eq!(output, "else\ndone 2\n");
}

#[test]
fn do_while_runs_body_at_least_once() {
    let (_, output) = run_program(vec![
        assign("i", num(10)),
        json!({
            "node": "do_while",
            "body": block(vec![print(vec![id("i")]), add_assign("i", num(1))]),
            "condition": cmp("<", id("i"), num(0)),
        }),
        assign("k", num(0)),
        json!({
            "node": "do_while",
            "body": block(vec![add_assign("k", num(1))]),
            "condition": cmp("<", id("k"), num(4)),
        }),
        print(vec![id("k")]),
    ]);
    assert_eq!(output, "10\n4\n");
}

#[test]
fn for_loop_with_break_and_continue() {
    let (_, output) = run_program(vec![json!({
        "node": "for",
        "init": assign("i", num(0)),
        "condition": cmp("<", id("i"), num(10)),
        "step": add_assign("i", num(1)),
        "body": block(vec![
            json!({"node": "if", "condition": cmp("==", id("i"), num(2)), "then": {"node": "continue"}}),
            json!({"node": "if", "condition": cmp("==", id("i"), num(5)), "then": {"node": "break"}}),
            print(vec![id("i")]),
        ]),
    })]);
    assert_eq!(output, "0\n1\n3\n4\n");
}

#[test]
fn break_leaves_only_the_inner_loop() {
    let inner = json!({
        "node": "for",
        "init": assign("j", num(0)),
        "condition": cmp("<", id("j"), num(3)),
        "step": add_assign("j", num(1)),
        "body": block(vec![
            json!({"node": "if", "condition": cmp("==", id("j"), num(1)), "then": {"node": "break"}}),
            print(vec![id("i"), id("j")]),
        ]),
    });
    let (_, output) = run_program(vec![json!({
        "node": "for",
        "init": assign("i", num(0)),
        "condition": cmp("<", id("i"), num(2)),
        "step": add_assign("i", num(1)),
        "body": block(vec![inner]),
    })]);
    assert_eq!(output, "0 0\n1 0\n");
}

#[test]
fn if_else_picks_a_branch() {
    let branch = |value: i64| {
        json!({
            "node": "if",
            "condition": cmp(">", num(value), num(0)),
            "then": block(vec![print(vec![string("positive")])]),
            "otherwise": block(vec![print(vec![string("not positive")])]),
        })
    };
    let (_, output) = run_program(vec![branch(3), branch(-3)]);
    assert_eq!(output, "positive\nnot positive\n");
}

#[test]
fn foreach_over_list_and_hash() {
    let (_, output) = run_program(vec![
        json!({
            "node": "foreach",
            "source": list(vec![num(10), num(20)]),
            "value": "v",
            "body": block(vec![print(vec![id("v")])]),
        }),
        json!({
            "node": "foreach",
            "source": list(vec![string("a"), string("b")]),
            "key": "i",
            "value": "v",
            "body": block(vec![print(vec![id("i"), id("v")])]),
        }),
        json!({
            "node": "foreach",
            "source": {
                "node": "data_structure",
                "class": id("hash"),
                "elements": [
                    {"key": string("x"), "value": num(1)},
                    {"key": string("y"), "value": num(2)},
                ],
            },
            "key": "k",
            "value": "v",
            "body": block(vec![print(vec![id("k"), id("v")])]),
        }),
    ]);
    assert_eq!(output, "10\n20\n0 a\n1 b\nx 1\ny 2\n");
}

#[test]
fn foreach_else_runs_for_empty_source() {
    let (_, output) = run_program(vec![
        json!({
            "node": "foreach",
            "source": list(vec![]),
            "value": "v",
            "body": block(vec![print(vec![id("v")])]),
            "otherwise": block(vec![print(vec![string("empty")])]),
        }),
        json!({
            "node": "foreach",
            "source": list(vec![num(1)]),
            "value": "v",
            "body": block(vec![print(vec![id("v")])]),
            "otherwise": block(vec![print(vec![string("not reached")])]),
        }),
    ]);
    assert_eq!(output, "empty\n1\n");
}

fn switch_on(subject: i64) -> Value {
    json!({
        "node": "switch",
        "subject": num(subject),
        "cases": [
            {"body": [print(vec![string("default")])]},
            {"test": num(1), "body": [print(vec![string("one")])]},
            {"test": num(2), "body": [print(vec![string("two")])]},
            {"test": num(3), "body": [print(vec![string("three")]), {"node": "break"}]},
            {"test": num(4), "body": [print(vec![string("four")])]},
        ],
    })
}

/// A matching case falls through the following bodies until a break. The
/// default is laid out after the last case wherever it was declared.
#[test]
fn switch_falls_through_and_defaults_last() {
    let (_, output) = run_program(vec![
        switch_on(2),
        print(vec![string("--")]),
        switch_on(4),
        print(vec![string("--")]),
        switch_on(9),
    ]);
    assert_eq!(output, "two\nthree\n--\nfour\ndefault\n--\ndefault\n");
}

/// A switch with no default and no matching case runs nothing. Repeating it
/// many times in a loop would overflow the value or block stack if either leaked.
#[test]
fn switch_without_default_matches_nothing() {
    let switch = json!({
        "node": "switch",
        "subject": id("i"),
        "cases": [
            {"test": num(-100), "body": [print(vec![string("a")])]},
            {"test": num(-200), "body": [print(vec![string("b")])]},
            {"test": num(-300), "body": [print(vec![string("c")])]},
        ],
    });
    let (code, output) = run_program(vec![
        assign("i", num(0)),
        json!({
            "node": "while",
            "condition": cmp("<", id("i"), num(2000)),
            "body": block(vec![switch, add_assign("i", num(1))]),
        }),
        print(vec![id("i")]),
        json!({"node": "return", "value": num(3)}),
    ]);
    assert_eq!((code, output.as_str()), (3, "2000\n"));
}

#[test]
fn goto_jumps_to_label() {
    let (_, output) = run_program(vec![
        json!({"node": "goto", "label": "skip"}),
        print(vec![string("skipped")]),
        json!({"node": "label", "name": "skip"}),
        print(vec![string("reached")]),
    ]);
    assert_eq!(output, "reached\n");
}

#[test]
fn return_value_becomes_exit_code() {
    let (code, _) = run_program(vec![json!({"node": "return", "value": num(7)})]);
    assert_eq!(code, 7);
    let (code, _) = run_program(vec![json!({"node": "return", "value": string("seven")})]);
    assert_eq!(code, 0, "a non-numerical return value exits with 0");
}

// =============================================================================
// 3. Datastructures
// =============================================================================

#[test]
fn list_methods_and_subscripts() {
    let (_, output) = run_program(vec![
        assign("l", list(vec![num(1), num(2), num(3)])),
        print(vec![method_call(id("l"), "length", vec![])]),
        // l[] = 4
        json!({"node": "assignment", "target": {"node": "subscript", "object": id("l")}, "value": num(4)}),
        // l[0] = 9
        json!({
            "node": "assignment",
            "target": {"node": "subscript", "object": id("l"), "start": num(0)},
            "value": num(9),
        }),
        print(vec![id("l")]),
        print(vec![json!({"node": "subscript", "object": id("l"), "start": num(1)})]),
        print(vec![json!({"node": "subscript", "object": id("l"), "start": num(0), "end": num(2), "slice": true})]),
        print(vec![json!({"node": "subscript", "object": id("l"), "start": num(2), "slice": true})]),
        print(vec![json!({"node": "subscript", "object": id("l"), "start": num(99)})]),
        print(vec![method_call(id("l"), "has", vec![num(9)]), method_call(id("l"), "keys", vec![])]),
    ]);
    assert_eq!(output, "3\n[9, 2, 3, 4]\n2\n[9, 2]\n[3, 4]\nnull\ntrue [0, 1, 2, 3]\n");
}

#[test]
fn hash_set_get_and_keys() {
    let (_, output) = run_program(vec![
        assign(
            "h",
            json!({"node": "call", "callee": id("hash"), "args": []}),
        ),
        json!({
            "node": "assignment",
            "target": {"node": "subscript", "object": id("h"), "start": string("b")},
            "value": num(2),
        }),
        json!({
            "node": "assignment",
            "target": {"node": "subscript", "object": id("h"), "start": string("a")},
            "value": num(1),
        }),
        json!({
            "node": "assignment",
            "target": {"node": "subscript", "object": id("h"), "start": string("b")},
            "value": num(3),
        }),
        print(vec![id("h"), method_call(id("h"), "length", vec![])]),
        print(vec![method_call(id("h"), "keys", vec![])]),
        print(vec![cmp("in", string("a"), id("h")), cmp("in", string("z"), id("h"))]),
    ]);
    assert_eq!(output, "{\"b\": 3, \"a\": 1} 2\n[\"b\", \"a\"]\ntrue false\n");
}

#[test]
fn tuples_are_immutable_values() {
    let (_, output) = run_program(vec![
        assign("t", json!({"node": "call", "callee": id("tuple"), "args": [num(1), num(2), num(3)]})),
        print(vec![id("t"), method_call(id("t"), "length", vec![])]),
        print(vec![json!({"node": "subscript", "object": id("t"), "start": num(1), "end": num(3), "slice": true})]),
    ]);
    assert_eq!(output, "(1, 2, 3) 3\n(2, 3)\n");
}

#[test]
fn import_binds_builtin_class() {
    let (_, output) = run_program(vec![
        json!({"node": "import", "class": "list", "alias": "L", "module": "::saffire"}),
        json!({"node": "import", "class": "Exception", "module": "saffire"}),
        print(vec![id("L"), id("Exception")]),
        print(vec![json!({"node": "call", "callee": id("L"), "args": [num(1)]})]),
    ]);
    assert_eq!(output, "<class list> <class Exception>\n[1]\n");
}
