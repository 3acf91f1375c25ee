//! Tests for `try`/`catch`/`finally`, `throw`, uncaught exceptions and
//! resource limits.

use pretty_assertions::assert_eq;
use saffire::{
    CollectStringPrint, CompileOptions, Error, ExcType, Exception, LimitedTracker, NoLimitTracker, ResourceLimits,
    Runner, ast::Node,
};
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

fn print(args: Vec<Value>) -> Value {
    json!({"node": "call", "callee": id("print"), "args": args})
}

fn call(callee: Value, args: Vec<Value>) -> Value {
    json!({"node": "call", "callee": callee, "args": args})
}

fn property(object: Value, name: &str) -> Value {
    json!({"node": "property", "object": object, "name": name})
}

fn block(statements: Vec<Value>) -> Value {
    json!({"node": "block", "statements": statements})
}

fn throw(value: Value) -> Value {
    json!({"node": "throw", "value": value})
}

fn catch(class: &str, var: &str, body: Vec<Value>) -> Value {
    json!({"class": class, "var": var, "body": block(body)})
}

/// `class <name> extends Exception {}`
fn exception_class(name: &str) -> Value {
    json!({"node": "class", "name": name, "extends": id("Exception")})
}

fn compile(body: Vec<Value>) -> Runner {
    let ast: Node = serde_json::from_value(json!({"node": "program", "body": body})).expect("valid tree");
    Runner::new(&ast, &CompileOptions::default()).expect("program should compile")
}

fn run_program(body: Vec<Value>) -> (i64, String) {
    let mut print = CollectStringPrint::new();
    let code = compile(body)
        .run(NoLimitTracker, &mut print)
        .expect("program should run");
    (code, print.into_output())
}

/// Runs a program that must end with an uncaught exception.
fn run_uncaught(body: Vec<Value>) -> (Exception, String) {
    let mut print = CollectStringPrint::new();
    match compile(body).run(NoLimitTracker, &mut print) {
        Err(Error::Runtime(exc)) => (exc, print.into_output()),
        other => panic!("expected an uncaught exception, got {other:?}"),
    }
}

// =============================================================================
// 1. Catching
// =============================================================================

#[test]
fn catch_clauses_match_by_class() {
    let (_, output) = run_program(vec![
        exception_class("MyError"),
        json!({
            "node": "try",
            "body": block(vec![throw(call(id("MyError"), vec![string("boom")]))]),
            "catches": [
                catch("TypeException", "e", vec![print(vec![string("wrong clause")])]),
                catch("MyError", "e", vec![print(vec![string("caught"), property(id("e"), "message")])]),
            ],
        }),
        print(vec![string("after")]),
    ]);
    assert_eq!(output, "caught boom\nafter\n");
}

#[test]
fn catch_by_base_class() {
    let (_, output) = run_program(vec![
        exception_class("MyError"),
        json!({
            "node": "try",
            "body": block(vec![throw(call(id("MyError"), vec![]))]),
            "catches": [catch("Exception", "e", vec![print(vec![string("base"), property(id("e"), "message")])])],
        }),
    ]);
    assert_eq!(output, "base null\n");
}

#[test]
fn errors_raised_by_the_vm_are_catchable() {
    let guarded = |statement: Value, class: &str, label: &str| {
        json!({
            "node": "try",
            "body": block(vec![statement]),
            "catches": [catch(class, "e", vec![print(vec![string(label)])])],
        })
    };
    let (_, output) = run_program(vec![
        guarded(
            json!({"node": "assignment", "target": id("x"),
                   "value": {"node": "operator", "op": "/", "left": num(1), "right": num(0)}}),
            "ArithmeticException",
            "division",
        ),
        guarded(
            json!({"node": "assignment", "target": id("y"),
                   "value": {"node": "operator", "op": "-", "left": string("a"), "right": num(1)}}),
            "TypeException",
            "operands",
        ),
        guarded(print(vec![id("undefined_name")]), "IdentifierException", "identifier"),
        guarded(call(num(3), vec![]), "CallException", "call"),
        guarded(
            json!({"node": "import", "class": "Nope", "module": "::saffire"}),
            "ImportException",
            "import",
        ),
        guarded(throw(num(1)), "TypeException", "throw"),
    ]);
    assert_eq!(output, "division\noperands\nidentifier\ncall\nimport\nthrow\n");
}

#[test]
fn unmatched_exception_runs_finally_then_propagates() {
    let inner = json!({
        "node": "try",
        "body": block(vec![throw(call(id("MyError"), vec![string("inner")]))]),
        "catches": [catch("TypeException", "e", vec![print(vec![string("wrong clause")])])],
        "finally": block(vec![print(vec![string("inner finally")])]),
    });
    let (_, output) = run_program(vec![
        exception_class("MyError"),
        json!({
            "node": "try",
            "body": block(vec![inner]),
            "catches": [catch("MyError", "e", vec![print(vec![string("outer"), property(id("e"), "message")])])],
        }),
    ]);
    assert_eq!(output, "inner finally\nouter inner\n");
}

#[test]
fn exception_thrown_in_catch_still_runs_finally() {
    let inner = json!({
        "node": "try",
        "body": block(vec![throw(call(id("Exception"), vec![string("first")]))]),
        "catches": [catch("Exception", "e", vec![throw(call(id("Exception"), vec![string("second")]))])],
        "finally": block(vec![print(vec![string("finally")])]),
    });
    let (_, output) = run_program(vec![json!({
        "node": "try",
        "body": block(vec![inner]),
        "catches": [catch("Exception", "e", vec![print(vec![property(id("e"), "message")])])],
    })]);
    assert_eq!(output, "finally\nsecond\n");
}

// =============================================================================
// 2. Finally
// =============================================================================

#[test]
fn finally_runs_after_normal_completion_and_after_catch() {
    let (_, output) = run_program(vec![
        json!({
            "node": "try",
            "body": block(vec![print(vec![string("body")])]),
            "finally": block(vec![print(vec![string("finally")])]),
        }),
        json!({
            "node": "try",
            "body": block(vec![throw(call(id("Exception"), vec![]))]),
            "catches": [catch("Exception", "e", vec![print(vec![string("catch")])])],
            "finally": block(vec![print(vec![string("finally")])]),
        }),
    ]);
    assert_eq!(output, "body\nfinally\ncatch\nfinally\n");
}

/// A `return` inside `try` runs the finally body exactly once before leaving.
#[test]
fn return_through_finally_runs_it_once() {
    let (code, output) = run_program(vec![json!({
        "node": "try",
        "body": block(vec![json!({"node": "return", "value": num(5)})]),
        "finally": block(vec![print(vec![string("finally")])]),
    })]);
    assert_eq!(output, "finally\n");
    assert_eq!(code, 5);
}

#[test]
fn break_and_continue_through_finally() {
    let (_, output) = run_program(vec![
        json!({
            "node": "while",
            "condition": id("true"),
            "body": block(vec![json!({
                "node": "try",
                "body": block(vec![json!({"node": "break"})]),
                "finally": block(vec![print(vec![string("cleanup")])]),
            })]),
        }),
        print(vec![string("after")]),
        json!({
            "node": "for",
            "init": {"node": "assignment", "target": id("i"), "value": num(0)},
            "condition": {"node": "comparison", "op": "<", "left": id("i"), "right": num(3)},
            "step": {"node": "assignment", "op": "+", "target": id("i"), "value": num(1)},
            "body": block(vec![json!({
                "node": "try",
                "body": block(vec![
                    json!({
                        "node": "if",
                        "condition": {"node": "comparison", "op": "==", "left": id("i"), "right": num(1)},
                        "then": {"node": "continue"},
                    }),
                    print(vec![id("i")]),
                ]),
                "finally": block(vec![print(vec![string("f")])]),
            })]),
        }),
    ]);
    assert_eq!(output, "cleanup\nafter\n0\nf\nf\n2\nf\n");
}

/// Each finally body closes its own try block, innermost first.
#[test]
fn nested_try_blocks_close_innermost_first() {
    let (code, output) = run_program(vec![
        json!({
            "node": "try",
            "body": block(vec![
                json!({
                    "node": "try",
                    "body": block(vec![throw(call(id("Exception"), vec![]))]),
                    "finally": block(vec![print(vec![string("inner finally")])]),
                }),
                print(vec![string("unreached")]),
            ]),
            "catches": [catch("Exception", "e", vec![print(vec![string("outer catch")])])],
            "finally": block(vec![print(vec![string("outer finally")])]),
        }),
        json!({
            "node": "try",
            "body": block(vec![json!({
                "node": "try",
                "body": block(vec![print(vec![string("body")])]),
                "catches": [catch("Exception", "e", vec![print(vec![string("unreached")])])],
                "finally": block(vec![print(vec![string("first")])]),
            })]),
            "finally": block(vec![print(vec![string("second")])]),
        }),
        json!({"node": "return", "value": num(1)}),
    ]);
    assert_eq!(
        (code, output.as_str()),
        (1, "inner finally\nouter catch\nouter finally\nbody\nfirst\nsecond\n")
    );
}

// =============================================================================
// 3. Uncaught exceptions
// =============================================================================

#[test]
fn uncaught_exception_reports_class_message_and_line() {
    let (exc, output) = run_uncaught(vec![
        json!({"line": 1, "node": "class", "name": "MyError", "extends": id("Exception")}),
        json!({"line": 2, "node": "call", "callee": id("print"), "args": [string("before")]}),
        json!({"line": 3, "node": "throw", "value": call(id("MyError"), vec![string("boom")])}),
        json!({"line": 4, "node": "call", "callee": id("print"), "args": [string("not reached")]}),
    ]);
    assert_eq!(output, "before\n");
    assert_eq!(exc.class_name(), "MyError");
    assert_eq!(exc.message(), Some("boom"));
    assert_eq!(exc.exc_type(), None, "a user class is not one of the builtin kinds");
    assert_eq!(exc.traceback().len(), 1);
    assert_eq!(exc.traceback()[0].frame_name, "main");
    assert_eq!(exc.traceback()[0].line, Some(3));
    assert_eq!(exc.to_string(), "Traceback (innermost first):\n  in main, line 3\nMyError: boom");
}

#[test]
fn uncaught_vm_error_keeps_its_kind() {
    let (exc, _) = run_uncaught(vec![print(vec![id("missing")])]);
    assert_eq!(exc.exc_type(), Some(ExcType::IdentifierException));
    assert_eq!(exc.class_name(), "IdentifierException");
    assert!(
        exc.message().is_some_and(|m| m.contains("missing")),
        "message should name the identifier: {exc}"
    );
}

#[test]
fn traceback_lists_frames_innermost_first() {
    let thrower = json!({
        "node": "class",
        "name": "Thrower",
        "attributes": [{
            "name": "fail",
            "kind": "method",
            "body": block(vec![throw(call(id("Exception"), vec![string("deep")]))]),
        }],
    });
    let (exc, _) = run_uncaught(vec![
        thrower,
        json!({"node": "assignment", "target": id("t"), "value": call(id("Thrower"), vec![])}),
        call(property(id("t"), "fail"), vec![]),
    ]);
    let frames: Vec<&str> = exc.traceback().iter().map(|f| f.frame_name.as_str()).collect();
    assert_eq!(frames, vec!["Thrower::fail", "main"]);
    assert_eq!(exc.message(), Some("deep"));
}

// =============================================================================
// 4. Resource limits
// =============================================================================

fn recursive_class() -> Value {
    json!({
        "node": "class",
        "name": "Deep",
        "attributes": [{
            "name": "recurse",
            "kind": "method",
            "body": block(vec![json!({
                "node": "return",
                "value": call(property(id("self"), "recurse"), vec![]),
            })]),
        }],
    })
}

#[test]
fn recursion_limit_is_a_resource_exception() {
    let runner = compile(vec![recursive_class(), call(property(call(id("Deep"), vec![]), "recurse"), vec![])]);
    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(Some(20)));
    let err = runner
        .run(tracker, &mut CollectStringPrint::new())
        .expect_err("unbounded recursion should fail");
    let Error::Runtime(exc) = err else {
        panic!("expected a runtime exception, got {err:?}");
    };
    assert_eq!(exc.exc_type(), Some(ExcType::ResourceException));
    assert_eq!(exc.traceback().len(), 20, "every frame up to the limit unwinds");
}

#[test]
fn recursion_limit_can_be_caught() {
    let runner = compile(vec![
        recursive_class(),
        json!({
            "node": "try",
            "body": block(vec![call(property(call(id("Deep"), vec![]), "recurse"), vec![])]),
            "catches": [catch("ResourceException", "e", vec![print(vec![string("too deep")])])],
        }),
    ]);
    let tracker = LimitedTracker::new(ResourceLimits::new().max_recursion_depth(Some(20)));
    let mut print = CollectStringPrint::new();
    runner.run(tracker, &mut print).expect("the exception is caught");
    assert_eq!(print.output(), "too deep\n");
}

/// The operation limit ends the run even inside a catch-all.
#[test]
fn operation_limit_cannot_be_caught() {
    let runner = compile(vec![json!({
        "node": "try",
        "body": block(vec![json!({"node": "while", "condition": id("true"), "body": block(vec![])})]),
        "catches": [catch("Exception", "e", vec![print(vec![string("caught")])])],
    })]);
    let tracker = LimitedTracker::new(ResourceLimits::new().max_operations(1_000));
    let mut print = CollectStringPrint::new();
    let err = runner.run(tracker, &mut print).expect_err("the loop never ends");
    let Error::Runtime(exc) = err else {
        panic!("expected a runtime exception, got {err:?}");
    };
    assert_eq!(exc.exc_type(), Some(ExcType::ResourceException));
    assert_eq!(print.output(), "", "the catch clause must not run");
}
