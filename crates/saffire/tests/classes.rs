//! Tests for classes: construction, properties, methods, inheritance,
//! visibility, interfaces and operator overloading.

use pretty_assertions::assert_eq;
use saffire::{CollectStringPrint, CompileOptions, Error, ExcType, NoLimitTracker, Runner, ast::Node};
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

fn method_call(object: Value, name: &str, args: Vec<Value>) -> Value {
    call(property(object, name), args)
}

fn assign(target: Value, value: Value) -> Value {
    json!({"node": "assignment", "target": target, "value": value})
}

fn ret(value: Value) -> Value {
    json!({"node": "return", "value": value})
}

fn block(statements: Vec<Value>) -> Value {
    json!({"node": "block", "statements": statements})
}

fn method(name: &str, params: &[&str], body: Vec<Value>) -> Value {
    let params: Vec<Value> = params.iter().map(|name| json!({"name": name})).collect();
    json!({"name": name, "kind": "method", "params": params, "body": block(body)})
}

fn prop(name: &str, value: Value) -> Value {
    json!({"name": name, "kind": "property", "value": value})
}

fn class(name: &str, attributes: Vec<Value>) -> Value {
    json!({"node": "class", "name": name, "attributes": attributes})
}

/// Wraps `statement` so an exception of `class` prints `label` instead of escaping.
fn expect_exception(statement: Value, class: &str, label: &str) -> Value {
    json!({
        "node": "try",
        "body": block(vec![statement]),
        "catches": [{"class": class, "var": "e", "body": block(vec![print(vec![string(label)])])}],
    })
}

fn run_program(body: Vec<Value>) -> String {
    let ast: Node = serde_json::from_value(json!({"node": "program", "body": body})).expect("valid tree");
    let runner = Runner::new(&ast, &CompileOptions::default()).expect("program should compile");
    let mut print = CollectStringPrint::new();
    runner.run(NoLimitTracker, &mut print).expect("program should run");
    print.into_output()
}

/// `class Point { x = 0; y = 0; __ctor(x, y = 5) {...}; sum() {...} }`
fn point_class() -> Value {
    let ctor = json!({
        "name": "__ctor",
        "kind": "method",
        "params": [{"name": "x"}, {"name": "y", "default": num(5)}],
        "body": block(vec![
            assign(property(id("self"), "x"), id("x")),
            assign(property(id("self"), "y"), id("y")),
        ]),
    });
    class(
        "Point",
        vec![
            prop("x", num(0)),
            prop("y", num(0)),
            ctor,
            method(
                "sum",
                &[],
                vec![ret(json!({
                    "node": "operator",
                    "op": "+",
                    "left": property(id("self"), "x"),
                    "right": property(id("self"), "y"),
                }))],
            ),
        ],
    )
}

// =============================================================================
// 1. Construction and methods
// =============================================================================

#[test]
fn constructor_sets_properties() {
    let output = run_program(vec![
        point_class(),
        assign(id("p"), call(id("Point"), vec![num(1), num(2)])),
        assign(id("q"), call(id("Point"), vec![num(10)])),
        print(vec![property(id("p"), "x"), property(id("p"), "y"), method_call(id("p"), "sum", vec![])]),
        print(vec![method_call(id("q"), "sum", vec![])]),
        print(vec![id("p"), id("Point")]),
    ]);
    assert_eq!(output, "1 2 3\n15\n<Point instance> <class Point>\n");
}

/// Each instance owns its own copy of the declared properties.
#[test]
fn instances_do_not_share_properties() {
    let output = run_program(vec![
        class("Counter", vec![prop("count", num(0))]),
        assign(id("a"), call(id("Counter"), vec![])),
        assign(id("b"), call(id("Counter"), vec![])),
        assign(property(id("a"), "count"), num(3)),
        print(vec![property(id("a"), "count"), property(id("b"), "count")]),
    ]);
    assert_eq!(output, "3 0\n");
}

#[test]
fn argument_count_is_checked() {
    let output = run_program(vec![
        point_class(),
        expect_exception(call(id("Point"), vec![]), "ArgumentException", "missing"),
        expect_exception(
            call(id("Point"), vec![num(1), num(2), num(3)]),
            "ArgumentException",
            "too many",
        ),
        expect_exception(
            call(id("Counter"), vec![num(1)]),
            "IdentifierException",
            "unknown class",
        ),
    ]);
    assert_eq!(output, "missing\ntoo many\nunknown class\n");
}

#[test]
fn constructor_cannot_be_called_directly() {
    let output = run_program(vec![
        point_class(),
        assign(id("p"), call(id("Point"), vec![num(1), num(2)])),
        expect_exception(method_call(id("p"), "__ctor", vec![num(3), num(4)]), "CallException", "refused"),
        print(vec![property(id("p"), "x")]),
    ]);
    assert_eq!(output, "refused\n1\n");
}

#[test]
fn static_methods_and_constants() {
    let double = json!({
        "name": "double",
        "kind": "method",
        "modifiers": {"static": true},
        "params": [{"name": "n"}],
        "body": block(vec![ret(json!({"node": "operator", "op": "*", "left": id("n"), "right": num(2)}))]),
    });
    let output = run_program(vec![
        class("Math", vec![json!({"name": "ANSWER", "kind": "constant", "value": num(42)}), double]),
        print(vec![property(id("Math"), "ANSWER"), method_call(id("Math"), "double", vec![num(21)])]),
        expect_exception(assign(property(id("Math"), "ANSWER"), num(1)), "AttributeException", "constant"),
        expect_exception(
            method_call(call(id("Math"), vec![]), "double", vec![num(1)]),
            "CallException",
            "static on instance",
        ),
        print(vec![property(id("Math"), "ANSWER")]),
    ]);
    assert_eq!(output, "42 42\nconstant\nstatic on instance\n42\n");
}

// =============================================================================
// 2. Inheritance
// =============================================================================

#[test]
fn subclass_overrides_and_calls_parent() {
    let animal = class(
        "Animal",
        vec![
            method("speak", &[], vec![ret(string("..."))]),
            method("describe", &[], vec![ret(method_call(id("self"), "speak", vec![]))]),
        ],
    );
    let dog = json!({
        "node": "class",
        "name": "Dog",
        "extends": id("Animal"),
        "attributes": [method("speak", &[], vec![ret(json!({
            "node": "operator",
            "op": "+",
            "left": method_call(id("parent"), "speak", vec![]),
            "right": string("woof"),
        }))])],
    });
    let output = run_program(vec![
        animal,
        dog,
        assign(id("d"), call(id("Dog"), vec![])),
        print(vec![method_call(id("d"), "speak", vec![])]),
        print(vec![method_call(id("d"), "describe", vec![])]),
        print(vec![
            json!({"node": "comparison", "op": "instanceof", "left": id("d"), "right": id("Animal")}),
            json!({"node": "comparison", "op": "instanceof", "left": call(id("Animal"), vec![]), "right": id("Dog")}),
        ]),
    ]);
    assert_eq!(output, "...woof\n...woof\ntrue false\n");
}

#[test]
fn final_class_cannot_be_extended() {
    let output = run_program(vec![
        json!({"node": "class", "name": "Sealed", "modifiers": {"final": true}}),
        expect_exception(
            json!({"node": "class", "name": "Open", "extends": id("Sealed")}),
            "TypeException",
            "final",
        ),
    ]);
    assert_eq!(output, "final\n");
}

#[test]
fn abstract_class_cannot_be_instantiated() {
    let shape = json!({
        "node": "class",
        "name": "Shape",
        "modifiers": {"abstract": true},
        "attributes": [{"name": "area", "kind": "method", "modifiers": {"abstract": true}}],
    });
    let square = json!({
        "node": "class",
        "name": "Square",
        "extends": id("Shape"),
        "attributes": [method("area", &[], vec![ret(num(16))])],
    });
    let output = run_program(vec![
        shape,
        square,
        expect_exception(call(id("Shape"), vec![]), "CallException", "abstract"),
        print(vec![method_call(call(id("Square"), vec![]), "area", vec![])]),
    ]);
    assert_eq!(output, "abstract\n16\n");
}

// =============================================================================
// 3. Visibility and access
// =============================================================================

#[test]
fn private_members_are_hidden_outside_the_class() {
    let safe = class(
        "Safe",
        vec![
            json!({"name": "secret", "kind": "property", "visibility": "private", "value": num(42)}),
            method("reveal", &[], vec![ret(property(id("self"), "secret"))]),
        ],
    );
    let output = run_program(vec![
        safe,
        assign(id("s"), call(id("Safe"), vec![])),
        print(vec![method_call(id("s"), "reveal", vec![])]),
        expect_exception(print(vec![property(id("s"), "secret")]), "VisibilityException", "hidden"),
        expect_exception(print(vec![property(id("s"), "missing")]), "AttributeException", "missing"),
    ]);
    assert_eq!(output, "42\nhidden\nmissing\n");
}

/// A read-only property can be written from inside its class only.
#[test]
fn readonly_property_is_writable_from_its_class() {
    let config = class(
        "Config",
        vec![
            json!({"name": "level", "kind": "property", "access": "read_only", "value": num(1)}),
            method("raise", &[], vec![assign(property(id("self"), "level"), num(2))]),
        ],
    );
    let output = run_program(vec![
        config,
        assign(id("c"), call(id("Config"), vec![])),
        method_call(id("c"), "raise", vec![]),
        print(vec![property(id("c"), "level")]),
        expect_exception(assign(property(id("c"), "level"), num(3)), "AttributeException", "read-only"),
        print(vec![property(id("c"), "level")]),
    ]);
    assert_eq!(output, "2\nread-only\n2\n");
}

// =============================================================================
// 4. Interfaces
// =============================================================================

#[test]
fn classes_must_conform_to_their_interfaces() {
    let greeter = json!({
        "node": "interface",
        "name": "Greeter",
        "attributes": [{"name": "greet", "kind": "method"}],
    });
    let hello = json!({
        "node": "class",
        "name": "Hello",
        "implements": [id("Greeter")],
        "attributes": [method("greet", &[], vec![ret(string("hi"))])],
    });
    let broken = json!({"node": "class", "name": "Broken", "implements": [id("Greeter")]});
    let output = run_program(vec![
        greeter,
        hello,
        assign(id("h"), call(id("Hello"), vec![])),
        print(vec![
            method_call(id("h"), "greet", vec![]),
            json!({"node": "comparison", "op": "instanceof", "left": id("h"), "right": id("Greeter")}),
            id("Greeter"),
        ]),
        expect_exception(broken, "InterfaceException", "nonconforming"),
        expect_exception(call(id("Greeter"), vec![]), "CallException", "interface"),
    ]);
    assert_eq!(output, "hi true <interface Greeter>\nnonconforming\ninterface\n");
}

// =============================================================================
// 5. Operator overloading
// =============================================================================

#[test]
fn operators_dispatch_to_overload_methods() {
    let ctor = method("__ctor", &["v"], vec![assign(property(id("self"), "v"), id("v"))]);
    let add = method(
        "__opr_add",
        &["other"],
        vec![ret(call(
            id("Money"),
            vec![json!({
                "node": "operator",
                "op": "+",
                "left": property(id("self"), "v"),
                "right": property(id("other"), "v"),
            })],
        ))],
    );
    let output = run_program(vec![
        class("Money", vec![prop("v", num(0)), ctor, add]),
        assign(
            id("total"),
            json!({
                "node": "operator",
                "op": "+",
                "left": call(id("Money"), vec![num(1)]),
                "right": call(id("Money"), vec![num(2)]),
            }),
        ),
        print(vec![property(id("total"), "v")]),
        expect_exception(
            json!({"node": "operator", "op": "-", "left": id("total"), "right": num(1)}),
            "TypeException",
            "no overload",
        ),
    ]);
    assert_eq!(output, "3\nno overload\n");
}

#[test]
fn uncaught_error_from_a_method_reports_its_kind() {
    let ast: Node = serde_json::from_value(json!({"node": "program", "body": [
        point_class(),
        call(id("Point"), vec![]),
    ]}))
    .expect("valid tree");
    let runner = Runner::new(&ast, &CompileOptions::default()).expect("program should compile");
    let err = runner
        .run(NoLimitTracker, &mut CollectStringPrint::new())
        .expect_err("the constructor needs an argument");
    let Error::Runtime(exc) = err else {
        panic!("expected a runtime exception, got {err:?}");
    };
    assert_eq!(exc.exc_type(), Some(ExcType::ArgumentException));
}
