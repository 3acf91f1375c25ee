//! Tests for writing programs to `.sfc` bytecode files and running them back.

use pretty_assertions::assert_eq;
use saffire::{CollectStringPrint, CompileOptions, Error, LoadError, MarshalOptions, NoLimitTracker, Runner, ast::Node};
use serde_json::{Value, json};

fn id(name: &str) -> Value {
    json!({"node": "identifier", "name": name})
}

fn num(value: i64) -> Value {
    json!({"node": "number", "value": value})
}

fn print(args: Vec<Value>) -> Value {
    json!({"node": "call", "callee": id("print"), "args": args})
}

/// A program with a class, a loop and a string constant, so the file carries
/// nested code frames alongside the main frame.
fn sample_program() -> Node {
    let tree = json!({"line": 1, "node": "program", "body": [
        {"line": 1, "node": "class", "name": "Greeter", "attributes": [
            {"name": "greet", "kind": "method", "params": [{"name": "n"}], "body": {"node": "block", "statements": [
                {"line": 2, "node": "return", "value": {"node": "operator", "op": "*", "left": id("n"), "right": num(2)}},
            ]}},
        ]},
        {"line": 4, "node": "assignment", "target": id("g"), "value": {"node": "call", "callee": id("Greeter"), "args": []}},
        {"line": 5, "node": "for",
         "init": {"node": "assignment", "target": id("i"), "value": num(0)},
         "condition": {"node": "comparison", "op": "<", "left": id("i"), "right": num(3)},
         "step": {"node": "assignment", "op": "+", "target": id("i"), "value": num(1)},
         "body": {"node": "block", "statements": [
             print(vec![json!({
                 "node": "call",
                 "callee": {"node": "property", "object": id("g"), "name": "greet"},
                 "args": [id("i")],
             })]),
         ]}},
        {"line": 7, "node": "call", "callee": id("print"), "args": [{"node": "string", "value": "done"}]},
        {"line": 8, "node": "return", "value": num(7)},
    ]});
    serde_json::from_value(tree).expect("valid tree")
}

fn compile() -> Runner {
    Runner::new(&sample_program(), &CompileOptions::default()).expect("program should compile")
}

fn run(runner: &Runner) -> (i64, String) {
    let mut print = CollectStringPrint::new();
    let code = runner.run(NoLimitTracker, &mut print).expect("program should run");
    (code, print.into_output())
}

const EXPECTED_OUTPUT: &str = "0\n2\n4\ndone\n";

// =============================================================================
// 1. Loading written files
// =============================================================================

#[test]
fn loaded_file_runs_like_the_compiled_program() {
    let runner = compile();
    assert_eq!(run(&runner), (7, EXPECTED_OUTPUT.to_owned()));

    let bytes = runner.serialize(&MarshalOptions::default()).expect("serialize");
    let loaded = Runner::from_bytecode(&bytes, None).expect("file should load");
    assert_eq!(run(&loaded), (7, EXPECTED_OUTPUT.to_owned()), "loaded file should behave identically");
}

#[test]
fn compressed_file_runs() {
    let runner = compile();
    let plain = runner.serialize(&MarshalOptions::default()).expect("serialize");
    let compressed = runner
        .serialize(&MarshalOptions::default().compressed())
        .expect("serialize compressed");
    assert_ne!(plain, compressed, "compression should change the file contents");

    let loaded = Runner::from_bytecode(&compressed, None).expect("compressed file should load");
    assert_eq!(run(&loaded), (7, EXPECTED_OUTPUT.to_owned()));
}

#[test]
fn serialization_is_deterministic() {
    let runner = compile();
    let options = MarshalOptions {
        timestamp: 1_700_000_000,
        ..MarshalOptions::default()
    };
    let first = runner.serialize(&options).expect("serialize");
    let second = runner.serialize(&options).expect("serialize");
    assert_eq!(first, second);

    let reloaded = Runner::from_bytecode(&first, None).expect("load");
    let again = reloaded.serialize(&options).expect("serialize loaded");
    assert_eq!(first, again, "a loaded file should serialize to the same bytes");
}

// =============================================================================
// 2. Signatures
// =============================================================================

#[test]
fn signed_file_verifies_with_the_right_key() {
    let runner = compile();
    let bytes = runner
        .serialize(&MarshalOptions::default().compressed().signed(b"secret".to_vec()))
        .expect("serialize signed");

    let loaded = Runner::from_bytecode(&bytes, Some(b"secret")).expect("signature should verify");
    assert_eq!(run(&loaded), (7, EXPECTED_OUTPUT.to_owned()));

    let err = Runner::from_bytecode(&bytes, Some(b"wrong")).expect_err("wrong key must be rejected");
    assert!(matches!(err, Error::Load(LoadError::BadSignature)), "got {err:?}");
}

#[test]
fn signed_file_loads_without_a_key() {
    let bytes = compile()
        .serialize(&MarshalOptions::default().signed(b"secret".to_vec()))
        .expect("serialize signed");
    assert!(Runner::from_bytecode(&bytes, None).is_ok());
}

#[test]
fn key_for_an_unsigned_file_is_rejected() {
    let bytes = compile().serialize(&MarshalOptions::default()).expect("serialize");
    let err = Runner::from_bytecode(&bytes, Some(b"secret")).expect_err("unsigned file with a key");
    assert!(matches!(err, Error::Load(LoadError::Unsigned)), "got {err:?}");
}

#[test]
fn tampered_signature_is_rejected() {
    let mut bytes = compile()
        .serialize(&MarshalOptions::default().signed(b"secret".to_vec()))
        .expect("serialize signed");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let err = Runner::from_bytecode(&bytes, Some(b"secret")).expect_err("tampered signature");
    assert!(matches!(err, Error::Load(LoadError::BadSignature)), "got {err:?}");
}

// =============================================================================
// 3. Corruption
// =============================================================================

#[test]
fn tampered_body_fails_the_checksum() {
    let mut bytes = compile().serialize(&MarshalOptions::default()).expect("serialize");
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    let err = Runner::from_bytecode(&bytes, None).expect_err("tampered body");
    assert!(matches!(err, Error::Load(LoadError::Crc { .. })), "got {err:?}");
}

#[test]
fn truncated_file_is_rejected() {
    let bytes = compile().serialize(&MarshalOptions::default()).expect("serialize");
    let err = Runner::from_bytecode(&bytes[..10], None).expect_err("truncated file");
    assert!(matches!(err, Error::Load(_)), "got {err:?}");
}

// =============================================================================
// 4. Listings
// =============================================================================

#[test]
fn loaded_file_disassembles_every_frame() {
    let bytes = compile().serialize(&MarshalOptions::default()).expect("serialize");
    let listing = Runner::from_bytecode(&bytes, None).expect("load").listing();
    assert!(listing.starts_with("frame main:"), "listing:\n{listing}");
    assert!(listing.contains("\nframe main#"), "method frame missing:\n{listing}");
    for opcode in ["LOAD_CONST", "BUILD_CLASS", "CALL", "RETURN"] {
        assert!(listing.contains(opcode), "{opcode} missing:\n{listing}");
    }
}

#[test]
fn compiled_program_lists_assembly() {
    let listing = compile().listing();
    assert!(listing.contains("main"), "listing:\n{listing}");
    assert!(listing.contains("BUILD_CLASS"), "listing:\n{listing}");
}
