//! Tests for the execution tracers passed to `Runner::run_traced`.

use pretty_assertions::assert_eq;
use saffire::{
    CompileOptions, CoverageTracer, NoLimitTracker, NoPrint, ProfilingTracer, RecordingTracer, Runner, TraceEvent,
    ast::Node, bytecode::Opcode,
};
use serde_json::{Value, json};

fn id(name: &str) -> Value {
    json!({"node": "identifier", "name": name})
}

fn num(value: i64) -> Value {
    json!({"node": "number", "value": value})
}

fn block(statements: Vec<Value>) -> Value {
    json!({"node": "block", "statements": statements})
}

/// One method call, one caught exception and a three-step loop.
fn runner() -> Runner {
    let tree = json!({"node": "program", "body": [
        {"node": "class", "name": "Doubler", "attributes": [
            {"name": "twice", "kind": "method", "params": [{"name": "n"}], "body": block(vec![
                json!({"node": "return", "value": {"node": "operator", "op": "*", "left": id("n"), "right": num(2)}}),
            ])},
        ]},
        {"node": "assignment", "target": id("x"), "value": {
            "node": "call",
            "callee": {"node": "property", "object": {"node": "call", "callee": id("Doubler"), "args": []}, "name": "twice"},
            "args": [num(4)],
        }},
        {"node": "try",
         "body": block(vec![json!({"node": "throw", "value": {"node": "call", "callee": id("Exception"), "args": []}})]),
         "catches": [{"class": "Exception", "var": "e", "body": block(vec![])}]},
        {"node": "while",
         "condition": {"node": "comparison", "op": "<", "left": id("x"), "right": num(11)},
         "body": block(vec![json!({"node": "assignment", "op": "+", "target": id("x"), "value": num(1)})])},
    ]});
    let ast: Node = serde_json::from_value(tree).expect("valid tree");
    Runner::new(&ast, &CompileOptions::default()).expect("program should compile")
}

fn record() -> Vec<TraceEvent> {
    let mut tracer = RecordingTracer::new();
    runner()
        .run_traced(NoLimitTracker, &mut NoPrint, &mut tracer)
        .expect("program should run");
    tracer.into_events()
}

fn instruction_count(events: &[TraceEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, TraceEvent::Instruction { .. }))
        .count()
}

// =============================================================================
// 1. RecordingTracer
// =============================================================================

#[test]
fn recording_starts_at_the_main_frame() {
    let events = record();
    match events.first() {
        Some(TraceEvent::Instruction { frame, ip, .. }) => {
            assert_eq!((frame.as_str(), *ip), ("main", 0));
        }
        other => panic!("expected an instruction first, got {other:?}"),
    }
    assert_eq!(events.last(), Some(&TraceEvent::Return { depth: 0 }), "main frame returns last");
}

#[test]
fn recording_sees_calls_and_exception_blocks() {
    let events = record();
    let structural: Vec<&TraceEvent> = events
        .iter()
        .filter(|event| !matches!(event, TraceEvent::Instruction { .. }))
        .collect();
    assert_eq!(
        structural,
        vec![
            &TraceEvent::Call {
                frame: "Doubler::twice".to_owned(),
                depth: 2
            },
            &TraceEvent::Return { depth: 1 },
            &TraceEvent::ExceptionPush { depth: 1 },
            &TraceEvent::ExceptionPop { depth: 0 },
            &TraceEvent::Return { depth: 0 },
        ]
    );
    assert!(
        events.iter().any(|event| matches!(
            event,
            TraceEvent::Instruction { frame, opcode: Opcode::Operator, .. } if frame == "Doubler::twice"
        )),
        "the method body should be traced under its own frame name"
    );
}

#[test]
fn recording_limit_caps_events() {
    let mut tracer = RecordingTracer::with_limit(5);
    runner()
        .run_traced(NoLimitTracker, &mut NoPrint, &mut tracer)
        .expect("program should run");
    assert_eq!(tracer.events().len(), 5);
}

// =============================================================================
// 2. ProfilingTracer and CoverageTracer
// =============================================================================

#[test]
fn profiling_report_matches_the_recorded_run() {
    let recorded = instruction_count(&record());

    let mut tracer = ProfilingTracer::new();
    runner()
        .run_traced(NoLimitTracker, &mut NoPrint, &mut tracer)
        .expect("program should run");
    let report = tracer.report();

    assert_eq!(usize::try_from(report.total_instructions).unwrap(), recorded);
    assert_eq!(
        report.opcode_counts.iter().map(|(_, count)| count).sum::<u64>(),
        report.total_instructions
    );
    assert_eq!(report.total_calls, 1);
    assert_eq!(report.try_blocks, 1);
    assert_eq!(report.max_depth, 2);
    let rendered = report.to_string();
    assert!(rendered.contains("Total calls:        1"), "report:\n{rendered}");
}

#[test]
fn coverage_counts_each_offset_once() {
    let recorded = instruction_count(&record());

    let mut tracer = CoverageTracer::new();
    runner()
        .run_traced(NoLimitTracker, &mut NoPrint, &mut tracer)
        .expect("program should run");

    assert!(tracer.is_covered("main", 0));
    assert!(!tracer.is_covered("main", usize::MAX));
    assert!(tracer.coverage_count() > 0);
    assert!(
        tracer.coverage_count() < recorded,
        "the loop body runs more than once, so unique offsets must be fewer than dispatched instructions"
    );
}
