//! Integration Tests for the Dataflow Engine
//!
//! These tests drive whole networks end to end: external writes, delta
//! propagation, firing, command round-trips, sub-network expansion, and
//! snapshot persistence.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;

use conflux_core::engine::{Completion, Engine, NullDispatcher};
use conflux_core::persist;
use conflux_core::value::Payload;
use conflux_core::{
    Command, Error, FiringState, FunctionDef, FunctionRegistry, RecordType, RunInput, RunOutput,
    Type, Value,
};

/// `math::add`: two required int inputs, one int sum output.
fn register_add(funcs: &mut FunctionRegistry) {
    let inputs = RecordType::new()
        .field("x", Type::Int, true)
        .unwrap()
        .field("y", Type::Int, true)
        .unwrap();
    let outputs = RecordType::new().field("sum", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "math::add",
                inputs,
                outputs,
                Arc::new(|input: &RunInput, out: &mut RunOutput| {
                    let x = input.get_input("x")?.and_then(Payload::as_int).unwrap_or(0);
                    let y = input.get_input("y")?.and_then(Payload::as_int).unwrap_or(0);
                    out.set_out("sum", Value::int(x + y))?;
                    Ok(())
                }),
            )
            .unwrap(),
        )
        .unwrap();
}

fn add_registry() -> FunctionRegistry {
    let mut funcs = FunctionRegistry::new();
    register_add(&mut funcs);
    funcs
}

fn engine_with(funcs: FunctionRegistry, dir: &std::path::Path) -> Engine {
    Engine::new(funcs, Arc::new(NullDispatcher::default()), dir)
}

fn int_at(engine: &Engine, path: &str) -> i64 {
    engine
        .value(path)
        .unwrap()
        .payload()
        .and_then(Payload::as_int)
        .unwrap()
}

/// Two writes, one fire, one sum.
#[test]
fn two_term_add() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(add_registry(), dir.path());

    engine.add_instance("a", "math::add").unwrap();
    engine.write("a:in.x", Value::int(2)).unwrap();
    engine.write("a:in.y", Value::int(3)).unwrap();
    engine.run_until_quiescent().unwrap();

    assert_eq!(int_at(&engine, "a:out.sum"), 5);
    let status = engine.status("a").unwrap();
    assert_eq!(status.state, FiringState::Done);
    assert_eq!(status.fire_count, 1);
    assert!(status.last_error.is_none());
    assert!(engine.quiescent());
}

/// An output feeding a downstream input propagates across the connection.
#[test]
fn chained_adds_propagate() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(add_registry(), dir.path());

    engine.add_instance("a", "math::add").unwrap();
    engine.add_instance("b", "math::add").unwrap();
    engine.connect("a:out.sum", "b:in.x").unwrap();

    engine.write("a:in.x", Value::int(2)).unwrap();
    engine.write("a:in.y", Value::int(3)).unwrap();
    engine.write("b:in.y", Value::int(8)).unwrap();
    engine.run_until_quiescent().unwrap();

    assert_eq!(int_at(&engine, "b:out.sum"), 13);
    assert_eq!(engine.status("a").unwrap().fire_count, 1);
    assert_eq!(engine.status("b").unwrap().fire_count, 1);
}

/// A batch of writes queued before the loop runs lands in one turn: the
/// list consumer fires exactly once and sees every element.
#[test]
fn list_batch_fires_once() {
    let mut funcs = FunctionRegistry::new();
    let inputs = RecordType::new()
        .field("terms", Type::list(Type::Int), true)
        .unwrap();
    let outputs = RecordType::new().field("total", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "math::multi_add",
                inputs,
                outputs,
                Arc::new(|input: &RunInput, out: &mut RunOutput| {
                    let total: i64 = input
                        .get_input_value("terms")?
                        .items()
                        .map(|items| {
                            items
                                .iter()
                                .filter_map(Value::payload)
                                .filter_map(Payload::as_int)
                                .sum()
                        })
                        .unwrap_or(0);
                    out.set_out("total", Value::int(total))?;
                    Ok(())
                }),
            )
            .unwrap(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("m", "math::multi_add").unwrap();
    for i in 0..1000i64 {
        engine
            .write(&format!("m:in.terms[{i}]"), Value::int(i))
            .unwrap();
    }
    engine.run_until_quiescent().unwrap();

    assert_eq!(int_at(&engine, "m:out.total"), 499_500);
    assert_eq!(engine.status("m").unwrap().fire_count, 1);
}

/// Rewriting an input before the loop runs coalesces into one fire that
/// sees the latest value.
#[test]
fn double_write_coalesces() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(add_registry(), dir.path());

    engine.add_instance("a", "math::add").unwrap();
    engine.write("a:in.x", Value::int(2)).unwrap();
    engine.write("a:in.x", Value::int(4)).unwrap();
    engine.write("a:in.y", Value::int(3)).unwrap();
    engine.run_until_quiescent().unwrap();

    assert_eq!(int_at(&engine, "a:out.sum"), 7);
    assert_eq!(engine.status("a").unwrap().fire_count, 1);
}

/// Register `cmd::double`: offloads doubling to an external command and
/// publishes the result when the completion comes back.
fn register_double(funcs: &mut FunctionRegistry) {
    let inputs = RecordType::new().field("x", Type::Int, true).unwrap();
    let outputs = RecordType::new().field("out", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "cmd::double",
                inputs,
                outputs,
                Arc::new(|input: &RunInput, out: &mut RunOutput| {
                    if let Some(completion) = input.cmd() {
                        if let Some(value) = completion.values.get("result") {
                            out.set_out("out", value.clone())?;
                        }
                        return Ok(());
                    }
                    let x = input.get_input("x")?.and_then(Payload::as_int).unwrap_or(0);
                    out.add_command(Command::new("math/double").arg(Payload::Int(x)));
                    Ok(())
                }),
            )
            .unwrap()
            .stateful(),
        )
        .unwrap();
}

/// Full command lifecycle: fire dispatches, the instance blocks, the
/// completion re-fires it, and the result lands on the output tree.
#[test]
fn command_round_trip() {
    let mut funcs = FunctionRegistry::new();
    register_double(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(funcs, dispatcher.clone(), dir.path());

    engine.add_instance("d", "cmd::double").unwrap();
    engine.write("d:in.x", Value::int(21)).unwrap();
    engine.run_until_quiescent().unwrap();

    // Dispatched and blocked, awaiting the external worker.
    assert_eq!(engine.status("d").unwrap().state, FiringState::Blocked);
    let dispatched = dispatcher.dispatched.lock().clone();
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].command.key, "math/double");
    assert_eq!(dispatched[0].instance, "d");

    let mut values = IndexMap::new();
    values.insert("result".to_string(), Value::int(42));
    engine.complete_command(Completion::success(dispatched[0].id, values));
    engine.run_until_quiescent().unwrap();

    assert_eq!(int_at(&engine, "d:out.out"), 42);
    let status = engine.status("d").unwrap();
    assert_eq!(status.state, FiringState::Done);
    assert_eq!(status.fire_count, 2);
}

/// A failed completion surfaces its diagnostics on the instance and still
/// re-triggers the callback.
#[test]
fn failed_commands_surface_diagnostics() {
    let mut funcs = FunctionRegistry::new();
    register_double(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(funcs, dispatcher.clone(), dir.path());

    engine.add_instance("d", "cmd::double").unwrap();
    engine.write("d:in.x", Value::int(21)).unwrap();
    engine.run_until_quiescent().unwrap();
    let id = dispatcher.dispatched.lock()[0].id;

    engine.complete_command(Completion::failure(id, "exit status 1"));
    engine.run_until_quiescent().unwrap();

    let status = engine.status("d").unwrap();
    assert_eq!(status.state, FiringState::Done);
    let warning = status.last_warning.unwrap();
    assert!(warning.contains("failed"), "{warning}");
    assert!(warning.contains("exit status 1"), "{warning}");
}

/// Register `cmd::latest`: keeps only the newest request in flight,
/// aborting the previous command when fresh input supersedes it.
fn register_latest(funcs: &mut FunctionRegistry) {
    let inputs = RecordType::new().field("x", Type::Int, true).unwrap();
    let outputs = RecordType::new().field("out", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "cmd::latest",
                inputs,
                outputs,
                Arc::new(|input: &RunInput, out: &mut RunOutput| {
                    if let Some(completion) = input.cmd() {
                        if let Some(value) = completion.values.get("result") {
                            out.set_out("out", value.clone())?;
                        }
                        return Ok(());
                    }
                    let x = input.require_input("x")?.as_int().unwrap_or(0);
                    out.cancel_prev_commands();
                    out.add_command(Command::new("math/double").arg(Payload::Int(x)));
                    Ok(())
                }),
            )
            .unwrap()
            .stateful(),
        )
        .unwrap();
}

/// Fresh input while a command is outstanding supersedes it: the re-fire
/// aborts the stale command and only the newest one is left to complete.
#[test]
fn superseding_fire_cancels_outstanding_commands() {
    let mut funcs = FunctionRegistry::new();
    register_latest(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(funcs, dispatcher.clone(), dir.path());

    engine.add_instance("d", "cmd::latest").unwrap();
    engine.write("d:in.x", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();
    let first = dispatcher.dispatched.lock()[0].id;
    assert_eq!(engine.status("d").unwrap().state, FiringState::Blocked);

    // A newer request lands while the first command is still out.
    engine.write("d:in.x", Value::int(2)).unwrap();
    engine.run_until_quiescent().unwrap();

    assert_eq!(dispatcher.cancelled.lock().clone(), vec![first]);
    let dispatched = dispatcher.dispatched.lock().clone();
    assert_eq!(dispatched.len(), 2);
    assert_eq!(engine.status("d").unwrap().state, FiringState::Blocked);

    // Only the live command's completion lands.
    let mut values = IndexMap::new();
    values.insert("result".to_string(), Value::int(4));
    engine.complete_command(Completion::success(dispatched[1].id, values));
    engine.run_until_quiescent().unwrap();
    assert_eq!(int_at(&engine, "d:out.out"), 4);
    assert_eq!(engine.status("d").unwrap().fire_count, 3);
}

/// Shutdown drains outstanding commands before returning.
#[test]
fn shutdown_waits_for_completions() {
    let mut funcs = FunctionRegistry::new();
    register_double(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(funcs, dispatcher.clone(), dir.path());

    engine.add_instance("d", "cmd::double").unwrap();
    engine.write("d:in.x", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();
    let id = dispatcher.dispatched.lock()[0].id;

    engine.complete_command(Completion::success(id, IndexMap::new()));
    engine.shutdown(Duration::from_secs(1)).unwrap();

    // The completion was integrated; the re-armed fire is deliberately not
    // run during shutdown and survives in the inbox for after restart.
    assert_eq!(engine.status("d").unwrap().state, FiringState::Ready);
}

/// One failing instance never stops its neighbours; the staged output of
/// the failing fire is discarded wholesale.
#[test]
fn errors_are_contained() {
    let mut funcs = add_registry();
    let inputs = RecordType::new().field("x", Type::Int, true).unwrap();
    let outputs = RecordType::new().field("sum", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "lib::broken",
                inputs,
                outputs,
                Arc::new(|_: &RunInput, out: &mut RunOutput| {
                    // Staged before the error; must not survive it.
                    out.set_out("sum", Value::int(99))?;
                    out.set_error("bad");
                    Ok(())
                }),
            )
            .unwrap(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("a", "lib::broken").unwrap();
    engine.add_instance("b", "math::add").unwrap();
    engine.write("a:in.x", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();

    let a = engine.status("a").unwrap();
    assert_eq!(a.state, FiringState::Done);
    assert_eq!(a.last_error.as_deref(), Some("bad"));
    // The staged write was discarded with the error.
    assert!(matches!(
        engine.value("a:out.sum"),
        Err(Error::PathNotFound(_))
    ));

    let b = engine.status("b").unwrap();
    assert_eq!(b.state, FiringState::Held);
    assert_eq!(b.fire_count, 0);
}

/// A staged write to a path outside the output schema rejects the whole
/// staging: no sibling write from the same fire becomes visible.
#[test]
fn rejected_staging_applies_nothing() {
    let mut funcs = FunctionRegistry::new();
    let inputs = RecordType::new().field("x", Type::Int, true).unwrap();
    let outputs = RecordType::new().field("sum", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "lib::halfgood",
                inputs,
                outputs,
                Arc::new(|_: &RunInput, out: &mut RunOutput| {
                    out.set_out("sum", Value::int(99))?;
                    out.set_out("nope", Value::int(1))?;
                    Ok(())
                }),
            )
            .unwrap(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("a", "lib::halfgood").unwrap();
    engine.write("a:in.x", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();

    let status = engine.status("a").unwrap();
    assert_eq!(status.state, FiringState::Done);
    assert_eq!(status.last_error.as_deref(), Some("path not found: nope"));
    // The valid sibling write was rejected along with the bad one.
    assert!(matches!(
        engine.value("a:out.sum"),
        Err(Error::PathNotFound(_))
    ));
}

/// A failed expansion rolls the sub-network back wholesale: a valid child
/// staged alongside an unknown function never appears.
#[test]
fn rejected_expansion_rolls_back_children() {
    let mut funcs = add_registry();
    let inputs = RecordType::new().field("n", Type::Int, true).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "wf::hollow",
                inputs,
                RecordType::new(),
                Arc::new(|_: &RunInput, out: &mut RunOutput| {
                    out.add_instance("kid", "math::add");
                    out.add_instance("ghost", "lib::absent");
                    Ok(())
                }),
            )
            .unwrap()
            .stateful(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("wf", "wf::hollow").unwrap();
    engine.write("wf:in.n", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();

    let status = engine.status("wf").unwrap();
    assert_eq!(status.state, FiringState::Done);
    assert!(status.last_error.is_some());
    // The valid child went down with the batch.
    assert!(engine.status("wf/kid").is_err());
}

/// A panicking callback is contained the same way as a reported error.
#[test]
fn panics_are_contained() {
    let mut funcs = add_registry();
    funcs
        .register(
            FunctionDef::new(
                "lib::panics",
                RecordType::new().field("x", Type::Int, true).unwrap(),
                RecordType::new(),
                Arc::new(|_: &RunInput, _: &mut RunOutput| -> conflux_core::Result<()> {
                    panic!("boom")
                }),
            )
            .unwrap(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("p", "lib::panics").unwrap();
    engine.write("p:in.x", Value::int(1)).unwrap();
    engine.run_until_quiescent().unwrap();

    let status = engine.status("p").unwrap();
    assert_eq!(status.state, FiringState::Done);
    assert_eq!(status.last_error.as_deref(), Some("boom"));
}

/// Connections are type-checked at creation, and loops with no
/// command-emitting instance are rejected.
#[test]
fn structural_edits_are_validated() {
    let mut funcs = add_registry();
    funcs
        .register(
            FunctionDef::new(
                "lib::shout",
                RecordType::new().field("text", Type::Str, true).unwrap(),
                RecordType::new(),
                Arc::new(|_: &RunInput, _: &mut RunOutput| Ok(())),
            )
            .unwrap(),
        )
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("a", "math::add").unwrap();
    engine.add_instance("b", "math::add").unwrap();
    engine.add_instance("s", "lib::shout").unwrap();

    // int -> str is not assignable.
    assert!(matches!(
        engine.connect("a:out.sum", "s:in.text"),
        Err(Error::TypeMismatch { .. })
    ));

    // Connections read outputs and write inputs; sideways edges between
    // two input trees are rejected.
    assert!(matches!(
        engine.connect("a:in.x", "b:in.x"),
        Err(Error::PathParse(_, _))
    ));

    // a -> b -> a with both stateless closes a forbidden loop.
    engine.connect("a:out.sum", "b:in.x").unwrap();
    assert!(matches!(
        engine.connect("b:out.sum", "a:in.x"),
        Err(Error::CycleDetected(_, _))
    ));
}

/// Two sources into one destination: both propagate, the later connection
/// wins, and the network still settles deterministically.
#[test]
fn fan_in_last_writer_wins() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(add_registry(), dir.path());

    engine.add_instance("a", "math::add").unwrap();
    engine.add_instance("b", "math::add").unwrap();
    engine.add_instance("c", "math::add").unwrap();
    engine.connect("a:out.sum", "c:in.x").unwrap();
    engine.connect("b:out.sum", "c:in.x").unwrap();

    engine.write("a:in.x", Value::int(1)).unwrap();
    engine.write("a:in.y", Value::int(1)).unwrap();
    engine.write("b:in.x", Value::int(10)).unwrap();
    engine.write("b:in.y", Value::int(10)).unwrap();
    engine.write("c:in.y", Value::int(0)).unwrap();
    engine.run_until_quiescent().unwrap();

    // Both fired in creation order in one turn; b's propagation landed
    // after a's.
    assert_eq!(int_at(&engine, "c:in.x"), 20);
    assert_eq!(int_at(&engine, "c:out.sum"), 20);
}

/// Register `wf::fanout`: a composite that expands into three `math::add`
/// children and republishes the last child's sum.
fn register_fanout(funcs: &mut FunctionRegistry) {
    let inputs = RecordType::new().field("n", Type::Int, true).unwrap();
    let outputs = RecordType::new().field("total", Type::Int, false).unwrap();
    let sub_inputs = RecordType::new().field("total", Type::Int, false).unwrap();
    funcs
        .register(
            FunctionDef::new(
                "wf::fanout",
                inputs,
                outputs,
                Arc::new(|input: &RunInput, out: &mut RunOutput| {
                    if let Some(total) = input.get_sub_input("total")? {
                        let total = total.as_int().unwrap_or(0);
                        out.set_out("total", Value::int(total))?;
                        return Ok(());
                    }
                    for i in 0..3i64 {
                        let name = format!("t{i}");
                        out.add_instance(&name, "math::add");
                        out.add_connection(Some("self:ext_in.n"), &format!("{name}:in.x"), None)?;
                        out.add_connection(None, &format!("{name}:in.y"), Some(Value::int(i)))?;
                    }
                    out.add_connection(Some("t2:out.sum"), "self:sub_in.total", None)?;
                    Ok(())
                }),
            )
            .unwrap()
            .with_subnet_inputs(sub_inputs)
            .stateful(),
        )
        .unwrap();
}

/// A composite instance expands into a sub-network, the parent's input
/// propagates into it, and a child's output comes back out through the
/// sub-network input surface.
#[test]
fn composite_expands_subnetwork() {
    let mut funcs = add_registry();
    register_fanout(&mut funcs);

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(funcs, dir.path());
    engine.add_instance("wf", "wf::fanout").unwrap();
    engine.write("wf:in.n", Value::int(10)).unwrap();
    engine.run_until_quiescent().unwrap();

    // Children exist under the composite's canonical namespace.
    for (name, expected) in [("wf/t0", 10), ("wf/t1", 11), ("wf/t2", 12)] {
        let status = engine.status(name).unwrap();
        assert_eq!(status.state, FiringState::Done, "{name}");
        assert_eq!(status.fire_count, 1, "{name}");
        assert_eq!(int_at(&engine, &format!("{name}:out.sum")), expected);
    }

    // t2's sum came back through sub_in and out the parent's output.
    assert_eq!(int_at(&engine, "wf:out.total"), 12);
    assert_eq!(engine.status("wf").unwrap().fire_count, 2);
}

/// A project description replays into a working network, with initial
/// values deferred until the loop runs.
#[test]
fn load_replays_a_project() {
    use conflux_core::LoadEvent;

    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(add_registry(), dir.path());
    engine
        .load([
            LoadEvent::Instance {
                name: "a".to_string(),
                function: "math::add".to_string(),
            },
            LoadEvent::Instance {
                name: "b".to_string(),
                function: "math::add".to_string(),
            },
            LoadEvent::Connection {
                src: "a:out.sum".to_string(),
                dst: "b:in.x".to_string(),
            },
            LoadEvent::Value {
                dst: "a:in.x".to_string(),
                value: Value::int(2),
            },
            LoadEvent::Value {
                dst: "a:in.y".to_string(),
                value: Value::int(3),
            },
            LoadEvent::Value {
                dst: "b:in.y".to_string(),
                value: Value::int(8),
            },
        ])
        .unwrap();

    // Nothing fires during the load itself.
    assert_eq!(engine.status("a").unwrap().fire_count, 0);
    engine.run_until_quiescent().unwrap();
    assert_eq!(int_at(&engine, "b:out.sum"), 13);
}

/// The same writes against the same network always produce byte-identical
/// snapshots.
#[test]
fn runs_are_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("proj");

    let run = || {
        let engine = engine_with(add_registry(), &base);
        engine.add_instance("a", "math::add").unwrap();
        engine.add_instance("b", "math::add").unwrap();
        engine.connect("a:out.sum", "b:in.x").unwrap();
        engine.write("a:in.x", Value::int(2)).unwrap();
        engine.write("a:in.y", Value::int(3)).unwrap();
        engine.write("b:in.y", Value::int(8)).unwrap();
        engine.run_until_quiescent().unwrap();
        persist::snapshot_bytes(&engine.snapshot()).unwrap()
    };

    assert_eq!(run(), run());
}

/// Checkpoint, restore with a fresh registry, and keep going: the restored
/// engine carries the same state bytes and accepts further work.
#[test]
fn checkpoint_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("proj");
    let snap_path = dir.path().join("state.snapshot");

    let engine = engine_with(add_registry(), &base);
    engine.add_instance("a", "math::add").unwrap();
    engine.write("a:in.x", Value::int(2)).unwrap();
    engine.write("a:in.y", Value::int(3)).unwrap();
    engine.run_until_quiescent().unwrap();
    engine.checkpoint(&snap_path).unwrap();
    let before = persist::snapshot_bytes(&engine.snapshot()).unwrap();
    drop(engine);

    let engine = Engine::restore(
        add_registry(),
        Arc::new(NullDispatcher::default()),
        &base,
        &snap_path,
    )
    .unwrap();
    let after = persist::snapshot_bytes(&engine.snapshot()).unwrap();
    assert_eq!(before, after);
    assert_eq!(int_at(&engine, "a:out.sum"), 5);
    assert_eq!(engine.status("a").unwrap().state, FiringState::Done);

    // The restored network keeps working.
    engine.write("a:in.x", Value::int(7)).unwrap();
    engine.write("a:in.y", Value::int(7)).unwrap();
    engine.run_until_quiescent().unwrap();
    assert_eq!(int_at(&engine, "a:out.sum"), 14);
    assert_eq!(engine.status("a").unwrap().fire_count, 2);

    engine.add_instance("b", "math::add").unwrap();
    engine.connect("a:out.sum", "b:in.x").unwrap();
}

/// Restoring a snapshot with in-flight commands reissues them.
#[test]
fn restore_reissues_pending_commands() {
    let mut funcs = FunctionRegistry::new();
    register_double(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("proj");
    let snap_path = dir.path().join("state.snapshot");

    let engine = Engine::new(funcs, dispatcher, base.clone());
    engine.add_instance("d", "cmd::double").unwrap();
    engine.write("d:in.x", Value::int(21)).unwrap();
    engine.run_until_quiescent().unwrap();
    engine.checkpoint(&snap_path).unwrap();
    drop(engine);

    let mut funcs = FunctionRegistry::new();
    register_double(&mut funcs);
    let dispatcher = Arc::new(NullDispatcher::default());
    let engine = Engine::restore(funcs, dispatcher.clone(), &base, &snap_path).unwrap();

    // The command was reissued through the new dispatcher.
    let reissued = dispatcher.dispatched.lock().clone();
    assert_eq!(reissued.len(), 1);
    assert_eq!(reissued[0].command.key, "math/double");
    assert_eq!(engine.status("d").unwrap().state, FiringState::Blocked);

    // Completing it finishes the round-trip.
    let mut values = IndexMap::new();
    values.insert("result".to_string(), Value::int(42));
    engine.complete_command(Completion::success(reissued[0].id, values));
    engine.run_until_quiescent().unwrap();
    assert_eq!(int_at(&engine, "d:out.out"), 42);
}
