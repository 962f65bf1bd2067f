mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use common::ManualExecutor;
use ripple::{Executor, Scope, Trigger, Value, Variable, Worker};

fn executor(manual: &Arc<ManualExecutor>) -> Arc<dyn Executor> {
    manual.clone()
}

#[test]
fn worker_forwards_values_and_never_regresses() {
    common::init();
    let manual = ManualExecutor::new();
    let source: Variable<String> = Variable::from_value(Value::blocked_draft("x".to_string()));
    let worker = Worker::new({
        let source = source.clone();
        move || source.get().map_err(Into::into)
    })
    .executor(executor(&manual));

    // Before the loop has run, the initial blocking sentinel is served.
    let initial = worker.get();
    assert!(initial.blocking());
    assert!(initial.error().is_some());

    manual.run_all();
    let draft = worker.get();
    assert_eq!(draft.get().unwrap(), "x");
    assert!(draft.blocking());

    source.write(Value::of("y".to_string()));
    manual.run_all();
    let settled = worker.get();
    assert_eq!(settled.get().unwrap(), "y");
    assert!(!settled.blocking());

    // Once a non-blocking value shipped, blocking values are discarded.
    source.write(Value::blocked_draft("z".to_string()));
    manual.run_all();
    let unchanged = worker.get();
    assert_eq!(unchanged.get().unwrap(), "y");
    assert!(!unchanged.blocking());

    source.write(Value::blocked_draft("w".to_string()));
    manual.run_all();
    assert_eq!(worker.get().get().unwrap(), "y");
}

#[test]
fn equal_outputs_are_suppressed() {
    let manual = ManualExecutor::new();
    let tick = Variable::new(0u32);
    let worker = Worker::new({
        let tick = tick.clone();
        move || {
            tick.read();
            Ok(42u32)
        }
    })
    .executor(executor(&manual));

    worker.get();
    manual.run_all();
    assert_eq!(worker.get().get().unwrap(), 42);

    // A reader armed on the output sees no publish for equal outputs.
    let scope = Scope::new();
    {
        let _entered = scope.enter();
        worker.get();
    }
    let trigger = Trigger::new();
    trigger.arm(scope.versions());
    tick.set(1);
    manual.run_all();
    // equal-output iteration 1 is exactly when the first probe fires
    assert!(trigger.fired());

    let scope = Scope::new();
    {
        let _entered = scope.enter();
        worker.get();
    }
    let trigger = Trigger::new();
    trigger.arm(scope.versions());
    tick.set(2);
    manual.run_all();
    assert!(trigger.fired());

    // iteration 3 of the equal streak carries no probe
    let scope = Scope::new();
    {
        let _entered = scope.enter();
        worker.get();
    }
    let trigger = Trigger::new();
    trigger.arm(scope.versions());
    tick.set(3);
    manual.run_all();
    assert!(!trigger.fired());
}

#[test]
fn probes_are_exponentially_spaced() {
    let manual = ManualExecutor::new();
    let tick = Variable::new(0u32);
    let worker = Worker::new({
        let tick = tick.clone();
        move || {
            tick.read();
            Ok(7u32)
        }
    })
    .executor(executor(&manual));

    worker.get();
    manual.run_all();

    let mut fired_rounds = Vec::new();
    for round in 1..=16u32 {
        let scope = Scope::new();
        {
            let _entered = scope.enter();
            worker.get();
        }
        let trigger = Trigger::new();
        trigger.arm(scope.versions());
        tick.set(round);
        manual.run_all();
        if trigger.fired() {
            fired_rounds.push(round);
        }
    }
    assert_eq!(fired_rounds, vec![1, 2, 4, 8, 16]);
}

#[test]
fn unused_worker_pauses_and_resumes_on_get() {
    let manual = ManualExecutor::new();
    let tick = Variable::new(0u32);
    let runs = Arc::new(AtomicU32::new(0));
    let worker = Worker::new({
        let tick = tick.clone();
        let runs = runs.clone();
        move || {
            tick.read();
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(7u32)
        }
    })
    .executor(executor(&manual));

    worker.get();
    manual.run_all();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // No reader acknowledges the probe from this iteration.
    tick.set(1);
    manual.run_all();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // The unanswered probe pauses the worker instead of recomputing.
    tick.set(2);
    manual.run_all();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // While paused, invalidations cost nothing at all.
    tick.set(3);
    assert_eq!(manual.run_all(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // The next reader sees the parked output flagged blocking and its
    // heartbeat resumes the loop.
    let parked = worker.get();
    assert!(parked.blocking());
    assert_eq!(parked.get().unwrap(), 7);
    manual.run_all();
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let resumed = worker.get();
    assert!(!resumed.blocking());
    assert_eq!(resumed.get().unwrap(), 7);
}

#[test]
fn initial_override_is_served_until_first_run() {
    let manual = ManualExecutor::new();
    let worker = Worker::new(|| Ok(2u32))
        .initial(Value::of(1))
        .executor(executor(&manual));
    assert_eq!(worker.get().get().unwrap(), 1);
    manual.run_all();
    assert_eq!(worker.get().get().unwrap(), 2);
}

#[test]
#[should_panic(expected = "started worker")]
fn reconfiguring_a_started_worker_panics() {
    let manual = ManualExecutor::new();
    let worker = Worker::new(|| Ok(1u32)).executor(executor(&manual));
    worker.get();
    let _ = worker.initial(Value::of(5));
}
