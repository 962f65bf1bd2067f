mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use common::ManualExecutor;
use ripple::{AsyncCache, CacheStatus, Executor, Scope, Trigger, Value, Variable};

fn executor(manual: &Arc<ManualExecutor>) -> Arc<dyn Executor> {
    manual.clone()
}

#[test]
fn serves_initial_then_computed_value() {
    common::init();
    let manual = ManualExecutor::new();
    let source = Variable::new("value".to_string());
    let cache = AsyncCache::new({
        let source = source.clone();
        move || source.get().map_err(Into::into)
    })
    .initial(Value::blocked_draft("i".to_string()))
    .executor(executor(&manual));

    assert_eq!(cache.status(), CacheStatus::Initial);
    assert_eq!(cache.get().get().unwrap(), "i");
    assert_eq!(cache.status(), CacheStatus::Running);

    manual.run_all();
    assert_eq!(cache.status(), CacheStatus::AwaitingQueries);
    assert_eq!(cache.get().get().unwrap(), "value");
    assert_eq!(cache.status(), CacheStatus::Idle);
}

#[test]
fn readers_are_notified_through_the_version_variable() {
    let manual = ManualExecutor::new();
    let source = Variable::new(1u32);
    let cache = AsyncCache::new({
        let source = source.clone();
        move || source.get().map_err(Into::into)
    })
    .executor(executor(&manual));

    let scope = Scope::new();
    {
        let _entered = scope.enter();
        cache.get();
    }
    let trigger = Trigger::new();
    trigger.arm(scope.versions());
    assert!(!trigger.fired());
    manual.run_all();
    // publishing bumped the version, which reaches the armed reader
    assert!(trigger.fired());
    assert_eq!(cache.get().get().unwrap(), 1);
}

#[test]
fn invalidation_during_compute_backlogs() {
    let manual = ManualExecutor::new();
    let source = Variable::new(1u32);
    let sneak = Arc::new(AtomicBool::new(false));
    let cache = AsyncCache::new({
        let source = source.clone();
        let sneak = sneak.clone();
        move || {
            let current = source.get()?;
            if sneak.swap(false, Ordering::SeqCst) {
                // a writer lands while the computation is in flight
                source.set(current + 10);
            }
            Ok(current)
        }
    })
    .executor(executor(&manual));

    cache.get();
    manual.run_all();
    assert_eq!(cache.status(), CacheStatus::AwaitingQueries);
    cache.get();
    assert_eq!(cache.status(), CacheStatus::Idle);

    sneak.store(true, Ordering::SeqCst);
    source.set(2);
    assert_eq!(cache.status(), CacheStatus::Running);
    manual.run_all();
    assert_eq!(cache.status(), CacheStatus::AwaitingQueriesBacklogged);
    // the bumped version is already exposed to readers
    let stale = cache.get();
    assert_eq!(stale.get().unwrap(), 2);
    // ... and that get() moved the cache back into computation
    assert_eq!(cache.status(), CacheStatus::Running);
    manual.run_all();
    assert_eq!(cache.get().get().unwrap(), 12);
}

#[test]
fn blocking_computation_parks_idle_and_publishes_draft() {
    let manual = ManualExecutor::new();
    let gate = Variable::new(false);
    let cache = AsyncCache::new({
        let gate = gate.clone();
        move || {
            if !gate.get()? {
                ripple::scope::block();
                return Ok(0u32);
            }
            Ok(7)
        }
    })
    .executor(executor(&manual));

    cache.get();
    manual.run_all();
    assert_eq!(cache.status(), CacheStatus::Idle);
    let draft = cache.get();
    assert!(draft.blocking());
    assert_eq!(draft.get().unwrap(), 0);

    gate.set(true);
    assert_eq!(cache.status(), CacheStatus::Running);
    manual.run_all();
    let settled = cache.get();
    assert!(!settled.blocking());
    assert_eq!(settled.get().unwrap(), 7);
}

#[test]
fn draft_mode_off_holds_back_blocking_values() {
    let manual = ManualExecutor::new();
    let gate = Variable::new(false);
    let cache = AsyncCache::new({
        let gate = gate.clone();
        move || {
            if !gate.get()? {
                ripple::scope::block();
                return Ok(0u32);
            }
            Ok(7)
        }
    })
    .initial(Value::of(99))
    .draft(false)
    .executor(executor(&manual));

    cache.get();
    manual.run_all();
    // the blocking intermediate result was not published
    assert_eq!(cache.get().get().unwrap(), 99);
    gate.set(true);
    manual.run_all();
    assert_eq!(cache.get().get().unwrap(), 7);
}

#[test]
fn blocking_iterations_reuse_pins() {
    let manual = ManualExecutor::new();
    let gate = Variable::new(false);
    let evaluations = Arc::new(AtomicU32::new(0));
    let cache = AsyncCache::new({
        let gate = gate.clone();
        let evaluations = evaluations.clone();
        move || {
            let pinned = ripple::scope::pin("side", {
                let evaluations = evaluations.clone();
                move || {
                    evaluations.fetch_add(1, Ordering::SeqCst);
                    Ok(5u32)
                }
            });
            if !gate.get()? {
                ripple::scope::block();
                return Ok(0);
            }
            pinned.get().map_err(Into::into)
        }
    })
    .executor(executor(&manual));

    cache.get();
    manual.run_all();
    assert_eq!(cache.status(), CacheStatus::Idle);
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);

    // The pin survives into the next run instead of being recomputed.
    gate.set(true);
    manual.run_all();
    assert_eq!(evaluations.load(Ordering::SeqCst), 1);
    let value = cache.get();
    assert_eq!(value.result().copied(), Some(5));
    // That get() scheduled the forced refresh that re-collects pins.
    manual.run_all();
    assert_eq!(evaluations.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get().result().copied(), Some(5));
}

#[test]
fn start_schedules_without_a_reader() {
    let manual = ManualExecutor::new();
    let cache = AsyncCache::new(|| Ok(3u32)).executor(executor(&manual));
    cache.start();
    assert_eq!(cache.status(), CacheStatus::Running);
    manual.run_all();
    assert_eq!(cache.get().get().unwrap(), 3);
}

#[test]
fn stop_suppresses_further_scheduling() {
    let manual = ManualExecutor::new();
    let source = Variable::new(1u32);
    let cache = AsyncCache::new({
        let source = source.clone();
        move || source.get().map_err(Into::into)
    })
    .executor(executor(&manual));

    cache.get();
    manual.run_all();
    assert_eq!(cache.get().get().unwrap(), 1);

    cache.stop();
    source.set(2);
    manual.run_all();
    // the stale value stays; nothing recomputes after stop
    assert_eq!(cache.get().get().unwrap(), 1);
    assert_eq!(manual.pending(), 0);
}

#[test]
#[should_panic(expected = "started async cache")]
fn reconfiguring_a_started_cache_panics() {
    let manual = ManualExecutor::new();
    let cache = AsyncCache::new(|| Ok(1u32)).executor(executor(&manual));
    cache.start();
    let _ = cache.draft(false);
}
