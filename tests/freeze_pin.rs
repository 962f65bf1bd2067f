mod common;

use ripple::{BlockedError, PinStore, Scope, Trigger, Value};

#[test]
fn freeze_evaluates_once_and_replays() {
    let scope = Scope::new();
    let _entered = scope.enter();
    let mut calls = 0;
    let first = scope.freeze("k", || {
        calls += 1;
        Ok("v")
    });
    let second = scope.freeze("k", || {
        calls += 1;
        Ok("other")
    });
    assert_eq!(first.get().unwrap(), "v");
    assert_eq!(second.get().unwrap(), "v");
    assert_eq!(calls, 1);
}

#[test]
fn freeze_replays_errors() {
    let scope = Scope::new();
    let _entered = scope.enter();
    let mut calls = 0;
    let first: Value<i32> = scope.freeze("failing", || {
        calls += 1;
        Err("nope".into())
    });
    let second: Value<i32> = scope.freeze("failing", || {
        calls += 1;
        Ok(1)
    });
    assert_eq!(first.error().unwrap().description(), "nope");
    assert!(second.error().unwrap().same(first.error().unwrap()));
    assert_eq!(calls, 1);
}

#[test]
fn freeze_captures_blocking() {
    let scope = Scope::new();
    let _entered = scope.enter();
    let blocked: Value<i32> = scope.freeze("blocked", BlockedError::bail);
    assert!(blocked.blocking());
    assert!(scope.blocked());
    let replay: Value<i32> = scope.freeze("blocked", || Ok(5));
    assert!(replay.blocking());
    assert!(replay.error().unwrap().is_blocked());
}

#[test]
fn pin_rejects_blocking_then_stores_normally() {
    let store = PinStore::new();
    {
        let scope = Scope::new();
        scope.set_pins(store.clone());
        let _entered = scope.enter();
        let refused: Value<i32> = scope.pin("k", BlockedError::bail);
        assert!(refused.blocking());
        assert!(store.is_empty());
        // the store stayed empty, so blocking never invalidated it
        assert!(store.valid());
    }
    {
        let scope = Scope::new();
        scope.set_pins(store.clone());
        let _entered = scope.enter();
        let stored: Value<i32> = scope.pin("k", || Ok(7));
        assert_eq!(stored.get().unwrap(), 7);
        assert_eq!(store.len(), 1);
        let replay: Value<i32> = scope.pin("k", || Ok(99));
        assert_eq!(replay.get().unwrap(), 7);
    }
}

#[test]
fn blocking_invalidates_non_empty_pins() {
    let scope = Scope::new();
    let _entered = scope.enter();
    let pinned = scope.pin("k", || Ok(1));
    assert_eq!(pinned.get().unwrap(), 1);
    assert!(scope.pins().valid());
    scope.block();
    assert!(!scope.pins().valid());
}

#[test]
fn blocked_scope_arms_on_real_dependencies() {
    let variable = ripple::Variable::new(1);
    let scope = Scope::new();
    let _entered = scope.enter();
    let _ = scope.pin("k", || Ok(1));
    variable.read();
    scope.block();
    // A blocked evaluation waits for its actual inputs; the invalid pins
    // matter only once an evaluation completes without blocking.
    let versions = scope.versions();
    assert_eq!(versions.len(), 1);
    assert!(!versions[0].outdated());
}

#[test]
fn invalid_pins_force_one_extra_reevaluation() {
    // First evaluation pins a value, then blocks: the store survives but
    // is invalid from then on.
    let scope1 = Scope::new();
    {
        let _entered = scope1.enter();
        let pinned = scope1.pin("k", || Ok("v"));
        assert_eq!(pinned.get().unwrap(), "v");
        scope1.block();
    }
    let pins = scope1.pins();
    assert!(!pins.valid());

    // A later evaluation completes without blocking, but it consumed the
    // stale pins: its version snapshot degenerates to a single synthetic
    // outdated entry, so the armed trigger fires immediately and forces
    // one re-evaluation with freshly collected pins.
    let scope2 = Scope::new();
    scope2.set_pins(pins);
    let variable = ripple::Variable::new(1);
    {
        let _entered = scope2.enter();
        variable.read();
        let replay = scope2.pin("k", || Ok("other"));
        assert_eq!(replay.get().unwrap(), "v");
    }
    assert!(!scope2.blocked());
    let versions = scope2.versions();
    assert_eq!(versions.len(), 1);
    assert!(versions[0].outdated());
    let trigger = Trigger::new();
    trigger.arm(versions);
    assert!(trigger.fired());
}

#[test]
fn pin_survival_across_scopes() {
    let scope1 = Scope::new();
    {
        let _entered = scope1.enter();
        let pinned = scope1.pin("k", || Ok("v"));
        assert_eq!(pinned.get().unwrap(), "v");
        scope1.block();
    }
    let scope2 = Scope::new();
    scope2.set_pins(scope1.pins());
    let _entered = scope2.enter();
    let replay = scope2.pin("k", || Ok("other"));
    assert_eq!(replay.get().unwrap(), "v");
}

#[test]
fn explicit_pin_api_supports_rebuilding() {
    let store = PinStore::new();
    store.set(ripple::CacheKey::new("k"), Value::of(1));
    assert_eq!(store.len(), 1);
    let scope = Scope::new();
    scope.set_pins(store.clone());
    {
        let _entered = scope.enter();
        let replay: Value<i32> = scope.pin("k", || Ok(2));
        assert_eq!(replay.get().unwrap(), 1);
    }
    assert!(store.remove(&ripple::CacheKey::new("k")));
    assert!(store.is_empty());
    assert_eq!(store.keys().len(), 0);
}
