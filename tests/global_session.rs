//! Process-wide session installation.
//!
//! Everything lives in one test: the installed session is global state
//! shared by every test in this binary.

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use streamspy::{install, installed, MemoryLogger, Notification, Observable, SpyConfig, SpyError};

#[test]
fn test_install_lifecycle() {
    assert!(installed().is_none());

    let logger = Arc::new(MemoryLogger::new());
    let session = install(SpyConfig::default().with_logger(logger.clone())).unwrap();
    assert!(installed().is_some_and(|s| s.ptr_eq(&session)));

    // A second install while the first is active conflicts.
    let err = install(SpyConfig::default()).unwrap_err();
    assert!(matches!(err, SpyError::SessionConflict));

    // Plain subscribes are intercepted by the installed session.
    let tagged = Observable::of(vec![json!(1), json!(2)]).with_tag("global");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let tick = session.tick();
    tagged.subscribe(move |n: Notification| sink.lock().push(n));
    assert_eq!(seen.lock().len(), 3);
    // subscribe, two nexts, complete, unsubscribe
    assert_eq!(session.tick(), tick + 5);

    // Direct activation bypasses it.
    let tick = session.tick();
    Observable::of(vec![json!(3)]).subscribe_direct(|_: Notification| {});
    assert_eq!(session.tick(), tick);

    session.teardown();
    assert!(installed().is_none());

    // After teardown plain subscribes run uninstrumented.
    let tick = session.tick();
    tagged.subscribe(|_: Notification| {});
    assert_eq!(session.tick(), tick);

    // A fresh install is allowed once the previous one is torn down.
    let next = install(SpyConfig::bare()).unwrap();
    assert!(!next.ptr_eq(&session));
    next.teardown();
    assert!(installed().is_none());
}
