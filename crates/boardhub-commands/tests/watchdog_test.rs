//! Reply deadlines: timeout events, stale replies and restart recovery.

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use boardhub_commands::{CommandMessage, DispatchOutcome, EntryOutcome, Watchdog};
use boardhub_core::{BoardEvent, LockKey, LockKind};
use boardhub_storage::LockStore;
use common::{drain, fast_timing, state_reply, wait_until, FlakyLocks, Harness, MAC};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_timeout_emits_once_and_ignores_stale_reply() {
    let h = Harness::with_timing(fast_timing()).await;
    h.add_board(MAC).await;
    let mut rx = h.bus.subscribe();

    let outcome = h.dispatcher.dispatch(MAC, &CommandMessage::state(false)).await;
    assert!(outcome.is_accepted());

    let (event, _) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, BoardEvent::timeout(LockKind::Pending, MAC));
    assert!(h.locks.list().await.unwrap().is_empty());
    assert!(drain(&mut rx).is_empty());
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "board_timeout");
    assert_eq!(json["command"], "pending");
    assert_eq!(json["device_id"], MAC);

    // The board finally answers: nothing changes and no event goes out.
    let entry = h.deliver(&state_reply(MAC, false), "w0").await;
    assert_eq!(h.reconciler.process_entry(&entry).await, EntryOutcome::Stale);
    assert!(h.board(MAC).await.is_active);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_fire_after_reply_is_noop() {
    let h = Harness::new().await;
    h.add_board(MAC).await;
    let mut rx = h.bus.subscribe();

    let DispatchOutcome::Accepted { job_id } =
        h.dispatcher.dispatch(MAC, &CommandMessage::state(false)).await
    else {
        panic!("dispatch not accepted");
    };

    let entry = h.deliver(&state_reply(MAC, false), "w0").await;
    assert_eq!(h.reconciler.process_entry(&entry).await, EntryOutcome::Applied);
    drain(&mut rx);

    let key = LockKey::new(LockKind::Pending, MAC, job_id);
    assert!(!h.watchdog.fire(&key).await);
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_fire_twice_notifies_once() {
    let h = Harness::new().await;
    let mut rx = h.bus.subscribe();
    let key = LockKey::generate(LockKind::Flashing, MAC);
    h.locks
        .try_acquire(&key, Duration::from_secs(330), Duration::from_secs(300))
        .await
        .unwrap();

    assert!(h.watchdog.fire(&key).await);
    assert!(!h.watchdog.fire(&key).await);

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], BoardEvent::timeout(LockKind::Flashing, MAC));
}

#[tokio::test]
async fn test_recover_rearms_stored_deadlines() {
    let h = Harness::new().await;
    let mut rx = h.bus.subscribe();

    // Lock left behind by a previous process whose deadline has passed.
    let key = LockKey::generate(LockKind::Pending, MAC);
    h.locks
        .try_acquire(&key, Duration::from_secs(60), Duration::ZERO)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = Watchdog::new(
        h.locks.clone(),
        Arc::new(h.bus.clone()),
        fast_timing(),
        cancel.clone(),
    );
    assert_eq!(watchdog.recover().await.unwrap(), 1);

    let (event, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, BoardEvent::timeout(LockKind::Pending, MAC));
    assert!(h.locks.list().await.unwrap().is_empty());

    cancel.cancel();
    watchdog.wait().await;
}

#[tokio::test]
async fn test_cancel_stops_timers_and_keeps_locks() {
    let h = Harness::new().await;
    assert!(h
        .dispatcher
        .dispatch(MAC, &CommandMessage::state(true))
        .await
        .is_accepted());
    assert_eq!(h.watchdog.armed(), 1);

    h.cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), h.watchdog.wait())
        .await
        .unwrap();

    assert_eq!(h.watchdog.armed(), 0);
    assert_eq!(h.locks.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_expire_is_retried() {
    let h = Harness::new().await;
    let mut rx = h.bus.subscribe();
    let locks = Arc::new(FlakyLocks {
        inner: h.locks.as_ref().clone(),
        expire_failures: AtomicUsize::new(1),
    });
    let key = LockKey::generate(LockKind::Pending, MAC);
    locks
        .try_acquire(&key, Duration::from_secs(60), Duration::from_secs(30))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let watchdog = Watchdog::new(
        locks.clone(),
        Arc::new(h.bus.clone()),
        fast_timing(),
        cancel.clone(),
    );
    watchdog.arm(key.clone(), Duration::from_millis(100));

    let (event, _) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, BoardEvent::timeout(LockKind::Pending, MAC));
    assert!(locks.get(&key).await.unwrap().is_none());
    assert!(
        wait_until(Duration::from_secs(1), || {
            let idle = watchdog.armed() == 0;
            async move { idle }
        })
        .await
    );
    assert!(drain(&mut rx).is_empty());

    cancel.cancel();
    watchdog.wait().await;
}
