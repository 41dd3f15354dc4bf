mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{dummy_args, dummy_bin, send_dummy, wait_running, wait_stopped};
use copr::guard::{Guard, GuardOpts, GuardState};
use copr::testkit::DummyCommand;

const PORT: u16 = 31101;
const RACE_PORT: u16 = 31102;

async fn wait_state(guard: &Guard, want: impl Fn(GuardState) -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if want(guard.status()) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn guard_restarts_crashed_child_with_new_pid() {
    let guard = Arc::new(Guard::new(
        GuardOpts::new(dummy_bin())
            .with_args(dummy_args(PORT))
            .with_kill_timeout(Duration::from_millis(500))
            .with_restart_after(Duration::from_millis(500)),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let guard = Arc::clone(&guard);
        let cancel = cancel.clone();
        tokio::spawn(async move { guard.run_ctx(cancel).await })
    };

    // start
    let first_pid = guard.start().await.expect("guard start");
    assert!(first_pid > 0);
    assert_eq!(
        guard.status(),
        GuardState::RunningStarted { pid: first_pid }
    );
    assert!(wait_running(PORT, Duration::from_secs(5)).await);

    // crash; the guard must observe the exit quickly
    let _ = send_dummy(PORT, &DummyCommand::crash()).await;
    assert!(
        wait_state(
            &guard,
            |st| st == GuardState::RunningStopped,
            Duration::from_secs(1)
        )
        .await,
        "state after crash"
    );

    // auto-restart after the configured delay, with a different pid
    assert!(
        wait_state(&guard, |st| st.is_started(), Duration::from_secs(2)).await,
        "state after restart"
    );
    let second_pid = guard.pid();
    assert!(second_pid > 0);
    assert_ne!(first_pid, second_pid, "restart must yield a fresh pid");
    assert!(wait_running(PORT, Duration::from_secs(5)).await);

    // operator stop: no restart follows
    guard.stop().await.expect("guard stop");
    assert_eq!(guard.status(), GuardState::RunningStopped);
    assert!(wait_stopped(PORT, Duration::from_secs(1)).await);
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(guard.status(), GuardState::RunningStopped, "no restart after stop");

    // start again
    let third_pid = guard.start().await.expect("guard start again");
    assert!(third_pid > 0);
    assert!(wait_running(PORT, Duration::from_secs(5)).await);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("guard exit via cancellation")
        .unwrap();
    assert_eq!(guard.status(), GuardState::NotRunning);
    assert!(wait_stopped(PORT, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn manual_start_wins_over_pending_restart() {
    let guard = Arc::new(Guard::new(
        GuardOpts::new(dummy_bin())
            .with_args(dummy_args(RACE_PORT))
            .with_kill_timeout(Duration::from_millis(500))
            .with_restart_after(Duration::from_millis(1500)),
    ));

    let cancel = CancellationToken::new();
    let task = {
        let guard = Arc::clone(&guard);
        let cancel = cancel.clone();
        tokio::spawn(async move { guard.run_ctx(cancel).await })
    };

    let first_pid = guard.start().await.expect("guard start");
    assert!(wait_running(RACE_PORT, Duration::from_secs(5)).await);

    // crash arms the restart deadline
    let _ = send_dummy(RACE_PORT, &DummyCommand::crash()).await;
    assert!(
        wait_state(
            &guard,
            |st| st == GuardState::RunningStopped,
            Duration::from_secs(1)
        )
        .await,
        "state after crash"
    );

    // beat the deadline with a manual start
    let manual_pid = guard.start().await.expect("manual start during backoff");
    assert!(manual_pid > 0);
    assert_ne!(manual_pid, first_pid);
    assert!(wait_running(RACE_PORT, Duration::from_secs(5)).await);

    // once the stale deadline passes, the manually started child must still
    // be the one the guard tracks
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert_eq!(
        guard.status(),
        GuardState::RunningStarted { pid: manual_pid },
        "a stale restart deadline must not spawn a second child"
    );
    assert!(wait_running(RACE_PORT, Duration::from_secs(1)).await);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("guard exit via cancellation")
        .unwrap();
    assert!(wait_stopped(RACE_PORT, Duration::from_secs(1)).await);
}
