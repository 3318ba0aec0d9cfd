//! Signals delivered to init reach the workload.
//!
//! Raises signals at the test process itself, so it lives in its own binary.

use std::time::Duration;

use guest_init::pid1;
use guest_init::supervisor::{exit_code, relay_signals};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Command;

#[tokio::test]
async fn sigterm_is_relayed_to_the_workload() {
    let (mut child, awaited) = pid1::spawn_tracked(Command::new("sleep").arg("30")).unwrap();
    let pid = Pid::from_raw(awaited.pid().unwrap());

    let mut relay = relay_signals(pid).unwrap();
    kill(Pid::this(), Signal::SIGTERM).unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
        .await
        .expect("workload did not receive SIGTERM")
        .unwrap();
    assert_eq!(exit_code(status), 128 + libc::SIGTERM);

    relay.shutdown().await;
    drop(awaited);
}
