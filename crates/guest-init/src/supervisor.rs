//! Waits for the workload and relays termination signals to it.

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{InitError, InitResult};
use crate::pid1::Awaited;

/// Signals init forwards to the workload.
pub const RELAYED: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGABRT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

/// How long a cancelled boot waits for the workload before killing it.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Exit code for a finished process: its code, or 128 + the signal that
/// killed it.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    }
}

/// Start relaying [`RELAYED`] signals to `pid`.
///
/// One listener per signal feeds a channel; a single task drains it and
/// calls `kill(2)`. Dropping or shutting down the returned set stops the
/// relay.
pub fn relay_signals(pid: Pid) -> InitResult<JoinSet<()>> {
    let (tx, mut rx) = mpsc::channel::<Signal>(RELAYED.len() * 4);
    let mut tasks = JoinSet::new();

    for &sig in RELAYED {
        let mut stream = signal(SignalKind::from_raw(sig as i32)).map_err(InitError::Signal)?;
        let tx = tx.clone();
        tasks.spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(sig).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    tasks.spawn(async move {
        while let Some(sig) = rx.recv().await {
            match kill(pid, sig) {
                Ok(()) => info!(pid = pid.as_raw(), signal = sig.as_str(), "relayed signal"),
                Err(e) => warn!(
                    pid = pid.as_raw(),
                    signal = sig.as_str(),
                    error = %e,
                    "relay signal failed"
                ),
            }
        }
    });

    debug!(pid = pid.as_raw(), "signal relay started");
    Ok(tasks)
}

async fn wait_after_cancel(child: &mut Child) -> InitResult<ExitStatus> {
    warn!(grace_secs = CANCEL_GRACE.as_secs(), "boot cancelled, waiting for workload");
    if let Ok(status) = tokio::time::timeout(CANCEL_GRACE, child.wait()).await {
        return status.map_err(InitError::Wait);
    }
    warn!("workload still running after grace period, killing");
    child.kill().await.map_err(InitError::Wait)?;
    child.wait().await.map_err(InitError::Wait)
}

/// Relay signals to the workload until it exits, then return its exit code.
///
/// The relay is stopped before `awaited` is released, so a recycled pid never
/// receives a relayed signal.
pub async fn supervise(
    mut child: Child,
    awaited: Awaited,
    cancel: &CancellationToken,
) -> InitResult<i32> {
    let mut relay = match awaited.pid() {
        Some(pid) => relay_signals(Pid::from_raw(pid))?,
        None => JoinSet::new(),
    };

    let status = tokio::select! {
        status = child.wait() => status.map_err(InitError::Wait),
        () = cancel.cancelled() => wait_after_cancel(&mut child).await,
    };

    relay.shutdown().await;
    drop(awaited);

    let status = status?;
    let code = exit_code(status);
    info!(%status, code, "workload exited");
    Ok(code)
}
