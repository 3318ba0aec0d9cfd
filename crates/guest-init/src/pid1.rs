//! PID 1 responsibilities: signal dispositions and zombie reaping.
//!
//! Signal handling follows [tini](https://github.com/krallin/tini): TTY job
//! control signals and SIGPIPE are ignored, SIGCHLD stays at SIG_DFL so
//! `waitpid()` keeps working.
//!
//! Reaping has to share the child table with the supervisor and with the
//! network helpers, each of which collects its own child. Every process init
//! spawns is entered in [`AWAITED`] while the registry lock is held across
//! `spawn()`, and stays there until its owner drops the [`Awaited`] handle.
//! The reaper only peeks with `WNOWAIT`, takes the same lock, and collects a
//! pid only if nobody is awaiting it. An awaited zombie does not block the
//! queue: the reaper then walks init's child list for other exited orphans.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Idle interval when no orphan is reapable.
pub const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Pids whose exit status belongs to someone other than the reaper.
static AWAITED: Mutex<BTreeSet<i32>> = Mutex::new(BTreeSet::new());

fn awaited() -> MutexGuard<'static, BTreeSet<i32>> {
    AWAITED.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `pid` is currently registered as awaited by its owner.
pub fn is_awaited(pid: i32) -> bool {
    awaited().contains(&pid)
}

/// Install a `sigaction` handler for the given signal with `SA_RESTART`.
fn set_handler(sig: libc::c_int, handler: libc::sighandler_t) {
    // SAFETY: zeroed sigaction is valid; we fill sa_handler and sa_flags.
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = libc::SA_RESTART;
    // SAFETY: sa is properly initialized, sig is a valid signal number.
    unsafe {
        libc::sigaction(sig, &sa, std::ptr::null_mut());
    }
}

/// Set PID 1 signal dispositions.
///
/// - SIGTTIN/SIGTTOU: ignored so console I/O never stops init
/// - SIGPIPE: ignored so a closed console pipe does not kill init
///
/// Termination signals are handled later by the supervisor's relay.
pub fn setup_signal_handlers() {
    set_handler(libc::SIGTTIN, libc::SIG_IGN);
    set_handler(libc::SIGTTOU, libc::SIG_IGN);
    set_handler(libc::SIGPIPE, libc::SIG_IGN);
}

/// Restore dispositions that [`setup_signal_handlers`] changed, in a child
/// between `fork` and `exec`. Ignored dispositions survive `exec`.
pub fn reset_signal_handlers_for_exec(cmd: &mut Command) {
    // SAFETY: the closure only calls `signal(2)`, which is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            for sig in [libc::SIGTTIN, libc::SIGTTOU, libc::SIGPIPE] {
                if libc::signal(sig, libc::SIG_DFL) == libc::SIG_ERR {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

/// Registration of a spawned child as awaited by its owner.
///
/// Keep it alive until the child's exit status has been collected; dropping
/// it hands the pid back to the reaper.
#[derive(Debug)]
#[must_use]
pub struct Awaited {
    pid: Option<i32>,
}

impl Awaited {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

impl Drop for Awaited {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            awaited().remove(&pid);
        }
    }
}

/// Spawn `cmd` with its pid registered before the reaper can observe it.
pub fn spawn_tracked(cmd: &mut Command) -> io::Result<(Child, Awaited)> {
    let mut registry = awaited();
    let child = cmd.spawn()?;
    let pid = child.id().and_then(|id| i32::try_from(id).ok());
    if let Some(pid) = pid {
        registry.insert(pid);
    }
    Ok((child, Awaited { pid }))
}

/// Outcome of one reap attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reap {
    /// An orphan was collected.
    Reaped(Pid),
    /// Nothing reapable right now: no exited child, or only children whose
    /// owners have yet to collect them.
    Idle,
    /// Interrupted by a signal; try again immediately.
    Interrupted,
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are
/// counted from the last `)`.
fn parent_from_stat(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}

fn parse_pids(list: &str) -> impl Iterator<Item = i32> + '_ {
    list.split_whitespace().filter_map(|p| p.parse().ok())
}

/// Direct children of this process.
///
/// Reads every thread's `children` list; falls back to scanning
/// `/proc/*/stat` on kernels built without `CONFIG_PROC_CHILDREN`.
fn child_pids() -> Vec<i32> {
    let lists: Vec<String> = fs::read_dir("/proc/self/task")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
        .collect();
    if !lists.is_empty() {
        return lists.iter().flat_map(|l| parse_pids(l.as_str())).collect();
    }

    let me = i32::try_from(std::process::id()).unwrap_or_default();
    fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            fs::read_to_string(format!("/proc/{pid}/stat"))
                .ok()
                .and_then(|stat| parent_from_stat(&stat))
                == Some(me)
        })
        .collect()
}

/// Collect `pid` if it has exited.
fn collect(pid: Pid) -> Reap {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => Reap::Idle,
        Ok(status) => {
            info!(pid = pid.as_raw(), ?status, "reaped zombie");
            Reap::Reaped(pid)
        }
        Err(Errno::EINTR) => Reap::Interrupted,
        Err(e) => {
            debug!(pid = pid.as_raw(), error = %e, "waitpid failed");
            Reap::Idle
        }
    }
}

/// `waitid` only ever reports one exited child. When that one is awaited,
/// look past it for any other exited child nobody owns.
fn reap_unawaited(registry: &BTreeSet<i32>, awaited_pid: Pid) -> Reap {
    for pid in child_pids() {
        if registry.contains(&pid) {
            continue;
        }
        match collect(Pid::from_raw(pid)) {
            Reap::Idle => {}
            outcome => return outcome,
        }
    }
    debug!(pid = awaited_pid.as_raw(), "only awaited children have exited");
    Reap::Idle
}

/// Try to collect one exited descendant without blocking.
pub fn reap_once() -> Reap {
    let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
    let peeked = match waitid(Id::All, flags) {
        Ok(status) => status,
        Err(Errno::EINTR) => return Reap::Interrupted,
        Err(Errno::ECHILD) => return Reap::Idle,
        Err(e) => {
            warn!(error = %e, "waitid failed");
            return Reap::Idle;
        }
    };
    let Some(pid) = peeked.pid() else {
        return Reap::Idle;
    };

    // Held until the reap is done, so no spawn can register a pid that is
    // about to be collected here.
    let registry = awaited();
    if registry.contains(&pid.as_raw()) {
        return reap_unawaited(&registry, pid);
    }
    collect(pid)
}

/// Reap orphans forever.
///
/// Anything but [`Reap::Idle`] retries immediately so a burst of exits
/// drains quickly.
pub fn reap_loop() {
    loop {
        match reap_once() {
            Reap::Reaped(_) | Reap::Interrupted => {}
            Reap::Idle => thread::sleep(REAP_INTERVAL),
        }
    }
}

/// Start the reaper on its own thread. The thread is never joined.
pub fn spawn_reaper() -> io::Result<()> {
    thread::Builder::new()
        .name("reaper".into())
        .spawn(reap_loop)?;
    info!("zombie reaper started");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracked_child_registered_until_dropped() {
        let (mut child, registration) = spawn_tracked(&mut Command::new("true")).unwrap();
        let pid = registration.pid().unwrap();
        assert!(is_awaited(pid));

        assert!(child.wait().await.unwrap().success());
        assert!(is_awaited(pid));

        drop(registration);
        assert!(!is_awaited(pid));
    }

    #[test]
    fn parent_from_stat_skips_command_name() {
        let stat = "4242 (sleep) S 1 4242 4242 0 -1 4194560 106 0 0 0";
        assert_eq!(parent_from_stat(stat), Some(1));
        let tricky = "77 (a) b (c) Z 31337 77 77 0 -1";
        assert_eq!(parent_from_stat(tricky), Some(31337));
        assert_eq!(parent_from_stat("garbage"), None);
    }

    #[test]
    fn parse_pids_ignores_noise() {
        let pids: Vec<_> = parse_pids("12 345 \n 6x 7\n").collect();
        assert_eq!(pids, vec![12, 345, 7]);
    }

    #[tokio::test]
    async fn child_pids_lists_live_children() {
        let (mut child, registration) =
            spawn_tracked(Command::new("sleep").arg("30")).unwrap();
        let pid = registration.pid().unwrap();
        assert!(child_pids().contains(&pid), "children: {:?}", child_pids());

        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = spawn_tracked(&mut Command::new("/nonexistent/guest-init-test")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
