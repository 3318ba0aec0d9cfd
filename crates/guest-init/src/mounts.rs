//! Pseudo-filesystem mounts for guest boot.
//!
//! `/proc` is mounted on its own because the shutdown path writes to
//! `/proc/sysrq-trigger`; everything after it is best-effort, strictly in
//! order:
//! 1. devtmpfs on `/dev`
//! 2. sysfs on `/sys`
//! 3. cgroup2 on `/sys/fs/cgroup`
//! 4. tmpfs on `/tmp`

use std::fs;

use nix::mount::{MsFlags, mount};
use tracing::{info, warn};

use crate::error::{InitError, InitResult};

/// One `mount(2)` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountPoint {
    pub source: &'static str,
    pub target: &'static str,
    pub fstype: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
    /// Create the target directory before mounting.
    pub create_target: bool,
}

pub const PROC: MountPoint = MountPoint {
    source: "proc",
    target: "/proc",
    fstype: "proc",
    flags: MsFlags::MS_NOSUID
        .union(MsFlags::MS_NODEV)
        .union(MsFlags::MS_NOEXEC),
    data: Some("hidepid=2"),
    create_target: false,
};

const SECURE: MsFlags = MsFlags::MS_NODEV
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NOSUID);

/// Mounts that follow `/proc`, in the order they must be attempted.
pub const BOOT_MOUNTS: &[MountPoint] = &[
    MountPoint {
        source: "devtmpfs",
        target: "/dev",
        fstype: "devtmpfs",
        flags: MsFlags::MS_NOEXEC.union(MsFlags::MS_NOSUID),
        data: None,
        create_target: false,
    },
    MountPoint {
        source: "sysfs",
        target: "/sys",
        fstype: "sysfs",
        flags: SECURE,
        data: None,
        create_target: true,
    },
    MountPoint {
        source: "cgroup2",
        target: "/sys/fs/cgroup",
        fstype: "cgroup2",
        flags: SECURE,
        data: None,
        create_target: false,
    },
    MountPoint {
        source: "tmpfs",
        target: "/tmp",
        fstype: "tmpfs",
        flags: SECURE,
        data: None,
        create_target: true,
    },
];

/// Mount a single pseudo-filesystem, creating its target first if asked to.
pub fn mount_one(point: &MountPoint) -> InitResult<()> {
    if point.create_target
        && let Err(e) = fs::create_dir_all(point.target)
    {
        warn!(path = point.target, error = %e, "cannot create mount point");
    }
    mount(
        Some(point.source),
        point.target,
        Some(point.fstype),
        point.flags,
        point.data,
    )
    .map_err(|source| InitError::Mount {
        target: point.target.into(),
        source,
    })?;
    info!(path = point.target, fstype = point.fstype, "mounted");
    Ok(())
}

/// Mount `/proc`. The caller decides what a failure means.
pub fn mount_proc() -> InitResult<()> {
    mount_one(&PROC)
}

/// Attempt every mount in `points` in order, logging and skipping failures.
///
/// Returns the targets that failed.
pub fn mount_best_effort<F>(points: &[MountPoint], mut mount_fn: F) -> Vec<&'static str>
where
    F: FnMut(&MountPoint) -> InitResult<()>,
{
    let mut failed = Vec::new();
    for point in points {
        if let Err(e) = mount_fn(point) {
            warn!(path = point.target, error = %e, "mount failed, continuing");
            failed.push(point.target);
        }
    }
    failed
}

/// Mount everything after `/proc`, normally [`BOOT_MOUNTS`].
pub fn mount_boot_filesystems(points: &[MountPoint]) {
    let failed = mount_best_effort(points, mount_one);
    if failed.is_empty() {
        info!("boot filesystems mounted");
    } else {
        warn!(?failed, "boot filesystems partially mounted");
    }
}
