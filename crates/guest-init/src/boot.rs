//! Everything after the `/proc` mount attempt.
//!
//! [`boot`] owns the armed [`Shutdown`] guard, so the power-off sequence runs
//! whether boot finishes, fails, or panics.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ImageConfiguration;
use crate::error::{InitError, InitResult};
use crate::launcher::Workload;
use crate::mounts::{self, BOOT_MOUNTS, MountPoint};
use crate::network::{self, Addressing, KernelLinks, LinkControl, Udhcpc};
use crate::shutdown::Shutdown;
use crate::supervisor;

/// Grace for runtime tasks (signal relay, helper cleanup) after the workload exits.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(1);

/// The machine boot acts on.
pub struct Guest<'a, L, A> {
    pub mounts: &'a [MountPoint],
    pub links: L,
    pub addressing: A,
}

impl Guest<'static, KernelLinks, Udhcpc> {
    /// The running kernel, busybox DHCP clients, and the standard mounts.
    pub fn kernel() -> Self {
        Self {
            mounts: BOOT_MOUNTS,
            links: KernelLinks,
            addressing: Udhcpc,
        }
    }
}

/// Network, launch and supervision, under one cancellation token.
async fn run<L, A>(guest: &Guest<'_, L, A>, config: ImageConfiguration) -> InitResult<i32>
where
    L: LinkControl,
    A: Addressing,
{
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling boot");
            on_interrupt.cancel();
        }
    });

    tokio::select! {
        result = network::bring_up(&config.network, &guest.links, &guest.addressing, &cancel) => result?,
        () = cancel.cancelled() => return Err(InitError::Cancelled),
    }
    info!("network configured");

    let workload = Workload::resolve(config)?;
    let (child, awaited) = workload.spawn()?;
    drop(workload);

    supervisor::supervise(child, awaited, &cancel).await
}

fn mount_and_run<L, A>(guest: &Guest<'_, L, A>, config: ImageConfiguration) -> InitResult<i32>
where
    L: LinkControl,
    A: Addressing,
{
    mounts::mount_boot_filesystems(guest.mounts);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(InitError::Runtime)?;
    let code = runtime.block_on(run(guest, config))?;
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);
    Ok(code)
}

/// Finish booting and power off.
///
/// `proc_mounted` is the outcome of the `/proc` mount; a failure there is
/// fatal but still ends in the power-off sequence. Returns the exit code
/// recorded on `shutdown`, which is only observable when the guard does not
/// park.
pub fn boot<L, A>(
    guest: &Guest<'_, L, A>,
    proc_mounted: InitResult<()>,
    config: ImageConfiguration,
    mut shutdown: Shutdown,
) -> u8
where
    L: LinkControl,
    A: Addressing,
{
    match proc_mounted.and_then(|()| mount_and_run(guest, config)) {
        Ok(code) => {
            info!(code, "workload finished");
            shutdown.set_exit_code(code);
        }
        Err(e) => error!(error = %e, "fatal"),
    }

    let code = shutdown.exit_code();
    drop(shutdown);
    code
}
