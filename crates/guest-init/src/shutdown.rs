//! Power-off through the magic SysRq trigger.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use tracing::{error, info};

use crate::error::{InitError, InitResult};

pub const DEFAULT_SYSRQ_TRIGGER: &str = "/proc/sysrq-trigger";

const SYNC: char = 's';
const POWER_OFF: char = 'o';

/// Emergency sync, then power off.
const SEQUENCE: [char; 2] = [SYNC, POWER_OFF];

/// Write the shutdown sequence to `trigger`.
pub fn power_off(trigger: &Path) -> InitResult<()> {
    let sysrq_err = |marker: char| {
        let path = trigger.to_path_buf();
        move |source| InitError::Sysrq {
            marker,
            path,
            source,
        }
    };

    let mut file = OpenOptions::new()
        .write(true)
        .open(trigger)
        .map_err(sysrq_err(SYNC))?;
    for marker in SEQUENCE {
        let mut buf = [0u8; 4];
        file.write_all(marker.encode_utf8(&mut buf).as_bytes())
            .map_err(sysrq_err(marker))?;
    }
    Ok(())
}

/// Powers the machine off when dropped.
///
/// Armed as soon as `/proc` is available so that every exit path of boot,
/// including fatal errors, ends in a power-off. After a successful request
/// the dropping thread parks until the kernel stops the machine. If the
/// request fails, init exits with the recorded status instead.
#[derive(Debug)]
#[must_use]
pub struct Shutdown {
    trigger: PathBuf,
    exit_code: u8,
    park: bool,
}

impl Shutdown {
    pub fn arm(trigger: impl Into<PathBuf>) -> Self {
        Self {
            trigger: trigger.into(),
            exit_code: 1,
            park: true,
        }
    }

    /// Return from drop once the sequence is written instead of waiting for
    /// the kernel to stop the machine. For triggers that are not the real
    /// sysrq file.
    pub fn without_park(mut self) -> Self {
        self.park = false;
        self
    }

    /// Record the status to exit with if power-off fails.
    pub fn set_exit_code(&mut self, code: i32) {
        self.exit_code = u8::try_from(code).unwrap_or(u8::MAX);
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        info!(trigger = %self.trigger.display(), "powering off");
        match power_off(&self.trigger) {
            Ok(()) if self.park => loop {
                thread::park();
            },
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, exit_code = self.exit_code, "power-off failed");
                std::process::exit(i32::from(self.exit_code));
            }
        }
    }
}
