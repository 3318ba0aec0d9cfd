//! PID 1 for single-workload guests.
//!
//! Boot sequence, driven by the `guest-init` binary:
//! 1. Load the image configuration ([`config`])
//! 2. Mount `/proc`, arm the power-off guard ([`shutdown`]), mount the rest
//!    ([`mounts`])
//! 3. Bring up loopback and the primary link, configure addresses
//!    ([`network`])
//! 4. Start the workload ([`launcher`]) and supervise it until it exits
//!    ([`supervisor`])
//! 5. Sync and power off
//!
//! Steps 2 to 5 after the `/proc` mount are driven by [`boot`]. The zombie
//! reaper ([`pid1`]) runs on its own thread from the start.

pub mod boot;
pub mod command;
pub mod config;
pub mod error;
pub mod launcher;
pub mod mounts;
pub mod network;
pub mod pid1;
pub mod shutdown;
pub mod supervisor;

pub use error::{InitError, InitResult};
