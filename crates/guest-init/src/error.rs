use std::path::PathBuf;

use crate::network::NetworkError;

/// Errors that abort boot.
///
/// Each variant names the step that failed; the logged-and-continue paths
/// (non-proc mounts, per-link lease errors, config read errors) never reach
/// this type.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid network config: {0}")]
    NetworkConfig(String),

    #[error("mount {target}: {source}")]
    Mount {
        target: String,
        source: nix::Error,
    },

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("nothing to run: entrypoint and cmd are both empty")]
    EmptyCommand,

    #[error("cannot split {field} {value:?}: unbalanced quoting")]
    Lex { field: &'static str, value: String },

    #[error("cannot resolve run-as {0:?}: no matching user and not a numeric uid")]
    Identity(String),

    #[error("start workload {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("wait for workload: {0}")]
    Wait(std::io::Error),

    #[error("register signal relay: {0}")]
    Signal(std::io::Error),

    #[error("write {marker:?} to {path}: {source}")]
    Sysrq {
        marker: char,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("boot cancelled")]
    Cancelled,

    #[error("build async runtime: {0}")]
    Runtime(std::io::Error),
}

pub type InitResult<T> = Result<T, InitError>;
