//! Workload launch: argv, identity, environment, working directory.

use std::collections::BTreeMap;

use tokio::process::{Child, Command};
use tracing::info;

use crate::config::{Accounts, ImageConfiguration, UnmatchedGid};
use crate::error::{InitError, InitResult};
use crate::pid1::{self, Awaited};

/// Numeric credentials the workload runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
}

impl Identity {
    pub const ROOT: Identity = Identity { uid: 0, gid: 0 };
}

/// Everything needed to start the workload, resolved from the image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub argv: Vec<String>,
    pub identity: Identity,
    pub env: BTreeMap<String, String>,
    /// `None` inherits init's working directory.
    pub work_dir: Option<String>,
}

fn split(field: &'static str, value: &str) -> InitResult<Vec<String>> {
    shlex::split(value).ok_or_else(|| InitError::Lex {
        field,
        value: value.to_string(),
    })
}

/// Entrypoint tokens followed by cmd tokens.
pub fn resolve_argv(entrypoint: &str, cmd: &str) -> InitResult<Vec<String>> {
    let mut argv = split("entrypoint", entrypoint)?;
    argv.extend(split("cmd", cmd)?);
    if argv.is_empty() {
        return Err(InitError::EmptyCommand);
    }
    Ok(argv)
}

/// Resolve `run-as` to a uid/gid pair.
///
/// A user record matching by name or by stringified uid wins over reading
/// `run-as` as a number.
pub fn resolve_identity(accounts: &Accounts) -> InitResult<Identity> {
    let run_as = accounts.run_as.as_str();
    if run_as.is_empty() {
        return Ok(Identity::ROOT);
    }

    if let Some(user) = accounts
        .users
        .iter()
        .find(|u| u.username == run_as || u.uid.to_string() == run_as)
    {
        return Ok(Identity {
            uid: user.uid,
            gid: user.gid,
        });
    }

    if run_as == "root" {
        return Ok(Identity::ROOT);
    }

    let uid: u32 = run_as
        .parse()
        .map_err(|_| InitError::Identity(run_as.to_string()))?;
    let gid = match accounts.unmatched_gid {
        UnmatchedGid::Root => 0,
        UnmatchedGid::Uid => uid,
    };
    Ok(Identity { uid, gid })
}

impl Workload {
    /// Resolve the workload from the image configuration, consuming it.
    pub fn resolve(config: ImageConfiguration) -> InitResult<Self> {
        let argv = resolve_argv(&config.entrypoint.command, &config.cmd)?;
        let identity = resolve_identity(&config.accounts)?;
        let work_dir = Some(config.work_dir).filter(|d| !d.is_empty());
        Ok(Self {
            argv,
            identity,
            env: config.environment,
            work_dir,
        })
    }

    /// The workload environment as `name=value` strings.
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }

    fn command(&self) -> InitResult<Command> {
        let (program, args) = self.argv.split_first().ok_or(InitError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&self.env)
            .uid(self.identity.uid)
            .gid(self.identity.gid);
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        pid1::reset_signal_handlers_for_exec(&mut cmd);
        Ok(cmd)
    }

    /// Start the workload with init's standard streams.
    ///
    /// The returned registration keeps the reaper away from the child until
    /// the supervisor has collected it.
    pub fn spawn(&self) -> InitResult<(Child, Awaited)> {
        let mut cmd = self.command()?;
        let program = self.argv.first().cloned().unwrap_or_default();
        let (child, awaited) =
            pid1::spawn_tracked(&mut cmd).map_err(|source| InitError::Spawn { program, source })?;
        info!(
            pid = ?awaited.pid(),
            argv = ?self.argv,
            uid = self.identity.uid,
            gid = self.identity.gid,
            work_dir = ?self.work_dir,
            "workload started"
        );
        Ok((child, awaited))
    }
}
