//! Address configuration through busybox `udhcpc` / `udhcpc6`.
//!
//! The DHCP exchange itself (broadcast to `255.255.255.255:67`, or the
//! `ff02::1:2` relay multicast group on port 547 for v6) is the client's
//! business. The client is pointed back at this binary as its hook script;
//! the hook prints the lease as `key=value` lines and init applies it with
//! `ip` and `/etc/resolv.conf`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{self, find_program};

use super::error::{NetworkError, Result};
use super::lease::{Lease, Protocol};

/// Environment marker telling this binary it was started as the DHCP hook.
pub const HOOK_ENV: &str = "GUEST_INIT_DHCP_HOOK";

/// Lease parameters the hook forwards, as exported by udhcpc.
const HOOK_KEYS: &[&str] = &[
    "ip",
    "mask",
    "subnet",
    "router",
    "dns",
    "lease",
    "boot_file",
    "siaddr",
    "ipv6",
];

const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Upper bound for a single `ip` invocation.
const IP_DEADLINE: Duration = Duration::from_secs(10);

/// Parameters for one round of DHCP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpRequest {
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub retries: u32,
    pub ipv4: bool,
    pub ipv6: bool,
}

impl DhcpRequest {
    /// Whole-request budget: every attempt plus slack for process startup.
    fn deadline(&self) -> Duration {
        self.timeout
            .saturating_mul(self.retries.saturating_add(1))
            .saturating_add(Duration::from_secs(5))
    }
}

/// Outcome of a lease request for one link and protocol.
#[derive(Debug)]
pub struct LeaseResult {
    pub link: String,
    pub protocol: Protocol,
    pub lease: Result<Lease>,
}

/// Address-configuration primitives.
#[async_trait]
pub trait Addressing: Send + Sync {
    /// Request leases on every link for each enabled protocol.
    async fn dhcp(
        &self,
        links: &[String],
        request: DhcpRequest,
        cancel: &CancellationToken,
    ) -> Vec<LeaseResult>;

    /// One bounded network-boot exchange on `link`.
    async fn netboot(
        &self,
        link: &str,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Lease>;

    /// Configure `lease` on `link`.
    async fn apply(&self, link: &str, lease: &Lease, cancel: &CancellationToken) -> Result<()>;
}

/// [`Addressing`] backed by busybox `udhcpc`, `udhcpc6` and `ip`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Udhcpc;

fn client_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::V4 => "udhcpc",
        Protocol::V6 => "udhcpc6",
    }
}

fn client_args(link: &str, request: DhcpRequest, hook: &str) -> Vec<String> {
    vec![
        "-i".into(),
        link.to_string(),
        // Foreground, quit once bound, fail instead of backgrounding.
        "-f".into(),
        "-q".into(),
        "-n".into(),
        "-t".into(),
        request.retries.to_string(),
        "-T".into(),
        request.timeout.as_secs().max(1).to_string(),
        "-s".into(),
        hook.to_string(),
    ]
}

async fn request_lease(
    link: &str,
    protocol: Protocol,
    request: DhcpRequest,
    hook: PathBuf,
    cancel: &CancellationToken,
) -> Result<Lease> {
    let program = find_program(client_name(protocol))?;
    let hook = hook.display().to_string();
    let args = client_args(link, request, &hook);
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let report = command::exec(
        &program,
        &args,
        &[(HOOK_ENV, "1")],
        request.deadline(),
        cancel,
    )
    .await?;
    debug!(link, %protocol, report = %report, "dhcp client report");
    if report.is_empty() {
        return Err(NetworkError::NoLease(link.to_string()));
    }
    Lease::parse_report(protocol, &report)
}

fn hook_path() -> Result<PathBuf> {
    std::env::current_exe().map_err(NetworkError::HookPath)
}

#[async_trait]
impl Addressing for Udhcpc {
    async fn dhcp(
        &self,
        links: &[String],
        request: DhcpRequest,
        cancel: &CancellationToken,
    ) -> Vec<LeaseResult> {
        let mut protocols = Vec::new();
        if request.ipv4 {
            protocols.push(Protocol::V4);
        }
        if request.ipv6 {
            protocols.push(Protocol::V6);
        }

        let mut tasks = JoinSet::new();
        for link in links {
            for &protocol in &protocols {
                let link = link.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let lease = match hook_path() {
                        Ok(hook) => request_lease(&link, protocol, request, hook, &cancel).await,
                        Err(e) => Err(e),
                    };
                    LeaseResult {
                        link,
                        protocol,
                        lease,
                    }
                });
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "dhcp request task failed"),
            }
        }
        results
    }

    async fn netboot(
        &self,
        link: &str,
        timeout: Duration,
        retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        let request = DhcpRequest {
            timeout,
            retries,
            ipv4: true,
            ipv6: false,
        };
        let lease = request_lease(link, Protocol::V4, request, hook_path()?, cancel).await?;
        info!(
            link,
            address = %lease.address,
            server = ?lease.server,
            boot_file = ?lease.boot_file,
            "netboot answered"
        );
        Ok(lease)
    }

    async fn apply(&self, link: &str, lease: &Lease, cancel: &CancellationToken) -> Result<()> {
        let ip = find_program("ip")?;
        for args in lease.ip_commands(link) {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            command::exec(&ip, &args, &[], IP_DEADLINE, cancel).await?;
        }

        update_resolv_conf(Path::new(RESOLV_CONF), lease).await
    }
}

/// Add the lease's name servers to `path`. A missing file starts empty.
async fn update_resolv_conf(path: &Path, lease: &Lease) -> Result<()> {
    let existing = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(NetworkError::ResolvConf(e)),
    };
    if let Some(merged) = lease.merge_resolv_conf(&existing) {
        tokio::fs::write(path, merged)
            .await
            .map_err(NetworkError::ResolvConf)?;
    }
    Ok(())
}

/// Lease lines for a hook invocation: `event` plus the client's exported
/// variables. Only `bound` and `renew` carry a lease.
pub fn hook_report<F>(event: &str, lookup: F) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    if !matches!(event, "bound" | "renew") {
        return Vec::new();
    }
    HOOK_KEYS
        .iter()
        .filter_map(|key| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .map(|v| format!("{key}={v}"))
        })
        .collect()
}

/// Entry point when the DHCP client runs this binary as its hook script.
///
/// Returns `None` when not running as a hook.
pub fn run_hook() -> Option<std::process::ExitCode> {
    std::env::var_os(HOOK_ENV)?;
    let event = std::env::args().nth(1).unwrap_or_default();
    let lines = hook_report(&event, |key| std::env::var(key).ok());

    let mut stdout = std::io::stdout().lock();
    for line in lines {
        if writeln!(stdout, "{line}").is_err() {
            return Some(std::process::ExitCode::FAILURE);
        }
    }
    Some(std::process::ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request() -> DhcpRequest {
        DhcpRequest {
            timeout: Duration::from_secs(10),
            retries: 3,
            ipv4: true,
            ipv6: false,
        }
    }

    #[test]
    fn deadline_covers_every_attempt() {
        assert_eq!(request().deadline(), Duration::from_secs(45));
    }

    #[test]
    fn client_args_are_bounded_and_foreground() {
        let args = client_args("eth0", request(), "/sbin/guest-init");
        assert_eq!(
            args,
            vec![
                "-i",
                "eth0",
                "-f",
                "-q",
                "-n",
                "-t",
                "3",
                "-T",
                "10",
                "-s",
                "/sbin/guest-init"
            ]
        );
    }

    #[test]
    fn client_names() {
        assert_eq!(client_name(Protocol::V4), "udhcpc");
        assert_eq!(client_name(Protocol::V6), "udhcpc6");
    }

    #[test]
    fn hook_reports_bound_lease() {
        let env: HashMap<&str, &str> = [
            ("ip", "10.0.2.15"),
            ("mask", "24"),
            ("router", "10.0.2.2"),
            ("dns", ""),
            ("interface", "eth0"),
        ]
        .into_iter()
        .collect();
        let lines = hook_report("bound", |key| env.get(key).map(|v| v.to_string()));
        assert_eq!(lines, vec!["ip=10.0.2.15", "mask=24", "router=10.0.2.2"]);

        let lease = Lease::parse_report(Protocol::V4, &lines.join("\n")).unwrap();
        assert_eq!(lease.prefix_len, 24);
    }

    #[tokio::test]
    async fn resolv_conf_created_then_merged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        let lease = Lease::parse_report(Protocol::V4, "ip=10.0.2.15\ndns=10.0.2.3\n").unwrap();

        update_resolv_conf(&path, &lease).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "nameserver 10.0.2.3\n");

        std::fs::write(&path, "search lan\n").unwrap();
        update_resolv_conf(&path, &lease).await.unwrap();
        update_resolv_conf(&path, &lease).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "search lan\nnameserver 10.0.2.3\n"
        );
    }

    #[tokio::test]
    async fn resolv_conf_read_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let lease = Lease::parse_report(Protocol::V4, "ip=10.0.2.15\ndns=10.0.2.3\n").unwrap();
        // A directory cannot be read as a file.
        let err = update_resolv_conf(dir.path(), &lease).await.unwrap_err();
        assert!(matches!(err, NetworkError::ResolvConf(_)), "got: {err}");
    }

    #[test]
    fn hook_ignores_other_events() {
        for event in ["deconfig", "leasefail", "nak", ""] {
            assert!(hook_report(event, |_| Some("x".into())).is_empty(), "{event}");
        }
    }
}
