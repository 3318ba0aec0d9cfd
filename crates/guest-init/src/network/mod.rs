//! Network bring-up for the guest.
//!
//! 1. Loopback up (fatal on failure)
//! 2. First broadcast + multicast capable link selected and brought up
//!    (fatal if missing or stuck down)
//! 3. Address configuration per [`NetworkMode`]
//!
//! Every step observes the boot cancellation token.

mod dhcp;
mod error;
mod lease;
mod link;

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{NetworkConfig, NetworkMode};
use crate::error::{InitError, InitResult};

pub use dhcp::{Addressing, DhcpRequest, HOOK_ENV, LeaseResult, Udhcpc, hook_report, run_hook};
pub use error::NetworkError;
pub use lease::{Lease, Protocol};
pub use link::{KernelLinks, Link, LinkControl};

pub const LOOPBACK: &str = "lo";

/// Netboot runs with fixed, short bounds regardless of the DHCP settings.
pub const NETBOOT_TIMEOUT: Duration = Duration::from_secs(5);
pub const NETBOOT_RETRIES: u32 = 3;

/// The first link that is not loopback and supports broadcast and multicast.
pub fn select_primary(links: &[Link]) -> Option<&Link> {
    links.iter().find(|l| l.is_primary_candidate())
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> InitResult<()> {
    if cancel.is_cancelled() {
        return Err(InitError::Cancelled);
    }
    Ok(())
}

/// Bring the guest network up.
pub async fn bring_up<L, A>(
    config: &NetworkConfig,
    links: &L,
    addressing: &A,
    cancel: &CancellationToken,
) -> InitResult<()>
where
    L: LinkControl,
    A: Addressing,
{
    ensure_not_cancelled(cancel)?;
    links.set_up(LOOPBACK)?;
    info!("loopback up");

    if config.mode == NetworkMode::None {
        info!("network mode none, skipping link setup");
        return Ok(());
    }

    let available = links.links()?;
    let primary = select_primary(&available)
        .ok_or(NetworkError::NoSuitableLink)?
        .name
        .clone();
    links.set_up(&primary)?;
    info!(link = %primary, mode = ?config.mode, "primary link up");
    ensure_not_cancelled(cancel)?;

    match config.mode {
        NetworkMode::None => {}
        NetworkMode::Static => {
            let lease = Lease::from_static(config)
                .map_err(|e| InitError::NetworkConfig(e.to_string()))?;
            match addressing.apply(&primary, &lease, cancel).await {
                Ok(()) => info!(link = %primary, address = %lease.address, "static address applied"),
                Err(e) => warn!(link = %primary, error = %e, "cannot apply static address"),
            }
        }
        NetworkMode::Dhcpv4 | NetworkMode::Dhcpv4v6 => {
            let request = DhcpRequest {
                timeout: Duration::from_secs(config.timeout_secs),
                retries: config.retries,
                ipv4: true,
                ipv6: config.mode == NetworkMode::Dhcpv4v6,
            };
            configure_dhcp(&primary, request, addressing, cancel).await;
        }
        NetworkMode::Netboot => {
            let lease = addressing
                .netboot(&primary, NETBOOT_TIMEOUT, NETBOOT_RETRIES, cancel)
                .await;
            ensure_not_cancelled(cancel)?;
            let lease = lease?;
            addressing.apply(&primary, &lease, cancel).await?;
            info!(link = %primary, address = %lease.address, "netboot address applied");
        }
    }

    ensure_not_cancelled(cancel)
}

/// Request leases and apply each one. Per-link failures are logged only.
async fn configure_dhcp<A: Addressing>(
    link: &str,
    request: DhcpRequest,
    addressing: &A,
    cancel: &CancellationToken,
) {
    let results = addressing.dhcp(&[link.to_string()], request, cancel).await;
    for LeaseResult {
        link,
        protocol,
        lease,
    } in results
    {
        let lease = match lease {
            Ok(lease) => lease,
            Err(e) => {
                warn!(%link, %protocol, error = %e, "no lease");
                continue;
            }
        };
        match addressing.apply(&link, &lease, cancel).await {
            Ok(()) => info!(
                %link,
                %protocol,
                address = %lease.address,
                prefix_len = lease.prefix_len,
                lease_secs = ?lease.lease_secs,
                "lease applied"
            ),
            Err(e) => warn!(%link, %protocol, error = %e, "cannot apply lease"),
        }
    }
    info!("dhcp configuration finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::Mutex;

    fn link(name: &str, loopback: bool, broadcast: bool, multicast: bool) -> Link {
        Link {
            name: name.into(),
            loopback,
            broadcast,
            multicast,
        }
    }

    fn lease(protocol: Protocol, address: &str) -> Lease {
        Lease {
            protocol,
            address: address.parse().unwrap(),
            prefix_len: 24,
            router: None,
            dns: Vec::new(),
            lease_secs: None,
            boot_file: None,
            server: None,
        }
    }

    #[derive(Default)]
    struct FakeLinks {
        links: Vec<Link>,
        stuck_down: Vec<&'static str>,
        up: Mutex<Vec<String>>,
    }

    impl FakeLinks {
        fn standard() -> Self {
            Self {
                links: vec![
                    link("lo", true, false, false),
                    link("sit0", false, false, false),
                    link("eth0", false, true, true),
                    link("eth1", false, true, true),
                ],
                ..Self::default()
            }
        }

        fn up(&self) -> Vec<String> {
            self.up.lock().unwrap().clone()
        }
    }

    impl LinkControl for FakeLinks {
        fn links(&self) -> error::Result<Vec<Link>> {
            Ok(self.links.clone())
        }

        fn set_up(&self, name: &str) -> error::Result<()> {
            if self.stuck_down.iter().any(|s| *s == name) {
                return Err(NetworkError::LinkUp {
                    link: name.into(),
                    source: std::io::Error::from_raw_os_error(libc::ENODEV),
                });
            }
            self.up.lock().unwrap().push(name.into());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeAddressing {
        v4: Option<Lease>,
        v6: Option<Lease>,
        netboot: Option<Lease>,
        fail_apply: bool,
        requests: Mutex<Vec<DhcpRequest>>,
        applied: Mutex<Vec<(String, IpAddr)>>,
    }

    impl FakeAddressing {
        fn applied(&self) -> Vec<(String, IpAddr)> {
            self.applied.lock().unwrap().clone()
        }

        fn requests(&self) -> Vec<DhcpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Addressing for FakeAddressing {
        async fn dhcp(
            &self,
            links: &[String],
            request: DhcpRequest,
            _cancel: &CancellationToken,
        ) -> Vec<LeaseResult> {
            self.requests.lock().unwrap().push(request);
            let mut results = Vec::new();
            for link in links {
                let mut wanted = vec![(Protocol::V4, &self.v4)];
                if request.ipv6 {
                    wanted.push((Protocol::V6, &self.v6));
                }
                for (protocol, lease) in wanted {
                    results.push(LeaseResult {
                        link: link.clone(),
                        protocol,
                        lease: lease.clone().ok_or_else(|| NetworkError::NoLease(link.clone())),
                    });
                }
            }
            results
        }

        async fn netboot(
            &self,
            link: &str,
            _timeout: Duration,
            _retries: u32,
            _cancel: &CancellationToken,
        ) -> error::Result<Lease> {
            self.netboot
                .clone()
                .ok_or_else(|| NetworkError::NoLease(link.into()))
        }

        async fn apply(
            &self,
            link: &str,
            lease: &Lease,
            _cancel: &CancellationToken,
        ) -> error::Result<()> {
            if self.fail_apply {
                return Err(NetworkError::InvalidLease("refused".into()));
            }
            self.applied
                .lock()
                .unwrap()
                .push((link.to_string(), lease.address));
            Ok(())
        }
    }

    fn config(mode: NetworkMode) -> NetworkConfig {
        NetworkConfig {
            mode,
            ..NetworkConfig::default()
        }
    }

    #[test]
    fn select_primary_skips_loopback_and_incapable_links() {
        let links = FakeLinks::standard().links;
        assert_eq!(select_primary(&links).unwrap().name, "eth0");
        assert!(select_primary(&links[..2]).is_none());
    }

    #[tokio::test]
    async fn dhcp_applies_lease_on_primary() {
        let links = FakeLinks::standard();
        let addressing = FakeAddressing {
            v4: Some(lease(Protocol::V4, "10.0.2.15")),
            ..FakeAddressing::default()
        };

        bring_up(
            &config(NetworkMode::Dhcpv4),
            &links,
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(links.up(), vec!["lo", "eth0"]);
        let requests = addressing.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].ipv4 && !requests[0].ipv6);
        assert_eq!(requests[0].timeout, Duration::from_secs(10));
        assert_eq!(requests[0].retries, 3);
        assert_eq!(
            addressing.applied(),
            vec![("eth0".to_string(), "10.0.2.15".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn dhcp_lease_errors_are_not_fatal() {
        let links = FakeLinks::standard();
        let addressing = FakeAddressing {
            v6: Some(lease(Protocol::V6, "fd00::15")),
            ..FakeAddressing::default()
        };

        bring_up(
            &config(NetworkMode::Dhcpv4v6),
            &links,
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(addressing.requests()[0].ipv6);
        assert_eq!(
            addressing.applied(),
            vec![("eth0".to_string(), "fd00::15".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn dhcp_apply_errors_are_not_fatal() {
        let addressing = FakeAddressing {
            v4: Some(lease(Protocol::V4, "10.0.2.15")),
            fail_apply: true,
            ..FakeAddressing::default()
        };

        bring_up(
            &config(NetworkMode::Dhcpv4),
            &FakeLinks::standard(),
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn loopback_failure_is_fatal() {
        let links = FakeLinks {
            stuck_down: vec!["lo"],
            ..FakeLinks::standard()
        };
        let addressing = FakeAddressing::default();

        let err = bring_up(
            &config(NetworkMode::Dhcpv4),
            &links,
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, InitError::Network(NetworkError::LinkUp { ref link, .. }) if link == "lo"),
            "got: {err}"
        );
        assert!(addressing.requests().is_empty());
    }

    #[tokio::test]
    async fn missing_capable_link_is_fatal_before_addressing() {
        let links = FakeLinks {
            links: vec![link("lo", true, false, false), link("tun0", false, false, true)],
            ..FakeLinks::default()
        };
        let addressing = FakeAddressing::default();

        let err = bring_up(
            &config(NetworkMode::Dhcpv4),
            &links,
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, InitError::Network(NetworkError::NoSuitableLink)),
            "got: {err}"
        );
        assert_eq!(links.up(), vec!["lo"]);
        assert!(addressing.requests().is_empty());
        assert!(addressing.applied().is_empty());
    }

    #[tokio::test]
    async fn primary_stuck_down_is_fatal() {
        let links = FakeLinks {
            stuck_down: vec!["eth0"],
            ..FakeLinks::standard()
        };

        let err = bring_up(
            &config(NetworkMode::Dhcpv4),
            &links,
            &FakeAddressing::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, InitError::Network(NetworkError::LinkUp { ref link, .. }) if link == "eth0"),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn netboot_failure_is_fatal() {
        let err = bring_up(
            &config(NetworkMode::Netboot),
            &FakeLinks::standard(),
            &FakeAddressing::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(
            matches!(err, InitError::Network(NetworkError::NoLease(_))),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn netboot_lease_is_applied() {
        let addressing = FakeAddressing {
            netboot: Some(lease(Protocol::V4, "10.1.0.5")),
            ..FakeAddressing::default()
        };

        bring_up(
            &config(NetworkMode::Netboot),
            &FakeLinks::standard(),
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(addressing.requests().is_empty());
        assert_eq!(
            addressing.applied(),
            vec![("eth0".to_string(), "10.1.0.5".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn static_mode_applies_configured_address() {
        let addressing = FakeAddressing::default();
        let config = NetworkConfig {
            mode: NetworkMode::Static,
            address: Some("192.168.100.2/24".into()),
            gateway: Some("192.168.100.1".into()),
            ..NetworkConfig::default()
        };

        bring_up(
            &config,
            &FakeLinks::standard(),
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            addressing.applied(),
            vec![("eth0".to_string(), "192.168.100.2".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn static_mode_without_address_is_fatal() {
        let err = bring_up(
            &config(NetworkMode::Static),
            &FakeLinks::standard(),
            &FakeAddressing::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, InitError::NetworkConfig(_)), "got: {err}");
    }

    #[tokio::test]
    async fn mode_none_only_raises_loopback() {
        let links = FakeLinks::standard();
        let addressing = FakeAddressing::default();

        bring_up(
            &config(NetworkMode::None),
            &links,
            &addressing,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(links.up(), vec!["lo"]);
        assert!(addressing.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_boot_does_not_touch_links() {
        let links = FakeLinks::standard();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bring_up(
            &config(NetworkMode::Dhcpv4),
            &links,
            &FakeAddressing::default(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, InitError::Cancelled), "got: {err}");
        assert!(links.up().is_empty());
    }
}
