//! Wired network bring-up.
//!
//! Tries each Ethernet interface in turn: bring the link up, run a DHCP
//! client on it, and accept the first interface that ends up with a default
//! route. Wireless interfaces are never considered.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use thinboot_core::error::{BootFailure, Result, ThinbootError};
use thinboot_core::wire::normalize_mac;

use crate::process::CommandRunner;

/// `ARPHRD_ETHER` in `/sys/class/net/<iface>/type`.
const ARPHRD_ETHER: u32 = 1;

const RTF_UP: u32 = 0x0001;
const RTF_GATEWAY: u32 = 0x0002;

/// The interface that came up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLease {
    pub interface: String,
    /// Upper-case colon form, used as the terminal's identity.
    pub mac: String,
}

/// Brings a link up before DHCP runs on it.
#[async_trait]
pub trait LinkControl: Send + Sync {
    async fn set_up(&self, interface: &str) -> Result<()>;
}

/// Link control through `SIOCSIFFLAGS`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoctlLink;

#[async_trait]
impl LinkControl for IoctlLink {
    async fn set_up(&self, interface: &str) -> Result<()> {
        set_interface_up(interface)
    }
}

/// Bring an interface up using ioctl SIOCGIFFLAGS/SIOCSIFFLAGS.
#[cfg(target_os = "linux")]
pub fn set_interface_up(name: &str) -> Result<()> {
    let link_error = |what: &str| {
        ThinbootError::BringUpError(format!(
            "{} failed for {}: {}",
            what,
            name,
            std::io::Error::last_os_error()
        ))
    };

    if name.is_empty() || name.len() >= libc::IFNAMSIZ {
        return Err(ThinbootError::BringUpError(format!(
            "invalid interface name '{}'",
            name
        )));
    }

    let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
    if sock < 0 {
        return Err(link_error("socket"));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }

    let result = (|| {
        if unsafe { libc::ioctl(sock, libc::SIOCGIFFLAGS as _, &mut ifr) } < 0 {
            return Err(link_error("SIOCGIFFLAGS"));
        }
        unsafe {
            ifr.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
        }
        if unsafe { libc::ioctl(sock, libc::SIOCSIFFLAGS as _, &ifr) } < 0 {
            return Err(link_error("SIOCSIFFLAGS"));
        }
        Ok(())
    })();

    unsafe { libc::close(sock) };
    result
}

#[cfg(not(target_os = "linux"))]
pub fn set_interface_up(name: &str) -> Result<()> {
    tracing::info!(interface = name, "Skipping link setup on non-Linux platform (development mode)");
    Ok(())
}

/// Wired Ethernet interfaces under `sys_class_net`, sorted by name.
pub fn wired_interfaces(sys_class_net: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sys_class_net) else {
        return Vec::new();
    };
    let mut interfaces: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            let dir = e.path();
            let link_type = fs::read_to_string(dir.join("type"))
                .ok()
                .and_then(|t| t.trim().parse::<u32>().ok());
            let wireless = dir.join("wireless").exists() || dir.join("phy80211").exists();
            (name != "lo" && link_type == Some(ARPHRD_ETHER) && !wireless).then_some(name)
        })
        .collect();
    interfaces.sort();
    interfaces
}

/// Hardware address of an interface, normalized.
pub fn interface_mac(sys_class_net: &Path, interface: &str) -> Option<String> {
    fs::read_to_string(sys_class_net.join(interface).join("address"))
        .ok()
        .and_then(|a| normalize_mac(a.trim()))
}

/// Whether the kernel routing table (`/proc/net/route` format) holds a usable
/// default route through `interface`.
pub fn has_default_route(route_table: &str, interface: &str) -> bool {
    route_table.lines().skip(1).any(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != interface || fields[1] != "00000000" {
            return false;
        }
        let flags = u32::from_str_radix(fields[3], 16).unwrap_or(0);
        flags & (RTF_UP | RTF_GATEWAY) == (RTF_UP | RTF_GATEWAY)
    })
}

/// Network bring-up over the wired interfaces.
pub struct NetworkBringUp<'a> {
    runner: &'a dyn CommandRunner,
    link: &'a dyn LinkControl,
    udhcpc: PathBuf,
    dhcp_timeout: Duration,
    sys_class_net: PathBuf,
    route_table: PathBuf,
}

impl<'a> NetworkBringUp<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        link: &'a dyn LinkControl,
        udhcpc: impl Into<PathBuf>,
        dhcp_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            link,
            udhcpc: udhcpc.into(),
            dhcp_timeout,
            sys_class_net: PathBuf::from("/sys/class/net"),
            route_table: PathBuf::from("/proc/net/route"),
        }
    }

    /// Use different sysfs and routing-table paths.
    pub fn with_paths(mut self, sys_class_net: impl Into<PathBuf>, route_table: impl Into<PathBuf>) -> Self {
        self.sys_class_net = sys_class_net.into();
        self.route_table = route_table.into();
        self
    }

    /// Bring up the first interface that obtains a lease and a default
    /// route. No such interface is a boundary-condition failure.
    pub async fn run(&self) -> std::result::Result<NetworkLease, BootFailure> {
        if let Err(e) = self.link.set_up("lo").await {
            tracing::warn!(error = %e, "Failed to bring up loopback");
        }

        let interfaces = wired_interfaces(&self.sys_class_net);
        if interfaces.is_empty() {
            return Err(BootFailure::BoundaryCondition(
                "no wired network interface found".to_string(),
            ));
        }

        let mut reasons = Vec::new();
        for interface in &interfaces {
            match self.try_interface(interface).await {
                Ok(lease) => {
                    tracing::info!(interface = %lease.interface, mac = %lease.mac, "Network is up");
                    return Ok(lease);
                }
                Err(e) => {
                    tracing::warn!(interface = %interface, error = %e, "Interface did not come up");
                    reasons.push(format!("{}: {}", interface, e));
                }
            }
        }
        Err(BootFailure::BoundaryCondition(reasons.join("; ")))
    }

    async fn try_interface(&self, interface: &str) -> Result<NetworkLease> {
        self.link.set_up(interface).await?;

        let retries = self.dhcp_timeout.as_secs().max(1).to_string();
        let args: Vec<String> = ["-i", interface, "-n", "-q", "-f", "-t", &retries, "-T", "1"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.runner.run(&self.udhcpc, &args).await?;
        if !output.success() {
            return Err(ThinbootError::BringUpError(format!(
                "DHCP failed ({}): {}",
                output.exit,
                output.combined()
            )));
        }

        let routes = fs::read_to_string(&self.route_table)?;
        if !has_default_route(&routes, interface) {
            return Err(ThinbootError::BringUpError(
                "lease obtained but no default route".to_string(),
            ));
        }

        let mac = interface_mac(&self.sys_class_net, interface).ok_or_else(|| {
            ThinbootError::BringUpError(format!("{} has no hardware address", interface))
        })?;
        Ok(NetworkLease {
            interface: interface.to_string(),
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bringup::tests::ScriptedRunner;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const ROUTES_ETH1: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT\n\
        eth1\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0\n\
        eth1\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0\n";

    #[derive(Default)]
    struct RecordingLink {
        raised: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LinkControl for RecordingLink {
        async fn set_up(&self, interface: &str) -> Result<()> {
            self.raised.lock().push(interface.to_string());
            Ok(())
        }
    }

    fn add_iface(sys: &Path, name: &str, link_type: u32, mac: &str, wireless: bool) {
        let dir = sys.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("type"), format!("{}\n", link_type)).unwrap();
        fs::write(dir.join("address"), format!("{}\n", mac)).unwrap();
        if wireless {
            fs::create_dir_all(dir.join("wireless")).unwrap();
        }
    }

    fn sysfs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let sys = tmp.path().join("net");
        add_iface(&sys, "lo", 772, "00:00:00:00:00:00", false);
        add_iface(&sys, "eth0", 1, "52:54:00:aa:bb:01", false);
        add_iface(&sys, "eth1", 1, "52:54:00:aa:bb:02", false);
        add_iface(&sys, "wlan0", 1, "52:54:00:aa:bb:03", true);
        tmp
    }

    #[test]
    fn test_wired_interfaces_skip_loopback_and_wireless() {
        let tmp = sysfs();
        assert_eq!(wired_interfaces(&tmp.path().join("net")), vec!["eth0", "eth1"]);
        assert!(wired_interfaces(&tmp.path().join("missing")).is_empty());
    }

    #[test]
    fn test_interface_mac_normalized() {
        let tmp = sysfs();
        assert_eq!(
            interface_mac(&tmp.path().join("net"), "eth0").as_deref(),
            Some("52:54:00:AA:BB:01")
        );
    }

    #[test]
    fn test_has_default_route() {
        assert!(has_default_route(ROUTES_ETH1, "eth1"));
        assert!(!has_default_route(ROUTES_ETH1, "eth0"));
        let down = ROUTES_ETH1.replace("\t0003\t", "\t0002\t");
        assert!(!has_default_route(&down, "eth1"));
    }

    #[tokio::test]
    async fn test_first_working_interface_wins() {
        let tmp = sysfs();
        let routes = tmp.path().join("route");
        fs::write(&routes, ROUTES_ETH1).unwrap();

        let runner = ScriptedRunner::default();
        let link = RecordingLink::default();
        // eth0 gets a lease but no default route; eth1 has one.
        let lease = NetworkBringUp::new(&runner, &link, "/sbin/udhcpc", Duration::from_secs(5))
            .with_paths(tmp.path().join("net"), &routes)
            .run()
            .await
            .unwrap();

        assert_eq!(lease.interface, "eth1");
        assert_eq!(lease.mac, "52:54:00:AA:BB:02");
        assert_eq!(*link.raised.lock(), vec!["lo", "eth0", "eth1"]);
        assert_eq!(runner.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_all_interfaces_failing_is_boundary_failure() {
        let tmp = sysfs();
        let routes = tmp.path().join("route");
        fs::write(&routes, "Iface\tDestination\n").unwrap();

        let runner = ScriptedRunner::default().failing("udhcpc -i", 1);
        let link = RecordingLink::default();
        let err = NetworkBringUp::new(&runner, &link, "/sbin/udhcpc", Duration::from_secs(5))
            .with_paths(tmp.path().join("net"), &routes)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, BootFailure::BoundaryCondition(_)));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("eth0"));
        assert!(err.to_string().contains("eth1"));
    }

    #[tokio::test]
    async fn test_no_interfaces() {
        let tmp = TempDir::new().unwrap();
        let runner = ScriptedRunner::default();
        let link = RecordingLink::default();
        let err = NetworkBringUp::new(&runner, &link, "/sbin/udhcpc", Duration::from_secs(5))
            .with_paths(tmp.path(), tmp.path().join("route"))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, BootFailure::BoundaryCondition(_)));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_set_interface_up_rejects_bad_names() {
        assert!(set_interface_up("").is_err());
        assert!(set_interface_up("an-interface-name-too-long").is_err());
    }
}
