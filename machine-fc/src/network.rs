//! TAP device and NAT allocation for Firecracker VMs.
//!
//! Every VM leases a private /30 out of `172.16.0.0/16`:
//!
//! ```text
//!   host side:  172.16.<index>.1  (TAP device, gateway for the guest)
//!   guest side: 172.16.<index>.2  (static IP passed via kernel boot args)
//! ```
//!
//! Outbound traffic is masqueraded; the return path is matched statefully.
//! Every rule this process installs carries an
//! `-m comment --comment nightshift-<tap>` tag so that the startup sweep can
//! remove leftovers from an unclean shutdown without touching unrelated
//! operator rules in the same address space.

use std::collections::BTreeSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::command::{Privilege, exec, exec_ignore_errors, exec_shell_ignore_errors};

/// Prefix of every TAP device this system creates.
pub const TAP_PREFIX: &str = "tap-";

/// Prefix of the iptables comment tag on every rule this system installs.
const RULE_TAG_PREFIX: &str = "nightshift-";

/// The VM index doubles as the third octet of `172.16.<index>.0/30`.
const MAX_VM_INDEX: u32 = 255;

/// /30 netmask in dotted decimal, as the kernel `ip=` boot arg expects it.
const SLASH_30_MASK: &str = "255.255.255.252";

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("all {MAX_VM_INDEX} VM network indices are in use")]
    Exhausted,

    #[error("failed to create TAP device {tap}: {detail}")]
    TapCreate { tap: String, detail: String },

    #[error("failed to configure TAP device {tap}: {detail}")]
    TapConfig { tap: String, detail: String },

    #[error("failed to install NAT rules for {tap}: {detail}")]
    Nat { tap: String, detail: String },
}

pub type Result<T> = std::result::Result<T, NetworkError>;

/// The network resources held by one live VM.
#[derive(Debug, Clone)]
pub struct NetworkLease {
    pub tap_name: String,
    pub host_ip: String,
    pub guest_ip: String,
    pub mask: String,
    pub index: u32,
}

impl NetworkLease {
    fn rule_tag(&self) -> String {
        format!("{RULE_TAG_PREFIX}{}", self.tap_name)
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn host_ip(index: u32) -> String {
    format!("172.16.{index}.1")
}

fn guest_ip(index: u32) -> String {
    format!("172.16.{index}.2")
}

/// `tap-` plus 8 hex characters of a fresh token; 12 characters total,
/// comfortably inside the 15-character interface-name limit.
fn fresh_tap_name() -> String {
    let token: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("{TAP_PREFIX}{token}")
}

fn smallest_free_index(used: &BTreeSet<u32>) -> Option<u32> {
    (1..=MAX_VM_INDEX).find(|i| !used.contains(i))
}

/// Extract device names from `ip -o link show type tun` output.
///
/// Lines look like `62: tap-c5bcddec: <BROADCAST,...> mtu 1500 ...`; veth
/// style `name@ifN` suffixes are stripped defensively.
fn parse_tun_devices(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split(':').nth(1))
        .map(|name| {
            name.trim()
                .split('@')
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Kernel boot arguments giving the guest its static network configuration.
pub fn boot_args(lease: &NetworkLease) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off",
        lease.guest_ip, lease.host_ip, lease.mask
    )
}

/// Deterministic guest MAC derived from the VM id.
///
/// Six octets from a stable hash of the id bytes, with the first octet's
/// locally-administered bit forced on and the multicast bit forced off. The
/// same id always maps to the same MAC, across processes.
pub fn derive_guest_mac(vm_id: &str) -> String {
    let digest = Sha256::digest(vm_id.as_bytes());
    let mut octets: Vec<u8> = digest.iter().copied().take(6).collect();
    if let Some(first) = octets.first_mut() {
        *first = (*first | 0x02) & 0xFE;
    }
    octets
        .iter()
        .map(|o| format!("{o:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Process-wide TAP/NAT allocator.
///
/// Index bookkeeping is in-memory only, so [`NetworkAllocator::cleanup_stale`]
/// must run before the first allocation after a restart.
pub struct NetworkAllocator {
    used: Mutex<BTreeSet<u32>>,
}

impl Default for NetworkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkAllocator {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(BTreeSet::new()),
        }
    }

    fn reserve_index(&self) -> Result<u32> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let index = smallest_free_index(&used).ok_or(NetworkError::Exhausted)?;
        used.insert(index);
        Ok(index)
    }

    fn free_index(&self, index: u32) {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&index);
    }

    /// Create a TAP device with a fresh /30 and install its NAT plumbing.
    pub async fn allocate(&self) -> Result<NetworkLease> {
        let index = self.reserve_index()?;
        let lease = NetworkLease {
            tap_name: fresh_tap_name(),
            host_ip: host_ip(index),
            guest_ip: guest_ip(index),
            mask: SLASH_30_MASK.to_string(),
            index,
        };

        match install(&lease).await {
            Ok(()) => {
                info!(tap = %lease.tap_name, host = %lease.host_ip, guest = %lease.guest_ip, "network lease allocated");
                Ok(lease)
            }
            Err(e) => {
                // Partial setup: undo whatever landed, then free the index.
                teardown(&lease).await;
                self.free_index(index);
                Err(e)
            }
        }
    }

    /// Remove the lease's rules and device in reverse creation order, then
    /// free its index. Idempotent; already-removed pieces are skipped.
    pub async fn release(&self, lease: &NetworkLease) {
        teardown(lease).await;
        self.free_index(lease.index);
        info!(tap = %lease.tap_name, "network lease released");
    }

    /// Sweep TAP devices and tagged rules left by an unclean previous run.
    ///
    /// Must complete before the first [`NetworkAllocator::allocate`], or a
    /// fresh lease could collide with a stale device on the same subnet.
    pub async fn cleanup_stale(&self) {
        match exec("ip", &["-o", "link", "show", "type", "tun"], Privilege::Sudo).await {
            Ok(output) => {
                for name in parse_tun_devices(&output) {
                    if name.starts_with(TAP_PREFIX) {
                        info!(tap = %name, "removing stale TAP device");
                        exec_ignore_errors("ip", &["link", "del", name.as_str()], Privilege::Sudo)
                            .await;
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not enumerate TAP devices for cleanup"),
        }

        sweep_tagged_rules("nat").await;
        sweep_tagged_rules("filter").await;
    }
}

async fn install(lease: &NetworkLease) -> Result<()> {
    let tap = lease.tap_name.as_str();
    let tag = lease.rule_tag();

    exec(
        "ip",
        &["tuntap", "add", "dev", tap, "mode", "tap"],
        Privilege::Sudo,
    )
    .await
    .map_err(|e| NetworkError::TapCreate {
        tap: tap.to_string(),
        detail: e.detail,
    })?;

    let host_cidr = format!("{}/30", lease.host_ip);
    for args in [
        vec!["addr", "add", host_cidr.as_str(), "dev", tap],
        vec!["link", "set", tap, "up"],
    ] {
        exec("ip", &args, Privilege::Sudo)
            .await
            .map_err(|e| NetworkError::TapConfig {
                tap: tap.to_string(),
                detail: e.detail,
            })?;
    }

    exec("sysctl", &["-w", "net.ipv4.ip_forward=1"], Privilege::Sudo)
        .await
        .map_err(|e| NetworkError::TapConfig {
            tap: tap.to_string(),
            detail: e.detail,
        })?;

    let guest_cidr = format!("{}/32", lease.guest_ip);
    let nat = [
        vec![
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            guest_cidr.as_str(),
            "-j",
            "MASQUERADE",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
        vec![
            "-A",
            "FORWARD",
            "-i",
            tap,
            "-j",
            "ACCEPT",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
        vec![
            "-A",
            "FORWARD",
            "-o",
            tap,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
    ];
    for args in &nat {
        exec("iptables", args, Privilege::Sudo)
            .await
            .map_err(|e| NetworkError::Nat {
                tap: tap.to_string(),
                detail: e.detail,
            })?;
    }

    Ok(())
}

/// Best-effort removal of a lease's rules and device, reverse of [`install`].
async fn teardown(lease: &NetworkLease) {
    let tap = lease.tap_name.as_str();
    let tag = lease.rule_tag();
    let guest_cidr = format!("{}/32", lease.guest_ip);

    let rules = [
        vec![
            "-D",
            "FORWARD",
            "-o",
            tap,
            "-m",
            "state",
            "--state",
            "RELATED,ESTABLISHED",
            "-j",
            "ACCEPT",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
        vec![
            "-D",
            "FORWARD",
            "-i",
            tap,
            "-j",
            "ACCEPT",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
        vec![
            "-t",
            "nat",
            "-D",
            "POSTROUTING",
            "-s",
            guest_cidr.as_str(),
            "-j",
            "MASQUERADE",
            "-m",
            "comment",
            "--comment",
            tag.as_str(),
        ],
    ];
    for args in &rules {
        exec_ignore_errors("iptables", args, Privilege::Sudo).await;
    }

    exec_ignore_errors("ip", &["link", "del", tap], Privilege::Sudo).await;
}

/// Delete every rule in `table` carrying this system's comment tag.
///
/// Replays `iptables-save` lines with `-A` flipped to `-D`; the replay goes
/// through a shell because iptables-save quotes comment values.
async fn sweep_tagged_rules(table: &str) {
    let rules = match exec("iptables-save", &["-t", table], Privilege::Sudo).await {
        Ok(rules) => rules,
        Err(e) => {
            warn!(table, error = %e, "could not read iptables rules for cleanup");
            return;
        }
    };

    for line in rules
        .lines()
        .filter(|l| l.starts_with("-A ") && l.contains(RULE_TAG_PREFIX))
    {
        let rule = line.replacen("-A ", "-D ", 1);
        info!(table, rule = %rule, "removing stale NAT rule");
        exec_shell_ignore_errors(&format!("iptables -t {table} {rule}"), Privilege::Sudo).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_addresses_follow_index() {
        assert_eq!(host_ip(1), "172.16.1.1");
        assert_eq!(guest_ip(1), "172.16.1.2");
        assert_eq!(host_ip(254), "172.16.254.1");
    }

    #[test]
    fn distinct_indices_never_share_addresses() {
        let mut seen = BTreeSet::new();
        for index in 1..=MAX_VM_INDEX {
            assert!(seen.insert(host_ip(index)));
            assert!(seen.insert(guest_ip(index)));
        }
    }

    #[test]
    fn tap_name_fits_interface_name_limit() {
        let name = fresh_tap_name();
        assert!(name.starts_with(TAP_PREFIX));
        assert_eq!(name.len(), 12);
        assert!(name.len() <= 15);
    }

    #[test]
    fn tap_names_are_unique() {
        assert_ne!(fresh_tap_name(), fresh_tap_name());
    }

    #[test]
    fn smallest_free_index_starts_at_one() {
        assert_eq!(smallest_free_index(&BTreeSet::new()), Some(1));
    }

    #[test]
    fn smallest_free_index_fills_gaps() {
        let used: BTreeSet<u32> = [1, 2, 4].into_iter().collect();
        assert_eq!(smallest_free_index(&used), Some(3));
    }

    #[test]
    fn smallest_free_index_exhausts() {
        let used: BTreeSet<u32> = (1..=MAX_VM_INDEX).collect();
        assert_eq!(smallest_free_index(&used), None);
    }

    #[test]
    fn released_index_is_reused() {
        let allocator = NetworkAllocator::new();
        assert_eq!(allocator.reserve_index().unwrap(), 1);
        assert_eq!(allocator.reserve_index().unwrap(), 2);
        assert_eq!(allocator.reserve_index().unwrap(), 3);
        allocator.free_index(2);
        assert_eq!(allocator.reserve_index().unwrap(), 2);
    }

    #[test]
    fn parse_tun_devices_extracts_names() {
        let output = "\
62: tap-c5bcddec: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN\n\
63: tap-11aa22bb: <BROADCAST,MULTICAST,UP> mtu 1500 qdisc fq state UP\n";
        assert_eq!(
            parse_tun_devices(output),
            vec!["tap-c5bcddec".to_string(), "tap-11aa22bb".to_string()]
        );
    }

    #[test]
    fn parse_tun_devices_strips_peer_suffix() {
        let output = "7: tap-ab12cd34@if6: <UP> mtu 1420\n";
        assert_eq!(parse_tun_devices(output), vec!["tap-ab12cd34".to_string()]);
    }

    #[test]
    fn parse_tun_devices_tolerates_garbage() {
        assert!(parse_tun_devices("").is_empty());
        assert!(parse_tun_devices("not an ip link line").is_empty());
    }

    #[test]
    fn boot_args_carry_static_ip_config() {
        let lease = NetworkLease {
            tap_name: "tap-ab12cd34".to_string(),
            host_ip: host_ip(3),
            guest_ip: guest_ip(3),
            mask: SLASH_30_MASK.to_string(),
            index: 3,
        };
        assert_eq!(
            boot_args(&lease),
            "console=ttyS0 reboot=k panic=1 pci=off \
             ip=172.16.3.2::172.16.3.1:255.255.255.252::eth0:off"
        );
    }

    #[test]
    fn rule_tag_names_the_tap() {
        let lease = NetworkLease {
            tap_name: "tap-ab12cd34".to_string(),
            host_ip: host_ip(1),
            guest_ip: guest_ip(1),
            mask: SLASH_30_MASK.to_string(),
            index: 1,
        };
        assert_eq!(lease.rule_tag(), "nightshift-tap-ab12cd34");
    }

    #[test]
    fn mac_is_deterministic() {
        assert_eq!(derive_guest_mac("vm-123"), derive_guest_mac("vm-123"));
        assert_ne!(derive_guest_mac("vm-123"), derive_guest_mac("vm-124"));
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        for id in ["a", "vm-123", "550e8400-e29b-41d4-a716-446655440000"] {
            let mac = derive_guest_mac(id);
            let first = u8::from_str_radix(mac.split(':').next().unwrap(), 16).unwrap();
            assert_eq!(first & 0x02, 0x02, "locally-administered bit: {mac}");
            assert_eq!(first & 0x01, 0x00, "multicast bit: {mac}");
        }
    }

    #[test]
    fn mac_has_six_octets() {
        let mac = derive_guest_mac("vm-123");
        assert_eq!(mac.split(':').count(), 6);
        assert!(mac.split(':').all(|o| o.len() == 2));
    }
}
