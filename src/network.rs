//! Host network provisioning for the TAP variant.
//!
//! Each instance gets a TAP device carrying a /32 point-to-point route to its
//! guest address, a DNAT rule forwarding one host port to the guest's SSH
//! port, and a share of the subnet-wide MASQUERADE rule for egress. Teardown
//! reverses the DNAT rule and the TAP; the MASQUERADE rule is installed once
//! per host and deliberately left in place (other agents may share the
//! subnet).

use crate::command::{run, run_quiet};
use crate::config::{GATEWAY_IP, GUEST_SUBNET};
use crate::error::{Error, Result};
use std::net::Ipv4Addr;

/// Prefix for per-instance TAP device names.
pub const TAP_PREFIX: &str = "tap-";

/// Derive the TAP name from an instance id: prefix + first 8 hex chars.
/// Stays well under the 15-byte IFNAMSIZ limit.
pub fn tap_name(instance_id: &str) -> String {
    format!("{}{}", TAP_PREFIX, &instance_id[..8])
}

/// Synthesised guest MAC; the low byte doubles as the subnet offset.
pub fn format_mac(suffix: u8) -> String {
    format!("52:54:00:12:34:{:02x}", suffix)
}

/// Enable IPv4 forwarding. Called once at agent startup; a failure is the
/// caller's to log since guests merely lose egress, not boot.
pub fn ensure_ip_forward() -> Result<()> {
    std::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .map_err(|e| Error::network(format!("enable ip_forward: {}", e)))
}

/// Create the instance's TAP device and NAT rules.
///
/// The /32 address and route adds are tolerated (they may already exist);
/// everything else is fatal. On any fatal failure the TAP is removed before
/// returning so no partial rule set survives.
pub fn provision(tap: &str, guest_ip: Ipv4Addr, host_port: u16) -> Result<()> {
    run("ip", &["tuntap", "add", "name", tap, "mode", "tap"])
        .map_err(|e| Error::network(format!("create tap {}: {}", tap, e)))?;

    if let Err(e) = run("ip", &["link", "set", tap, "up"]) {
        run_quiet("ip", &["link", "del", tap]);
        return Err(Error::network(format!("bring up tap {}: {}", tap, e)));
    }

    run_quiet("ip", &["addr", "add", &format!("{}/32", GATEWAY_IP), "dev", tap]);
    run_quiet("ip", &["route", "add", &format!("{}/32", guest_ip), "dev", tap]);

    if let Err(e) = ensure_masquerade() {
        run_quiet("ip", &["link", "del", tap]);
        return Err(e);
    }

    if let Err(e) = run("iptables", &dnat_rule_args("-A", guest_ip, host_port)) {
        run_quiet("ip", &["link", "del", tap]);
        return Err(Error::network(format!(
            "add dnat rule for port {}: {}",
            host_port, e
        )));
    }

    tracing::info!(tap, guest_ip = %guest_ip, host_port, "network provisioned");
    Ok(())
}

/// Remove the instance's DNAT rule and TAP device. Best-effort: failures are
/// logged so delete always makes forward progress.
pub fn teardown(tap: &str, guest_ip: Ipv4Addr, host_port: u16) {
    if !run_quiet("iptables", &dnat_rule_args("-D", guest_ip, host_port)) {
        tracing::warn!(host_port, "failed to remove dnat rule");
    }
    if !run_quiet("ip", &["link", "del", tap]) {
        tracing::warn!(tap, "failed to delete tap device");
    }
    tracing::info!(tap, host_port, "network torn down");
}

/// Install the subnet-wide MASQUERADE rule once. The check runs first so the
/// rule is never duplicated.
fn ensure_masquerade() -> Result<()> {
    let check = [
        "-t",
        "nat",
        "-C",
        "POSTROUTING",
        "-s",
        GUEST_SUBNET,
        "-j",
        "MASQUERADE",
    ];
    if run_quiet("iptables", &check) {
        return Ok(());
    }

    run(
        "iptables",
        &[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            GUEST_SUBNET,
            "-j",
            "MASQUERADE",
        ],
    )
    .map_err(|e| Error::network(format!("add masquerade rule: {}", e)))?;
    Ok(())
}

/// DNAT rule arguments, shared between add (`-A`) and delete (`-D`) so both
/// sides always match the same rule.
fn dnat_rule_args(op: &'static str, guest_ip: Ipv4Addr, host_port: u16) -> [String; 12] {
    [
        "-t".into(),
        "nat".into(),
        op.into(),
        "PREROUTING".into(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        host_port.to_string(),
        "-j".into(),
        "DNAT".into(),
        "--to-destination".into(),
        format!("{}:22", guest_ip),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_uses_id_prefix() {
        let name = tap_name("550e8400-e29b-41d4-a716-446655440000");
        assert_eq!(name, "tap-550e8400");
        assert!(name.len() <= 15, "must fit IFNAMSIZ");
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac(3), "52:54:00:12:34:03");
        assert_eq!(format_mac(255), "52:54:00:12:34:ff");
    }

    #[test]
    fn test_dnat_add_and_delete_args_match() {
        let ip = Ipv4Addr::new(172, 16, 0, 3);
        let add = dnat_rule_args("-A", ip, 20003);
        let del = dnat_rule_args("-D", ip, 20003);
        // Identical apart from the operation, so -D removes exactly what -A added.
        for (i, (a, d)) in add.iter().zip(del.iter()).enumerate() {
            if a == "-A" {
                assert_eq!(d, "-D");
            } else {
                assert_eq!(a, d, "arg {} differs", i);
            }
        }
        assert!(add.contains(&"20003".to_string()));
        assert!(add.contains(&"172.16.0.3:22".to_string()));
    }
}
