//! Connectivity probe: the diagnostic scripts run on a source node and the
//! parsers for what they print.
//!
//! The marker lines (`PING_STATUS:`, `PACKET_LOSS:`, `AVG_LATENCY:`,
//! `HANDSHAKE:`, `SSH_PORT:`) are the only contract with the remote side.
//! Everything else the scripts print is free-form log text.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::types::{ConnectionStatus, WireGuardStats};

pub const DEFAULT_INTERFACE: &str = "wg0";

const PING_SUCCESS: &str = "PING_STATUS:SUCCESS";
const PACKET_LOSS: &str = "PACKET_LOSS:";
const AVG_LATENCY: &str = "AVG_LATENCY:";
const HANDSHAKE_ACTIVE: &str = "HANDSHAKE:ACTIVE";
const WIREGUARD_READY: &str = "WIREGUARD:READY";

/// Builds probe scripts for one WireGuard interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectivityProbe {
    interface: String,
}

impl Default for ConnectivityProbe {
    fn default() -> Self {
        Self::new(DEFAULT_INTERFACE)
    }
}

/// Fields of a [`ConnectionStatus`] derived from one probe's output.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub is_connected: bool,
    pub packet_loss: f64,
    pub latency: Duration,
    pub wireguard: Option<WireGuardStats>,
}

impl ProbeOutcome {
    pub fn apply_to(self, status: &mut ConnectionStatus) {
        status.is_connected = self.is_connected;
        status.packet_loss = self.packet_loss;
        status.latency = self.latency;
        status.wireguard = self.wireguard;
    }
}

/// Readiness of the WireGuard interface on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelReadiness {
    pub ready: bool,
    pub peer_count: Option<u32>,
}

impl ConnectivityProbe {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Full reachability check from the node it runs on to `target_ip`.
    ///
    /// Order: interface present and up (fail fast), 10 pings over the
    /// interface, handshake lookup, TCP/22 connect, routing entry.
    pub fn build_script(&self, target_ip: &str) -> String {
        format!(
            r#"#!/bin/bash
set -e

TARGET_IP="{target_ip}"
INTERFACE="{interface}"

echo "=== VPN Connectivity Check ==="
echo "Target: $TARGET_IP"
echo "Timestamp: $(date)"
echo ""

# Interface must exist and carry the UP flag
if ! ip link show "$INTERFACE" &>/dev/null; then
    echo "ERROR: WireGuard interface $INTERFACE not found"
    exit 1
fi

if ! ip link show "$INTERFACE" | grep -qE "[<,]UP[,>]"; then
    echo "ERROR: WireGuard interface $INTERFACE is down"
    exit 1
fi

PING_OUT=$(mktemp /tmp/vpn_ping.XXXXXX)
trap 'rm -f "$PING_OUT"' EXIT

echo "PING_TEST:"
if ping -c 10 -W 2 -I "$INTERFACE" "$TARGET_IP" > "$PING_OUT" 2>&1; then
    echo "PING_STATUS:SUCCESS"

    PACKET_LOSS=$(grep "packet loss" "$PING_OUT" | sed -nE 's/.* ([0-9.]+)% packet loss.*/\1/p')
    AVG_LATENCY=$(grep -E "^(rtt|round-trip)" "$PING_OUT" | cut -d'/' -f5)

    echo "PACKET_LOSS:${{PACKET_LOSS:-0}}"
    echo "AVG_LATENCY:${{AVG_LATENCY:-0}}"
else
    echo "PING_STATUS:FAILED"
    echo "PACKET_LOSS:100"
    cat "$PING_OUT"
fi

echo ""
echo "WIREGUARD_STATUS:"
wg show "$INTERFACE" peers || true

# Resolve the peer owning the target address, then look at its handshake
PEER_KEY=$(wg show "$INTERFACE" allowed-ips 2>/dev/null | grep -F "$TARGET_IP/" | awk '{{print $1}}' | head -n1)
if [ -n "$PEER_KEY" ] && wg show "$INTERFACE" latest-handshakes | grep -F "$PEER_KEY" | awk '$2 > 0 {{found=1}} END {{exit !found}}'; then
    echo "HANDSHAKE:ACTIVE"
else
    echo "HANDSHAKE:NONE"
fi

echo ""
echo "TCP_TEST:"
if (command -v nc &>/dev/null && timeout 2 nc -z "$TARGET_IP" 22) || timeout 2 bash -c "</dev/tcp/$TARGET_IP/22" 2>/dev/null; then
    echo "SSH_PORT:OPEN"
else
    echo "SSH_PORT:CLOSED"
fi

echo ""
echo "ROUTING:"
ip route | grep -F "$TARGET_IP" || echo "No specific route for $TARGET_IP"

echo ""
echo "=== Check Complete ==="
"#,
            target_ip = target_ip,
            interface = self.interface,
        )
    }

    /// Parse probe output. Missing or malformed numbers stay at zero.
    pub fn parse_output(&self, raw: &str) -> ProbeOutcome {
        let wireguard = raw.contains(HANDSHAKE_ACTIVE).then(|| WireGuardStats {
            interface: self.interface.clone(),
            ..Default::default()
        });

        if !raw.contains(PING_SUCCESS) {
            return ProbeOutcome {
                is_connected: false,
                packet_loss: 100.0,
                latency: Duration::ZERO,
                wireguard,
            };
        }

        let packet_loss = extract_value(raw, PACKET_LOSS)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);

        let latency = extract_value(raw, AVG_LATENCY)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(millis_to_duration)
            .unwrap_or(Duration::ZERO);

        ProbeOutcome {
            is_connected: true,
            packet_loss,
            latency,
            wireguard,
        }
    }

    /// Lightweight counter refresh for a peer that is already known good.
    pub fn stats_script(&self, target_ip: &str) -> String {
        format!(
            r#"#!/bin/bash
TARGET_IP="{target_ip}"
INTERFACE="{interface}"

wg show "$INTERFACE" dump | awk -F'\t' -v ip="$TARGET_IP/" '
NR > 1 && index("," $4, "," ip) {{
    print "PEER_KEY:" $1
    print "ENDPOINT:" $3
    print "LATEST_HANDSHAKE:" $5
    print "TRANSFER_RX:" $6
    print "TRANSFER_TX:" $7
    print "KEEPALIVE:" $8
    found = 1
}}
END {{ if (!found) print "No peer info" }}'
"#,
            target_ip = target_ip,
            interface = self.interface,
        )
    }

    /// Parse [`stats_script`](Self::stats_script) output; `None` when the peer is unknown.
    pub fn parse_stats(&self, raw: &str) -> Option<WireGuardStats> {
        let public_key = extract_value(raw, "PEER_KEY:")?;

        let endpoint = extract_value(raw, "ENDPOINT:")
            .filter(|e| *e != "(none)")
            .map(str::to_string);

        let last_handshake = extract_value(raw, "LATEST_HANDSHAKE:")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|secs| *secs > 0)
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

        let counter = |prefix: &str| {
            extract_value(raw, prefix)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
        };

        let persistent_keepalive = extract_value(raw, "KEEPALIVE:")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|secs| *secs > 0);

        Some(WireGuardStats {
            interface: self.interface.clone(),
            public_key: Some(public_key.to_string()),
            endpoint,
            last_handshake,
            transfer_rx: counter("TRANSFER_RX:"),
            transfer_tx: counter("TRANSFER_TX:"),
            persistent_keepalive,
        })
    }

    /// Does the node have a configured, running interface?
    pub fn readiness_script(&self) -> String {
        format!(
            r#"#!/bin/bash
INTERFACE="{interface}"
if [ -f "/etc/wireguard/$INTERFACE.conf" ] && wg show "$INTERFACE" &>/dev/null; then
    echo "WIREGUARD:READY"
    wg show "$INTERFACE" peers | wc -l | sed 's/^ */PEER_COUNT:/'
else
    echo "WIREGUARD:NOT_READY"
fi
"#,
            interface = self.interface,
        )
    }

    pub fn parse_readiness(raw: &str) -> TunnelReadiness {
        let ready = raw.lines().any(|l| l.trim() == WIREGUARD_READY);
        let peer_count = extract_value(raw, "PEER_COUNT:").and_then(|v| v.parse().ok());
        TunnelReadiness { ready, peer_count }
    }
}

pub(crate) fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_nanos((ms * 1_000_000.0).round() as u64)
}

/// Value following the first occurrence of `prefix`, up to whitespace.
fn extract_value<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let start = s.find(prefix)? + prefix.len();
    let rest = &s[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_is_deterministic_and_carries_markers() {
        let probe = ConnectivityProbe::default();
        let script = probe.build_script("10.8.0.2");
        assert_eq!(script, probe.build_script("10.8.0.2"));

        for needle in [
            r#"TARGET_IP="10.8.0.2""#,
            r#"INTERFACE="wg0""#,
            "ping -c 10",
            "-W 2",
            "PING_STATUS:SUCCESS",
            "PING_STATUS:FAILED",
            "PACKET_LOSS:100",
            "HANDSHAKE:ACTIVE",
            "HANDSHAKE:NONE",
            "SSH_PORT:OPEN",
            "SSH_PORT:CLOSED",
            "No specific route for $TARGET_IP",
        ] {
            assert!(script.contains(needle), "script is missing {:?}", needle);
        }
    }

    #[test]
    fn script_checks_interface_before_pinging() {
        let script = ConnectivityProbe::default().build_script("10.8.0.5");
        let not_found = script.find("not found").unwrap();
        let down = script.find("is down").unwrap();
        let ping = script.find("ping -c 10").unwrap();
        let handshake = script.find("HANDSHAKE:ACTIVE").unwrap();
        let tcp = script.find("SSH_PORT:OPEN").unwrap();
        let route = script.find("ROUTING:").unwrap();
        assert!(not_found < down && down < ping);
        assert!(ping < handshake && handshake < tcp && tcp < route);
        assert!(script.contains("exit 1"));
    }

    #[test]
    fn shell_expansions_survive_formatting() {
        let script = ConnectivityProbe::default().build_script("10.8.0.2");
        assert!(script.contains("${PACKET_LOSS:-0}"));
        assert!(script.contains("${AVG_LATENCY:-0}"));
        assert!(script.contains("awk '{print $1}'"));
    }

    #[test]
    fn custom_interface_is_used() {
        let script = ConnectivityProbe::new("wg-mesh").build_script("10.9.0.1");
        assert!(script.contains(r#"INTERFACE="wg-mesh""#));
    }

    #[test]
    fn parses_success() {
        let out = ConnectivityProbe::default().parse_output("PING_STATUS:SUCCESS\nPACKET_LOSS:0\nAVG_LATENCY:1.234\n");
        assert!(out.is_connected);
        assert_eq!(out.packet_loss, 0.0);
        assert_eq!(out.latency.as_micros(), 1234);
        assert!(out.wireguard.is_none());
    }

    #[test]
    fn parses_partial_loss_and_handshake() {
        let raw = "=== VPN Connectivity Check ===\nPING_TEST:\nPING_STATUS:SUCCESS\nPACKET_LOSS:20\nAVG_LATENCY:35.5\nHANDSHAKE:ACTIVE\nSSH_PORT:OPEN\n";
        let out = ConnectivityProbe::default().parse_output(raw);
        assert!(out.is_connected);
        assert_eq!(out.packet_loss, 20.0);
        assert_eq!(out.latency.as_micros(), 35_500);
        assert_eq!(out.wireguard.unwrap().interface, "wg0");
    }

    #[test]
    fn handshake_stats_name_the_configured_interface() {
        let out = ConnectivityProbe::new("wg1").parse_output("PING_STATUS:SUCCESS\nHANDSHAKE:ACTIVE\n");
        assert_eq!(out.wireguard.unwrap().interface, "wg1");
    }

    #[test]
    fn failure_marker_wins_over_everything() {
        let raw = "PING_STATUS:FAILED\nPACKET_LOSS:0\nAVG_LATENCY:3.0\nHANDSHAKE:ACTIVE\n";
        let out = ConnectivityProbe::default().parse_output(raw);
        assert!(!out.is_connected);
        assert_eq!(out.packet_loss, 100.0);
        assert_eq!(out.latency, Duration::ZERO);
    }

    #[test]
    fn garbage_numbers_default_to_zero() {
        let out = ConnectivityProbe::default().parse_output("PING_STATUS:SUCCESS\nPACKET_LOSS:abc\nAVG_LATENCY:\n");
        assert!(out.is_connected);
        assert_eq!(out.packet_loss, 0.0);
        assert_eq!(out.latency, Duration::ZERO);

        let out = ConnectivityProbe::default().parse_output("PING_STATUS:SUCCESS\nAVG_LATENCY:-4\n");
        assert_eq!(out.latency, Duration::ZERO);
    }

    #[test]
    fn empty_or_error_output_is_not_connected() {
        for raw in ["", "ERROR: WireGuard interface wg0 not found\n"] {
            let out = ConnectivityProbe::default().parse_output(raw);
            assert!(!out.is_connected);
            assert_eq!(out.packet_loss, 100.0);
        }
    }

    #[test]
    fn parsing_is_idempotent() {
        let raw = "PING_STATUS:SUCCESS\nPACKET_LOSS:10\nAVG_LATENCY:0.812\nHANDSHAKE:ACTIVE\n";
        assert_eq!(
            ConnectivityProbe::default().parse_output(raw),
            ConnectivityProbe::default().parse_output(raw)
        );
    }

    #[test]
    fn apply_to_copies_probe_fields() {
        let mut status = ConnectionStatus::new("b", "10.8.0.2");
        ConnectivityProbe::default().parse_output("PING_STATUS:SUCCESS\nPACKET_LOSS:0\nAVG_LATENCY:2\n")
            .apply_to(&mut status);
        assert!(status.is_connected);
        assert_eq!(status.latency, Duration::from_millis(2));
        assert_eq!(status.target_node, "b");
    }

    #[test]
    fn stats_are_parsed_from_dump_markers() {
        let probe = ConnectivityProbe::default();
        let raw = "PEER_KEY:abc123=\nENDPOINT:203.0.113.9:51820\nLATEST_HANDSHAKE:1700000000\nTRANSFER_RX:4096\nTRANSFER_TX:2048\nKEEPALIVE:25\n";
        let stats = probe.parse_stats(raw).unwrap();
        assert_eq!(stats.public_key.as_deref(), Some("abc123="));
        assert_eq!(stats.endpoint.as_deref(), Some("203.0.113.9:51820"));
        assert_eq!(stats.last_handshake.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(stats.transfer_rx, 4096);
        assert_eq!(stats.transfer_tx, 2048);
        assert_eq!(stats.persistent_keepalive, Some(25));
    }

    #[test]
    fn stats_handle_idle_peers_and_missing_peers() {
        let probe = ConnectivityProbe::default();
        let raw = "PEER_KEY:k=\nENDPOINT:(none)\nLATEST_HANDSHAKE:0\nTRANSFER_RX:0\nTRANSFER_TX:0\nKEEPALIVE:off\n";
        let stats = probe.parse_stats(raw).unwrap();
        assert!(stats.endpoint.is_none());
        assert!(stats.last_handshake.is_none());
        assert!(stats.persistent_keepalive.is_none());

        assert!(probe.parse_stats("No peer info\n").is_none());
        assert!(probe.stats_script("10.8.0.4").contains(r#"ip="$TARGET_IP/""#));
    }

    #[test]
    fn readiness_is_line_exact() {
        let ready = ConnectivityProbe::parse_readiness("WIREGUARD:READY\nPEER_COUNT:4\n");
        assert_eq!(
            ready,
            TunnelReadiness {
                ready: true,
                peer_count: Some(4)
            }
        );

        let not_ready = ConnectivityProbe::parse_readiness("WIREGUARD:NOT_READY\n");
        assert!(!not_ready.ready);
        assert!(not_ready.peer_count.is_none());
    }
}
