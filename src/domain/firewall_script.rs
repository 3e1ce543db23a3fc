//! Firewall configuration script rendering and output parsing.
//!
//! One script covers all three backends: it detects ufw, then firewalld, then
//! iptables, resets the detected backend to deny-inbound, applies the node's
//! rules and enables forwarding. The last line it prints is `SUCCESS`.

use super::rules::FirewallRule;
use super::types::FirewallBackend;

const SUCCESS_MARKER: &str = "SUCCESS";
const BACKEND_MARKER: &str = "FIREWALL_TYPE:";

/// What a firewall script run reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub backend: Option<FirewallBackend>,
    pub success: bool,
    /// First `ERROR:` line, if the script printed one.
    pub error: Option<String>,
}

/// Render the configuration script for `node_name` with `rules` in order.
pub fn render_script(node_name: &str, rules: &[FirewallRule]) -> String {
    let mut script = String::new();

    script.push_str(&format!(
        r#"#!/bin/bash
set -e

echo "=== OS Firewall Configuration ==="
echo "Node: {node}"
echo "Timestamp: $(date)"
echo ""

FIREWALL_TYPE=""
if command -v ufw &> /dev/null; then
    FIREWALL_TYPE="ufw"
elif command -v firewall-cmd &> /dev/null; then
    FIREWALL_TYPE="firewalld"
elif command -v iptables &> /dev/null; then
    FIREWALL_TYPE="iptables"
else
    echo "ERROR: No supported firewall found"
    exit 1
fi

echo "{marker}$FIREWALL_TYPE"
echo "Detected firewall: $FIREWALL_TYPE"
echo ""

"#,
        node = shell_safe(node_name),
        marker = BACKEND_MARKER,
    ));

    // ── ufw ──
    script.push_str(
        r#"configure_ufw() {
    echo "Configuring UFW firewall..."
    ufw --force disable
    ufw --force reset

    ufw default deny incoming
    ufw default allow outgoing
    ufw default allow routed
    sed -i 's/DEFAULT_FORWARD_POLICY="DROP"/DEFAULT_FORWARD_POLICY="ACCEPT"/' /etc/default/ufw

    ufw allow in on lo
    ufw allow out on lo

"#,
    );
    for rule in rules {
        script.push_str(&format!("    {}\n", ufw_rule(rule)));
    }
    script.push_str(
        r#"
    ufw --force enable
    ufw status verbose
    echo "UFW configuration complete"
}

"#,
    );

    // ── firewalld ──
    script.push_str(
        r#"configure_firewalld() {
    echo "Configuring firewalld..."
    systemctl enable --now firewalld
    firewall-cmd --permanent --load-zone-defaults=public || true
    firewall-cmd --set-default-zone=public

    # Stock zone services would reopen ports outside the rule list
    for service in $(firewall-cmd --permanent --zone=public --list-services); do
        firewall-cmd --permanent --zone=public --remove-service="$service"
    done
    firewall-cmd --permanent --zone=public --remove-service=ssh || true
    firewall-cmd --permanent --zone=public --add-masquerade

"#,
    );
    for rule in rules {
        script.push_str(&format!("    {}\n", firewalld_rule(rule)));
    }
    script.push_str(
        r#"
    firewall-cmd --reload
    firewall-cmd --list-all
    echo "firewalld configuration complete"
}

"#,
    );

    // ── iptables ──
    // Policy flips to DROP only after the allow rules are in place so the
    // SSH session running this script survives.
    script.push_str(
        r#"configure_iptables() {
    echo "Configuring iptables..."
    iptables-save > /tmp/iptables.backup
    iptables -P INPUT ACCEPT
    iptables -F INPUT

    iptables -A INPUT -i lo -j ACCEPT
    iptables -A INPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT

"#,
    );
    for rule in rules {
        script.push_str(&format!("    {}\n", iptables_rule(rule)));
    }
    script.push_str(
        r#"
    iptables -P INPUT DROP
    iptables -P FORWARD ACCEPT
    iptables -P OUTPUT ACCEPT

    if command -v iptables-save &> /dev/null; then
        iptables-save > /etc/iptables/rules.v4 2>/dev/null || \
        iptables-save > /etc/sysconfig/iptables 2>/dev/null || \
        iptables-save > /etc/iptables.rules
    fi

    iptables -L INPUT -n
    echo "iptables configuration complete"
}

"#,
    );

    // ── kernel + dispatch ──
    script.push_str(
        r#"enable_forwarding() {
    modprobe br_netfilter 2>/dev/null || true
    cat > /etc/sysctl.d/99-kubernetes.conf <<'SYSCTL'
net.ipv4.ip_forward=1
net.bridge.bridge-nf-call-iptables=1
net.bridge.bridge-nf-call-ip6tables=1
SYSCTL
    sysctl --system > /dev/null || true
}

case "$FIREWALL_TYPE" in
    ufw)
        configure_ufw
        ;;
    firewalld)
        configure_firewalld
        ;;
    iptables)
        configure_iptables
        ;;
    *)
        echo "ERROR: Unsupported firewall type"
        exit 1
        ;;
esac

enable_forwarding

echo ""
echo "=== Firewall Configuration Complete ==="
echo "SUCCESS"
"#,
    );

    script
}

/// Parse script output. Success needs a line that is exactly `SUCCESS`.
pub fn parse_output(raw: &str) -> ScriptOutcome {
    let mut outcome = ScriptOutcome {
        backend: None,
        success: false,
        error: None,
    };

    for line in raw.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix(BACKEND_MARKER) {
            outcome.backend = outcome.backend.or_else(|| name.parse().ok());
        } else if line == SUCCESS_MARKER {
            outcome.success = true;
        } else if let Some(message) = line.strip_prefix("ERROR:") {
            if outcome.error.is_none() {
                outcome.error = Some(message.trim().to_string());
            }
        }
    }

    outcome
}

fn ufw_rule(rule: &FirewallRule) -> String {
    let comment = shell_safe(&rule.description);
    if rule.is_public() {
        format!("ufw allow {}/{} comment '{}'", rule.port, rule.protocol, comment)
    } else {
        format!(
            "ufw allow from {} to any port {} proto {} comment '{}'",
            rule.source, rule.port, rule.protocol, comment
        )
    }
}

// firewalld writes ranges as low-high
fn firewalld_rule(rule: &FirewallRule) -> String {
    let port = match rule.port_range() {
        Some((low, high)) if low != high => format!("{}-{}", low, high),
        _ => rule.port.clone(),
    };
    if rule.is_public() {
        format!(
            "firewall-cmd --permanent --zone=public --add-port={}/{}",
            port, rule.protocol
        )
    } else {
        format!(
            "firewall-cmd --permanent --zone=public --add-rich-rule='rule family=ipv4 source address={} port port={} protocol={} accept'",
            rule.source, port, rule.protocol
        )
    }
}

fn iptables_rule(rule: &FirewallRule) -> String {
    let comment = shell_safe(&rule.description);
    let source = if rule.is_public() {
        String::new()
    } else {
        format!("-s {} ", rule.source)
    };
    format!(
        "iptables -A INPUT {}-p {} --dport {} -j ACCEPT -m comment --comment '{}'",
        source, rule.protocol, rule.port, comment
    )
}

/// Strip characters that would break out of a single-quoted or echoed string.
fn shell_safe(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '\'' | '"' | '`' | '$' | '\\' | '\n'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::Node;
    use crate::domain::rules::RuleSelector;

    fn worker_rules() -> Vec<FirewallRule> {
        let node = Node::new("w", "192.0.2.1", "10.8.0.2").with_role("worker");
        RuleSelector::default().rules_for_node(&node)
    }

    #[test]
    fn script_detects_backends_in_order() {
        let script = render_script("worker-1", &worker_rules());
        let ufw = script.find("command -v ufw").unwrap();
        let firewalld = script.find("command -v firewall-cmd").unwrap();
        let iptables = script.find("command -v iptables").unwrap();
        assert!(ufw < firewalld && firewalld < iptables);
        assert!(script.contains("ERROR: No supported firewall found"));
        assert!(script.contains("echo \"FIREWALL_TYPE:$FIREWALL_TYPE\""));
        assert!(script.trim_end().ends_with("echo \"SUCCESS\""));
        assert!(script.contains("Node: worker-1"));
    }

    #[test]
    fn public_rules_have_no_source_clause() {
        let script = render_script("w", &worker_rules());
        assert!(script.contains("ufw allow 51820/udp comment 'WireGuard VPN'"));
        assert!(script.contains("ufw allow 30000:32767/tcp comment 'NodePort Services'"));
        assert!(script.contains("--add-port=30000-32767/tcp"));
        assert!(script.contains(
            "iptables -A INPUT -p udp --dport 51820 -j ACCEPT -m comment --comment 'WireGuard VPN'"
        ));
    }

    #[test]
    fn restricted_rules_carry_their_source() {
        let script = render_script("w", &worker_rules());
        assert!(script.contains("ufw allow from 10.8.0.0/24 to any port 22 proto tcp comment 'SSH via WireGuard'"));
        assert!(script.contains("source address=10.0.0.0/8 port port=10250 protocol=tcp accept"));
        assert!(script.contains("iptables -A INPUT -s 10.0.0.0/8 -p tcp --dport 10250 -j ACCEPT"));
    }

    #[test]
    fn rules_render_in_selection_order() {
        let rules = worker_rules();
        let script = render_script("w", &rules);
        let comments: Vec<&str> = script
            .lines()
            .filter(|l| l.trim_start().starts_with("ufw allow") && l.contains("comment"))
            .filter_map(|l| l.split("comment '").nth(1))
            .map(|c| c.trim_end_matches('\''))
            .collect();
        let expected: Vec<&str> = rules.iter().map(|r| r.description.as_str()).collect();
        assert_eq!(comments, expected);
    }

    #[test]
    fn firewalld_drops_stock_services_after_reset() {
        let script = render_script("w", &worker_rules());
        let start = script.find("configure_firewalld() {").unwrap();
        let end = start + script[start..].find("\n}\n").unwrap();
        let section = &script[start..end];

        let reset = section.find("--load-zone-defaults=public").unwrap();
        let removal = section.find("--remove-service=ssh").unwrap();
        let first_rule = section.find("--add-rich-rule").unwrap();
        assert!(reset < removal && removal < first_rule);
        assert!(section.contains("--list-services"));

        // port 22 is only reachable through the overlay rich rule
        let ssh_lines: Vec<&str> = section
            .lines()
            .filter(|l| l.contains("--add-"))
            .filter(|l| {
                l.contains("port=22 ") || l.contains("port=22/") || l.contains("service=ssh")
            })
            .collect();
        assert_eq!(ssh_lines.len(), 1);
        assert!(ssh_lines[0].contains("source address=10.8.0.0/24"));
    }

    #[test]
    fn iptables_drops_only_after_allow_rules() {
        let script = render_script("w", &worker_rules());
        let last_allow = script.rfind("iptables -A INPUT").unwrap();
        let drop = script.find("iptables -P INPUT DROP").unwrap();
        assert!(drop > last_allow);
    }

    #[test]
    fn node_names_are_sanitised() {
        let script = render_script("evil\"; rm -rf /; echo \"", &[]);
        assert!(!script.contains("evil\""));
        assert!(script.contains("Node: evil; rm -rf /; echo "));
    }

    #[test]
    fn parse_requires_an_exact_success_line() {
        let ok = parse_output("FIREWALL_TYPE:ufw\nStatus: active\n\nSUCCESS\n");
        assert!(ok.success);
        assert_eq!(ok.backend, Some(FirewallBackend::Ufw));

        let noisy = parse_output("FIREWALL_TYPE:iptables\nUNSUCCESSFUL attempt\n");
        assert!(!noisy.success);
        assert_eq!(noisy.backend, Some(FirewallBackend::Iptables));
    }

    #[test]
    fn parse_reports_detection_failure() {
        let out = parse_output("=== OS Firewall Configuration ===\nERROR: No supported firewall found\n");
        assert!(!out.success);
        assert_eq!(out.backend, None);
        assert_eq!(out.error.as_deref(), Some("No supported firewall found"));
    }
}
