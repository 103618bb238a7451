//! Network identity of the emulated device: inference parsing and the
//! reachability probe.

use std::net::Ipv4Addr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::runner::{CommandOutput, CommandSpec};

/// A quoted dotted quad followed by `)`, as printed by the inference script
/// when it lists discovered interfaces, e.g. `('br0', '192.168.0.1')`.
const INFERRED_ADDRESS_PATTERN: &str = r"'(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})'\)";

fn inferred_address_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(INFERRED_ADDRESS_PATTERN).ok())
        .as_ref()
}

/// First valid address reported by the network inference script.
pub fn parse_inferred_address(output: &str) -> Option<Ipv4Addr> {
    inferred_address_regex()?
        .captures_iter(output)
        .filter_map(|caps| caps.get(1))
        .find_map(|m| m.as_str().parse().ok())
}

/// A single ICMP echo with a bounded wait.
pub fn probe_command(address: Ipv4Addr, timeout: Duration) -> CommandSpec {
    CommandSpec::new("ping").args([
        "-c".to_string(),
        "1".to_string(),
        "-W".to_string(),
        timeout.as_secs().max(1).to_string(),
        address.to_string(),
    ])
}

/// Some ping builds exit nonzero even when the reply arrived, so the output
/// marker counts as well.
pub fn is_reachable(output: &CommandOutput, marker: &str) -> bool {
    output.success() || output.combined().contains(marker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(exit_code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            duration_ms: 5,
        }
    }

    #[test]
    fn test_parse_documentation_address() {
        let out = "Interfaces: [('br0', '203.0.113.5')]\n";
        assert_eq!(parse_inferred_address(out), Some(Ipv4Addr::new(203, 0, 113, 5)));
    }

    #[test]
    fn test_parse_first_of_several() {
        let out = "[('eth0', '192.168.1.1'), ('eth1', '10.0.0.1')]";
        assert_eq!(parse_inferred_address(out), Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn test_parse_skips_invalid_octets() {
        let out = "[('eth0', '999.1.1.1'), ('br0', '192.168.0.100')]";
        assert_eq!(parse_inferred_address(out), Some(Ipv4Addr::new(192, 168, 0, 100)));
    }

    #[test]
    fn test_parse_requires_delimiters() {
        assert_eq!(parse_inferred_address("Interfaces: []"), None);
        assert_eq!(parse_inferred_address("address 192.168.0.1 found"), None);
        assert_eq!(parse_inferred_address("'192.168.0.1'"), None);
    }

    #[test]
    fn test_probe_command() {
        let cmd = probe_command(Ipv4Addr::new(192, 168, 0, 1), Duration::from_secs(10));
        assert_eq!(cmd.to_string(), "ping -c 1 -W 10 192.168.0.1");
    }

    #[test]
    fn test_probe_wait_is_at_least_one_second() {
        let cmd = probe_command(Ipv4Addr::LOCALHOST, Duration::from_millis(200));
        assert!(cmd.args.windows(2).any(|w| w == ["-W", "1"]));
    }

    #[test]
    fn test_reachability_by_exit_code() {
        assert!(is_reachable(&output(0, ""), "1 received"));
    }

    #[test]
    fn test_reachability_by_marker() {
        let out = output(1, "1 packets transmitted, 1 received, 0% packet loss");
        assert!(is_reachable(&out, "1 received"));
    }

    #[test]
    fn test_unreachable() {
        let out = output(1, "1 packets transmitted, 0 received, 100% packet loss");
        assert!(!is_reachable(&out, "1 received"));
    }
}
