//! Packet-marking rules in the mangle FORWARD chain
//!
//! One rule per direction tags matching packets with the path identifier so
//! the tc `fw` filter can classify them.

use super::command::{FailurePolicy, Invocation};
use crate::path::model::{Direction, Protocol, Selector};

const TABLE: &str = "mangle";
const CHAIN: &str = "FORWARD";

/// Marking rule of one selector in one direction.
#[derive(Debug, Clone, Copy)]
pub struct MarkingRule<'a> {
    selector: &'a Selector,
    direction: Direction,
    in_iface: &'a str,
    out_iface: &'a str,
}

impl<'a> MarkingRule<'a> {
    /// `in_iface`/`out_iface` are the forwarding pair of `direction`.
    pub fn new(selector: &'a Selector, direction: Direction, in_iface: &'a str, out_iface: &'a str) -> Self {
        Self {
            selector,
            direction,
            in_iface,
            out_iface,
        }
    }

    pub fn append(&self) -> Invocation {
        Invocation::iptables(self.args("-A"), FailurePolicy::Required)
    }

    pub fn delete(&self) -> Invocation {
        Invocation::iptables(self.args("-D"), FailurePolicy::Tolerated)
    }

    fn args(&self, action: &str) -> Vec<String> {
        let mut args: Vec<String> = ["-t", TABLE, action, CHAIN, "-i", self.in_iface, "-o", self.out_iface]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(self.match_args());
        args.extend(["-j", "MARK", "--set-mark"].map(String::from));
        args.push(self.selector.mark.to_string());
        args
    }

    /// Uplink matches LAN as source and WAN as destination; downlink the reverse.
    fn match_args(&self) -> Vec<String> {
        let uplink = self.direction == Direction::Uplink;
        let (lan_addr_flag, wan_addr_flag) = if uplink { ("-s", "-d") } else { ("-d", "-s") };
        let (lan_port_flag, wan_port_flag) = if uplink {
            ("--sport", "--dport")
        } else {
            ("--dport", "--sport")
        };

        let mut args = Vec::new();
        if let Some(ip) = self.selector.lan_ip() {
            args.extend([lan_addr_flag.to_string(), ip.to_string()]);
        }
        if let Some(ip) = self.selector.wan_ip() {
            args.extend([wan_addr_flag.to_string(), ip.to_string()]);
        }

        if self.selector.protocol != Protocol::Any {
            args.extend(["-p".to_string(), self.selector.protocol.as_str().to_string()]);
            if let Some(port) = self.selector.lan_port.port() {
                args.extend([lan_port_flag.to_string(), port.to_string()]);
            }
            if let Some(port) = self.selector.wan_port.port() {
                args.extend([wan_port_flag.to_string(), port.to_string()]);
            }
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::model::PortSpec;

    fn selector() -> Selector {
        Selector {
            protocol: Protocol::Udp,
            lan_ip: Some("192.168.1.10".into()),
            lan_port: PortSpec::Port(5000),
            wan_ip: Some("8.8.8.8".into()),
            wan_port: PortSpec::Any,
            mark: 9531,
        }
    }

    #[test]
    fn test_uplink_orientation() {
        let sel = selector();
        let rule = MarkingRule::new(&sel, Direction::Uplink, "eth0", "eth1");
        assert_eq!(
            rule.append().command_line(),
            "iptables -t mangle -A FORWARD -i eth0 -o eth1 -s 192.168.1.10 -d 8.8.8.8 -p udp --sport 5000 -j MARK --set-mark 9531"
        );
    }

    #[test]
    fn test_downlink_orientation_and_delete() {
        let sel = selector();
        let rule = MarkingRule::new(&sel, Direction::Downlink, "eth1", "eth0");
        let delete = rule.delete();
        assert_eq!(
            delete.command_line(),
            "iptables -t mangle -D FORWARD -i eth1 -o eth0 -d 192.168.1.10 -s 8.8.8.8 -p udp --dport 5000 -j MARK --set-mark 9531"
        );
        assert_eq!(delete.policy, FailurePolicy::Tolerated);
    }

    #[test]
    fn test_any_protocol_ignores_ports() {
        let sel = Selector {
            protocol: Protocol::Any,
            wan_port: PortSpec::Port(443),
            mark: 9527,
            ..Default::default()
        };
        let rule = MarkingRule::new(&sel, Direction::Uplink, "eth0", "eth1");
        assert_eq!(
            rule.append().command_line(),
            "iptables -t mangle -A FORWARD -i eth0 -o eth1 -j MARK --set-mark 9527"
        );
    }
}
