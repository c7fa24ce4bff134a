use std::net::ToSocketAddrs;
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Host-utility capability: name resolution, ARP, address plumbing, and
/// Wake-on-LAN. Everything here shells out (or hits the resolver) and may
/// block briefly; callers invoke these outside cache locks.
pub trait HostTools: Send + Sync {
    /// Resolve a hostname to a dotted-quad IPv4 address.
    fn resolve_host(&self, hostname: &str) -> Result<String>;

    /// Look up the MAC address for an IP in the neighbor table.
    fn arp_lookup(&self, ip: &str) -> Result<String>;

    /// Plumb an address onto an interface (`ip addr add <ip>/32 dev <dev>`).
    fn ip_addr_add(&self, ip: &str, dev: &str) -> Result<()>;

    /// Remove an address from an interface.
    fn ip_addr_del(&self, ip: &str, dev: &str) -> Result<()>;

    /// Send a Wake-on-LAN magic packet to `target` (MAC, or IP fallback)
    /// via the given broadcast address.
    fn wake_on_lan(&self, broadcast: &str, target: &str) -> Result<()>;

    /// Signal the DHCP daemon to re-read its lease configuration.
    fn kick_dhcpd(&self) -> Result<()>;
}

fn host_command(cmd: &str, args: &[&str]) -> Result<Output> {
    let rendered = format!("{} {}", cmd, args.join(" "));
    Command::new(cmd)
        .args(args)
        .output()
        .with_context(|| format!("could not execute '{}'", rendered))
}

fn host_command_checked(cmd: &str, args: &[&str]) -> Result<()> {
    let output = host_command(cmd, args)?;
    match output.status.code() {
        Some(0) => Ok(()),
        code => bail!(
            "'{} {}' exited with status {:?}",
            cmd,
            args.join(" "),
            code
        ),
    }
}

/// Default implementation backed by the standard host utilities.
#[derive(Debug, Default)]
pub struct ShellTools;

impl HostTools for ShellTools {
    fn resolve_host(&self, hostname: &str) -> Result<String> {
        let addrs = (hostname, 0)
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve host '{}'", hostname))?;
        for addr in addrs {
            if addr.is_ipv4() {
                return Ok(addr.ip().to_string());
            }
        }
        anyhow::bail!("No IPv4 address for host '{}'", hostname)
    }

    fn arp_lookup(&self, ip: &str) -> Result<String> {
        let output = host_command("ip", &["neigh", "show", ip])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        // "10.1.0.5 dev eth0 lladdr d0:0d:01:02:03:04 REACHABLE"
        for line in stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if let Some(pos) = fields.iter().position(|f| *f == "lladdr")
                && let Some(mac) = fields.get(pos + 1)
            {
                return Ok(mac.to_string());
            }
        }
        anyhow::bail!("No neighbor entry for {}", ip)
    }

    fn ip_addr_add(&self, ip: &str, dev: &str) -> Result<()> {
        let cidr = format!("{}/32", ip);
        debug!(ip = %ip, dev = %dev, "Adding address");
        host_command_checked("ip", &["addr", "add", &cidr, "dev", dev])
    }

    fn ip_addr_del(&self, ip: &str, dev: &str) -> Result<()> {
        let cidr = format!("{}/32", ip);
        debug!(ip = %ip, dev = %dev, "Removing address");
        host_command_checked("ip", &["addr", "del", &cidr, "dev", dev])
    }

    fn wake_on_lan(&self, broadcast: &str, target: &str) -> Result<()> {
        debug!(broadcast = %broadcast, target = %target, "Sending wake-on-LAN");
        host_command_checked("powerwake", &["-b", broadcast, target])
    }

    fn kick_dhcpd(&self) -> Result<()> {
        host_command_checked("pkill", &["-HUP", "dhcpd"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost() {
        let tools = ShellTools;
        let ip = tools.resolve_host("localhost").unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[test]
    fn test_resolve_garbage_fails() {
        let tools = ShellTools;
        assert!(tools.resolve_host("no-such-host.invalid").is_err());
    }
}
