//! Helper VM backend: the container runtime lives in a docker-machine VM
//!
//! The container is only reachable through the VM, so every route is added
//! twice: on the VM towards the container, and on this host towards the VM.
//! The VM masquerades traffic leaving through docker0. DNS delegation stays
//! local in `/etc/resolver`, with a host route to the container so replies
//! come back the same way.

use super::shell::{HostShell, argv, ensure_success};
use super::{NetworkBackend, PlatformError, install_marker_file, list_marker_files, parse_route_lines};
use crate::ip::{Ipv4Address, Ipv4Subnet};
use std::path::PathBuf;
use tracing::{debug, warn};

pub const RESOLVER_DIR: &str = "/etc/resolver";

const VM_IPTABLES: &str = "/usr/local/sbin/iptables";

pub struct HelperVmBackend {
    shell: Box<dyn HostShell>,
    tag: String,
    machine: String,
    ip: Option<Ipv4Address>,
    /// Container the companion host route was added for
    connected: Option<Ipv4Address>,
    host_ip: Option<String>,
    resolver_dir: PathBuf,
}

impl HelperVmBackend {
    pub fn new(tag: &str, machine: String, shell: Box<dyn HostShell>) -> Self {
        Self {
            shell,
            tag: tag.to_string(),
            machine,
            ip: None,
            connected: None,
            host_ip: None,
            resolver_dir: PathBuf::from(RESOLVER_DIR),
        }
    }

    pub fn with_resolver_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resolver_dir = dir.into();
        self
    }

    fn require_ip(&self) -> Result<Ipv4Address, PlatformError> {
        self.ip.ok_or(PlatformError::NoContainerIp)
    }

    /// Run `args` on the VM over docker-machine ssh.
    fn vm(&mut self, args: &[&str]) -> Result<Vec<String>, PlatformError> {
        let mut command = argv(["docker-machine", "ssh", self.machine.as_str()]);
        command.extend(argv(args.iter().copied()));
        Ok(self.shell.run_checked(&command)?.lines)
    }

    /// Address of the VM as seen from this host, looked up once.
    fn host_ip(&mut self) -> Result<String, PlatformError> {
        if let Some(ip) = &self.host_ip {
            return Ok(ip.clone());
        }
        let command = argv(["docker-machine", "ip", self.machine.as_str()]);
        let output = self.shell.run(&command)?;
        let ip = ensure_success(&command, output)
            .map_err(|e| PlatformError::HelperUnavailable(e.to_string()))?
            .lines
            .last()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| PlatformError::HelperUnavailable(format!("no address for {}", self.machine)))?;
        debug!("Helper VM {} is at {}", self.machine, ip);
        self.host_ip = Some(ip.clone());
        Ok(ip)
    }

    fn nat_rules(&mut self, op: &str) -> Result<(), PlatformError> {
        self.vm(&["sudo", VM_IPTABLES, "-t", "nat", op, "POSTROUTING", "-o", "docker0", "-j", "MASQUERADE"])?;
        self.vm(&["sudo", VM_IPTABLES, op, "FORWARD", "-i", "eth1", "-j", "ACCEPT"])?;
        Ok(())
    }

    fn local_route(&mut self, op: &str, dest: &str, gateway: Option<&str>) -> Result<(), PlatformError> {
        let mut command = argv(["sudo", "route", "-n", op, dest]);
        if let Some(gateway) = gateway {
            command.push(gateway.to_string());
        }
        self.shell.run_checked(&command)?;
        Ok(())
    }
}

/// Parse `export KEY="value"` lines from `docker-machine env`.
pub(crate) fn parse_env_lines(lines: &[String]) -> Vec<(String, String)> {
    lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("export "))
        .filter_map(|assignment| assignment.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        .collect()
}

impl NetworkBackend for HelperVmBackend {
    fn set_container_ip(&mut self, ip: Option<Ipv4Address>) {
        if ip.is_some() {
            self.connected = ip;
        }
        self.ip = ip;
    }

    fn container_ip(&self) -> Option<Ipv4Address> {
        self.ip
    }

    fn on_connect(&mut self) -> Result<(), PlatformError> {
        let ip = self.require_ip()?;
        self.nat_rules("-A")?;
        let host_ip = self.host_ip()?;
        self.local_route("add", &format!("{}/32", ip), Some(&host_ip))
    }

    fn on_disconnect(&mut self) -> Result<(), PlatformError> {
        let mut result = Ok(());
        // The session may already have dropped the address
        if let Some(ip) = self.connected.take().or(self.ip) {
            let host_ip = self.host_ip()?;
            result = self.local_route("delete", &format!("{}/32", ip), Some(&host_ip));
        }
        if let Err(e) = self.nat_rules("-D") {
            warn!("Failed to remove NAT rules on {}: {}", self.machine, e);
            result = result.and(Err(e));
        }
        result
    }

    fn add_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let ip = self.require_ip()?.to_string();
        let subnet = subnet.to_string();
        self.vm(&["sudo", "ip", "route", "add", &subnet, "via", &ip])?;
        let host_ip = self.host_ip()?;
        self.local_route("add", &subnet, Some(&host_ip))
    }

    fn del_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let subnet = subnet.to_string();
        let local = self.local_route("delete", &subnet, None);
        if let Err(e) = self.vm(&["sudo", "ip", "route", "del", &subnet]) {
            if let Err(local_err) = &local {
                warn!("Host route {} not removed either: {}", subnet, local_err);
            }
            return Err(e);
        }
        local
    }

    fn list_routes(&mut self) -> Vec<Ipv4Subnet> {
        let Some(ip) = self.ip else {
            return Vec::new();
        };
        let ip = ip.to_string();
        match self.vm(&["sudo", "ip", "route", "show", "via", &ip]) {
            Ok(lines) => parse_route_lines(&lines),
            Err(e) => {
                warn!("Listing routes on {} failed: {}", self.machine, e);
                Vec::new()
            }
        }
    }

    fn add_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        let ip = self.require_ip()?;
        let content = format!("nameserver {}  # {}\n", ip, self.tag);
        let dest = self.resolver_dir.join(domain);
        install_marker_file(self.shell.as_mut(), &content, &dest)
    }

    fn del_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        let path = self.resolver_dir.join(domain).to_string_lossy().into_owned();
        self.shell.run_checked(&argv(["sudo".to_string(), "rm".into(), path]))?;
        Ok(())
    }

    fn list_domains(&mut self) -> Vec<String> {
        let dir = self.resolver_dir.clone();
        list_marker_files(self.shell.as_mut(), &dir, &self.tag, true)
    }

    fn runtime_env(&mut self) -> Result<Vec<(String, String)>, PlatformError> {
        let command = argv(["docker-machine", "env", "--shell", "bash", self.machine.as_str()]);
        let output = self.shell.run(&command)?;
        let output = ensure_success(&command, output)
            .map_err(|e| PlatformError::HelperUnavailable(e.to_string()))?;
        Ok(parse_env_lines(&output.lines))
    }
}
