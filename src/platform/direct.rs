//! Direct backend: the container runs on this host
//!
//! Routes go straight into the kernel table via `ip route`; DNS domains are
//! delegated through NetworkManager's dnsmasq with one `server=` file per
//! domain, tagged with the session so they can be found again later.

use super::shell::{HostShell, argv, ensure_success};
use super::{NetworkBackend, PlatformError, install_marker_file, list_marker_files, parse_route_lines};
use crate::ip::{Ipv4Address, Ipv4Subnet};
use std::path::PathBuf;
use tracing::warn;

pub const DNSMASQ_DIR: &str = "/etc/NetworkManager/dnsmasq.d";

pub struct DirectBackend {
    shell: Box<dyn HostShell>,
    tag: String,
    ip: Option<Ipv4Address>,
    resolver_dir: PathBuf,
}

impl DirectBackend {
    pub fn new(tag: &str, shell: Box<dyn HostShell>) -> Self {
        Self {
            shell,
            tag: tag.to_string(),
            ip: None,
            resolver_dir: PathBuf::from(DNSMASQ_DIR),
        }
    }

    /// Use another directory for dnsmasq delegation files
    pub fn with_resolver_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.resolver_dir = dir.into();
        self
    }

    fn require_ip(&self) -> Result<Ipv4Address, PlatformError> {
        self.ip.ok_or(PlatformError::NoContainerIp)
    }

    fn domain_path(&self, domain: &str) -> PathBuf {
        self.resolver_dir.join(domain)
    }

    fn marker(&self, domain: &str, ip: Ipv4Address) -> String {
        format!("server=/{}/{}  # {}\n", domain, ip, self.tag)
    }
}

impl NetworkBackend for DirectBackend {
    fn set_container_ip(&mut self, ip: Option<Ipv4Address>) {
        self.ip = ip;
    }

    fn container_ip(&self) -> Option<Ipv4Address> {
        self.ip
    }

    fn add_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let ip = self.require_ip()?;
        self.shell.run_checked(&argv([
            "sudo".to_string(),
            "ip".to_string(),
            "route".to_string(),
            "add".to_string(),
            subnet.to_string(),
            "via".to_string(),
            ip.to_string(),
        ]))?;
        Ok(())
    }

    fn del_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let command = argv(["sudo".to_string(), "ip".into(), "route".into(), "del".into(), subnet.to_string()]);
        let output = self.shell.run(&command)?;
        ensure_success(&command, output)?;
        Ok(())
    }

    fn list_routes(&mut self) -> Vec<Ipv4Subnet> {
        let Some(ip) = self.ip else {
            return Vec::new();
        };
        let command = argv(["ip".to_string(), "route".into(), "show".into(), "via".into(), ip.to_string()]);
        match self.shell.run(&command) {
            Ok(output) if output.success() => parse_route_lines(&output.lines),
            Ok(output) => {
                warn!("Listing routes failed with {:?}", output.status);
                Vec::new()
            }
            Err(e) => {
                warn!("Listing routes failed: {}", e);
                Vec::new()
            }
        }
    }

    fn add_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        let ip = self.require_ip()?;
        let content = self.marker(domain, ip);
        let dest = self.domain_path(domain);
        install_marker_file(self.shell.as_mut(), &content, &dest)
    }

    fn del_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        let command = argv([
            "sudo".to_string(),
            "rm".into(),
            self.domain_path(domain).to_string_lossy().to_string(),
        ]);
        self.shell.run_checked(&command)?;
        Ok(())
    }

    fn list_domains(&mut self) -> Vec<String> {
        // Delegation files are world readable, no elevation needed
        let dir = self.resolver_dir.clone();
        list_marker_files(self.shell.as_mut(), &dir, &self.tag, false)
    }
}
