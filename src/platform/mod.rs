//! Host network backends
//!
//! A backend splices subnets and DNS domains from the VPN container into the
//! host. Two strategies exist:
//!
//! - [`direct::DirectBackend`]: the container runtime runs on this host, so
//!   routes and resolver entries are applied to the local kernel directly.
//! - [`helper::HelperVmBackend`]: the runtime lives in a docker-machine VM,
//!   so each route is mirrored on the VM and on the host, with NAT on the VM.
//!
//! The strategy is chosen once at startup with [`PlatformKind::detect`] and
//! handed to the session as a boxed [`NetworkBackend`].

pub mod direct;
pub mod helper;
pub mod shell;

use crate::config::PlatformChoice;
use crate::expect::ExpectError;
use crate::ip::{Ipv4Address, Ipv4Subnet};
use shell::{HostShell, argv};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Command failed ({status:?}): {command}\n{output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },
    #[error("Command timed out: {0}")]
    CommandTimedOut(String),
    #[error("Interactive command failed: {0}")]
    Interactive(#[from] ExpectError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No active container IP")]
    NoContainerIp,
    #[error("Helper VM unavailable: {0}")]
    HelperUnavailable(String),
    #[error("{failed} of {attempted} removals failed")]
    PartialFailure { failed: usize, attempted: usize },
    #[error("Unsupported platform")]
    UnsupportedPlatform,
}

/// Backend strategy for the host this process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    Direct,
    HelperVm,
}

impl PlatformKind {
    pub fn detect(choice: PlatformChoice) -> Result<Self, PlatformError> {
        match choice {
            PlatformChoice::Direct => Ok(PlatformKind::Direct),
            PlatformChoice::HelperVm => Ok(PlatformKind::HelperVm),
            PlatformChoice::Auto => Self::for_os(std::env::consts::OS),
        }
    }

    fn for_os(os: &str) -> Result<Self, PlatformError> {
        match os {
            "linux" => Ok(PlatformKind::Direct),
            "macos" => Ok(PlatformKind::HelperVm),
            _ => Err(PlatformError::UnsupportedPlatform),
        }
    }
}

/// Route and DNS splicing for one session.
///
/// Every operation is scoped by the active container IP set through
/// [`NetworkBackend::set_container_ip`]. Listings never fail; problems are
/// logged and an empty list returned.
pub trait NetworkBackend {
    fn set_container_ip(&mut self, ip: Option<Ipv4Address>);

    fn container_ip(&self) -> Option<Ipv4Address>;

    /// One-time setup once the VPN is up
    fn on_connect(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    /// One-time teardown when the VPN goes down
    fn on_disconnect(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    fn add_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError>;

    fn del_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError>;

    /// Routes whose next hop is the active container
    fn list_routes(&mut self) -> Vec<Ipv4Subnet>;

    fn add_domain(&mut self, domain: &str) -> Result<(), PlatformError>;

    fn del_domain(&mut self, domain: &str) -> Result<(), PlatformError>;

    /// Domains delegated by files carrying this session's tag
    fn list_domains(&mut self) -> Vec<String>;

    /// Environment the container runtime client needs to reach its daemon
    fn runtime_env(&mut self) -> Result<Vec<(String, String)>, PlatformError> {
        Ok(Vec::new())
    }

    /// Remove every listed route plus the `declared` ones, which may have
    /// been left behind by a container that died before it was listed.
    fn remove_all_routes(&mut self, declared: &[Ipv4Subnet]) -> Result<(), PlatformError> {
        let listed: BTreeSet<Ipv4Subnet> = self.list_routes().into_iter().collect();
        let mut all = listed.clone();
        all.extend(declared.iter().copied());

        let mut failed = 0;
        for subnet in &all {
            match self.del_route(subnet) {
                Ok(()) => info!("Removed route: {}", subnet),
                Err(e) if listed.contains(subnet) => {
                    warn!("Failed to remove route {}: {} (continuing)", subnet, e);
                    failed += 1;
                }
                Err(e) => debug!("Route {} was not present: {}", subnet, e),
            }
        }
        removal_result(failed, all.len())
    }

    fn remove_all_domains(&mut self) -> Result<(), PlatformError> {
        let domains = self.list_domains();
        let mut failed = 0;
        for domain in &domains {
            match self.del_domain(domain) {
                Ok(()) => info!("Removed domain: {}", domain),
                Err(e) => {
                    warn!("Failed to remove domain {}: {} (continuing)", domain, e);
                    failed += 1;
                }
            }
        }
        removal_result(failed, domains.len())
    }
}

fn removal_result(failed: usize, attempted: usize) -> Result<(), PlatformError> {
    if failed == 0 {
        Ok(())
    } else {
        Err(PlatformError::PartialFailure { failed, attempted })
    }
}

/// Get the network backend for `kind`.
pub fn get_network_backend(
    kind: PlatformKind,
    tag: &str,
    helper_machine: Option<String>,
    shell: Box<dyn HostShell>,
) -> Result<Box<dyn NetworkBackend>, PlatformError> {
    match kind {
        PlatformKind::Direct => Ok(Box::new(direct::DirectBackend::new(tag, shell))),
        PlatformKind::HelperVm => {
            let machine = helper_machine
                .filter(|m| !m.is_empty())
                .or_else(|| std::env::var("DOCKER_MACHINE_NAME").ok())
                .ok_or_else(|| {
                    PlatformError::HelperUnavailable(
                        "set system.helper_machine or DOCKER_MACHINE_NAME".to_string(),
                    )
                })?;
            Ok(Box::new(helper::HelperVmBackend::new(tag, machine, shell)))
        }
    }
}

/// Write `content` to a world-readable temp file and copy it into place as root.
pub(crate) fn install_marker_file(
    shell: &mut dyn HostShell,
    content: &str,
    dest: &Path,
) -> Result<(), PlatformError> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))?;
    }
    shell.run_checked(&argv([
        "sudo".to_string(),
        "cp".into(),
        file.path().to_string_lossy().into_owned(),
        dest.to_string_lossy().into_owned(),
    ]))?;
    Ok(())
}

/// Names of the files in `dir` that mention `tag`.
pub(crate) fn list_marker_files(
    shell: &mut dyn HostShell,
    dir: &Path,
    tag: &str,
    elevate: bool,
) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read {}: {}", dir.display(), e);
            return Vec::new();
        }
    };
    let mut files: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .map(|path| path.to_string_lossy().into_owned())
        .collect();
    if files.is_empty() {
        return Vec::new();
    }
    files.sort();

    let mut command = Vec::new();
    if elevate {
        command.push("sudo".to_string());
    }
    command.extend(argv(["grep", "-l", tag]));
    command.extend(files);

    match shell.run(&command) {
        Ok(output) if output.success() => parse_grep_files(&output.lines),
        // grep exits 1 when nothing matched
        Ok(output) if output.status == Some(1) => Vec::new(),
        Ok(output) => {
            warn!("Listing domains failed with {:?}", output.status);
            Vec::new()
        }
        Err(e) => {
            warn!("Listing domains failed: {}", e);
            Vec::new()
        }
    }
}

/// Parse the destinations out of `ip route show` output.
pub(crate) fn parse_route_lines(lines: &[String]) -> Vec<Ipv4Subnet> {
    lines
        .iter()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|dest| match dest.parse::<Ipv4Subnet>() {
            Ok(subnet) => Some(subnet),
            Err(_) => {
                debug!("Ignoring route entry: {}", dest);
                None
            }
        })
        .collect()
}

/// File names from `grep -l` output
pub(crate) fn parse_grep_files(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| std::path::Path::new(line).file_name())
        .map(|name| name.to_string_lossy().to_string())
        .collect()
}
