//! Configuration handling for vpn-porthole
//!
//! Settings live in a TOML file with one `[system]` table and a
//! `[session.<name>]` table per VPN profile. The orchestrator never reads the
//! raw file; it consumes the validated [`SessionSettings`] produced here.

use crate::ip::{AddressError, Ipv4Subnet};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

const SHELL_PREFIX: &str = "SHELL:";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Session \"{0}\" not found")]
    UnknownSession(String),
    #[error("Invalid subnet in session \"{session}\": {source}")]
    InvalidSubnet {
        session: String,
        source: AddressError,
    },
    #[error("Invalid domain in session \"{session}\": {domain:?}")]
    InvalidDomain { session: String, domain: String },
    #[error("Invalid file name in session \"{session}\": {name:?}")]
    InvalidFileName { session: String, name: String },
    #[error("Secret command failed: {0}")]
    SecretCommand(String),
    #[error("Config file already exists: {0}")]
    AlreadyExists(PathBuf),
}

/// Which network backend to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformChoice {
    /// Pick from the host operating system
    #[default]
    Auto,
    /// Mutate the local routing table and resolver directly
    Direct,
    /// Container runtime lives in a docker-machine helper VM
    HelperVm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// Sudo password, `SHELL:<cmd>` or empty to prompt once per run
    #[serde(default)]
    pub sudo: Option<String>,
    #[serde(default)]
    pub platform: PlatformChoice,
    /// docker-machine name of the helper VM
    #[serde(default)]
    pub helper_machine: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub vpn: String,
    pub username: String,
    /// VPN password, `SHELL:<cmd>` or empty to prompt
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub run_options: Vec<String>,
    /// Build context files, by file name
    #[serde(default)]
    pub build: BTreeMap<String, String>,
    /// Container hook scripts, installed as `/vpnp/<name>`
    #[serde(default)]
    pub hooks: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub session: BTreeMap<String, SessionConfig>,
}

/// Validated, typed view of one session profile
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub name: String,
    pub vpn: String,
    pub username: String,
    pub password: Option<String>,
    pub subnets: Vec<Ipv4Subnet>,
    pub domains: Vec<String>,
    pub run_options: Vec<String>,
    pub build_files: BTreeMap<String, String>,
    pub hooks: BTreeMap<String, String>,
}


/// Example written by `vpnp init`
pub const EXAMPLE_SETTINGS: &str = include_str!("../resources/settings.example.toml");

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        // Validate every profile up front so a typo fails before any action runs
        for name in config.session.keys() {
            config.session_settings(name)?;
        }
        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/vpn-porthole/settings.toml` or the platform equivalent
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vpn-porthole")
            .join("settings.toml")
    }

    /// Write the example settings to `path`, refusing to overwrite.
    pub fn write_example(path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, EXAMPLE_SETTINGS)?;
        Ok(())
    }

    /// Session names in sorted order
    pub fn session_names(&self) -> Vec<String> {
        self.session.keys().cloned().collect()
    }

    pub fn session_settings(&self, name: &str) -> Result<SessionSettings, ConfigError> {
        let raw = self
            .session
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSession(name.to_string()))?;

        let subnets = raw
            .subnets
            .iter()
            .map(|s| s.trim().parse::<Ipv4Subnet>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| ConfigError::InvalidSubnet {
                session: name.to_string(),
                source,
            })?;

        for domain in &raw.domains {
            if !is_valid_domain(domain) {
                return Err(ConfigError::InvalidDomain {
                    session: name.to_string(),
                    domain: domain.clone(),
                });
            }
        }

        for file in raw.build.keys().chain(raw.hooks.keys()) {
            if !is_plain_file_name(file) {
                return Err(ConfigError::InvalidFileName {
                    session: name.to_string(),
                    name: file.clone(),
                });
            }
        }

        Ok(SessionSettings {
            name: name.to_string(),
            vpn: raw.vpn.clone(),
            username: raw.username.clone(),
            password: raw.password.clone().filter(|p| !p.is_empty()),
            subnets,
            domains: raw.domains.clone(),
            run_options: raw.run_options.clone(),
            build_files: raw.build.clone(),
            hooks: raw.hooks.clone(),
        })
    }
}

/// Domains become file names under resolver directories, so keep them to
/// plain DNS labels.
pub fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

/// Resolve a configured secret: `SHELL:<cmd>` runs `cmd` and takes its
/// trimmed stdout, anything else is returned as is.
pub fn resolve_secret(value: &str) -> Result<String, ConfigError> {
    let Some(command) = value.strip_prefix(SHELL_PREFIX) else {
        return Ok(value.to_string());
    };
    let output = Command::new("sh")
        .args(["-c", command])
        .output()
        .map_err(|e| ConfigError::SecretCommand(e.to_string()))?;
    if !output.status.success() {
        return Err(ConfigError::SecretCommand(format!(
            "exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Expand a leading `~` and `$VAR`/`${VAR}` references in a run option.
pub fn expand_option(option: &str) -> String {
    expand_option_with(option, dirs::home_dir(), |key| std::env::var(key).ok())
}

fn expand_option_with<F>(option: &str, home: Option<PathBuf>, get_var: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(option.len());
    let mut rest = option;

    if let Some(home) = home {
        if rest == "~" || rest.starts_with("~/") {
            out.push_str(&home.to_string_lossy());
            rest = &rest[1..];
        }
    }

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };
        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        // Unset variables are left untouched, matching shell-less expansion
        match get_var(name) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}
