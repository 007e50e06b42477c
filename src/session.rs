//! Session orchestration
//!
//! A [`Session`] ties one configured VPN profile to its container image, the
//! running container, and the routes and DNS delegations spliced into the
//! host. Nothing is persisted between runs: the container is found again by
//! its image tag, and host artifacts by the container address or the tag
//! written into them.

use crate::config::{Config, ConfigError, SessionSettings, expand_option, is_valid_domain};
use crate::credentials::{ConfiguredCredentials, CredentialSource, SudoPassword};
use crate::expect::login::{LoginOutcome, LoginState, negotiate};
use crate::expect::{CancelToken, DEFAULT_TIMEOUT, ExpectError};
use crate::ip::{Ipv4Address, Ipv4Subnet};
use crate::lock::{LockError, SessionLock};
use crate::platform::shell::PtyShell;
use crate::platform::{NetworkBackend, PlatformError, PlatformKind, get_network_backend};
use crate::runtime::docker::DockerCli;
use crate::runtime::{
    ContainerRuntime, ContainerSummary, ImageSummary, LaunchSpec, RuntimeError, short_id,
};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Helper baked into every image; runs a hook and reports its exit code
pub const EXEC_HELPER: &str = include_str!("../resources/exec");

/// Exit code for a hook that cannot run
pub const HOOK_NOT_FOUND: i32 = 127;

const HOOK_DIR: &str = "vpnp";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("Image build failed: {0}")]
    Build(#[source] RuntimeError),
    #[error("Already running: {0}")]
    AlreadyRunning(String),
    #[error("Failed to start (login {state}, exit code {exit_code:?})")]
    StartFailed {
        exit_code: Option<i32>,
        state: LoginState,
    },
    #[error("No active container")]
    NoActiveContainer,
    #[error("Not running: {0}")]
    NotRunning(String),
    #[error("Container runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("{0}")]
    Platform(#[from] PlatformError),
    #[error("Login failed: {0}")]
    Login(#[from] ExpectError),
    #[error("{0}")]
    Lock(#[from] LockError),
    #[error("No {0} hook configured")]
    HookNotFound(String),
}

impl SessionError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::Config(_) | SessionError::Build(_) => 3,
            SessionError::Login(ExpectError::AuthLockoutGuard) => 3,
            SessionError::HookNotFound(_) => HOOK_NOT_FOUND,
            _ => 1,
        }
    }
}

/// Lifecycle position derived from live runtime and host queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoImage,
    ImageBuilt,
    Stopped,
    Running,
    Spliced,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::NoImage => "no image",
            SessionState::ImageBuilt => "image built",
            SessionState::Stopped => "stopped",
            SessionState::Running => "running",
            SessionState::Spliced => "spliced",
        };
        f.write_str(text)
    }
}

/// Image/container name and ownership marker for `profile` run by `user`.
pub fn session_tag(profile: &str, user: &str) -> String {
    format!("vpnp/{}_{}", profile, user).to_lowercase()
}

/// Name of the invoking user
pub fn local_user() -> String {
    #[cfg(unix)]
    {
        if let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::getuid()) {
            return user.name;
        }
    }
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub image: String,
    pub state: String,
    pub id: String,
}

/// What `info` reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoReport {
    pub images: Vec<ImageSummary>,
    pub container: Option<ContainerInfo>,
    pub ip: Option<Ipv4Address>,
    pub routes: Vec<Ipv4Subnet>,
    pub domains: Vec<String>,
}

impl fmt::Display for InfoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for image in &self.images {
            writeln!(f, "Image: {}\t{}\t{}", image.repo_tag, short_id(&image.id), image.size)?;
        }
        if let Some(container) = &self.container {
            writeln!(
                f,
                "Container: {}\t{}\t{}",
                container.image,
                container.state,
                short_id(&container.id)
            )?;
        }
        if let Some(ip) = self.ip {
            writeln!(f, "IP: {}", ip)?;
        }
        for route in &self.routes {
            writeln!(f, "Route: {}", route)?;
        }
        for domain in &self.domains {
            writeln!(f, "Domain: {}", domain)?;
        }
        Ok(())
    }
}

pub struct Session {
    settings: SessionSettings,
    tag: String,
    runtime: Box<dyn ContainerRuntime>,
    backend: Box<dyn NetworkBackend>,
    credentials: Box<dyn CredentialSource>,
    cancel: CancelToken,
    login_timeout: Duration,
    ip: Option<Ipv4Address>,
    warnings: Vec<String>,
    lock_dir: PathBuf,
}

impl Session {
    pub fn new(
        settings: SessionSettings,
        tag: String,
        runtime: Box<dyn ContainerRuntime>,
        backend: Box<dyn NetworkBackend>,
        credentials: Box<dyn CredentialSource>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            settings,
            tag,
            runtime,
            backend,
            credentials,
            cancel,
            login_timeout: DEFAULT_TIMEOUT,
            ip: None,
            warnings: Vec::new(),
            lock_dir: SessionLock::default_dir(),
        }
    }

    /// Wire up a session from configuration for the current user and host.
    pub fn open(config: &Config, name: &str, cancel: CancelToken) -> Result<Self, SessionError> {
        let settings = config.session_settings(name)?;
        let tag = session_tag(name, &local_user());
        let kind = PlatformKind::detect(config.system.platform)?;
        debug!("Session {} uses the {:?} backend", tag, kind);

        let shell = PtyShell::new(SudoPassword::new(config.system.sudo.clone()), cancel.clone());
        let mut backend =
            get_network_backend(kind, &tag, config.system.helper_machine.clone(), Box::new(shell))?;
        let runtime = DockerCli::new(backend.runtime_env()?);
        let credentials = ConfiguredCredentials::from_settings(&settings);

        Ok(Self::new(
            settings,
            tag,
            Box::new(runtime),
            backend,
            Box::new(credentials),
            cancel,
        ))
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Login name as sent to the VPN, with `SHELL:` commands resolved
    pub fn username(&self) -> Result<String, SessionError> {
        Ok(self.credentials.username().map_err(ExpectError::from)?)
    }

    /// Non-fatal problems noticed so far
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    fn lock(&self) -> Result<SessionLock, SessionError> {
        Ok(SessionLock::acquire_in(&self.lock_dir, &self.tag)?)
    }

    fn set_ip(&mut self, ip: Option<Ipv4Address>) {
        self.ip = ip;
        self.backend.set_container_ip(ip);
    }

    /// Find the running container for this session and cache its address.
    fn resolve_container(&mut self) -> Result<Option<ContainerSummary>, SessionError> {
        let running: Vec<ContainerSummary> = self
            .runtime
            .containers(&self.tag)?
            .into_iter()
            .filter(ContainerSummary::is_running)
            .collect();

        let Some(container) = running.first().cloned() else {
            self.set_ip(None);
            return Ok(None);
        };

        if running.len() > 1 {
            let ids: Vec<&str> = running.iter().map(|c| short_id(&c.id)).collect();
            let message = format!(
                "More than one container running for {}: {}; using {}",
                self.tag,
                ids.join(", "),
                short_id(&container.id)
            );
            warn!("{}", message);
            self.warnings.push(message);
        }

        let ip = self.runtime.inspect(&container.id)?.and_then(|d| d.ip);
        if ip.is_none() {
            warn!("Container {} has no address", short_id(&container.id));
        }
        self.set_ip(ip);
        Ok(Some(container))
    }

    fn require_ip(&self) -> Result<Ipv4Address, SessionError> {
        self.ip.ok_or(SessionError::NoActiveContainer)
    }

    pub fn build(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.build_image()
    }

    fn build_image(&mut self) -> Result<(), SessionError> {
        let context = tempfile::TempDir::new().map_err(RuntimeError::from)?;
        write_build_context(context.path(), &self.settings).map_err(RuntimeError::from)?;
        info!("Building image {}", self.tag);
        self.runtime
            .build(context.path(), &self.tag)
            .map_err(SessionError::Build)?;
        println!("Name: {}", self.tag);
        Ok(())
    }

    /// Bring the VPN up and splice it into the host.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.start_unlocked()
    }

    fn start_unlocked(&mut self) -> Result<(), SessionError> {
        if self.resolve_container()?.is_some() {
            warn!("{} is already running", self.tag);
            return Err(SessionError::AlreadyRunning(self.tag.clone()));
        }

        if self.runtime.images(&self.tag)?.is_empty() {
            self.build_image()?;
        }

        self.set_ip(None);
        match self.login()? {
            LoginOutcome::Established => {}
            LoginOutcome::Failed { exit_code, state } => {
                error!("Failed to start {}: login {}", self.tag, state);
                return Err(SessionError::StartFailed { exit_code, state });
            }
        }

        let container = match self.resolve_container()? {
            Some(container) if self.ip.is_some() => container,
            _ => {
                error!("Failed to start {}: no container address", self.tag);
                return Err(SessionError::StartFailed {
                    exit_code: None,
                    state: LoginState::Established,
                });
            }
        };

        self.run_optional_hook(&container, "up")?;
        self.backend.on_connect()?;
        self.splice_unlocked()
    }

    fn login(&mut self) -> Result<LoginOutcome, SessionError> {
        let username = self.credentials.username().map_err(ExpectError::from)?;
        let spec = LaunchSpec {
            image: self.tag.clone(),
            run_options: self.settings.run_options.iter().map(|o| expand_option(o)).collect(),
            env: vec![
                ("VPNP_VPN".to_string(), self.settings.vpn.clone()),
                ("VPNP_USERNAME".to_string(), username),
            ],
            command: vec![format!("/{}/start", HOOK_DIR)],
        };
        let mut process = self.runtime.launch(&spec)?;
        let outcome = negotiate(
            process.as_mut(),
            self.credentials.as_ref(),
            self.login_timeout,
            &self.cancel,
        )?;
        Ok(outcome)
    }

    /// Add every configured subnet and domain that is not spliced yet.
    pub fn splice(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.resolve_container()?;
        self.splice_unlocked()
    }

    fn splice_unlocked(&mut self) -> Result<(), SessionError> {
        self.require_ip()?;
        let mut first_error = None;

        let routes: BTreeSet<Ipv4Subnet> = self.backend.list_routes().into_iter().collect();
        for subnet in &self.settings.subnets {
            if routes.contains(subnet) {
                debug!("Route {} already present", subnet);
                continue;
            }
            match self.backend.add_route(subnet) {
                Ok(()) => info!("Added route: {}", subnet),
                Err(e) => {
                    warn!("Failed to add route {}: {}", subnet, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let domains: BTreeSet<String> = self.backend.list_domains().into_iter().collect();
        for domain in &self.settings.domains {
            if domains.contains(domain) {
                debug!("Domain {} already present", domain);
                continue;
            }
            match self.backend.add_domain(domain) {
                Ok(()) => info!("Added domain: {}", domain),
                Err(e) => {
                    warn!("Failed to add domain {}: {}", domain, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn add_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.resolve_container()?;
        self.require_ip()?;
        if self.backend.list_routes().contains(subnet) {
            info!("Route {} already present", subnet);
            return Ok(());
        }
        self.backend.add_route(subnet)?;
        info!("Added route: {}", subnet);
        Ok(())
    }

    /// Remove every spliced route that falls within `subnet`.
    pub fn del_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.resolve_container()?;
        self.require_ip()?;

        let matching: Vec<Ipv4Subnet> = self
            .backend
            .list_routes()
            .into_iter()
            .filter(|route| subnet.contains_subnet(route))
            .collect();
        if matching.is_empty() {
            info!("No routes within {}", subnet);
        }
        for route in &matching {
            self.backend.del_route(route)?;
            info!("Removed route: {}", route);
        }
        Ok(())
    }

    pub fn add_domain(&mut self, domain: &str) -> Result<(), SessionError> {
        self.check_domain(domain)?;
        let _lock = self.lock()?;
        self.resolve_container()?;
        self.require_ip()?;
        if self.backend.list_domains().iter().any(|d| d == domain) {
            info!("Domain {} already present", domain);
            return Ok(());
        }
        self.backend.add_domain(domain)?;
        info!("Added domain: {}", domain);
        Ok(())
    }

    /// Remove a delegation owned by this session. Works without a running
    /// container so leftovers can still be cleared.
    pub fn del_domain(&mut self, domain: &str) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.resolve_container()?;
        if !self.backend.list_domains().iter().any(|d| d == domain) {
            info!("Domain {} not present", domain);
            return Ok(());
        }
        self.backend.del_domain(domain)?;
        info!("Removed domain: {}", domain);
        Ok(())
    }

    fn check_domain(&self, domain: &str) -> Result<(), SessionError> {
        if is_valid_domain(domain) {
            Ok(())
        } else {
            Err(ConfigError::InvalidDomain {
                session: self.settings.name.clone(),
                domain: domain.to_string(),
            }
            .into())
        }
    }

    /// Unsplice, shut the VPN down and clear out the session's containers.
    pub fn stop(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        self.stop_unlocked()
    }

    fn stop_unlocked(&mut self) -> Result<(), SessionError> {
        let mut first_error: Option<SessionError> = None;
        // Host cleanup must not depend on reaching the runtime
        let container = match self.resolve_container() {
            Ok(container) => container,
            Err(e) => {
                warn!("Cannot look up containers for {}: {}", self.tag, e);
                first_error.get_or_insert(e);
                None
            }
        };

        if let Err(e) = self.backend.remove_all_domains() {
            warn!("Domain cleanup incomplete: {}", e);
            first_error.get_or_insert(e.into());
        }
        let declared = self.settings.subnets.clone();
        if let Err(e) = self.backend.remove_all_routes(&declared) {
            warn!("Route cleanup incomplete: {}", e);
            first_error.get_or_insert(e.into());
        }

        if let Some(container) = &container {
            if let Err(e) = self.run_optional_hook(container, "stop") {
                warn!("Stop hook failed: {}", e);
            }
        }

        self.set_ip(None);
        if let Err(e) = self.backend.on_disconnect() {
            warn!("Disconnect cleanup failed: {}", e);
        }

        for container in self.list_containers(&mut first_error) {
            if container.is_running() {
                if let Err(e) = self.runtime.stop(&container.id) {
                    error!("Error stopping {}: {}", short_id(&container.id), e);
                    first_error.get_or_insert(e.into());
                }
            }
        }
        for container in self.list_containers(&mut first_error) {
            // Containers started with --rm may already be on their way out
            if !container.is_running() && container.state != "removing" {
                if let Err(e) = self.runtime.remove_container(&container.id) {
                    warn!("Error removing {}: {}", short_id(&container.id), e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn list_containers(&mut self, first_error: &mut Option<SessionError>) -> Vec<ContainerSummary> {
        match self.runtime.containers(&self.tag) {
            Ok(containers) => containers,
            Err(e) => {
                warn!("Cannot list containers for {}: {}", self.tag, e);
                first_error.get_or_insert(e.into());
                Vec::new()
            }
        }
    }

    /// Stop, then remove every image for this session.
    pub fn purge(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        let stopped = self.stop_unlocked();
        for image in self.runtime.images(&self.tag)? {
            self.runtime.remove_image(&image.id)?;
        }
        stopped
    }

    pub fn restart(&mut self) -> Result<(), SessionError> {
        let _lock = self.lock()?;
        if self.resolve_container()?.is_none() {
            println!("{} is not running", self.tag);
            return Err(SessionError::NotRunning(self.tag.clone()));
        }
        self.stop_unlocked()?;
        self.start_unlocked()
    }

    /// True when a container for this session is running.
    pub fn status(&mut self) -> Result<bool, SessionError> {
        Ok(self.resolve_container()?.is_some())
    }

    pub fn state(&mut self) -> Result<SessionState, SessionError> {
        if self.runtime.images(&self.tag)?.is_empty() {
            return Ok(SessionState::NoImage);
        }
        if self.runtime.containers(&self.tag)?.is_empty() {
            return Ok(SessionState::ImageBuilt);
        }
        if self.resolve_container()?.is_none() {
            return Ok(SessionState::Stopped);
        }
        let spliced =
            !self.backend.list_routes().is_empty() || !self.backend.list_domains().is_empty();
        Ok(if spliced {
            SessionState::Spliced
        } else {
            SessionState::Running
        })
    }

    pub fn info(&mut self) -> Result<InfoReport, SessionError> {
        let mut report = InfoReport {
            images: self.runtime.images(&self.tag)?,
            ..InfoReport::default()
        };
        let container = self.resolve_container()?;
        let (Some(container), Some(ip)) = (container, self.ip) else {
            return Ok(report);
        };
        report.container = Some(ContainerInfo {
            image: container.image,
            state: container.state,
            id: container.id,
        });
        report.ip = Some(ip);
        report.routes = self.backend.list_routes();
        report.domains = self.backend.list_domains();
        Ok(report)
    }

    /// Interactive shell in the running container
    pub fn shell(&mut self) -> Result<i32, SessionError> {
        let Some(container) = self.resolve_container()? else {
            return Err(SessionError::NotRunning(self.tag.clone()));
        };
        Ok(self.runtime.shell(&container.id)?)
    }

    pub fn health(&mut self) -> Result<i32, SessionError> {
        self.container_hook("health")
    }

    pub fn refresh(&mut self) -> Result<i32, SessionError> {
        self.container_hook("refresh")
    }

    /// Run `hook` in the running container; 127 when nothing runs.
    fn container_hook(&mut self, hook: &str) -> Result<i32, SessionError> {
        if !self.settings.hooks.contains_key(hook) {
            return Err(SessionError::HookNotFound(hook.to_string()));
        }
        let Some(container) = self.resolve_container()? else {
            warn!("{} is not running", self.tag);
            return Ok(HOOK_NOT_FOUND);
        };
        self.exec_hook(&container.id, hook)
    }

    /// Run `hook` if configured; a non-zero exit is only logged.
    fn run_optional_hook(&mut self, container: &ContainerSummary, hook: &str) -> Result<(), SessionError> {
        if !self.settings.hooks.contains_key(hook) {
            debug!("No {} hook", hook);
            return Ok(());
        }
        let code = self.exec_hook(&container.id, hook)?;
        if code != 0 {
            warn!("{} hook exited with {}", hook, code);
        }
        Ok(())
    }

    fn exec_hook(&mut self, id: &str, hook: &str) -> Result<i32, SessionError> {
        let path = format!("/{}/{}", HOOK_DIR, hook);
        Ok(self.runtime.exec(id, &[path])?.unwrap_or(1))
    }
}

/// Lay out the image build context: configured build files at the root,
/// hooks and the exec helper under `vpnp/`. Every file gets the epoch as
/// its mtime so unchanged content hits the build cache.
pub(crate) fn write_build_context(dir: &Path, settings: &SessionSettings) -> std::io::Result<()> {
    let hook_dir = dir.join(HOOK_DIR);
    std::fs::create_dir_all(&hook_dir)?;

    let hooks = settings
        .hooks
        .iter()
        .map(|(name, content)| (name.as_str(), content.as_str()))
        .filter(|(name, _)| *name != "exec")
        .chain(std::iter::once(("exec", EXEC_HELPER)));
    for (name, content) in hooks {
        let path = hook_dir.join(name);
        write_pinned(&path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        }
    }

    for (name, content) in &settings.build_files {
        write_pinned(&dir.join(name), content)?;
    }
    Ok(())
}

fn write_pinned(path: &Path, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)?;
    let file = File::options().write(true).open(path)?;
    file.set_modified(SystemTime::UNIX_EPOCH)
}
