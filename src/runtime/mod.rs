//! Container runtime client
//!
//! The session only needs a handful of runtime verbs, collected in
//! [`ContainerRuntime`]. [`docker::DockerCli`] implements them on top of the
//! `docker` command line.

pub mod docker;

use crate::expect::{ExpectError, Interactive};
use crate::ip::Ipv4Address;
use std::path::Path;
use thiserror::Error;

/// Line printed by the in-container exec helper after the hook exits
pub const EXIT_MARKER: &str = "/vpnp/exec:EXITCODE=";

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("{command} failed ({status:?}): {output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },
    #[error("Image build failed with exit code {0:?}")]
    BuildFailed(Option<i32>),
    #[error("Unexpected runtime output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Interactive(#[from] ExpectError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub repo_tag: String,
    pub id: String,
    pub size: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    pub state: String,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    pub state: String,
    pub ip: Option<Ipv4Address>,
}

/// What the launch of the login container needs
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub image: String,
    pub run_options: Vec<String>,
    pub env: Vec<(String, String)>,
    pub command: Vec<String>,
}

pub trait ContainerRuntime {
    /// Build `context` into an image named `tag`, streaming build output.
    fn build(&mut self, context: &Path, tag: &str) -> Result<(), RuntimeError>;

    /// Images whose repository is `tag`
    fn images(&mut self, tag: &str) -> Result<Vec<ImageSummary>, RuntimeError>;

    /// All containers, running or not, created from `image`
    fn containers(&mut self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError>;

    fn inspect(&mut self, id: &str) -> Result<Option<ContainerDetails>, RuntimeError>;

    /// Run `argv` in a running container through the exec helper and return
    /// the exit code it reports.
    fn exec(&mut self, id: &str, argv: &[String]) -> Result<Option<i32>, RuntimeError>;

    fn stop(&mut self, id: &str) -> Result<(), RuntimeError>;

    fn remove_container(&mut self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove an image by id.
    fn remove_image(&mut self, id: &str) -> Result<(), RuntimeError>;

    /// Start the login container attached to a pty.
    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn Interactive>, RuntimeError>;

    /// Interactive shell in a running container; returns its exit code.
    fn shell(&mut self, id: &str) -> Result<i32, RuntimeError>;
}

/// First 12 hex digits of an image or container id
pub fn short_id(id: &str) -> &str {
    let id = id.strip_prefix("sha256:").unwrap_or(id);
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

/// Exit code carried by an exec helper line, if it is one
pub fn parse_exit_marker(line: &str) -> Option<i32> {
    line.trim_end()
        .strip_prefix(EXIT_MARKER)
        .and_then(|code| code.trim().parse().ok())
}
