//! `docker` command line client

use super::{
    ContainerDetails, ContainerRuntime, ContainerSummary, ImageSummary, LaunchSpec, RuntimeError,
    parse_exit_marker,
};
use crate::expect::Interactive;
use crate::expect::login::CREDENTIAL_PROMPTS;
use crate::expect::pty::{PtyProcess, SpawnOptions};
use crate::ip::Ipv4Address;
use crate::platform::shell::display_command;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use tracing::{debug, info, warn};

const DOCKER: &str = "docker";

/// Talks to the daemon through the `docker` binary. `env` points the client
/// at a remote daemon when the runtime lives in a helper VM.
#[derive(Debug, Clone, Default)]
pub struct DockerCli {
    env: Vec<(String, String)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageLine {
    #[serde(rename = "ID")]
    id: String,
    repository: String,
    tag: String,
    #[serde(default)]
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerLine {
    #[serde(rename = "ID")]
    id: String,
    image: String,
    #[serde(default)]
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    #[serde(default)]
    config: InspectConfig,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    image: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(default)]
    networks: BTreeMap<String, NetworkEndpoint>,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

impl DockerCli {
    pub fn new(env: Vec<(String, String)>) -> Self {
        Self { env }
    }

    fn command(&self, args: &[&str]) -> (Command, Vec<String>) {
        let mut argv = vec![DOCKER.to_string()];
        argv.extend(args.iter().map(|a| a.to_string()));
        let mut command = Command::new(DOCKER);
        command.args(args);
        for (key, value) in &self.env {
            command.env(key, value);
        }
        (command, argv)
    }

    /// Run to completion, capturing output.
    fn output(&self, args: &[&str]) -> Result<Output, RuntimeError> {
        let (mut command, argv) = self.command(args);
        debug!("> {}", display_command(&argv));
        command.stdin(Stdio::null()).output().map_err(|source| RuntimeError::Spawn {
            command: display_command(&argv),
            source,
        })
    }

    fn checked(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let mut argv = vec![DOCKER.to_string()];
            argv.extend(args.iter().map(|a| a.to_string()));
            Err(RuntimeError::CommandFailed {
                command: display_command(&argv),
                status: output.status.code(),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

pub(crate) fn parse_images(output: &str, tag: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
    let mut images = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let image: ImageLine = serde_json::from_str(line)?;
        if image.repository == tag {
            images.push(ImageSummary {
                repo_tag: format!("{}:{}", image.repository, image.tag),
                id: image.id,
                size: image.size,
            });
        }
    }
    Ok(images)
}

pub(crate) fn parse_containers(
    output: &str,
    image: &str,
) -> Result<Vec<ContainerSummary>, RuntimeError> {
    let mut containers = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let container: ContainerLine = serde_json::from_str(line)?;
        let matches = container.image == image
            || container.image.strip_suffix(":latest") == Some(image);
        if matches {
            containers.push(ContainerSummary {
                id: container.id,
                image: container.image,
                state: container.state,
            });
        }
    }
    Ok(containers)
}

pub(crate) fn parse_inspect(output: &str) -> Result<Option<ContainerDetails>, RuntimeError> {
    let docs: Vec<InspectDoc> = serde_json::from_str(output)?;
    let Some(doc) = docs.into_iter().next() else {
        return Ok(None);
    };
    let settings = &doc.network_settings;
    let address = std::iter::once(settings.ip_address.as_str())
        .chain(settings.networks.values().map(|n| n.ip_address.as_str()))
        .find(|ip| !ip.is_empty());
    let ip = match address {
        Some(text) => match text.parse::<Ipv4Address>() {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("Ignoring container address {}: {}", text, e);
                None
            }
        },
        None => None,
    };
    Ok(Some(ContainerDetails {
        id: doc.id,
        image: doc.config.image,
        state: doc.state.status,
        ip,
    }))
}

impl ContainerRuntime for DockerCli {
    fn build(&mut self, context: &Path, tag: &str) -> Result<(), RuntimeError> {
        let dir = context.to_string_lossy().into_owned();
        let (mut command, argv) = self.command(&["build", "-t", tag, dir.as_str()]);
        info!("> {}", display_command(&argv));
        let status = command
            .stdin(Stdio::null())
            .status()
            .map_err(|source| RuntimeError::Spawn {
                command: display_command(&argv),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::BuildFailed(status.code()))
        }
    }

    fn images(&mut self, tag: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
        let output = self.checked(&["images", "--no-trunc", "--format", "{{json .}}"])?;
        parse_images(&output, tag)
    }

    fn containers(&mut self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let output = self.checked(&["ps", "-a", "--no-trunc", "--format", "{{json .}}"])?;
        parse_containers(&output, image)
    }

    fn inspect(&mut self, id: &str) -> Result<Option<ContainerDetails>, RuntimeError> {
        match self.checked(&["container", "inspect", id]) {
            Ok(output) => parse_inspect(&output),
            // Gone between listing and inspection
            Err(RuntimeError::CommandFailed { output, .. }) if output.contains("No such") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn exec(&mut self, id: &str, argv: &[String]) -> Result<Option<i32>, RuntimeError> {
        let mut args = vec!["exec", id, "/vpnp/exec"];
        args.extend(argv.iter().map(String::as_str));
        let (mut command, full) = self.command(&args);
        info!("> {}", display_command(&full));

        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: display_command(&full),
                source,
            })?;

        let mut reported = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line?;
                match parse_exit_marker(&line) {
                    Some(code) => reported = Some(code),
                    None => println!("{}", line),
                }
            }
        }
        let status = child.wait()?;
        Ok(reported.or(status.code()))
    }

    fn stop(&mut self, id: &str) -> Result<(), RuntimeError> {
        info!("Stopping container {}", super::short_id(id));
        self.checked(&["stop", id]).map(|_| ())
    }

    fn remove_container(&mut self, id: &str) -> Result<(), RuntimeError> {
        info!("Removing container {}", super::short_id(id));
        self.checked(&["rm", id]).map(|_| ())
    }

    fn remove_image(&mut self, id: &str) -> Result<(), RuntimeError> {
        info!("Removing image {}", super::short_id(id));
        self.checked(&["rmi", "-f", id]).map(|_| ())
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn Interactive>, RuntimeError> {
        let mut argv = vec![
            DOCKER.to_string(),
            "run".into(),
            "-it".into(),
            "--rm".into(),
            "--privileged".into(),
        ];
        argv.extend(spec.run_options.iter().cloned());
        for (key, value) in &spec.env {
            argv.push("-e".into());
            argv.push(format!("{}={}", key, value));
        }
        argv.push(spec.image.clone());
        argv.extend(spec.command.iter().cloned());

        info!("> {}", display_command(&argv));
        let options = SpawnOptions {
            env: self.env.clone(),
            echo: true,
            prompts: CREDENTIAL_PROMPTS.iter().map(|p| p.to_string()).collect(),
        };
        Ok(Box::new(PtyProcess::spawn(&argv, options)?))
    }

    fn shell(&mut self, id: &str) -> Result<i32, RuntimeError> {
        let (mut command, argv) = self.command(&["exec", "-it", id, "/bin/bash"]);
        info!("> {}", display_command(&argv));
        let status = command.status().map_err(|source| RuntimeError::Spawn {
            command: display_command(&argv),
            source,
        })?;
        Ok(status.code().unwrap_or(1))
    }
}
