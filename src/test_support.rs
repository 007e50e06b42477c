//! Fakes shared by the unit tests

use crate::credentials::{CredentialError, CredentialSource};
use crate::expect::{CancelToken, ExpectError, ExpectEvent, Interactive, find_marker};
use crate::ip::{Ipv4Address, Ipv4Subnet};
use crate::platform::shell::{CommandOutput, HostShell, display_command};
use crate::platform::{NetworkBackend, PlatformError};
use crate::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSummary, ImageSummary, LaunchSpec, RuntimeError,
};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;
use std::time::Duration;

/// Child that replays canned output chunks.
///
/// Each `expect` consumes chunks until a marker shows up. When the script
/// runs out it reports end-of-stream, or a timeout if so configured.
pub struct ScriptedProcess {
    chunks: VecDeque<String>,
    buffer: String,
    exit_code: Option<i32>,
    timeout_at_end: bool,
    transcript: Vec<String>,
    pub sent: Vec<String>,
    pub interrupts: usize,
    pub waits: usize,
}

impl ScriptedProcess {
    pub fn new(chunks: Vec<&str>) -> Self {
        Self::from_chunks(chunks.into_iter().map(str::to_string).collect())
    }

    pub fn from_chunks(chunks: Vec<String>) -> Self {
        Self {
            chunks: chunks.into(),
            buffer: String::new(),
            exit_code: Some(0),
            timeout_at_end: false,
            transcript: Vec::new(),
            sent: Vec::new(),
            interrupts: 0,
            waits: 0,
        }
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn timeout_at_end(mut self) -> Self {
        self.timeout_at_end = true;
        self
    }
}

impl Interactive for ScriptedProcess {
    fn expect(
        &mut self,
        markers: &[&str],
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExpectEvent, ExpectError> {
        loop {
            cancel.check()?;
            if let Some((index, end)) = find_marker(&self.buffer, markers) {
                let consumed: String = self.buffer.drain(..end).collect();
                self.transcript.extend(
                    consumed
                        .lines()
                        .map(|l| l.trim_end_matches('\r').to_string())
                        .filter(|l| !l.is_empty()),
                );
                return Ok(ExpectEvent::Matched(index));
            }
            match self.chunks.pop_front() {
                Some(chunk) => self.buffer.push_str(&chunk),
                None if self.timeout_at_end => return Ok(ExpectEvent::Timeout),
                None => return Ok(ExpectEvent::Eof),
            }
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), ExpectError> {
        self.sent.push(line.to_string());
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), ExpectError> {
        self.interrupts += 1;
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<i32>, ExpectError> {
        self.waits += 1;
        Ok(self.exit_code)
    }

    fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

/// Fixed username and a queue of passwords, one per request
pub struct FixedCredentials {
    username: String,
    passwords: RefCell<VecDeque<String>>,
    requests: Cell<usize>,
}

impl FixedCredentials {
    pub fn new(username: &str, passwords: &[&str]) -> Self {
        Self {
            username: username.to_string(),
            passwords: RefCell::new(passwords.iter().map(|p| p.to_string()).collect()),
            requests: Cell::new(0),
        }
    }

    pub fn password_requests(&self) -> usize {
        self.requests.get()
    }
}

impl CredentialSource for FixedCredentials {
    fn username(&self) -> Result<String, CredentialError> {
        Ok(self.username.clone())
    }

    fn password(&self) -> Result<String, CredentialError> {
        self.requests.set(self.requests.get() + 1);
        self.passwords
            .borrow_mut()
            .pop_front()
            .ok_or(CredentialError::Exhausted)
    }
}

fn failed(command: String) -> PlatformError {
    PlatformError::CommandFailed {
        command,
        status: Some(2),
        output: String::new(),
    }
}

#[derive(Default)]
struct BackendState {
    ip: Option<Ipv4Address>,
    routes: BTreeMap<Ipv4Subnet, Ipv4Address>,
    domains: BTreeSet<String>,
    route_delete_attempts: Vec<Ipv4Subnet>,
    failing_deletes: BTreeSet<Ipv4Subnet>,
    connects: usize,
    disconnects: usize,
}

/// In-memory routing table and resolver. Clones share state, so a test can
/// keep a handle on a backend it gave away.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Rc<RefCell<BackendState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A route left behind by some earlier container
    pub fn seed_route(&self, subnet: &str, via: &str) {
        let subnet = subnet.parse().unwrap();
        let via = via.parse().unwrap();
        self.state.borrow_mut().routes.insert(subnet, via);
    }

    pub fn seed_domain(&self, domain: &str) {
        self.state.borrow_mut().domains.insert(domain.to_string());
    }

    pub fn fail_deletes_of(&self, subnet: Ipv4Subnet) {
        self.state.borrow_mut().failing_deletes.insert(subnet);
    }

    pub fn route_delete_attempts(&self) -> Vec<Ipv4Subnet> {
        self.state.borrow().route_delete_attempts.clone()
    }

    /// Every route in the table, whatever its next hop
    pub fn all_routes(&self) -> Vec<Ipv4Subnet> {
        self.state.borrow().routes.keys().copied().collect()
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.borrow().disconnects
    }
}

impl NetworkBackend for MemoryBackend {
    fn set_container_ip(&mut self, ip: Option<Ipv4Address>) {
        self.state.borrow_mut().ip = ip;
    }

    fn container_ip(&self) -> Option<Ipv4Address> {
        self.state.borrow().ip
    }

    fn on_connect(&mut self) -> Result<(), PlatformError> {
        self.state.borrow_mut().connects += 1;
        Ok(())
    }

    fn on_disconnect(&mut self) -> Result<(), PlatformError> {
        self.state.borrow_mut().disconnects += 1;
        Ok(())
    }

    fn add_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        let ip = state.ip.ok_or(PlatformError::NoContainerIp)?;
        if state.routes.contains_key(subnet) {
            return Err(failed(format!("ip route add {}", subnet)));
        }
        state.routes.insert(*subnet, ip);
        Ok(())
    }

    fn del_route(&mut self, subnet: &Ipv4Subnet) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        state.route_delete_attempts.push(*subnet);
        if state.failing_deletes.contains(subnet) || state.routes.remove(subnet).is_none() {
            return Err(failed(format!("ip route del {}", subnet)));
        }
        Ok(())
    }

    fn list_routes(&mut self) -> Vec<Ipv4Subnet> {
        let state = self.state.borrow();
        match state.ip {
            Some(ip) => state
                .routes
                .iter()
                .filter(|(_, via)| **via == ip)
                .map(|(subnet, _)| *subnet)
                .collect(),
            None => Vec::new(),
        }
    }

    fn add_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        let mut state = self.state.borrow_mut();
        state.ip.ok_or(PlatformError::NoContainerIp)?;
        state.domains.insert(domain.to_string());
        Ok(())
    }

    fn del_domain(&mut self, domain: &str) -> Result<(), PlatformError> {
        if self.state.borrow_mut().domains.remove(domain) {
            Ok(())
        } else {
            Err(failed(format!("rm {}", domain)))
        }
    }

    fn list_domains(&mut self) -> Vec<String> {
        self.state.borrow().domains.iter().cloned().collect()
    }
}

#[derive(Default)]
struct RuntimeState {
    images: Vec<ImageSummary>,
    containers: Vec<(ContainerSummary, Option<Ipv4Address>)>,
    built_files: Vec<(PathBuf, bool)>,
    fail_build: bool,
    unreachable: bool,
    login_script: Vec<String>,
    login_exit: i32,
    login_ip: Option<Ipv4Address>,
    launches: Vec<LaunchSpec>,
    execs: Vec<(String, Vec<String>)>,
    exec_code: i32,
    stopped: Vec<String>,
    removed_images: Vec<String>,
    next_id: usize,
}

/// In-memory container runtime. Clones share state.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    state: Rc<RefCell<RuntimeState>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, tag: &str) {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = format!("sha256:{:064x}", state.next_id);
        state.images.push(ImageSummary {
            repo_tag: format!("{}:latest", tag),
            id,
            size: "182MB".to_string(),
        });
    }

    pub fn add_container(&self, image: &str, state_name: &str, ip: Option<&str>) -> String {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = format!("{:064x}", state.next_id);
        state.containers.push((
            ContainerSummary {
                id: id.clone(),
                image: image.to_string(),
                state: state_name.to_string(),
            },
            ip.map(|ip| ip.parse().unwrap()),
        ));
        id
    }

    /// What the login container prints, and the address it gets if the
    /// script reaches `Established`
    pub fn login_script(&self, chunks: &[&str], exit_code: i32, ip: Option<&str>) {
        let mut state = self.state.borrow_mut();
        state.login_script = chunks.iter().map(|c| c.to_string()).collect();
        state.login_exit = exit_code;
        state.login_ip = ip.map(|ip| ip.parse().unwrap());
    }

    pub fn fail_build(&self) {
        self.state.borrow_mut().fail_build = true;
    }

    /// Make container listings fail as with a stopped daemon
    pub fn make_unreachable(&self) {
        self.state.borrow_mut().unreachable = true;
    }

    pub fn set_exec_code(&self, code: i32) {
        self.state.borrow_mut().exec_code = code;
    }

    pub fn image_count(&self) -> usize {
        self.state.borrow().images.len()
    }

    pub fn container_states(&self) -> Vec<String> {
        self.state
            .borrow()
            .containers
            .iter()
            .map(|(c, _)| c.state.clone())
            .collect()
    }

    /// Relative paths of the last build context, with their executable bit
    pub fn built_files(&self) -> Vec<(PathBuf, bool)> {
        self.state.borrow().built_files.clone()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.borrow().launches.clone()
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.borrow().execs.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.borrow().stopped.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.borrow().removed_images.clone()
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, bool)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else {
            let meta = std::fs::metadata(&path)?;
            assert_eq!(meta.modified()?, std::time::SystemTime::UNIX_EPOCH);
            #[cfg(unix)]
            let executable = {
                use std::os::unix::fs::PermissionsExt;
                meta.permissions().mode() & 0o111 != 0
            };
            #[cfg(not(unix))]
            let executable = false;
            let relative = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push((relative, executable));
        }
    }
    Ok(())
}

impl ContainerRuntime for FakeRuntime {
    fn build(&mut self, context: &Path, tag: &str) -> Result<(), RuntimeError> {
        let mut files = Vec::new();
        walk(context, context, &mut files)?;
        files.sort();
        self.state.borrow_mut().built_files = files;
        if self.state.borrow().fail_build {
            return Err(RuntimeError::BuildFailed(Some(1)));
        }
        if self.images(tag)?.is_empty() {
            self.add_image(tag);
        }
        Ok(())
    }

    fn images(&mut self, tag: &str) -> Result<Vec<ImageSummary>, RuntimeError> {
        let prefix = format!("{}:", tag);
        Ok(self
            .state
            .borrow()
            .images
            .iter()
            .filter(|i| i.repo_tag.starts_with(&prefix))
            .cloned()
            .collect())
    }

    fn containers(&mut self, image: &str) -> Result<Vec<ContainerSummary>, RuntimeError> {
        if self.state.borrow().unreachable {
            return Err(RuntimeError::CommandFailed {
                command: "docker ps".to_string(),
                status: Some(1),
                output: "Cannot connect to the Docker daemon".to_string(),
            });
        }
        Ok(self
            .state
            .borrow()
            .containers
            .iter()
            .filter(|(c, _)| c.image == image)
            .map(|(c, _)| c.clone())
            .collect())
    }

    fn inspect(&mut self, id: &str) -> Result<Option<ContainerDetails>, RuntimeError> {
        Ok(self
            .state
            .borrow()
            .containers
            .iter()
            .find(|(c, _)| c.id == id)
            .map(|(c, ip)| ContainerDetails {
                id: c.id.clone(),
                image: c.image.clone(),
                state: c.state.clone(),
                ip: *ip,
            }))
    }

    fn exec(&mut self, id: &str, argv: &[String]) -> Result<Option<i32>, RuntimeError> {
        let mut state = self.state.borrow_mut();
        state.execs.push((id.to_string(), argv.to_vec()));
        Ok(Some(state.exec_code))
    }

    fn stop(&mut self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.borrow_mut();
        state.stopped.push(id.to_string());
        for (container, _) in state.containers.iter_mut().filter(|(c, _)| c.id == id) {
            container.state = "exited".to_string();
        }
        Ok(())
    }

    fn remove_container(&mut self, id: &str) -> Result<(), RuntimeError> {
        self.state.borrow_mut().containers.retain(|(c, _)| c.id != id);
        Ok(())
    }

    fn remove_image(&mut self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.borrow_mut();
        state.removed_images.push(id.to_string());
        state.images.retain(|i| i.id != id);
        Ok(())
    }

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Box<dyn Interactive>, RuntimeError> {
        let (script, exit, ip) = {
            let mut state = self.state.borrow_mut();
            state.launches.push(spec.clone());
            (state.login_script.clone(), state.login_exit, state.login_ip)
        };
        if script.iter().any(|chunk| chunk.contains("Established")) {
            self.add_container(&spec.image, "running", ip.map(|ip| ip.to_string()).as_deref());
        }
        Ok(Box::new(ScriptedProcess::from_chunks(script).exit_code(exit)))
    }

    fn shell(&mut self, _id: &str) -> Result<i32, RuntimeError> {
        Ok(0)
    }
}

#[derive(Default)]
struct ShellState {
    commands: Vec<String>,
    canned: Vec<(String, CommandOutput)>,
    routes: BTreeMap<Ipv4Subnet, String>,
    host_routes: BTreeMap<String, Option<String>>,
}

/// Host shell that simulates `ip route` and `route` tables in memory and
/// runs file commands for real, with `sudo` stripped. Commands reached
/// through `docker-machine ssh` hit the same simulated `ip route` table.
#[derive(Clone, Default)]
pub struct SimulatedShell {
    state: Rc<RefCell<ShellState>>,
}

impl SimulatedShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands starting with `prefix` with `output`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.state
            .borrow_mut()
            .canned
            .push((prefix.to_string(), output));
    }

    pub fn seed_route(&self, subnet: &str, via: &str) {
        self.state
            .borrow_mut()
            .routes
            .insert(subnet.parse().unwrap(), via.to_string());
    }

    pub fn route_count(&self) -> usize {
        self.state.borrow().routes.len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    fn ip_route(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let ok = |lines: Vec<String>| CommandOutput {
            status: Some(0),
            lines,
        };
        let err = |msg: &str| CommandOutput {
            status: Some(2),
            lines: vec![msg.to_string()],
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["add", subnet, "via", via] => {
                let subnet: Ipv4Subnet = subnet.parse().unwrap();
                if state.routes.contains_key(&subnet) {
                    err("RTNETLINK answers: File exists")
                } else {
                    state.routes.insert(subnet, via.to_string());
                    ok(Vec::new())
                }
            }
            ["del", subnet] => {
                let subnet: Ipv4Subnet = subnet.parse().unwrap();
                match state.routes.remove(&subnet) {
                    Some(_) => ok(Vec::new()),
                    None => err("RTNETLINK answers: No such process"),
                }
            }
            ["show", "via", via] => ok(state
                .routes
                .iter()
                .filter(|(_, v)| v.as_str() == *via)
                .map(|(subnet, _)| {
                    if subnet.prefix() == 32 {
                        format!("{} proto static", subnet.network())
                    } else {
                        format!("{} proto static", subnet)
                    }
                })
                .collect()),
            _ => err("unsupported ip route"),
        }
    }

    fn host_route(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let status = match args {
            [op, dest, rest @ ..] if op == "add" => {
                state.host_routes.insert(dest.clone(), rest.first().cloned());
                0
            }
            [op, dest, ..] if op == "delete" => {
                if state.host_routes.remove(dest).is_some() { 0 } else { 1 }
            }
            _ => 1,
        };
        CommandOutput {
            status: Some(status),
            lines: Vec::new(),
        }
    }

    fn dispatch(&self, args: &[String]) -> Result<CommandOutput, PlatformError> {
        match args {
            [sudo, rest @ ..] if sudo == "sudo" => self.dispatch(rest),
            [dm, ssh, _machine, rest @ ..] if dm == "docker-machine" && ssh == "ssh" => {
                self.dispatch(rest)
            }
            [ip, route, rest @ ..] if ip == "ip" && route == "route" => Ok(self.ip_route(rest)),
            [route, n, rest @ ..] if route == "route" && n == "-n" => Ok(self.host_route(rest)),
            [program, rest @ ..] if program == "cp" || program == "rm" || program == "grep" => {
                let output = Command::new(program).args(rest).output()?;
                let lines = String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .chain(String::from_utf8_lossy(&output.stderr).lines())
                    .map(str::to_string)
                    .collect();
                Ok(CommandOutput {
                    status: output.status.code(),
                    lines,
                })
            }
            _ => Ok(CommandOutput {
                status: Some(0),
                lines: Vec::new(),
            }),
        }
    }
}

impl HostShell for SimulatedShell {
    fn run(&mut self, argv: &[String]) -> Result<CommandOutput, PlatformError> {
        let display = display_command(argv);
        self.state.borrow_mut().commands.push(display.clone());
        let canned = self
            .state
            .borrow()
            .canned
            .iter()
            .find(|(prefix, _)| display.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone());
        match canned {
            Some(output) => Ok(output),
            None => self.dispatch(argv),
        }
    }
}
