//! Child processes attached to a pseudo-terminal

use super::{
    CancelToken, Disposition, ExpectError, ExpectEvent, Interactive, TranscriptFilter, find_marker,
};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{OpenptyResult, openpty};
use nix::unistd::setsid;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Longest single blocking poll, so cancellation is noticed promptly
const POLL_SLICE: Duration = Duration::from_millis(250);
/// How long an interrupted child gets to exit before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(10);
/// Unmatched output kept for marker search
const MAX_BUFFER: usize = 64 * 1024;

const CTRL_C: u8 = 0x03;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub env: Vec<(String, String)>,
    /// Print passed-through output lines for the operator
    pub echo: bool,
    /// Prompts whose following line is never retained or shown
    pub prompts: Vec<String>,
}

pub struct PtyProcess {
    command: String,
    master: File,
    child: Child,
    exit: Option<ExitStatus>,
    buffer: String,
    line: String,
    filter: TranscriptFilter,
    transcript: Vec<String>,
    echo: bool,
    eof: bool,
}

impl PtyProcess {
    pub fn spawn(argv: &[String], options: SpawnOptions) -> Result<Self, ExpectError> {
        let (program, args) = argv.split_first().ok_or(ExpectError::EmptyCommand)?;
        let rendered = argv.join(" ");

        let OpenptyResult { master, slave } = openpty(None, None).map_err(io::Error::from)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        // SAFETY: pre_exec runs after fork, before exec; only async-signal-safe
        // calls are made.
        unsafe {
            command.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|source| ExpectError::Spawn {
            command: rendered.clone(),
            source,
        })?;
        // Release our copies of the slave so EOF reaches the master
        drop(command);
        debug!("Spawned pid {} on pty: {}", child.id(), rendered);

        Ok(Self {
            command: rendered,
            master: File::from(master),
            child,
            exit: None,
            buffer: String::new(),
            line: String::new(),
            filter: TranscriptFilter::new(options.prompts),
            transcript: Vec::new(),
            echo: options.echo,
            eof: false,
        })
    }

    /// Read whatever arrives within `wait`. Returns false on a quiet wait.
    fn fill(&mut self, wait: Duration) -> Result<bool, ExpectError> {
        if self.eof {
            return Ok(false);
        }
        let millis = wait.as_millis().min(u128::from(u16::MAX)) as u16;
        let ready = {
            let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(n) => n > 0,
                Err(Errno::EINTR) => false,
                Err(e) => return Err(io::Error::from(e).into()),
            }
        };
        if !ready {
            return Ok(false);
        }

        let mut chunk = [0u8; 4096];
        let n = match self.master.read(&mut chunk) {
            Ok(n) => n,
            // Linux reports a hung-up pty as EIO rather than a zero read
            Err(e) if e.raw_os_error() == Some(libc::EIO) => 0,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            self.eof = true;
            if !self.line.is_empty() {
                let rest = std::mem::take(&mut self.line);
                self.emit(&rest);
            }
            return Ok(false);
        }

        let text = String::from_utf8_lossy(&chunk[..n]);
        self.buffer.push_str(&text);
        self.line.push_str(&text);
        while let Some(pos) = self.line.find('\n') {
            let line: String = self.line.drain(..=pos).collect();
            self.emit(line.trim_end_matches(['\r', '\n']));
        }
        self.trim_buffer();
        Ok(true)
    }

    fn emit(&mut self, line: &str) {
        match self.filter.feed(line) {
            Disposition::Keep => {
                if self.echo {
                    println!("{}", line);
                }
                self.transcript.push(line.to_string());
            }
            Disposition::ShowOnly => {
                if self.echo {
                    println!("{}", line);
                }
            }
            Disposition::Drop => {}
        }
    }

    /// Prompts rarely end in a newline; flush the partial line once its
    /// marker has matched so the filter sees the prompt before the echo.
    fn flush_prompt(&mut self, marker: &str) {
        if self.line.contains(marker) {
            let line = std::mem::take(&mut self.line);
            self.emit(line.trim_end_matches(['\r', '\n']));
        }
    }

    fn trim_buffer(&mut self) {
        if self.buffer.len() <= MAX_BUFFER {
            return;
        }
        let mut cut = self.buffer.len() - MAX_BUFFER / 2;
        while !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }

    fn record(&mut self, status: ExitStatus) -> Option<i32> {
        self.exit = Some(status);
        exit_code(status)
    }
}

fn exit_code(status: ExitStatus) -> Option<i32> {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
}

impl Interactive for PtyProcess {
    fn expect(
        &mut self,
        markers: &[&str],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ExpectEvent, ExpectError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((index, end)) = find_marker(&self.buffer, markers) {
                self.buffer.drain(..end);
                self.flush_prompt(markers[index]);
                return Ok(ExpectEvent::Matched(index));
            }
            if self.eof {
                self.buffer.clear();
                return Ok(ExpectEvent::Eof);
            }
            cancel.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(ExpectEvent::Timeout);
            }
            self.fill((deadline - now).min(POLL_SLICE))?;
        }
    }

    fn send_line(&mut self, line: &str) -> Result<(), ExpectError> {
        self.master.write_all(line.as_bytes())?;
        self.master.write_all(b"\n")?;
        self.master.flush()?;
        Ok(())
    }

    fn interrupt(&mut self) -> Result<(), ExpectError> {
        if self.exit.is_some() {
            return Ok(());
        }
        debug!("Interrupting: {}", self.command);
        if let Err(e) = self.master.write_all(&[CTRL_C]) {
            // The terminal is gone; signal the child directly instead
            debug!("Ctrl-C via pty failed ({}), sending SIGINT", e);
            let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);
            nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT)
                .map_err(io::Error::from)?;
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Option<i32>, ExpectError> {
        if let Some(status) = self.exit {
            return Ok(exit_code(status));
        }
        // Keep draining output so a chatty child cannot block on a full pty
        let deadline = Instant::now() + EXIT_GRACE;
        while !self.eof && Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                return Ok(self.record(status));
            }
            self.fill(POLL_SLICE)?;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.child.wait_timeout(remaining)? {
            Some(status) => Ok(self.record(status)),
            None => {
                warn!("{} did not exit after interrupt, killing it", self.command);
                self.child.kill()?;
                let status = self.child.wait()?;
                Ok(self.record(status))
            }
        }
    }

    fn transcript(&self) -> &[String] {
        &self.transcript
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // A still-running child is left detached; closing the master hangs
        // up its terminal. Reap it if it has already gone.
        if self.exit.is_none() {
            let _ = self.child.try_wait();
        }
    }
}
