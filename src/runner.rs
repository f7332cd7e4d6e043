use crate::error::ExecutionError;
use crate::session::CLIENT_USER_ENV;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    fn from_status(status: ExitStatus, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        let status_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Self {
            status_code,
            stdout,
            stderr,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub stdin: Option<PathBuf>,
    pub accepted_codes: Vec<i32>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env_overrides: BTreeMap<String, String>) -> Self {
        self.env_overrides = env_overrides;
        self
    }

    pub fn stdin_file(mut self, path: &Path) -> Self {
        self.stdin = Some(path.to_path_buf());
        self
    }

    pub fn accept(mut self, codes: &[i32]) -> Self {
        self.accepted_codes.extend_from_slice(codes);
        self
    }

    pub fn accepts(&self, status_code: i32) -> bool {
        status_code == 0 || self.accepted_codes.contains(&status_code)
    }

    /// Command line for logs and errors. A stdin file shows up as
    /// `< (stdin)` and never by path, since it may hold a password.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = IDENTITY_ENV
            .iter()
            .filter_map(|key| {
                self.env_overrides
                    .get(*key)
                    .map(|value| format!("{key}={}", quote(value)))
            })
            .collect();
        parts.push(self.program.clone());
        parts.extend(self.args.iter().map(|arg| quote(arg)));
        if self.stdin.is_some() {
            parts.push("< (stdin)".to_string());
        }
        parts.join(" ")
    }
}

pub trait CommandExecutor {
    /// Runs the invocation to completion. A `timeout` of `None` blocks until
    /// the child exits; on expiry the child is killed and an
    /// `io::ErrorKind::TimedOut` error is returned.
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error>;
}

// Programs resolve in `bin_dir` when set, otherwise on PATH.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    bin_dir: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Self { bin_dir }
    }

    pub fn resolve(&self, program: &str) -> Result<PathBuf, io::Error> {
        if let Some(dir) = &self.bin_dir {
            let candidate = dir.join(program);
            if candidate.is_file() {
                return Ok(candidate);
            }
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{program} not found in {}", dir.display()),
            ));
        }
        which::which(program).map_err(|err| {
            io::Error::new(io::ErrorKind::NotFound, format!("{program}: {err}"))
        })
    }
}

impl CommandExecutor for ProcessExecutor {
    fn run(
        &self,
        invocation: &Invocation,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error> {
        let program = self.resolve(&invocation.program)?;
        let mut cmd = Command::new(program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env_overrides {
            cmd.env(key, value);
        }
        match &invocation.stdin {
            Some(path) => cmd.stdin(File::open(path)?),
            None => cmd.stdin(Stdio::null()),
        };
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let Some(timeout) = timeout else {
            let output = cmd.output()?;
            return Ok(CommandOutput::from_status(
                output.status,
                output.stdout,
                output.stderr,
            ));
        };

        let mut child = cmd.spawn()?;
        let (tx, rx) = mpsc::channel();
        spawn_reader(child.stdout.take(), Pipe::Stdout, tx.clone());
        spawn_reader(child.stderr.take(), Pipe::Stderr, tx);
        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(err) => {
                    kill_and_reap(&mut child);
                    return Err(err);
                }
            }
            if Instant::now() >= deadline {
                kill_and_reap(&mut child);
                return Err(timed_out(&invocation.program));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // A background grandchild can keep the pipes open after the child exits.
        let mut stdout = None;
        let mut stderr = None;
        while stdout.is_none() || stderr.is_none() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok((Pipe::Stdout, buf)) => stdout = Some(buf),
                Ok((Pipe::Stderr, buf)) => stderr = Some(buf),
                Err(RecvTimeoutError::Timeout) => return Err(timed_out(&invocation.program)),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(CommandOutput::from_status(
            status,
            stdout.unwrap_or_default(),
            stderr.unwrap_or_default(),
        ))
    }
}

enum Pipe {
    Stdout,
    Stderr,
}

fn spawn_reader<R: Read + Send + 'static>(
    source: Option<R>,
    pipe: Pipe,
    tx: Sender<(Pipe, Vec<u8>)>,
) {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send((pipe, buf));
    });
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn timed_out(program: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{program} timed out"))
}

#[derive(Debug, Clone)]
pub struct CommandRunner<E> {
    executor: E,
    timeout: Option<Duration>,
}

impl<E: CommandExecutor> CommandRunner<E> {
    pub fn new(executor: E, timeout: Option<Duration>) -> Self {
        Self { executor, timeout }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn execute(&self, invocation: &Invocation) -> Result<CommandOutput, ExecutionError> {
        let command = invocation.render();
        debug!(command = %command, "running icommand");
        let output = self
            .executor
            .run(invocation, self.timeout)
            .map_err(|err| match err.kind() {
                io::ErrorKind::TimedOut => ExecutionError::timed_out(
                    &command,
                    self.timeout.map(|t| t.as_secs()).unwrap_or_default(),
                ),
                _ => ExecutionError::spawn_failed(&err, &command),
            })?;
        if !invocation.accepts(output.status_code) {
            return Err(ExecutionError::exit_status(
                &command,
                output.status_code,
                &output.stderr_text(),
            ));
        }
        Ok(output)
    }
}

/// Variables that name the acting grid user; they lead the rendered command
/// so an error shows whose identity a call ran under.
const IDENTITY_ENV: [&str; 2] = ["IRODS_USER_NAME", CLIENT_USER_ENV];

fn quote(part: &str) -> String {
    if part.is_empty() {
        return "\"\"".to_string();
    }
    if part.chars().any(|c| c.is_whitespace()) {
        return format!("\"{}\"", part.replace('"', "\\\""));
    }
    part.to_string()
}
