use crate::auth::{AuthenticationManager, SessionState};
use crate::config::{AuthScheme, GridSettings};
use crate::error::GridError;
use crate::runner::{CommandExecutor, CommandOutput, CommandRunner, Invocation, ProcessExecutor};
use crate::session::SessionEnvironment;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Exit status `ils` uses for a path that does not exist.
pub const NOT_FOUND_STATUS: i32 = 4;

const LISTING_TIME_FORMAT: &str = "%Y-%m-%d.%H:%M";

// Detailed listing: owner, replica number, resource, size, mtime, status, name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaRecord {
    pub fields: Vec<String>,
}

impl ReplicaRecord {
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();
        if fields.is_empty() {
            return None;
        }
        Some(Self { fields })
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn owner(&self) -> Option<&str> {
        self.field(0)
    }

    pub fn replica_number(&self) -> Option<u32> {
        self.field(1).and_then(|value| value.parse().ok())
    }

    pub fn resource(&self) -> Option<&str> {
        self.field(2)
    }

    pub fn size(&self) -> Option<u64> {
        self.field(3).and_then(|value| value.parse().ok())
    }

    pub fn modified(&self) -> Option<NaiveDateTime> {
        self.field(4)
            .and_then(|value| NaiveDateTime::parse_from_str(value, LISTING_TIME_FORMAT).ok())
    }

    pub fn name(&self) -> Option<&str> {
        self.fields.last().map(String::as_str)
    }
}

pub fn parse_listing(stdout: &str) -> Vec<ReplicaRecord> {
    stdout.lines().filter_map(ReplicaRecord::parse).collect()
}

/// Collects `attribute:`/`value:` pairs from `imeta ls` output.
pub fn parse_metadata(stdout: &str) -> BTreeMap<String, String> {
    let mut metas = BTreeMap::new();
    let mut pending: Option<String> = None;
    for line in stdout.lines() {
        let line = line.trim();
        if let Some(attribute) = line.strip_prefix("attribute:") {
            pending = Some(attribute.trim().to_string());
        } else if let Some(value) = line.strip_prefix("value:") {
            if let Some(attribute) = pending.take() {
                metas.insert(attribute, value.trim().to_string());
            }
        }
    }
    metas
}

pub struct GridClient<E = ProcessExecutor> {
    runner: CommandRunner<E>,
    auth: AuthenticationManager,
}

impl GridClient<ProcessExecutor> {
    pub fn connect(settings: GridSettings) -> Result<Self, GridError> {
        let executor = ProcessExecutor::new(settings.bin_dir.clone());
        Self::with_executor(settings, executor)
    }
}

impl<E: CommandExecutor> GridClient<E> {
    pub fn with_executor(settings: GridSettings, executor: E) -> Result<Self, GridError> {
        let runner = CommandRunner::new(executor, settings.timeout);
        let mut auth = AuthenticationManager::new(settings);
        auth.establish_admin(&runner)?;
        Ok(Self { runner, auth })
    }

    pub fn runner(&self) -> &CommandRunner<E> {
        &self.runner
    }

    pub fn settings(&self) -> &GridSettings {
        self.auth.settings()
    }

    pub fn state(&self) -> &SessionState {
        self.auth.state()
    }

    pub fn session(&self) -> Option<&SessionEnvironment> {
        self.auth.current()
    }

    pub fn whoami(&self) -> Option<&str> {
        self.auth.current().map(|env| env.user.as_str())
    }

    pub fn become_user(&mut self, user: Option<&str>) -> Result<&SessionEnvironment, GridError> {
        self.auth.become_user(user)
    }

    pub fn become_user_with(
        &mut self,
        user: &str,
        scheme: AuthScheme,
    ) -> Result<&SessionEnvironment, GridError> {
        self.auth.become_user_with(user, scheme)
    }

    pub fn user_home(&self, user: &str) -> String {
        self.auth.user_home(user)
    }

    fn command(&self, program: &str) -> Invocation {
        let envs = self
            .auth
            .current()
            .map(SessionEnvironment::env_overrides)
            .unwrap_or_default();
        Invocation::new(program).envs(envs)
    }

    fn run(&self, invocation: Invocation) -> Result<CommandOutput, GridError> {
        Ok(self.runner.execute(&invocation)?)
    }

    pub fn base_dir(&self) -> Result<String, GridError> {
        let output = self.run(self.command("ipwd"))?;
        Ok(output.stdout_text().trim().to_string())
    }

    /// Lists the working collection once so that a bad login surfaces early.
    pub fn verify_connection(&self) -> Result<Vec<ReplicaRecord>, GridError> {
        self.list(None, false)
    }

    fn run_list(
        &self,
        path: Option<&str>,
        detailed: bool,
        accepted: &[i32],
    ) -> Result<CommandOutput, GridError> {
        let path = match path {
            Some(path) => path.to_string(),
            None => self.base_dir()?,
        };
        let mut invocation = self.command("ils").arg(path).accept(accepted);
        if detailed {
            invocation = invocation.arg("-l");
        }
        self.run(invocation)
    }

    pub fn list(&self, path: Option<&str>, detailed: bool) -> Result<Vec<ReplicaRecord>, GridError> {
        let output = self.run_list(path, detailed, &[])?;
        Ok(parse_listing(&output.stdout_text()))
    }

    pub fn save(&self, path: &str, destination: Option<&str>) -> Result<String, GridError> {
        let mut invocation = self.command("iput").arg(path);
        if let Some(destination) = destination {
            invocation = invocation.arg(destination);
        }
        let output = self.run(invocation)?;
        debug!(path = %path, destination = ?destination, "uploaded to grid");
        Ok(output.stdout_text())
    }

    pub fn remove(&self, path: &str, recursive: bool, force: bool) -> Result<(), GridError> {
        let mut invocation = self.command("irm");
        if force {
            invocation = invocation.arg("-f");
        }
        if recursive {
            invocation = invocation.arg("-r");
        }
        self.run(invocation.arg(path))?;
        debug!(path = %path, "removed grid object");
        Ok(())
    }

    /// `true` when the path exists, `false` for the not-found status.
    pub fn check(&self, path: &str) -> Result<bool, GridError> {
        let output = self.run_list(Some(path), false, &[NOT_FOUND_STATUS])?;
        debug!(path = %path, status = output.status_code, "checked grid path");
        Ok(output.success())
    }

    /// With `like` the pattern gets a trailing `%`. A non-zero exit from
    /// `ilocate` means no matches and yields an empty list. A missing
    /// `ilocate` binary or a timeout is still returned as an error.
    pub fn search(&self, path: &str, like: bool) -> Result<Vec<String>, GridError> {
        let pattern = if like {
            format!("{path}%")
        } else {
            path.to_string()
        };
        debug!(pattern = %pattern, "grid search");
        let output = match self.run(self.command("ilocate").arg(pattern)) {
            Ok(output) => output,
            Err(GridError::Execution(err)) if err.status.is_some() => {
                debug!(code = %err.error_code, "no data found");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };
        Ok(output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Replicates `dataobj` inside its zone. Missing resources fall back to
    /// the configured source and destination.
    pub fn replica(
        &self,
        dataobj: &str,
        replicas_num: u32,
        source_resource: Option<&str>,
        dest_resource: Option<&str>,
    ) -> Result<String, GridError> {
        let resources = &self.settings().resources;
        let source = source_resource.unwrap_or(&resources.source);
        let dest = dest_resource.unwrap_or(&resources.destination);
        let invocation = self.command("irepl").args([
            dataobj.to_string(),
            "-P".to_string(),
            "-n".to_string(),
            replicas_num.to_string(),
            "-S".to_string(),
            source.to_string(),
            "-R".to_string(),
            dest.to_string(),
        ]);
        let output = self.run(invocation)?;
        Ok(output.stdout_text())
    }

    pub fn replica_list(&self, dataobj: &str) -> Result<Vec<String>, GridError> {
        Ok(self
            .list(Some(dataobj), true)?
            .iter()
            .filter_map(|record| record.resource().map(str::to_string))
            .collect())
    }

    pub fn create_empty(
        &self,
        path: &str,
        directory: bool,
        ignore_existing: bool,
    ) -> Result<(), GridError> {
        if !directory {
            warn!(path = %path, "creating empty files on the grid is not supported");
            return Err(GridError::Unsupported(format!(
                "cannot create empty file '{path}'; only collections can be created"
            )));
        }
        let mut invocation = self.command("imkdir");
        if ignore_existing {
            invocation = invocation.arg("-p");
        }
        self.run(invocation.arg(path))?;
        debug!(path = %path, "created grid collection");
        Ok(())
    }

    /// `irods://host:port/<absolute path>`; relative paths hang off the
    /// current user's home.
    pub fn current_location(&self, path: &str) -> String {
        let settings = self.settings();
        let absolute = if path.starts_with('/') {
            path.to_string()
        } else {
            let home = self
                .auth
                .current()
                .map(|env| env.home.clone())
                .unwrap_or_else(|| self.user_home(&settings.user));
            format!("{}/{}", home.trim_end_matches('/'), path)
        };
        format!("irods://{}:{}{}", settings.host, settings.port, absolute)
    }

    pub fn meta_list(&self, path: &str) -> Result<BTreeMap<String, String>, GridError> {
        let output = self.run(self.command("imeta").args(["ls", "-d", path]))?;
        Ok(parse_metadata(&output.stdout_text()))
    }

    pub fn meta_write(&self, path: &str, attribute: &str, value: &str) -> Result<(), GridError> {
        self.run(
            self.command("imeta")
                .args(["set", "-d", path, attribute, value]),
        )?;
        debug!(path = %path, attribute = %attribute, "wrote grid metadata");
        Ok(())
    }
}
