use crate::config::{AuthScheme, GridSettings, Resources};
use crate::runner::{CommandExecutor, CommandOutput, Invocation};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub env_overrides: BTreeMap<String, String>,
    pub stdin_content: Option<String>,
    pub accepted_codes: Vec<i32>,
}

/// Records every invocation and answers from a queue; an empty queue answers
/// with a silent success.
#[derive(Default)]
pub struct MockExecutor {
    calls: RefCell<Vec<RecordedCall>>,
    outputs: RefCell<VecDeque<Result<CommandOutput, io::Error>>>,
}

impl MockExecutor {
    pub fn push_output(&self, output: CommandOutput) {
        self.outputs.borrow_mut().push_back(Ok(output));
    }

    pub fn push_stdout(&self, stdout: &str) {
        self.push_output(CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
        });
    }

    pub fn push_status(&self, status_code: i32, stderr: &str) {
        self.push_output(CommandOutput {
            status_code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        });
    }

    pub fn push_error(&self, err: io::Error) {
        self.outputs.borrow_mut().push_back(Err(err));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn last_call(&self) -> RecordedCall {
        self.calls
            .borrow()
            .last()
            .cloned()
            .expect("no command was run")
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl CommandExecutor for MockExecutor {
    fn run(
        &self,
        invocation: &Invocation,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error> {
        let stdin_content = match &invocation.stdin {
            Some(path) => Some(fs::read_to_string(path)?),
            None => None,
        };
        self.calls.borrow_mut().push(RecordedCall {
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            env_overrides: invocation.env_overrides.clone(),
            stdin_content,
            accepted_codes: invocation.accepted_codes.clone(),
        });
        self.outputs.borrow_mut().pop_front().unwrap_or_else(|| {
            Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        })
    }
}

/// Settings rooted in `dir`: session file, temp dir and certificate root all
/// live below it. Certificates exist for `rods`, `alice` and `bob`.
pub fn settings_in(dir: &Path, scheme: AuthScheme) -> GridSettings {
    let cert_root = dir.join("certificates");
    for user in ["rods", "alice", "bob"] {
        let user_dir = cert_root.join(user);
        fs::create_dir_all(&user_dir).unwrap();
        fs::write(user_dir.join("usercert.pem"), "cert").unwrap();
        fs::write(user_dir.join("userkey.pem"), "key").unwrap();
    }
    let temp_dir = dir.join("tmp");
    fs::create_dir_all(&temp_dir).unwrap();
    GridSettings {
        scheme,
        user: "rods".to_string(),
        password: Some("rodspass".to_string()),
        host: "icat.example.org".to_string(),
        port: 1247,
        zone: "tempZone".to_string(),
        home_root: "/home".to_string(),
        cert_root,
        session_file: dir.join(".irods").join("irods_environment.json"),
        temp_dir,
        bin_dir: None,
        timeout: None,
        resources: Resources::default(),
    }
}
