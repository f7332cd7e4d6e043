use serde::Serialize;
use std::fmt;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("config error: {0}")]
    Configuration(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("{0}")]
    Execution(#[from] ExecutionError),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
}

impl GridError {
    pub fn execution_details(&self) -> Option<&ExecutionError> {
        match self {
            GridError::Execution(err) => Some(err),
            _ => None,
        }
    }
}

/// A command that could not be run, or exited with a status the caller did
/// not accept.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecutionError {
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_stderr: Option<String>,
    #[serde(skip)]
    message: String,
}

impl ExecutionError {
    pub fn spawn_failed(err: &io::Error, command: &str) -> Self {
        let (error_code, hint) = if err.kind() == io::ErrorKind::NotFound {
            (
                "binary_not_found",
                Some("Install the icommands client and ensure it is on your PATH (or set bin_dir)."),
            )
        } else {
            ("command_failed", None)
        };
        Self {
            error_code: error_code.to_string(),
            hint: hint.map(str::to_string),
            command: command.to_string(),
            status: None,
            raw_stderr: None,
            message: format!("failed to run command `{command}`: {err}"),
        }
    }

    pub fn timed_out(command: &str, secs: u64) -> Self {
        Self {
            error_code: "command_timed_out".to_string(),
            hint: Some("Raise timeout_sec or check connectivity to the grid server.".to_string()),
            command: command.to_string(),
            status: None,
            raw_stderr: None,
            message: format!("command `{command}` did not finish within {secs}s and was killed"),
        }
    }

    pub fn exit_status(command: &str, status: i32, stderr: &str) -> Self {
        let stderr = stderr.trim().to_string();
        let (error_code, hint) = classify_grid_failure(&stderr);
        let mut message = format!("command failed with status {status} while running `{command}`");
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(ref hint_message) = hint {
            message = format!("{message}\nHint: {hint_message}");
        }
        Self {
            error_code,
            hint,
            command: command.to_string(),
            status: Some(status),
            raw_stderr: if stderr.is_empty() { None } else { Some(stderr) },
            message,
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution error: {}", self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Maps icommand stderr onto a stable error code and an operator hint.
pub fn classify_grid_failure(stderr: &str) -> (String, Option<String>) {
    let lower = stderr.to_lowercase();

    if lower.contains("cat_invalid_authentication")
        || lower.contains("cat_invalid_user")
        || lower.contains("authentication")
        || lower.contains("pam_auth")
    {
        return (
            "grid_auth_failed".to_string(),
            Some(
                "Authentication was rejected. Check the configured user, password or certificates."
                    .to_string(),
            ),
        );
    }

    if lower.contains("user_sock_connect_err")
        || lower.contains("connection refused")
        || lower.contains("sys_sock_connect_err")
        || lower.contains("connect to")
    {
        return (
            "grid_unreachable".to_string(),
            Some("The grid server is unreachable. Check host and port.".to_string()),
        );
    }

    if lower.contains("cat_no_rows_found")
        || lower.contains("does not exist")
        || lower.contains("user_file_does_not_exist")
    {
        return ("grid_not_found".to_string(), None);
    }

    if lower.contains("overwrite_without_force_flag") {
        return (
            "grid_overwrite_refused".to_string(),
            Some("The target already exists. Remove it first or upload under another name.".to_string()),
        );
    }

    if lower.contains("sys_resc_does_not_exist")
        || lower.contains("user_invalid_resc_input")
        || lower.contains("invalid resource")
    {
        return (
            "grid_unknown_resource".to_string(),
            Some("Check the resource names with `ilsresc`.".to_string()),
        );
    }

    if lower.contains("cat_no_access_permission") || lower.contains("permission denied") {
        return ("grid_permission_denied".to_string(), None);
    }

    ("command_failed".to_string(), None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_icommand_failures() {
        let (code, hint) =
            classify_grid_failure("rcAuthResponse failed with error -826000 CAT_INVALID_AUTHENTICATION");
        assert_eq!(code, "grid_auth_failed");
        assert!(hint.is_some());

        let (code, _) = classify_grid_failure("ERROR: _rcConnect: connectToRhost error, USER_SOCK_CONNECT_ERR");
        assert_eq!(code, "grid_unreachable");

        let (code, hint) = classify_grid_failure("ERROR: put error for /tempZone/home/rods/a OVERWRITE_WITHOUT_FORCE_FLAG");
        assert_eq!(code, "grid_overwrite_refused");
        assert!(hint.is_some());

        let (code, _) = classify_grid_failure("SYS_RESC_DOES_NOT_EXIST");
        assert_eq!(code, "grid_unknown_resource");

        let (code, hint) = classify_grid_failure("something odd happened");
        assert_eq!(code, "command_failed");
        assert!(hint.is_none());
    }

    #[test]
    fn exit_status_error_carries_stderr_and_hint() {
        let err = ExecutionError::exit_status("ils /tempZone", 3, "  USER_SOCK_CONNECT_ERR \n");
        assert_eq!(err.status, Some(3));
        assert_eq!(err.raw_stderr.as_deref(), Some("USER_SOCK_CONNECT_ERR"));
        assert_eq!(err.error_code, "grid_unreachable");
        let text = err.to_string();
        assert!(text.contains("status 3"));
        assert!(text.contains("Hint:"));
    }

    #[test]
    fn empty_stderr_is_not_reported() {
        let err = ExecutionError::exit_status("irm x", 1, "");
        assert!(err.raw_stderr.is_none());
        assert_eq!(err.error_code, "command_failed");
    }
}
