use crate::config::{write_private_file, AuthScheme};
use crate::error::GridError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Variable the grid server reads to run a proxied command on behalf of
/// another user.
pub const CLIENT_USER_ENV: &str = "clientUserName";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GsiCertificates {
    pub ca_dir: PathBuf,
    pub user_cert: PathBuf,
    pub user_key: PathBuf,
}

impl GsiCertificates {
    pub fn for_user(cert_root: &Path, user: &str) -> Self {
        let user_dir = cert_root.join(user);
        Self {
            ca_dir: cert_root.join("caauth"),
            user_cert: user_dir.join("usercert.pem"),
            user_key: user_dir.join("userkey.pem"),
        }
    }

    pub fn missing(&self) -> Vec<&Path> {
        [self.user_cert.as_path(), self.user_key.as_path()]
            .into_iter()
            .filter(|path| !path.is_file())
            .collect()
    }
}

/// How commands of a session authenticate against the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum Authentication {
    /// Password stored by the password-init command, located through the
    /// session descriptor.
    Credentials { session_file: PathBuf },
    Pam { session_file: PathBuf },
    Gsi(GsiCertificates),
    /// Commands run under the admin session while the server acts as the
    /// session's user.
    Proxy { admin: Box<SessionEnvironment> },
}

/// Connection parameters of one identity. Identity changes build a new value
/// instead of editing this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEnvironment {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub zone: String,
    pub home: String,
    pub auth: Authentication,
}

impl SessionEnvironment {
    pub fn scheme(&self) -> AuthScheme {
        match &self.auth {
            Authentication::Credentials { .. } => AuthScheme::Credentials,
            Authentication::Pam { .. } => AuthScheme::Pam,
            Authentication::Gsi(_) => AuthScheme::Gsi,
            Authentication::Proxy { admin } => admin.scheme(),
        }
    }

    pub fn certificates(&self) -> Option<&GsiCertificates> {
        match &self.auth {
            Authentication::Gsi(certs) => Some(certs),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> SessionDescriptor {
        SessionDescriptor {
            irods_host: self.host.clone(),
            irods_port: self.port,
            irods_user_name: self.user.clone(),
            irods_zone_name: self.zone.clone(),
            irods_authentication_scheme: self.scheme().grid_name().to_string(),
        }
    }

    /// Variables layered over the inherited process environment for every
    /// command run as this identity.
    pub fn env_overrides(&self) -> BTreeMap<String, String> {
        let mut envs = BTreeMap::new();
        match &self.auth {
            Authentication::Credentials { session_file } | Authentication::Pam { session_file } => {
                envs.insert(
                    "IRODS_ENVIRONMENT_FILE".to_string(),
                    session_file.to_string_lossy().to_string(),
                );
            }
            Authentication::Gsi(certs) => {
                envs.insert("IRODS_USER_NAME".to_string(), self.user.clone());
                envs.insert("IRODS_HOME".to_string(), self.home.clone());
                envs.insert(
                    "IRODS_AUTHENTICATION_SCHEME".to_string(),
                    AuthScheme::Gsi.grid_name().to_string(),
                );
                envs.insert("IRODS_HOST".to_string(), self.host.clone());
                envs.insert("IRODS_PORT".to_string(), self.port.to_string());
                envs.insert("IRODS_ZONE".to_string(), self.zone.clone());
                envs.insert(
                    "X509_CERT_DIR".to_string(),
                    certs.ca_dir.to_string_lossy().to_string(),
                );
                envs.insert(
                    "X509_USER_CERT".to_string(),
                    certs.user_cert.to_string_lossy().to_string(),
                );
                envs.insert(
                    "X509_USER_KEY".to_string(),
                    certs.user_key.to_string_lossy().to_string(),
                );
            }
            Authentication::Proxy { admin } => {
                envs = admin.env_overrides();
                envs.insert(CLIENT_USER_ENV.to_string(), self.user.clone());
                envs.insert("IRODS_HOME".to_string(), self.home.clone());
            }
        }
        envs
    }
}

/// `/<zone><home_root>/<user>`, e.g. `/tempZone/home/alice`.
pub fn user_home(zone: &str, home_root: &str, user: &str) -> String {
    format!("/{}{}/{}", zone.trim_matches('/'), home_root, user)
}

/// User names become a directory under the certificate root and the last
/// segment of the home collection, so they must be one plain path component.
pub fn validate_user_name(user: &str) -> Result<(), String> {
    let mut components = Path::new(user).components();
    let single = matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none();
    if user.is_empty() || !single || user.contains(['/', '\\']) || user.contains("..") {
        return Err(format!("invalid grid user name '{user}'"));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub irods_host: String,
    pub irods_port: u16,
    pub irods_user_name: String,
    pub irods_zone_name: String,
    pub irods_authentication_scheme: String,
}

impl SessionDescriptor {
    pub fn write(&self, path: &Path) -> Result<(), GridError> {
        let content = serde_json::to_string_pretty(self)?;
        write_private_file(path, &content)
    }

    pub fn read(path: &Path) -> Result<Self, GridError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
