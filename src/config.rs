use crate::error::GridError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

pub const ENV_AUTH_SCHEME: &str = "GRIDCTL_AUTH_SCHEME";
pub const ENV_USER: &str = "GRIDCTL_USER";
pub const ENV_PASSWORD: &str = "GRIDCTL_PASSWORD";
pub const ENV_HOST: &str = "GRIDCTL_HOST";
pub const ENV_ADDRESS: &str = "GRIDCTL_ADDRESS";
pub const ENV_ZONE: &str = "GRIDCTL_ZONE";
pub const ENV_HOME_ROOT: &str = "GRIDCTL_HOME_ROOT";
pub const ENV_CERT_ROOT: &str = "GRIDCTL_CERT_ROOT";
pub const ENV_SESSION_FILE: &str = "GRIDCTL_SESSION_FILE";
pub const ENV_TEMP_DIR: &str = "GRIDCTL_TEMP_DIR";
pub const ENV_BIN_DIR: &str = "GRIDCTL_BIN_DIR";
pub const ENV_TIMEOUT_SEC: &str = "GRIDCTL_TIMEOUT_SEC";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthScheme {
    #[default]
    Credentials,
    #[serde(alias = "PAM")]
    Pam,
    #[serde(alias = "GSI")]
    Gsi,
}

impl AuthScheme {
    /// Name understood by the icommands in `irods_authentication_scheme`.
    pub fn grid_name(self) -> &'static str {
        match self {
            AuthScheme::Credentials => "native",
            AuthScheme::Pam => "PAM",
            AuthScheme::Gsi => "GSI",
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthScheme::Credentials => "credentials",
            AuthScheme::Pam => "pam",
            AuthScheme::Gsi => "gsi",
        };
        f.write_str(name)
    }
}

impl FromStr for AuthScheme {
    type Err = GridError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "credentials" | "native" | "password" => Ok(AuthScheme::Credentials),
            "pam" => Ok(AuthScheme::Pam),
            "gsi" => Ok(AuthScheme::Gsi),
            other => Err(GridError::Configuration(format!(
                "unknown authentication scheme '{other}' (expected credentials, pam or gsi)"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub auth_scheme: AuthScheme,
    pub user: String,
    pub password: String,
    pub host: String,
    pub address: String,
    pub zone: String,
    pub home_root: String,
    pub cert_root: String,
    pub session_file: String,
    pub temp_dir: String,
    pub bin_dir: String,
    pub timeout_sec: Option<u64>,
    pub resources: Resources,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Resources {
    pub source: String,
    pub destination: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            auth_scheme: AuthScheme::default(),
            user: "".to_string(),
            password: "".to_string(),
            host: "".to_string(),
            address: "".to_string(),
            zone: "".to_string(),
            home_root: "/home".to_string(),
            cert_root: "/opt/certificates".to_string(),
            session_file: "~/.irods/irods_environment.json".to_string(),
            temp_dir: "".to_string(),
            bin_dir: "".to_string(),
            timeout_sec: None,
            resources: Resources::default(),
        }
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            source: "demoResc".to_string(),
            destination: "replicaResc".to_string(),
        }
    }
}

impl Config {
    pub fn from_yaml(content: &str) -> Result<Self, GridError> {
        let cfg: Config = serde_yaml::from_str(content)?;
        if cfg.version != CONFIG_VERSION {
            return Err(GridError::Configuration(format!(
                "unsupported config version {}",
                cfg.version
            )));
        }
        Ok(cfg)
    }

    pub fn read(path: &Path) -> Result<Self, GridError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Reads `path` when it exists, otherwise starts from defaults so that a
    /// purely environment-driven setup works without a file.
    pub fn load(path: &Path) -> Result<Self, GridError> {
        if path.exists() {
            Self::read(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, GridError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = set(ENV_AUTH_SCHEME) {
            self.auth_scheme = value.parse()?;
        }
        for (key, field) in [
            (ENV_USER, &mut self.user),
            (ENV_PASSWORD, &mut self.password),
            (ENV_HOST, &mut self.host),
            (ENV_ADDRESS, &mut self.address),
            (ENV_ZONE, &mut self.zone),
            (ENV_HOME_ROOT, &mut self.home_root),
            (ENV_CERT_ROOT, &mut self.cert_root),
            (ENV_SESSION_FILE, &mut self.session_file),
            (ENV_TEMP_DIR, &mut self.temp_dir),
            (ENV_BIN_DIR, &mut self.bin_dir),
        ] {
            if let Some(value) = set(key) {
                *field = value;
            }
        }
        if let Some(value) = set(ENV_TIMEOUT_SEC) {
            let secs = value.trim().parse::<u64>().map_err(|_| {
                GridError::Configuration(format!("{ENV_TIMEOUT_SEC} must be a number of seconds"))
            })?;
            self.timeout_sec = Some(secs);
        }
        Ok(self)
    }

    pub fn with_process_env(self) -> Result<Self, GridError> {
        self.with_env(|key| env::var(key).ok())
    }

    /// Checks required values and derives typed settings. The admin
    /// password stays optional here; only schemes that need it ask for it.
    pub fn settings(&self) -> Result<GridSettings, GridError> {
        let user = required(&self.user, "user", ENV_USER)?;
        let host = required(&self.host, "host", ENV_HOST)?;
        let address = required(&self.address, "address", ENV_ADDRESS)?;
        let zone = required(&self.zone, "zone", ENV_ZONE)?;
        let port = parse_port(&address)?;

        let home_root = normalize_home_root(&self.home_root);
        if self.resources.source.trim().is_empty() || self.resources.destination.trim().is_empty() {
            return Err(GridError::Configuration(
                "resources.source and resources.destination must not be empty".to_string(),
            ));
        }
        let temp_dir = if self.temp_dir.trim().is_empty() {
            env::temp_dir()
        } else {
            expand_path(&self.temp_dir)
        };
        let bin_dir = if self.bin_dir.trim().is_empty() {
            None
        } else {
            Some(expand_path(&self.bin_dir))
        };

        Ok(GridSettings {
            scheme: self.auth_scheme,
            user,
            password: if self.password.is_empty() {
                None
            } else {
                Some(self.password.clone())
            },
            host,
            port,
            zone,
            home_root,
            cert_root: expand_path(&self.cert_root),
            session_file: expand_path(&self.session_file),
            temp_dir,
            bin_dir,
            timeout: self.timeout_sec.filter(|secs| *secs > 0).map(Duration::from_secs),
            resources: self.resources.clone(),
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct GridSettings {
    pub scheme: AuthScheme,
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub zone: String,
    pub home_root: String,
    pub cert_root: PathBuf,
    pub session_file: PathBuf,
    pub temp_dir: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub resources: Resources,
}

impl fmt::Debug for GridSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridSettings")
            .field("scheme", &self.scheme)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("zone", &self.zone)
            .field("home_root", &self.home_root)
            .field("cert_root", &self.cert_root)
            .field("session_file", &self.session_file)
            .field("temp_dir", &self.temp_dir)
            .field("bin_dir", &self.bin_dir)
            .field("timeout", &self.timeout)
            .field("resources", &self.resources)
            .finish()
    }
}

fn required(value: &str, field: &str, env_key: &str) -> Result<String, GridError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GridError::Configuration(format!(
            "missing {field}: set `{field}` in config.yaml or {env_key}"
        )));
    }
    Ok(value.to_string())
}

/// Port is the trailing colon-delimited segment, so `tcp://10.0.0.2:1247`,
/// `icat:1247` and a bare `1247` all work.
pub fn parse_port(address: &str) -> Result<u16, GridError> {
    let segment = address.rsplit(':').next().unwrap_or_default().trim();
    segment.parse::<u16>().map_err(|_| {
        GridError::Configuration(format!(
            "cannot derive a port from address '{address}'"
        ))
    })
}

fn normalize_home_root(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/home".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn ensure_parent(path: &Path) -> Result<(), GridError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes `content` readable by the owner only, through a temp file in the
/// same directory and a rename. Missing parent directories are created
/// owner-only as well, like `~/.irods`.
pub fn write_private_file(path: &Path, content: &str) -> Result<(), GridError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !parent.exists() {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(parent)?;
    }

    let mut staged = tempfile::Builder::new()
        .prefix(".gridctl-")
        .tempfile_in(parent)?;
    staged.write_all(content.as_bytes())?;
    staged.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(staged.path(), fs::Permissions::from_mode(0o600))?;
    }
    staged.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Expands a leading `~` to the home directory; config paths are trimmed.
pub fn expand_path(input: &str) -> PathBuf {
    let input = input.trim();
    let home_relative = if input == "~" {
        Some("")
    } else {
        input.strip_prefix("~/")
    };
    match (home_relative, home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_USER, "rods"),
            (ENV_HOST, "icat.example.org"),
            (ENV_ADDRESS, "tcp://172.17.0.2:1247"),
            (ENV_ZONE, "tempZone"),
        ]
    }

    #[test]
    fn config_unknown_field_errors() {
        let yaml = "version: 1\nunknown: true\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn config_wrong_version_errors() {
        let err = Config::from_yaml("version: 7").expect_err("version");
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = Config::from_yaml("version: 1").expect("config");
        assert_eq!(cfg.auth_scheme, AuthScheme::Credentials);
        assert_eq!(cfg.home_root, "/home");
        assert_eq!(cfg.cert_root, "/opt/certificates");
        assert_eq!(cfg.resources.source, "demoResc");
        assert_eq!(cfg.resources.destination, "replicaResc");
        assert!(cfg.timeout_sec.is_none());
    }

    #[test]
    fn bundled_default_yaml_parses() {
        let cfg = Config::from_yaml(DEFAULT_CONFIG_YAML).expect("default yaml");
        assert_eq!(cfg.version, CONFIG_VERSION);
    }

    #[test]
    fn scheme_accepts_grid_spellings() {
        let cfg = Config::from_yaml("version: 1\nauth_scheme: GSI\n").unwrap();
        assert_eq!(cfg.auth_scheme, AuthScheme::Gsi);
        assert_eq!("PAM".parse::<AuthScheme>().unwrap(), AuthScheme::Pam);
        assert!("kerberos".parse::<AuthScheme>().is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let cfg = Config::from_yaml("version: 1\nuser: fromfile\nzone: fileZone\n").unwrap();
        let mut pairs = base_env();
        pairs.push((ENV_AUTH_SCHEME, "pam"));
        pairs.push((ENV_TIMEOUT_SEC, "30"));
        let cfg = cfg.with_env(lookup(&pairs)).unwrap();
        assert_eq!(cfg.user, "rods");
        assert_eq!(cfg.zone, "tempZone");
        assert_eq!(cfg.auth_scheme, AuthScheme::Pam);
        assert_eq!(cfg.timeout_sec, Some(30));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let cfg = Config::from_yaml("version: 1\nuser: keep\n")
            .unwrap()
            .with_env(lookup(&[(ENV_USER, "  ")]))
            .unwrap();
        assert_eq!(cfg.user, "keep");
    }

    #[test]
    fn settings_derive_port_from_trailing_segment() {
        let settings = Config::default()
            .with_env(lookup(&base_env()))
            .unwrap()
            .settings()
            .unwrap();
        assert_eq!(settings.port, 1247);
        assert_eq!(settings.host, "icat.example.org");
        assert!(settings.password.is_none());
        assert!(settings.timeout.is_none());
        assert_eq!(parse_port("1247").unwrap(), 1247);
        assert!(parse_port("icat:http").is_err());
    }

    #[test]
    fn settings_require_user_host_address_zone() {
        for missing in [ENV_USER, ENV_HOST, ENV_ADDRESS, ENV_ZONE] {
            let pairs: Vec<_> = base_env()
                .into_iter()
                .filter(|(key, _)| *key != missing)
                .collect();
            let err = Config::default()
                .with_env(lookup(&pairs))
                .unwrap()
                .settings()
                .expect_err("missing value");
            assert!(matches!(err, GridError::Configuration(_)), "{missing}");
            assert!(err.to_string().contains(missing));
        }
    }

    #[test]
    fn home_root_is_normalized() {
        let mut pairs = base_env();
        pairs.push((ENV_HOME_ROOT, "users/"));
        let settings = Config::default()
            .with_env(lookup(&pairs))
            .unwrap()
            .settings()
            .unwrap();
        assert_eq!(settings.home_root, "/users");
    }

    #[test]
    fn private_write_replaces_content_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("env.json");
        write_private_file(&path, "first").unwrap();
        write_private_file(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o600);
            assert_eq!(dir_mode & 0o077, 0);
        }
    }

    #[test]
    fn expand_path_handles_home_and_plain_paths() {
        assert_eq!(expand_path(" /opt/certificates "), PathBuf::from("/opt/certificates"));
        if let Some(home) = home_dir() {
            assert_eq!(expand_path("~"), home);
            assert_eq!(expand_path("~/.irods/env.json"), home.join(".irods/env.json"));
        }
        assert_eq!(expand_path("~alice/x"), PathBuf::from("~alice/x"));
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut pairs = base_env();
        pairs.push((ENV_PASSWORD, "hunter2"));
        let settings = Config::default()
            .with_env(lookup(&pairs))
            .unwrap()
            .settings()
            .unwrap();
        let text = format!("{settings:?}");
        assert!(!text.contains("hunter2"));
        assert!(text.contains("<redacted>"));
    }
}
