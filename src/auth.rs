//! Admin login and identity switching.
//!
//! The manager moves through `Uninitialized → AdminEstablished` once, then
//! between `AdminEstablished` and `Impersonating(user)` as often as callers
//! ask. Switching only swaps the environment later commands run with; no
//! command is spawned.

use crate::config::{AuthScheme, GridSettings, ENV_PASSWORD};
use crate::error::GridError;
use crate::runner::{CommandExecutor, CommandRunner, Invocation};
use crate::session::{
    user_home, validate_user_name, Authentication, GsiCertificates, SessionEnvironment,
};
use std::io::Write;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    AdminEstablished,
    Impersonating(String),
}

#[derive(Debug)]
pub struct AuthenticationManager {
    settings: GridSettings,
    state: SessionState,
    admin: Option<SessionEnvironment>,
    current: Option<SessionEnvironment>,
}

impl AuthenticationManager {
    pub fn new(settings: GridSettings) -> Self {
        Self {
            settings,
            state: SessionState::Uninitialized,
            admin: None,
            current: None,
        }
    }

    pub fn settings(&self) -> &GridSettings {
        &self.settings
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn admin(&self) -> Option<&SessionEnvironment> {
        self.admin.as_ref()
    }

    pub fn current(&self) -> Option<&SessionEnvironment> {
        self.current.as_ref()
    }

    pub fn user_home(&self, user: &str) -> String {
        user_home(&self.settings.zone, &self.settings.home_root, user)
    }

    /// Logs in as the configured admin. Password schemes write the session
    /// descriptor and run the password-init command; GSI needs the admin's
    /// certificates under the certificate root.
    pub fn establish_admin<E: CommandExecutor>(
        &mut self,
        runner: &CommandRunner<E>,
    ) -> Result<&SessionEnvironment, GridError> {
        let settings = &self.settings;
        validate_user_name(&settings.user).map_err(GridError::Configuration)?;
        let admin = match settings.scheme {
            AuthScheme::Credentials | AuthScheme::Pam => {
                let password = settings.password.as_deref().ok_or_else(|| {
                    GridError::Configuration(format!(
                        "missing password: set `password` in config.yaml or {ENV_PASSWORD}"
                    ))
                })?;
                let session_file = settings.session_file.clone();
                let auth = if settings.scheme == AuthScheme::Pam {
                    Authentication::Pam { session_file }
                } else {
                    Authentication::Credentials { session_file }
                };
                let env = SessionEnvironment {
                    host: settings.host.clone(),
                    port: settings.port,
                    user: settings.user.clone(),
                    zone: settings.zone.clone(),
                    home: self.user_home(&settings.user),
                    auth,
                };
                env.descriptor().write(&settings.session_file)?;
                push_password(runner, &env, password, settings)?;
                info!(user = %env.user, scheme = %settings.scheme, "saved grid admin credentials");
                debug!(descriptor = ?env.descriptor(), "grid admin environment");
                env
            }
            AuthScheme::Gsi => {
                let env = self.gsi_environment(&settings.user);
                if let Some(certs) = env.certificates() {
                    let missing = certs.missing();
                    if !missing.is_empty() {
                        return Err(GridError::Configuration(format!(
                            "missing GSI certificate for admin '{}': {}",
                            settings.user,
                            display_paths(&missing)
                        )));
                    }
                }
                info!(user = %env.user, "using GSI certificates for grid admin");
                env
            }
        };

        self.admin = Some(admin.clone());
        self.current = Some(admin);
        self.state = SessionState::AdminEstablished;
        self.current_or_err()
    }

    /// `None` goes back to the admin; `Some(user)` impersonates `user` with
    /// GSI certificates.
    pub fn become_user(&mut self, user: Option<&str>) -> Result<&SessionEnvironment, GridError> {
        match user {
            None => {
                let admin = self.admin.clone().ok_or_else(not_established)?;
                info!(user = %admin.user, "switched to grid admin");
                self.current = Some(admin);
                self.state = SessionState::AdminEstablished;
                self.current_or_err()
            }
            Some(user) => self.become_user_with(user, AuthScheme::Gsi),
        }
    }

    pub fn become_user_with(
        &mut self,
        user: &str,
        scheme: AuthScheme,
    ) -> Result<&SessionEnvironment, GridError> {
        let user = user.trim();
        if user.is_empty() {
            return Err(GridError::Authentication(
                "cannot impersonate an empty user name".to_string(),
            ));
        }
        validate_user_name(user).map_err(GridError::Authentication)?;
        let admin = self.admin.as_ref().ok_or_else(not_established)?;

        let env = match scheme {
            AuthScheme::Gsi => {
                let env = self.gsi_environment(user);
                if let Some(certs) = env.certificates() {
                    let missing = certs.missing();
                    if !missing.is_empty() {
                        return Err(GridError::Authentication(format!(
                            "no GSI certificate for '{user}': {}",
                            display_paths(&missing)
                        )));
                    }
                }
                env
            }
            AuthScheme::Credentials => SessionEnvironment {
                host: admin.host.clone(),
                port: admin.port,
                user: user.to_string(),
                zone: admin.zone.clone(),
                home: self.user_home(user),
                auth: Authentication::Proxy {
                    admin: Box::new(admin.clone()),
                },
            },
            AuthScheme::Pam => {
                warn!(user = %user, "PAM impersonation requested but not implemented");
                return Err(GridError::Authentication(
                    "PAM impersonation is not implemented; use gsi or credentials".to_string(),
                ));
            }
        };

        self.current = Some(env);
        self.state = SessionState::Impersonating(user.to_string());
        info!(user = %user, scheme = %scheme, "switched grid user");
        self.current_or_err()
    }

    fn gsi_environment(&self, user: &str) -> SessionEnvironment {
        SessionEnvironment {
            host: self.settings.host.clone(),
            port: self.settings.port,
            user: user.to_string(),
            zone: self.settings.zone.clone(),
            home: self.user_home(user),
            auth: Authentication::Gsi(GsiCertificates::for_user(&self.settings.cert_root, user)),
        }
    }

    fn current_or_err(&self) -> Result<&SessionEnvironment, GridError> {
        self.current.as_ref().ok_or_else(not_established)
    }
}

fn not_established() -> GridError {
    GridError::Authentication("grid admin session is not established".to_string())
}

fn display_paths(paths: &[&std::path::Path]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Feeds the password to the password-init command through a private temp
/// file. The file is removed when `secret` drops, whichever way this returns.
fn push_password<E: CommandExecutor>(
    runner: &CommandRunner<E>,
    env: &SessionEnvironment,
    password: &str,
    settings: &GridSettings,
) -> Result<(), GridError> {
    let mut secret = tempfile::Builder::new()
        .prefix(".gridctl-pw-")
        .tempfile_in(&settings.temp_dir)?;
    secret.write_all(password.as_bytes())?;
    secret.flush()?;

    let invocation = Invocation::new("iinit")
        .envs(env.env_overrides())
        .stdin_file(secret.path());
    runner.execute(&invocation)?;
    debug!("pushed grid credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionDescriptor;
    use crate::testing::{settings_in, MockExecutor};
    use std::fs;
    use std::io;
    use tempfile::tempdir;

    fn temp_entries(settings: &GridSettings) -> usize {
        fs::read_dir(&settings.temp_dir).unwrap().count()
    }

    fn established(settings: GridSettings) -> (AuthenticationManager, CommandRunner<MockExecutor>) {
        let runner = CommandRunner::new(MockExecutor::default(), None);
        let mut manager = AuthenticationManager::new(settings);
        manager.establish_admin(&runner).unwrap();
        (manager, runner)
    }

    #[test]
    fn starts_uninitialized() {
        let dir = tempdir().unwrap();
        let manager = AuthenticationManager::new(settings_in(dir.path(), AuthScheme::Credentials));
        assert_eq!(manager.state(), &SessionState::Uninitialized);
        assert!(manager.current().is_none());
    }

    #[test]
    fn credentials_login_writes_descriptor_and_pipes_password() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), AuthScheme::Credentials);
        let (manager, runner) = established(settings.clone());

        assert_eq!(manager.state(), &SessionState::AdminEstablished);
        let descriptor = SessionDescriptor::read(&settings.session_file).unwrap();
        assert_eq!(descriptor.irods_user_name, "rods");
        assert_eq!(descriptor.irods_port, 1247);
        assert_eq!(descriptor.irods_zone_name, "tempZone");

        let call = runner.executor().last_call();
        assert_eq!(call.program, "iinit");
        assert_eq!(call.stdin_content.as_deref(), Some("rodspass"));
        assert_eq!(
            call.env_overrides["IRODS_ENVIRONMENT_FILE"],
            settings.session_file.to_string_lossy()
        );
        assert_eq!(temp_entries(&settings), 0);
    }

    #[test]
    fn failed_password_init_still_removes_temp_file() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), AuthScheme::Credentials);
        let runner = CommandRunner::new(MockExecutor::default(), None);
        runner
            .executor()
            .push_status(1, "CAT_INVALID_AUTHENTICATION");
        let mut manager = AuthenticationManager::new(settings.clone());

        let err = manager.establish_admin(&runner).expect_err("login fails");
        let details = err.execution_details().expect("execution error");
        assert_eq!(details.error_code, "grid_auth_failed");
        assert_eq!(manager.state(), &SessionState::Uninitialized);
        assert_eq!(temp_entries(&settings), 0);

        runner
            .executor()
            .push_error(io::Error::new(io::ErrorKind::NotFound, "iinit"));
        assert!(manager.establish_admin(&runner).is_err());
        assert_eq!(temp_entries(&settings), 0);
    }

    #[test]
    fn missing_password_is_configuration_error() {
        let dir = tempdir().unwrap();
        for scheme in [AuthScheme::Credentials, AuthScheme::Pam] {
            let mut settings = settings_in(dir.path(), scheme);
            settings.password = None;
            let runner = CommandRunner::new(MockExecutor::default(), None);
            let mut manager = AuthenticationManager::new(settings);
            let err = manager.establish_admin(&runner).expect_err("no password");
            assert!(matches!(err, GridError::Configuration(_)));
            assert!(runner.executor().calls().is_empty());
        }
    }

    #[test]
    fn pam_login_records_pam_scheme() {
        let dir = tempdir().unwrap();
        let settings = settings_in(dir.path(), AuthScheme::Pam);
        let (manager, _runner) = established(settings.clone());
        assert_eq!(manager.current().unwrap().scheme(), AuthScheme::Pam);
        let descriptor = SessionDescriptor::read(&settings.session_file).unwrap();
        assert_eq!(descriptor.irods_authentication_scheme, "PAM");
    }

    #[test]
    fn gsi_login_uses_certificates_without_commands() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path(), AuthScheme::Gsi);
        settings.password = None;
        let (manager, runner) = established(settings.clone());
        let admin = manager.admin().unwrap();
        assert_eq!(admin.scheme(), AuthScheme::Gsi);
        assert_eq!(
            admin.certificates().unwrap().user_cert,
            settings.cert_root.join("rods").join("usercert.pem")
        );
        assert!(runner.executor().calls().is_empty());
        assert!(!settings.session_file.exists());
    }

    #[test]
    fn gsi_login_without_certificates_fails_fast() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path(), AuthScheme::Gsi);
        settings.user = "nobody".to_string();
        let runner = CommandRunner::new(MockExecutor::default(), None);
        let mut manager = AuthenticationManager::new(settings);
        let err = manager.establish_admin(&runner).expect_err("no certs");
        assert!(matches!(err, GridError::Configuration(_)));
    }

    #[test]
    fn become_none_restores_admin_environment() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        let admin = manager.current().unwrap().clone();

        manager.become_user(Some("alice")).unwrap();
        assert_eq!(manager.state(), &SessionState::Impersonating("alice".to_string()));
        assert_ne!(manager.current().unwrap(), &admin);

        let restored = manager.become_user(None).unwrap().clone();
        assert_eq!(restored, admin);
        assert_eq!(manager.state(), &SessionState::AdminEstablished);
    }

    #[test]
    fn switching_users_never_leaks_certificates() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));

        let alice = manager.become_user(Some("alice")).unwrap().clone();
        let bob = manager.become_user(Some("bob")).unwrap().clone();

        let alice_certs = alice.certificates().unwrap();
        let bob_certs = bob.certificates().unwrap();
        assert!(alice_certs.user_cert.ends_with("alice/usercert.pem"));
        assert!(bob_certs.user_cert.ends_with("bob/usercert.pem"));
        assert!(bob_certs.user_key.ends_with("bob/userkey.pem"));
        let envs = bob.env_overrides();
        assert!(envs.values().all(|value| !value.contains("alice")));
        assert_eq!(bob.home, "/tempZone/home/bob");
        assert_eq!(bob.scheme(), AuthScheme::Gsi);
    }

    #[test]
    fn become_user_spawns_nothing() {
        let dir = tempdir().unwrap();
        let (mut manager, runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        runner.executor().clear();
        manager.become_user(Some("alice")).unwrap();
        manager.become_user(None).unwrap();
        assert!(runner.executor().calls().is_empty());
    }

    #[test]
    fn pam_impersonation_is_reported_not_implemented() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        manager.become_user(Some("alice")).unwrap();
        let err = manager
            .become_user_with("bob", AuthScheme::Pam)
            .expect_err("pam");
        assert!(matches!(err, GridError::Authentication(_)));
        assert!(err.to_string().contains("not implemented"));
        assert_eq!(manager.state(), &SessionState::Impersonating("alice".to_string()));
    }

    #[test]
    fn credentials_impersonation_proxies_through_admin() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        let env = manager
            .become_user_with("carol", AuthScheme::Credentials)
            .unwrap()
            .clone();
        let envs = env.env_overrides();
        assert_eq!(envs["clientUserName"], "carol");
        assert!(envs.contains_key("IRODS_ENVIRONMENT_FILE"));
        assert_eq!(env.home, "/tempZone/home/carol");
    }

    #[test]
    fn impersonation_requires_certificates() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        let err = manager.become_user(Some("mallory")).expect_err("no certs");
        assert!(matches!(err, GridError::Authentication(_)));
        assert_eq!(manager.state(), &SessionState::AdminEstablished);
    }

    #[test]
    fn impersonation_rejects_names_outside_certificate_root() {
        let dir = tempdir().unwrap();
        let (mut manager, _runner) = established(settings_in(dir.path(), AuthScheme::Credentials));
        let escaped = dir.path().join("evil");
        fs::create_dir_all(&escaped).unwrap();
        fs::write(escaped.join("usercert.pem"), "cert").unwrap();
        fs::write(escaped.join("userkey.pem"), "key").unwrap();

        for user in ["../evil", "alice/../bob", "a/b", "a\\b", ".", ".."] {
            let err = manager.become_user(Some(user)).expect_err(user);
            assert!(matches!(err, GridError::Authentication(_)), "{user}");
            let err = manager
                .become_user_with(user, AuthScheme::Credentials)
                .expect_err(user);
            assert!(matches!(err, GridError::Authentication(_)), "{user}");
        }
        assert_eq!(manager.state(), &SessionState::AdminEstablished);
        assert_eq!(manager.current().unwrap().user, "rods");
    }

    #[test]
    fn admin_name_must_be_single_component() {
        let dir = tempdir().unwrap();
        let mut settings = settings_in(dir.path(), AuthScheme::Gsi);
        settings.user = "../rods".to_string();
        let runner = CommandRunner::new(MockExecutor::default(), None);
        let mut manager = AuthenticationManager::new(settings);
        let err = manager.establish_admin(&runner).unwrap_err();
        assert!(matches!(err, GridError::Configuration(_)));
        assert!(runner.executor().calls().is_empty());
        assert_eq!(manager.state(), &SessionState::Uninitialized);
    }

    #[test]
    fn switching_before_login_fails() {
        let dir = tempdir().unwrap();
        let mut manager = AuthenticationManager::new(settings_in(dir.path(), AuthScheme::Credentials));
        assert!(manager.become_user(None).is_err());
        assert!(manager.become_user(Some("alice")).is_err());
    }
}
