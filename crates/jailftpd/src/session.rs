//! Per-connection session state
//!
//! Login sub-machine:
//!
//! ```text
//! NotLoggedIn --USER anonymous--> AnonymousPending --PASS *----> LoggedIn
//! NotLoggedIn --USER name-------> UserNamed(name) --PASS ok---> LoggedIn
//!                                                  --PASS bad--> connection closed
//! ```
//!
//! USER and PASS are rejected once logged in. The working directory only
//! changes through the path resolver, and the restart offset is consumed by
//! the next transfer whatever its outcome.

use std::path::Path;

use crate::auth::{CredentialOracle, Identity, ANONYMOUS};
use crate::error::{FtpError, Result};
use crate::sync::XferInfo;
use crate::vfs::Jail;

/// Where the session is in the login sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LoginState {
    NotLoggedIn,
    /// USER accepted, waiting for the password
    UserNamed(String),
    /// USER anonymous accepted, any password will do
    AnonymousPending,
    LoggedIn(Identity),
}

/// Result of a USER command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    /// Anonymous accepted
    AnonymousPending,
    /// Named user recorded; password required
    PasswordRequired(String),
    /// Anonymous disabled by configuration; state unchanged
    AnonymousDisabled,
    /// Already logged in; state unchanged
    AlreadyLoggedIn,
}

/// Result of a PASS command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Logged in as this identity
    LoggedIn(Identity),
    /// PASS without a preceding USER; state unchanged
    NoUser,
    /// Already logged in; state unchanged
    AlreadyLoggedIn,
    /// Wrong credentials; the connection must be closed
    Failed,
}

/// Settings the login sequence needs from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoginPolicy<'a> {
    /// USER anonymous permitted
    pub allow_anonymous: bool,
    /// Jail root for anonymous sessions
    pub anon_root: &'a Path,
    /// Symlink policy of the jail built at login
    pub allow_symlinks: bool,
}

/// State owned by one worker for one control connection.
#[derive(Debug)]
pub struct Session {
    login: LoginState,
    jail: Option<Jail>,
    cwd: String,
    restart: u64,
    /// Transfer counters shared with the master
    pub info: XferInfo,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A fresh, logged out session at `/`.
    pub fn new() -> Self {
        Self {
            login: LoginState::NotLoggedIn,
            jail: None,
            cwd: "/".to_string(),
            restart: 0,
            info: XferInfo::default(),
        }
    }

    /// True once PASS succeeded.
    pub fn is_logged_in(&self) -> bool {
        matches!(self.login, LoginState::LoggedIn(_))
    }

    /// Authenticated identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        match &self.login {
            LoginState::LoggedIn(identity) => Some(identity),
            _ => None,
        }
    }

    /// Handles USER.
    pub fn user(&mut self, name: &str, policy: &LoginPolicy<'_>) -> UserOutcome {
        if self.is_logged_in() {
            return UserOutcome::AlreadyLoggedIn;
        }

        if name.eq_ignore_ascii_case(ANONYMOUS) {
            if !policy.allow_anonymous {
                return UserOutcome::AnonymousDisabled;
            }
            self.login = LoginState::AnonymousPending;
            return UserOutcome::AnonymousPending;
        }

        self.login = LoginState::UserNamed(name.to_string());
        UserOutcome::PasswordRequired(name.to_string())
    }

    /// Handles PASS. On success the jail is built and the cwd reset to `/`.
    pub fn pass(
        &mut self,
        password: &str,
        oracle: &dyn CredentialOracle,
        policy: &LoginPolicy<'_>,
    ) -> PassOutcome {
        let identity = match &self.login {
            LoginState::LoggedIn(_) => return PassOutcome::AlreadyLoggedIn,
            LoginState::NotLoggedIn => return PassOutcome::NoUser,
            LoginState::AnonymousPending => Some(Identity::anonymous(policy.anon_root)),
            LoginState::UserNamed(name) => oracle.verify(name, password),
        };

        let Some(identity) = identity else {
            self.login = LoginState::NotLoggedIn;
            return PassOutcome::Failed;
        };

        self.jail = Some(Jail::new(&identity.root, policy.allow_symlinks));
        self.cwd = "/".to_string();
        self.login = LoginState::LoggedIn(identity.clone());
        PassOutcome::LoggedIn(identity)
    }

    /// The session's jail; only present after login.
    pub fn jail(&self) -> Result<&Jail> {
        self.jail.as_ref().ok_or(FtpError::NoJail)
    }

    /// Virtual working directory.
    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Replaces the working directory with an already resolved path.
    pub fn set_cwd(&mut self, virtual_path: String) {
        debug_assert!(virtual_path.starts_with('/'));
        self.cwd = virtual_path;
    }

    /// Records the REST offset.
    pub fn set_restart(&mut self, offset: u64) {
        self.restart = offset;
    }

    /// Returns the pending restart offset and resets it to 0.
    pub fn take_restart(&mut self) -> u64 {
        std::mem::take(&mut self.restart)
    }
}
