//! Acting-account discovery.
//!
//! Resolves which non-privileged account owns the project and will run the
//! resident application, without asking anyone. Resolution order:
//!
//! 1. identity hints (`TSUKI_TARGET_USER`/`--account`, then `SUDO_USER`);
//! 2. the current account when it is not `root`;
//! 3. conventional account names whose home directory exists;
//! 4. the lexicographically first directory under the home root.
//!
//! Only an empty home root is fatal. A missing project directory is reported by
//! [`EnvironmentContext::project_dir_exists`] and enforced later by the build step.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::account_db::{
    current_process_is_privileged, lookup_account_ids, AccountIds, DEFAULT_PASSWD_PATH,
    PRIVILEGED_ACCOUNT,
};

pub const DEFAULT_HOME_ROOT: &str = "/home";
pub const DEFAULT_PROJECT_NAME: &str = "tsukimi-device";
pub const TARGET_ACCOUNT_ENV: &str = "TSUKI_TARGET_USER";
pub const CONVENTIONAL_ACCOUNTS: &[&str] = &["pi", "ubuntu", "debian", "admin"];
const SCAN_IGNORED_ENTRIES: &[&str] = &["lost+found"];

/// Which resolution step produced the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSource {
    Hint,
    CurrentAccount,
    ConventionalName,
    HomeDirectoryScan,
}

impl AccountSource {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountSource::Hint => "hint",
            AccountSource::CurrentAccount => "current_account",
            AccountSource::ConventionalName => "conventional_name",
            AccountSource::HomeDirectoryScan => "home_directory_scan",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error(
        "no account could be resolved: no usable identity hint, current account is privileged or unknown, no conventional home exists, and '{}' has no entries",
        home_root.display()
    )]
    NoAccount { home_root: PathBuf },
    #[error("project name must be a single non-empty path component, got '{0}'")]
    InvalidProjectName(String),
}

/// Raw facts the resolver works from; gathered from the process or built by tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverInputs {
    pub identity_hints: Vec<String>,
    pub current_account: Option<String>,
    pub privileged: bool,
    pub home_root: PathBuf,
    pub project_name: String,
    pub passwd_path: PathBuf,
}

impl ResolverInputs {
    /// Collects hints from the environment of the running process.
    ///
    /// `explicit_hint` comes from `--account` (already bound to `TSUKI_TARGET_USER`
    /// by the CLI layer) and wins over `SUDO_USER`.
    pub fn from_process(explicit_hint: Option<&str>, home_root: &Path, project_name: &str) -> Self {
        let mut identity_hints = Vec::new();
        if let Some(hint) = explicit_hint {
            identity_hints.push(hint.to_string());
        } else if let Ok(hint) = std::env::var(TARGET_ACCOUNT_ENV) {
            identity_hints.push(hint);
        }
        if let Ok(sudo_user) = std::env::var("SUDO_USER") {
            identity_hints.push(sudo_user);
        }
        let current_account = std::env::var("USER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| std::env::var("LOGNAME").ok());

        Self {
            identity_hints,
            current_account,
            privileged: current_process_is_privileged(),
            home_root: home_root.to_path_buf(),
            project_name: project_name.to_string(),
            passwd_path: PathBuf::from(DEFAULT_PASSWD_PATH),
        }
    }
}

/// Resolved account, home and project directory for one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentContext {
    account: String,
    home_dir: PathBuf,
    project_dir: PathBuf,
    source: AccountSource,
    ids: Option<AccountIds>,
    privileged: bool,
}

impl EnvironmentContext {
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn source(&self) -> AccountSource {
        self.source
    }

    /// uid/gid of the account when the passwd database knows it.
    pub fn ids(&self) -> Option<AccountIds> {
        self.ids
    }

    /// True when this process runs as root on behalf of the resolved account.
    pub fn privileged(&self) -> bool {
        self.privileged
    }

    pub fn project_dir_exists(&self) -> bool {
        self.project_dir.is_dir()
    }

    /// `/run/user/<uid>` for the account's session, when the uid is known.
    pub fn runtime_dir(&self) -> Option<PathBuf> {
        self.ids
            .map(|ids| PathBuf::from(format!("/run/user/{}", ids.uid)))
    }
}

pub fn resolve_environment(inputs: &ResolverInputs) -> Result<EnvironmentContext, EnvironmentError> {
    let project_name = inputs.project_name.trim();
    if !is_single_component(project_name) {
        return Err(EnvironmentError::InvalidProjectName(
            inputs.project_name.clone(),
        ));
    }

    let (account, source) = resolve_account(inputs)?;
    let home_dir = inputs.home_root.join(&account);
    let project_dir = home_dir.join(project_name);
    let ids = lookup_account_ids(&inputs.passwd_path, &account);
    Ok(EnvironmentContext {
        account,
        home_dir,
        project_dir,
        source,
        ids,
        privileged: inputs.privileged,
    })
}

fn resolve_account(inputs: &ResolverInputs) -> Result<(String, AccountSource), EnvironmentError> {
    if let Some(hint) = inputs
        .identity_hints
        .iter()
        .map(|hint| hint.trim())
        .find(|hint| is_usable_account(hint))
    {
        return Ok((hint.to_string(), AccountSource::Hint));
    }

    if let Some(current) = inputs
        .current_account
        .as_deref()
        .map(str::trim)
        .filter(|current| !inputs.privileged && is_usable_account(current))
    {
        return Ok((current.to_string(), AccountSource::CurrentAccount));
    }

    if let Some(name) = CONVENTIONAL_ACCOUNTS
        .iter()
        .find(|name| inputs.home_root.join(name).is_dir())
    {
        return Ok((name.to_string(), AccountSource::ConventionalName));
    }

    first_home_entry(&inputs.home_root)
        .map(|name| (name, AccountSource::HomeDirectoryScan))
        .ok_or_else(|| EnvironmentError::NoAccount {
            home_root: inputs.home_root.clone(),
        })
}

fn first_home_entry(home_root: &Path) -> Option<String> {
    let entries = std::fs::read_dir(home_root).ok()?;
    let mut names = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.') && !SCAN_IGNORED_ENTRIES.contains(&name.as_str()))
        .filter(|name| is_usable_account(name))
        .collect::<Vec<_>>();
    names.sort();
    names.into_iter().next()
}

fn is_usable_account(name: &str) -> bool {
    is_single_component(name) && name != PRIVILEGED_ACCOUNT
}

fn is_single_component(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn inputs(home_root: &Path) -> ResolverInputs {
        ResolverInputs {
            identity_hints: Vec::new(),
            current_account: None,
            privileged: true,
            home_root: home_root.to_path_buf(),
            project_name: DEFAULT_PROJECT_NAME.to_string(),
            passwd_path: home_root.join("no-passwd"),
        }
    }

    #[test]
    fn unit_hint_wins_over_every_other_source() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("pi")).expect("pi home");
        let mut inputs = inputs(temp.path());
        inputs.identity_hints = vec!["kaguya".to_string()];
        inputs.current_account = Some("operator".to_string());
        inputs.privileged = false;

        let context = resolve_environment(&inputs).expect("resolve");
        assert_eq!(context.account(), "kaguya");
        assert_eq!(context.source(), AccountSource::Hint);
        assert_eq!(context.home_dir(), temp.path().join("kaguya"));
        assert_eq!(
            context.project_dir(),
            temp.path().join("kaguya").join(DEFAULT_PROJECT_NAME)
        );
    }

    #[test]
    fn unit_current_account_used_only_when_not_privileged() {
        let temp = tempdir().expect("tempdir");
        let mut inputs = inputs(temp.path());
        inputs.current_account = Some("operator".to_string());
        inputs.privileged = false;
        let context = resolve_environment(&inputs).expect("resolve");
        assert_eq!(context.account(), "operator");
        assert_eq!(context.source(), AccountSource::CurrentAccount);

        std::fs::create_dir_all(temp.path().join("ubuntu")).expect("ubuntu home");
        inputs.privileged = true;
        let context = resolve_environment(&inputs).expect("resolve privileged");
        assert_eq!(context.account(), "ubuntu");
        assert_eq!(context.source(), AccountSource::ConventionalName);
    }

    #[test]
    fn functional_conventional_names_follow_fixed_order() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("debian")).expect("debian home");
        std::fs::create_dir_all(temp.path().join("pi")).expect("pi home");
        let context = resolve_environment(&inputs(temp.path())).expect("resolve");
        assert_eq!(context.account(), "pi");
    }

    #[test]
    fn functional_home_scan_picks_lexicographically_first_directory() {
        let temp = tempdir().expect("tempdir");
        for name in ["zeta", "mika", ".hidden", "lost+found"] {
            std::fs::create_dir_all(temp.path().join(name)).expect("home dir");
        }
        std::fs::write(temp.path().join("aaa-not-a-dir"), "x").expect("file");
        let context = resolve_environment(&inputs(temp.path())).expect("resolve");
        assert_eq!(context.account(), "mika");
        assert_eq!(context.source(), AccountSource::HomeDirectoryScan);
        assert!(!context.project_dir_exists());
    }

    #[test]
    fn regression_empty_home_root_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let error = resolve_environment(&inputs(temp.path())).expect_err("must fail");
        assert!(matches!(error, EnvironmentError::NoAccount { .. }));
    }

    #[test]
    fn regression_root_and_blank_hints_are_skipped() {
        let temp = tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("pi")).expect("pi home");
        let mut inputs = inputs(temp.path());
        inputs.identity_hints = vec!["  ".to_string(), "root".to_string(), "../etc".to_string()];
        inputs.current_account = Some("root".to_string());
        inputs.privileged = false;
        let context = resolve_environment(&inputs).expect("resolve");
        assert_eq!(context.account(), "pi");
        assert_eq!(context.source(), AccountSource::ConventionalName);
    }

    #[test]
    fn regression_project_name_must_be_single_component() {
        let temp = tempdir().expect("tempdir");
        let mut inputs = inputs(temp.path());
        inputs.identity_hints = vec!["pi".to_string()];
        inputs.project_name = "../elsewhere".to_string();
        let error = resolve_environment(&inputs).expect_err("must fail");
        assert!(matches!(error, EnvironmentError::InvalidProjectName(_)));
    }

    #[test]
    fn integration_ids_and_runtime_dir_come_from_passwd() {
        let temp = tempdir().expect("tempdir");
        let passwd = temp.path().join("passwd");
        std::fs::write(&passwd, "pi:x:1000:1000::/home/pi:/bin/bash\n").expect("passwd");
        let mut inputs = inputs(temp.path());
        inputs.identity_hints = vec!["pi".to_string()];
        inputs.passwd_path = passwd;
        let context = resolve_environment(&inputs).expect("resolve");
        assert_eq!(context.ids(), Some(AccountIds { uid: 1000, gid: 1000 }));
        assert_eq!(context.runtime_dir(), Some(PathBuf::from("/run/user/1000")));
        assert!(context.privileged());
    }
}
