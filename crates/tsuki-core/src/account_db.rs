//! Account lookups against the host's passwd database and process credentials.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Name of the privileged account; never resolved as the acting account.
pub const PRIVILEGED_ACCOUNT: &str = "root";
pub const DEFAULT_PASSWD_PATH: &str = "/etc/passwd";
const PROC_SELF_STATUS_PATH: &str = "/proc/self/status";

/// Numeric identity of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIds {
    pub uid: u32,
    pub gid: u32,
}

/// Looks up `account` in a passwd-format file. Missing file or entry yields `None`.
pub fn lookup_account_ids(passwd_path: &Path, account: &str) -> Option<AccountIds> {
    let raw = std::fs::read_to_string(passwd_path).ok()?;
    parse_passwd_entry(&raw, account)
}

/// Finds `account` in passwd-format text (`name:pw:uid:gid:gecos:home:shell`).
pub fn parse_passwd_entry(raw: &str, account: &str) -> Option<AccountIds> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split(':');
            if fields.next()? != account {
                return None;
            }
            let _password = fields.next()?;
            let uid = fields.next()?.parse::<u32>().ok()?;
            let gid = fields.next()?.parse::<u32>().ok()?;
            Some(AccountIds { uid, gid })
        })
}

/// Returns true when the effective uid of this process is 0.
pub fn current_process_is_privileged() -> bool {
    std::fs::read_to_string(PROC_SELF_STATUS_PATH)
        .ok()
        .and_then(|raw| parse_effective_uid(&raw))
        .map(|uid| uid == 0)
        .unwrap_or(false)
}

/// Extracts the effective uid (second column of `Uid:`) from `/proc/<pid>/status` text.
pub fn parse_effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|value| value.parse::<u32>().ok())
}

/// Hands ownership of `path` to the account.
pub fn chown_to_account(path: &Path, ids: AccountIds) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(ids.uid), Some(ids.gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD_FIXTURE: &str = "\
root:x:0:0:root:/root:/bin/bash
# comment line
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
pi:x:1000:1000:,,,:/home/pi:/bin/bash
broken:x:notanumber:1001::/home/broken:/bin/sh
";

    #[test]
    fn unit_parse_passwd_entry_finds_uid_and_gid() {
        assert_eq!(
            parse_passwd_entry(PASSWD_FIXTURE, "pi"),
            Some(AccountIds {
                uid: 1000,
                gid: 1000
            })
        );
        assert_eq!(
            parse_passwd_entry(PASSWD_FIXTURE, "root"),
            Some(AccountIds { uid: 0, gid: 0 })
        );
    }

    #[test]
    fn regression_parse_passwd_entry_rejects_prefix_and_malformed_rows() {
        assert_eq!(parse_passwd_entry(PASSWD_FIXTURE, "p"), None);
        assert_eq!(parse_passwd_entry(PASSWD_FIXTURE, "broken"), None);
        assert_eq!(parse_passwd_entry(PASSWD_FIXTURE, "nobody"), None);
    }

    #[test]
    fn unit_parse_effective_uid_reads_second_uid_column() {
        let status = "Name:\tcat\nUmask:\t0022\nUid:\t1000\t0\t0\t0\nGid:\t1000\t1000\t1000\t1000\n";
        assert_eq!(parse_effective_uid(status), Some(0));
        assert_eq!(parse_effective_uid("Name:\tcat\n"), None);
    }

    #[test]
    fn functional_lookup_account_ids_reads_file_and_tolerates_missing_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let passwd = temp.path().join("passwd");
        std::fs::write(&passwd, PASSWD_FIXTURE).expect("write passwd");
        assert_eq!(
            lookup_account_ids(&passwd, "daemon"),
            Some(AccountIds { uid: 1, gid: 1 })
        );
        assert_eq!(lookup_account_ids(&temp.path().join("missing"), "pi"), None);
    }
}
