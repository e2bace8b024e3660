//! Foundational low-level utilities shared across tsuki crates.
//!
//! Provides atomic file writes, time helpers, account lookups, acting-account
//! resolution, the append-only narrative log, and the invocation guard.

pub mod account_db;
pub mod atomic_io;
pub mod environment;
pub mod invocation_guard;
pub mod log_sink;
pub mod time_utils;

pub use account_db::{
    chown_to_account, current_process_is_privileged, lookup_account_ids, AccountIds,
    PRIVILEGED_ACCOUNT,
};
pub use atomic_io::{set_mode, write_text_atomic};
pub use environment::{
    resolve_environment, AccountSource, EnvironmentContext, EnvironmentError, ResolverInputs,
    DEFAULT_HOME_ROOT, DEFAULT_PROJECT_NAME, TARGET_ACCOUNT_ENV,
};
pub use invocation_guard::{acquire_invocation_guard, GuardError, InvocationGuard, GUARD_FILE_NAME};
pub use log_sink::{LogSink, LogSinkConfig, LogSinkError, LogSinkLocation};
pub use time_utils::{
    current_unix_timestamp_ms, local_log_timestamp,
    local_rfc3339_timestamp,
};
