//! CLI argument model and validation for the `tsuki-setup` binary.
//!
//! Every flag carries a `TSUKI_*` environment binding so boot-time triggers
//! can configure the orchestrator without editing the trigger line.

pub mod cli_args;
pub mod cli_types;
pub mod validation;

pub use cli_args::Cli;
pub use cli_types::*;
pub use validation::*;
