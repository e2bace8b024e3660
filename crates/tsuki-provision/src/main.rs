mod bootstrap_helpers;

use std::process::ExitCode;

use clap::Parser;
use tsuki_cli::Cli;
use tsuki_provision::exit_codes::{EXIT_INVALID_ARGUMENTS, EXIT_SUCCESS};
use tsuki_provision::startup_dispatch::run_cli;

use crate::bootstrap_helpers::init_tracing;

fn main() -> ExitCode {
    init_tracing();
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() {
                EXIT_INVALID_ARGUMENTS
            } else {
                EXIT_SUCCESS
            };
            let _ = error.print();
            return ExitCode::from(code);
        }
    };
    ExitCode::from(run_cli(&cli))
}
