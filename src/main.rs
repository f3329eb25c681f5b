//! Binary entry point for the `easyflake` CLI.

use std::process::ExitCode;

fn main() -> ExitCode {
    easyflake::cli::run()
}
