//! The imageio admin tool binary.

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let args = cli::frontend::Cli::parse();
    match cli::frontend::run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("imageioctl: {e}");
            ExitCode::FAILURE
        }
    }
}
