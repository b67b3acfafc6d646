//! Binary entry point: parse arguments, run the linker, report errors.

use std::process::ExitCode;

fn main() -> ExitCode {
    env_logger::init();

    let options = match rvld::cli::parse_args(std::env::args()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("rvld: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = rvld::context::link(options) {
        eprintln!("rvld: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
