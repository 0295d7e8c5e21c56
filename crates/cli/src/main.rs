use std::process::ExitCode;

fn main() -> ExitCode {
    triago_cli::run()
}
