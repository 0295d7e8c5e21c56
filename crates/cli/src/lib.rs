pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "triago",
    about = "Triago operator CLI",
    long_about = "Inspect Triago configuration, validate instruction sets, and replay triage runs offline.",
    after_help = "Examples:\n  triago doctor --json\n  triago config\n  triago steps\n  triago replay scenarios/happy-path.toml"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Validate config, the instruction set, and function declarations")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "List the loaded instruction set with transitions and declared functions")]
    Steps,
    #[command(about = "Replay a scripted triage scenario through the engine, no live backends")]
    Replay {
        #[arg(help = "Path to a scenario TOML file")]
        scenario: PathBuf,
        #[arg(long, help = "Instruction directory to use instead of the scenario's steps_dir")]
        steps_dir: Option<PathBuf>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Steps => commands::CommandResult { exit_code: 0, output: commands::steps::run() },
        Command::Replay { scenario, steps_dir } => {
            commands::replay::run(&scenario, steps_dir.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
