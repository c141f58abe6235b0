mod commands;
mod helpers;

use clap::Parser;
use grism_core::GrismError;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().collect();
    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let engine_error = error.as_grism_error();
            eprintln!(
                "[{}] {}: {}",
                engine_error.category(),
                engine_error.code(),
                engine_error.message()
            );
            error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let args: Vec<String> = args.into_iter().map(Into::into).collect();
    match Cli::try_parse_from(&args) {
        Ok(cli) => dispatch(cli.command),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{err}");
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

fn dispatch(command: CliCommand) -> Result<i32, CliError> {
    match command {
        CliCommand::Simulate(args) => commands::run_simulate(args),
        CliCommand::Extract(args) => commands::run_extract(args),
    }
}

#[derive(Parser)]
#[command(name = "grism-rs", about = "Grism spectral-order extraction engine")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Write a synthetic scene description for testing the extractor
    Simulate(commands::SimulateArgs),
    /// Reduce a scene into per-order spectra
    Extract(commands::ExtractArgs),
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Engine(GrismError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl CliError {
    fn as_grism_error(&self) -> GrismError {
        match self {
            Self::Usage(message) => GrismError::input_validation("INPUT.CLI_USAGE", message.clone()),
            Self::Engine(error) => error.clone(),
            Self::Io(error) => GrismError::internal("IO.CLI", format!("{error:#}")),
        }
    }

    fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Engine(_) => 1,
            Self::Io(_) => 1,
        }
    }
}

impl From<GrismError> for CliError {
    fn from(error: GrismError) -> Self {
        Self::Engine(error)
    }
}
