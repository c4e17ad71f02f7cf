//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Looped gather/craft/build task with interactive region setup.
///
/// Without a subcommand the built-in barrel task runs against the simulated
/// world for three cycles.
#[derive(Parser, Debug)]
#[command(name = "craft_loop")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a task against the simulated world.
    Demo(DemoArgs),

    /// Print the built-in barrel task as YAML.
    Preset,

    /// Validate a task file and list its regions and steps.
    Check(CheckArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Task file to run instead of the built-in barrel task.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Cycles to complete before cancelling the task.
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(1..))]
    pub cycles: u64,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            config: None,
            cycles: 3,
        }
    }
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Path to the task YAML file.
    pub path: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
