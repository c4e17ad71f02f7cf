mod actions;
mod cancel;
mod cli;
mod config;
mod error;
mod logging;
mod monitor;
mod panel;
mod regions;
mod runner;
mod setup;
mod sim;
#[cfg(test)]
mod test_support;
mod types;
mod world;

use anyhow::Context;

use cli::{Cli, Command, DemoArgs};
use config::{StepSpec, TaskConfig};

fn demo(args: DemoArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => TaskConfig::load(path)
            .with_context(|| format!("cannot use task file {}", path.display()))?,
        None => TaskConfig::barrels(),
    };
    sim::run_demo(&config, args.cycles)?;
    Ok(())
}

fn check(path: &std::path::Path) -> anyhow::Result<()> {
    let config = TaskConfig::load(path)?;
    println!("task={} ok", config.name);
    for region in &config.regions {
        let label = region.label.as_deref().unwrap_or(&region.name);
        println!("region {} ({label})", region.name);
    }
    for (index, step) in config.steps.iter().enumerate() {
        match step {
            StepSpec::Craft { recipe, into } => {
                println!("step {index}: craft {recipe} into {into}")
            }
            StepSpec::Build {
                recipe,
                site,
                structure,
            } => println!("step {index}: build {structure} from {recipe} in {site}"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse_args();
    match cli.command {
        None => demo(DemoArgs::default()),
        Some(Command::Demo(args)) => demo(args),
        Some(Command::Preset) => {
            print!("{}", TaskConfig::barrels().to_yaml()?);
            Ok(())
        }
        Some(Command::Check(args)) => check(&args.path),
    }
}
