//! Command-line interface and root bootstrap.

pub mod console;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;

use crate::adapters::scheduler::LocalScheduler;
use crate::domain::errors::{GatorError, EXIT_SPEC_ERROR};
use crate::domain::models::{JobGroup, JobSpec};
use crate::domain::ports::{ConsoleSink, Scheduler};
use crate::infrastructure::config::{Config, ConfigLoader};
use crate::infrastructure::{logging, specfile};
use crate::services::{Tier, Wrapper};
use console::ColoredConsole;

#[derive(Parser)]
#[command(name = "gator")]
#[command(about = "Hierarchical shell-job runner", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Explicit configuration file (defaults to .gator/config.yaml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a spec file as the root of a new job tree.
    Run {
        /// Path to the YAML spec.
        spec: PathBuf,

        /// Tracking directory for stores and spec dumps.
        #[arg(long)]
        tracking: Option<PathBuf>,

        /// Render DEBUG entries on the console.
        #[arg(short, long)]
        verbose: bool,

        /// Only render WARNING and above on the console.
        #[arg(short, long, conflicts_with = "verbose")]
        quiet: bool,

        /// Local scheduler concurrency (defaults to the CPU count).
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Supervise a group or array on behalf of a parent (internal).
    #[command(hide = true)]
    Tier {
        #[arg(long, env = "GATOR_IDENT")]
        ident: String,
        #[arg(long, env = "GATOR_PARENT")]
        parent: String,
        #[arg(long)]
        tracking: PathBuf,
    },

    /// Supervise one leaf job on behalf of a parent (internal).
    #[command(hide = true)]
    Wrapper {
        #[arg(long, env = "GATOR_IDENT")]
        ident: String,
        #[arg(long, env = "GATOR_PARENT")]
        parent: String,
        #[arg(long)]
        tracking: PathBuf,
    },
}

/// Run the selected command and return the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err:#}");
            return EXIT_SPEC_ERROR;
        }
    };
    if let Err(err) = logging::init(&config.logging) {
        eprintln!("error: {err:#}");
        return EXIT_SPEC_ERROR;
    }

    let outcome = match cli.command {
        Commands::Run {
            spec,
            tracking,
            verbose,
            quiet,
            concurrency,
        } => run_root(spec, tracking, verbose, quiet, concurrency, config).await,
        Commands::Tier {
            ident,
            parent,
            tracking,
        } => {
            let scheduler = match local_scheduler(&config, None) {
                Ok(scheduler) => scheduler,
                Err(err) => return fail(&err),
            };
            Tier::child(ident, parent, tracking, config, scheduler)
                .run()
                .await
        }
        Commands::Wrapper {
            ident,
            parent,
            tracking,
        } => Wrapper::new(ident, parent, tracking, config).run().await,
    };

    match outcome {
        Ok(code) => code,
        Err(err) => fail(&err),
    }
}

async fn run_root(
    spec_path: PathBuf,
    tracking: Option<PathBuf>,
    verbose: bool,
    quiet: bool,
    concurrency: Option<usize>,
    mut config: Config,
) -> Result<i32, GatorError> {
    if verbose {
        config.console.severity = "DEBUG".to_string();
    } else if quiet {
        config.console.severity = "WARNING".to_string();
    }
    if let Some(concurrency) = concurrency {
        config.scheduler.concurrency = concurrency;
    }

    let spec = specfile::parse_file(&spec_path)?;
    // The root process is always a tier; a bare job gets a synthetic
    // single-child group around it.
    let spec = match spec {
        JobSpec::Job(job) => JobSpec::Group(JobGroup {
            ident: job.ident.clone(),
            jobs: vec![JobSpec::Job(job)],
            ..JobGroup::default()
        }),
        other => other,
    };

    let tracking = tracking.unwrap_or_else(|| PathBuf::from(&config.tracking_dir));
    let console: Arc<dyn ConsoleSink> = Arc::new(ColoredConsole::new());
    let scheduler = local_scheduler(&config, concurrency)?;

    Tier::root(spec, tracking, config, scheduler, Some(console))
        .run()
        .await
}

fn local_scheduler(
    config: &Config,
    override_concurrency: Option<usize>,
) -> Result<Arc<dyn Scheduler>, GatorError> {
    let concurrency =
        override_concurrency.unwrap_or_else(|| config.scheduler.effective_concurrency());
    Ok(Arc::new(LocalScheduler::new(concurrency)?))
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

fn fail(err: &GatorError) -> i32 {
    error!(%err, "run failed");
    eprintln!("error: {err}");
    err.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::parse_from(["gator", "run", "spec.yaml", "--verbose"]);
        match cli.command {
            Commands::Run { spec, verbose, .. } => {
                assert_eq!(spec, PathBuf::from("spec.yaml"));
                assert!(verbose);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_wrapper_arguments() {
        let cli = Cli::parse_from([
            "gator",
            "wrapper",
            "--ident",
            "a",
            "--parent",
            "127.0.0.1:1234",
            "--tracking",
            "/tmp/track/a",
        ]);
        match cli.command {
            Commands::Wrapper { ident, parent, .. } => {
                assert_eq!(ident, "a");
                assert_eq!(parent, "127.0.0.1:1234");
            }
            _ => panic!("expected wrapper"),
        }
    }

    #[test]
    fn test_verbose_quiet_conflict() {
        assert!(Cli::try_parse_from(["gator", "run", "s.yaml", "-v", "-q"]).is_err());
    }
}
