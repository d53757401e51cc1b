mod config;
mod constants;
mod job;
mod queue;
mod settings;
mod slicer;
mod utils;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigLocation, ConfigStore, ValidationPolicy};
use crate::constants::{DEFAULT_SETTING_VALUE, DEFAULT_SLICER_PROGRAM};
use crate::job::{JobOutcome, SliceSession};
use crate::queue::{JobReport, QueueError, SliceQueue};
use crate::settings::SettingKey;
use crate::slicer::{SlicerInvoker, SlicerOptions};

/// Extruder print settings and model slicing through mandoline.
#[derive(Parser, Debug)]
#[command(name = "extruder-rs", version, max_term_width = 80)]
struct Cli {
    /// Configuration file to use instead of the one beside the executable.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep the configuration in the user's configuration directory.
    #[arg(long, global = true, conflicts_with = "config")]
    user_config: bool,
    /// Fall back to default values instead of failing on a missing or
    /// damaged configuration.
    #[arg(long, global = true)]
    lenient: bool,
    /// Slicer executable.
    #[arg(long, global = true, default_value = DEFAULT_SLICER_PROGRAM)]
    slicer: OsString,
    /// Extra argument placed before the slicer's own arguments. Repeatable.
    #[arg(long = "slicer-arg", global = true, allow_hyphen_values = true)]
    slicer_args: Vec<OsString>,
    /// Kill the slicer if it runs longer than this many seconds.
    #[arg(long, global = true)]
    timeout: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the stored extruder settings.
    Settings,
    /// Change one extruder setting.
    Set {
        /// SpeedPercentage or InfillLayerHeight.
        key: SettingKey,
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },
    /// Write defaults for every setting that is not stored yet.
    Init,
    /// Validate models and slice them to G-code.
    Slice {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// G-code file to write. Defaults to the model's name with a .gcode extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check that the slicer can be started.
    Check,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        let location = match (&self.config, self.user_config) {
            (Some(path), _) => ConfigLocation::Explicit(path.clone()),
            (None, true) => ConfigLocation::UserConfigDir,
            (None, false) => ConfigLocation::BesideExecutable,
        };
        location.resolve()
    }

    fn policy(&self) -> ValidationPolicy {
        if self.lenient {
            ValidationPolicy::Lenient
        } else {
            ValidationPolicy::Strict
        }
    }

    fn open_store(&self) -> Result<ConfigStore> {
        let path = self.config_path();
        ConfigStore::open(&path, &SettingKey::ALL, self.policy())
            .with_context(|| format!("Failed to load settings from {}", path.display()))
    }

    fn slicer(&self) -> SlicerInvoker {
        SlicerInvoker::new(SlicerOptions {
            program: self.slicer.clone(),
            leading_args: self.slicer_args.clone(),
            timeout: self.timeout.map(Duration::from_secs),
            ..SlicerOptions::default()
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Command::Settings => show_settings(cli),
        Command::Set { key, value } => set_setting(cli, *key, *value),
        Command::Init => init_settings(cli),
        Command::Slice { inputs, output } => slice_models(cli, inputs, output.as_deref()).await,
        Command::Check => check_slicer(cli),
    }
}

fn print_setting(key: SettingKey, value: i64) {
    println!("{}: {}{}", key.label(), value, key.unit());
}

fn show_settings(cli: &Cli) -> Result<()> {
    // A broken configuration only disables the settings block, not the command.
    let store = match cli.open_store() {
        Ok(store) => store,
        Err(e) => {
            println!("Settings unavailable: {:#}", e);
            return Ok(());
        }
    };

    println!(
        "Configuration: {} ({:?})",
        store.path().display(),
        store.policy()
    );
    for (key, value) in store.snapshot() {
        match value {
            Ok(value) => print_setting(key, value),
            Err(e) => {
                tracing::warn!("Setting {} is unusable", e.key());
                println!("{}: unavailable ({})", key.label(), e);
            }
        }
    }
    Ok(())
}

fn set_setting(cli: &Cli, key: SettingKey, value: i64) -> Result<()> {
    let range = key.range();
    if !range.contains(&value) {
        bail!(
            "{} must be between {} and {}, got {}",
            key.label(),
            range.start(),
            range.end(),
            value
        );
    }

    let mut store = cli.open_store()?;
    store
        .set(key, value)
        .with_context(|| format!("Failed to save {}", key))?;
    print_setting(key, value);
    store.close()?;
    Ok(())
}

fn init_settings(cli: &Cli) -> Result<()> {
    let path = cli.config_path();
    let mut store = ConfigStore::open(&path, &SettingKey::ALL, ValidationPolicy::Lenient)?;
    let mut written = 0;
    for key in SettingKey::ALL {
        if !store.contains(key) {
            store
                .set(key, DEFAULT_SETTING_VALUE)
                .with_context(|| format!("Failed to initialize {}", key))?;
            print_setting(key, DEFAULT_SETTING_VALUE);
            written += 1;
        }
    }
    store.close()?;
    println!(
        "{} setting(s) initialized in {}",
        written,
        path.display()
    );
    Ok(())
}

async fn slice_models(cli: &Cli, inputs: &[PathBuf], output: Option<&Path>) -> Result<()> {
    if output.is_some() && inputs.len() > 1 {
        bail!("--output can only be used with a single model");
    }

    let queue = SliceQueue::new(Arc::new(cli.slicer()));
    let mut session = SliceSession::new();
    let mut failures = 0;

    for input in inputs {
        let source = input.canonicalize().unwrap_or_else(|_| input.clone());
        let job = session.take_job(&source, output);
        match queue.submit(job).await {
            Ok(JobReport { job, result }) => {
                match result {
                    Ok(JobOutcome::Sliced) => {
                        println!("Slice to G-code successful: {}", job.output().display())
                    }
                    Ok(JobOutcome::AlreadySliced) => {
                        println!("Model already sliced: {}", job.source().display())
                    }
                    Err(e) => {
                        if job.is_validated() && !job.is_sliced() {
                            println!("Model validation successful: {}", job.source().display());
                        }
                        eprintln!("{}: {}", job.source().display(), e);
                        failures += 1;
                    }
                }
                session.store(job);
            }
            Err(QueueError::Busy { job }) | Err(QueueError::Closed { job }) => {
                eprintln!("{}: slicer unavailable", job.source().display());
                session.store(job);
                failures += 1;
            }
            Err(e @ QueueError::Worker) => {
                eprintln!("{}: {}", source.display(), e);
                failures += 1;
            }
        }
    }

    queue.shutdown().await;
    if failures > 0 {
        bail!("{} of {} model(s) failed", failures, inputs.len());
    }
    Ok(())
}

fn check_slicer(cli: &Cli) -> Result<()> {
    let slicer = cli.slicer();
    let program = slicer.options().program.to_string_lossy().into_owned();
    slicer
        .probe()
        .with_context(|| format!("{} cannot be started", program))?;
    println!("{} is available", program);
    Ok(())
}
