//! # nsvfs CLI
//!
//! Command-line interface for the nsvfs in-memory filesystem.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nsvfs_config::logging::{init_logging, LogLevel};
use nsvfs_config::{log_cli_debug, Config};
use nsvfs_core::{Capability, Credentials};
use nsvfs_snapshot::VfsImage;

mod script;

use script::ScriptRunner;

/// nsvfs - in-memory filesystem with POSIX removal semantics
#[derive(Parser)]
#[command(name = "nsvfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of the standard locations
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command script against a fresh filesystem
    Run {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// User id of the acting task
        #[arg(long, default_value_t = 0)]
        uid: u32,

        /// Group id of the acting task
        #[arg(long, default_value_t = 0)]
        gid: u32,

        /// Drop privilege overrides even for uid 0
        #[arg(long)]
        no_override: bool,
    },

    /// Show what a saved checkpoint image contains
    Inspect {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        default: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_overrides_from(|key| std::env::var(key).ok());
            config
        }
        None => nsvfs_config::config().clone(),
    };
    init_logging(LogLevel::parse(&config.logging.level));

    match cli.command {
        Commands::Run {
            script,
            uid,
            gid,
            no_override,
        } => cmd_run(&config, &script, credentials(uid, gid, no_override)),
        Commands::Inspect { image } => cmd_inspect(&image),
        Commands::Config { default } => {
            let text = if default {
                Config::default_toml()?
            } else {
                config.to_toml()?
            };
            print!("{}", text);
            Ok(())
        }
    }
}

fn credentials(uid: u32, gid: u32, no_override: bool) -> Credentials {
    if uid != 0 {
        return Credentials::user(uid, gid);
    }
    let mut cred = Credentials::root();
    cred.gid = gid;
    if no_override {
        cred = cred
            .without_capability(Capability::DacOverride)
            .without_capability(Capability::DacReadSearch)
            .without_capability(Capability::Fowner);
    }
    cred
}

fn cmd_run(config: &Config, script: &Path, cred: Credentials) -> Result<()> {
    let text = fs::read_to_string(script)
        .with_context(|| format!("Failed to read script {}", script.display()))?;
    log_cli_debug!("Running script", path = %script.display(), uid = cred.uid);

    let mut runner = ScriptRunner::new(config, cred)?;
    for line in runner.run(&text)? {
        println!("{}", line);
    }
    Ok(())
}

fn cmd_inspect(image: &Path) -> Result<()> {
    let summary = VfsImage::load(image)
        .with_context(|| format!("Failed to load image {}", image.display()))?
        .summary();
    println!("Image: {}", image.display());
    println!("  Objects:       {}", summary.objects);
    println!("  Orphans:       {}", summary.orphans);
    println!("  Handles:       {}", summary.handles);
    println!("  Content bytes: {}", summary.content_bytes);
    Ok(())
}
