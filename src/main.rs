//! pluginhost - dynamic plugin lifecycle manager.
//!
//! Discovers native plugin libraries in a directory and loads, starts, stops
//! and unloads them on command.

#![allow(clippy::single_match_else)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pluginhost::plugin::{self, spawn_periodic_rescan, LifecycleReport, LoadReport};
use pluginhost::{Config, PluginManager, PluginSnapshot};

/// Dynamic plugin lifecycle manager
#[derive(Parser)]
#[command(name = "pluginhost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (defaults to .pluginhost.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Plugin directory
    #[arg(short, long, global = true, env = "PLUGINHOST_DIR")]
    dir: Option<PathBuf>,

    /// Archive file extension
    #[arg(long, global = true)]
    extension: Option<String>,

    /// Seconds between background rescans
    #[arg(long, global = true, env = "PLUGINHOST_INTERVAL")]
    interval: Option<u64>,

    /// Timeout for a single start/stop call, in milliseconds
    #[arg(long, global = true, env = "PLUGINHOST_TIMEOUT")]
    timeout: Option<u64>,

    /// Grace period before releasing a stopped plugin, in milliseconds
    #[arg(long, global = true, env = "PLUGINHOST_GRACE_MS")]
    grace: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load plugins and read commands from stdin (default)
    Run,

    /// List plugin archives in the plugin directory
    Scan {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Load every archive once and list the plugins found
    List {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show configuration
    Config {
        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    // Setup logging; logs go to stderr so command output stays parseable.
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        None | Some(Commands::Run) => cmd_run(&config).await,
        Some(Commands::Scan { format }) => cmd_scan(&config, format),
        Some(Commands::List { format }) => cmd_list(&config, format).await,
        Some(Commands::Config { path }) => cmd_config(&config, path),
    }
}

/// Read the configuration file and apply command-line overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?,
        None => Config::load().context("Failed to read configuration")?,
    };

    let plugins = &mut config.plugins;
    if let Some(dir) = &cli.dir {
        plugins.directory.clone_from(dir);
    }
    if let Some(extension) = &cli.extension {
        plugins.extension.clone_from(extension);
    }
    if let Some(interval) = cli.interval {
        plugins.rescan_interval_secs = interval;
    }
    if let Some(timeout) = cli.timeout {
        plugins.call_timeout_ms = timeout;
    }
    if let Some(grace) = cli.grace {
        plugins.unload_grace_ms = grace;
    }

    plugins.validate()?;
    Ok(config)
}

/// Interactive mode: background rescan plus stdin commands.
async fn cmd_run(config: &Config) -> Result<()> {
    let manager = Arc::new(PluginManager::new(&config.plugins)?);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    {
        let shutdown_tx = Arc::clone(&shutdown_tx);
        ctrlc::set_handler(move || {
            let _ = shutdown_tx.send(true);
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    print_load(&manager.load_plugins().await?);
    let rescan = spawn_periodic_rescan(
        Arc::clone(&manager),
        config.plugins.rescan_interval(),
        shutdown_rx.clone(),
    );

    println!("Watching {} (type 'help' for commands)", manager.directory().display());
    let mut lines = spawn_stdin_reader();

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = shutdown_rx.changed() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => {}
            "load" => match manager.load_plugins().await {
                Ok(report) => print_load(&report),
                Err(e) => eprintln!("Error: {e}"),
            },
            "start" => print_lifecycle(&manager.start_plugins().await),
            "stop" => print_lifecycle(&manager.stop_plugins().await),
            "unload" => print_lifecycle(&manager.unload_plugins().await),
            "reload" => match manager.reload_plugins().await {
                Ok((stopped, loaded)) => {
                    print_lifecycle(&stopped);
                    print_load(&loaded);
                }
                Err(e) => eprintln!("Error: {e}"),
            },
            "list" => print_plugins(&manager.plugins()),
            "help" => print_help(),
            "exit" | "quit" => break,
            other => eprintln!("Unknown command '{other}' (type 'help' for commands)"),
        }
    }

    let _ = shutdown_tx.send(true);
    rescan.await.context("Rescan task failed")?;

    let report = manager.shutdown().await;
    if !report.is_success() {
        print_lifecycle(&report);
    }
    println!("Bye");
    Ok(())
}

/// Forward stdin lines from a detached thread, outside the runtime's
/// blocking pool so Ctrl-C never waits on a pending read.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// List archives without loading them.
fn cmd_scan(config: &Config, format: Format) -> Result<()> {
    let directory = config.plugins.resolved_directory();
    let records = plugin::scanner::scan(&directory, &config.plugins.extension)?;

    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&records)?;
            println!("{json}");
        }
        Format::Text => {
            for record in &records {
                println!("  {}", record.file_name());
            }
            println!("\nTotal: {} archives in {}", records.len(), directory.display());
        }
    }

    Ok(())
}

/// Load every archive once, list what was found, and release it again.
async fn cmd_list(config: &Config, format: Format) -> Result<()> {
    let manager = PluginManager::new(&config.plugins)?;
    let report = manager.load_plugins().await?;
    for error in &report.errors {
        eprintln!("Warning: {error}");
    }

    let plugins = manager.plugins();
    match format {
        Format::Json => {
            let json = serde_json::to_string_pretty(&plugins)?;
            println!("{json}");
        }
        Format::Text => print_plugins(&plugins),
    }

    manager.shutdown().await;
    Ok(())
}

/// Show configuration.
fn cmd_config(config: &Config, path: bool) -> Result<()> {
    if path {
        match Config::config_dir() {
            Some(dir) => println!("{}", dir.join("config.toml").display()),
            None => anyhow::bail!("Could not determine config directory"),
        }
        return Ok(());
    }

    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn print_load(report: &LoadReport) {
    for error in &report.errors {
        eprintln!("  ! {error}");
    }
    for path in &report.stale {
        println!("  ~ {} changed on disk, 'reload' to pick it up", path.display());
    }
    println!("{}", report.summary());
}

fn print_lifecycle(report: &LifecycleReport) {
    for error in &report.failed {
        eprintln!("  ! {error}");
    }
    println!("{}", report.summary());
}

fn print_plugins(plugins: &[PluginSnapshot]) {
    for plugin in plugins {
        let busy = if plugin.busy { " (busy)" } else { "" };
        println!("  {:<10} {}{}  [{}]", plugin.state.as_str(), plugin.name, busy, plugin.id);
    }
    println!("\nTotal: {} plugins", plugins.len());
}

fn print_help() {
    println!("Commands:");
    println!("  load    scan the plugin directory and load new archives");
    println!("  start   start every loaded or stopped plugin");
    println!("  stop    stop every running plugin");
    println!("  reload  stop, unload and load everything again");
    println!("  unload  release every stopped plugin");
    println!("  list    show plugins and their state");
    println!("  exit    stop everything and quit");
}
