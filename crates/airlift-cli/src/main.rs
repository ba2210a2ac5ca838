// SPDX-License-Identifier: MIT OR Apache-2.0
//! `airlift` — over-the-air update client CLI.

#![deny(unsafe_code)]

use airlift_config::{ClientConfig, ConfigFile, validate_proxy_env};
use airlift_engine::daemon::{Daemon, NoopInventory, SystemRebooter};
use airlift_engine::{EngineContext, ResultFlags, standalone};
use airlift_error::ErrorKind;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for generic failures.
const EXIT_FAILURE: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "airlift", version, about = "Over-the-air update client")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "/etc/airlift/airlift.conf")]
    config: PathBuf,

    /// Fallback configuration file, merged under the main one.
    #[arg(long, default_value = "/var/lib/airlift/airlift.conf")]
    fallback_config: PathBuf,

    /// Log level: error, warn, info, debug, trace.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data directory (state store, device type, module trees).
    #[arg(long, default_value = "/var/lib/airlift")]
    data: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the header of an artifact file.
    ShowArtifact {
        /// Artifact path.
        path: PathBuf,
    },

    /// Print the provides currently recorded for this device.
    ShowProvides,

    /// Install an artifact from a local path or an http(s) URL.
    Install {
        /// Artifact path or URL.
        src: String,
        /// Exit with code 4 when a reboot is required.
        #[arg(long)]
        reboot_exit_code: bool,
    },

    /// Resume an interrupted install/commit/rollback.
    Resume {
        /// Exit with code 4 when a reboot is required.
        #[arg(long)]
        reboot_exit_code: bool,
    },

    /// Commit an installed-but-uncommitted update.
    Commit,

    /// Roll back an installed-but-uncommitted update.
    Rollback,

    /// Run the update daemon.
    Daemon,

    /// Ask a running daemon to check for updates now.
    CheckUpdate,

    /// Ask a running daemon to submit inventory now.
    SendInventory,
}

fn main() {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "cannot start the async runtime");
            std::process::exit(EXIT_FAILURE);
        }
    };
    let code = runtime.block_on(run(cli)).unwrap_or_else(|err| {
        error!("{err:#}");
        EXIT_FAILURE
    });
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    validate_proxy_env(|key| std::env::var(key).ok())?;

    match cli.command {
        Commands::ShowArtifact { ref path } => show_artifact(path),
        Commands::ShowProvides => {
            let ctx = engine_context(&cli)?;
            show_provides(&ctx)
        }
        Commands::Install {
            ref src,
            reboot_exit_code,
        } => {
            let ctx = engine_context(&cli)?;
            let cancel = cancel_on_interrupt();
            standalone::install_bootstrap_artifact(&ctx, &cancel)
                .await
                .unwrap_or_else(|err| error!(%err, "bootstrap artifact install failed"));
            let outcome = standalone::install(&ctx, src, &cancel).await;
            finish_standalone(outcome, reboot_exit_code)
        }
        Commands::Resume { reboot_exit_code } => {
            let ctx = engine_context(&cli)?;
            let cancel = cancel_on_interrupt();
            let outcome = standalone::resume(&ctx, &cancel).await;
            finish_standalone(outcome, reboot_exit_code)
        }
        Commands::Commit => {
            let ctx = engine_context(&cli)?;
            let cancel = cancel_on_interrupt();
            let outcome = standalone::commit(&ctx, &cancel).await;
            finish_standalone(outcome, false)
        }
        Commands::Rollback => {
            let ctx = engine_context(&cli)?;
            let cancel = cancel_on_interrupt();
            let outcome = standalone::rollback(&ctx, &cancel).await;
            finish_standalone(outcome, false)
        }
        Commands::Daemon => run_daemon(&cli).await,
        Commands::CheckUpdate => signal_daemon(&cli, nix::sys::signal::Signal::SIGUSR1),
        Commands::SendInventory => signal_daemon(&cli, nix::sys::signal::Signal::SIGUSR2),
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let main = match ConfigFile::load(&cli.config) {
        Ok(config) => config,
        Err(airlift_config::ConfigError::Unreadable { path, .. }) => {
            warn!(config = %path, "main config missing, using fallback only");
            ConfigFile::default()
        }
        Err(err) => return Err(err.into()),
    };
    let fallback = match ConfigFile::load(&cli.fallback_config) {
        Ok(config) => config,
        Err(airlift_config::ConfigError::Unreadable { .. }) => ConfigFile::default(),
        Err(err) => return Err(err.into()),
    };
    Ok(ClientConfig::resolve(main.merged_over(fallback), &cli.data))
}

fn engine_context(cli: &Cli) -> Result<EngineContext> {
    let config = load_config(cli)?;
    EngineContext::open(config).context("cannot open the client state")
}

fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; cancelling the running operation");
            trigger.cancel();
        }
    });
    cancel
}

fn finish_standalone(outcome: airlift_engine::ResultAndError, reboot_exit_code: bool) -> Result<i32> {
    if let Some(ref err) = outcome.error {
        error!("{err}");
    }
    if outcome.result.contains(ResultFlags::NO_UPDATE_IN_PROGRESS) {
        println!("No update in progress.");
    } else if outcome.result.contains(ResultFlags::COMMITTED) {
        println!("Update committed.");
    } else if outcome.result.contains(ResultFlags::ROLLED_BACK) {
        println!("Update rolled back.");
    } else if outcome.result.contains(ResultFlags::INSTALLED)
        && !outcome.result.contains(ResultFlags::FAILED)
    {
        println!("Update installed, but not committed.");
        println!("Use 'airlift commit' to make it permanent, or 'airlift rollback' to undo.");
    }
    if outcome.result.contains(ResultFlags::REBOOT_REQUIRED)
        && !outcome.result.contains(ResultFlags::FAILED)
    {
        println!("A reboot is required to complete the update.");
    }
    Ok(outcome.result.exit_code(reboot_exit_code))
}

fn show_artifact(path: &PathBuf) -> Result<i32> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("cannot open '{}'", path.display()))?;
    let artifact = airlift_artifact::parse(file, &airlift_artifact::ParserConfig::default())
        .context("cannot parse artifact")?;
    let header = artifact.header();

    println!("Artifact name: {}", header.artifact_name());
    if !header.artifact_group().is_empty() {
        println!("Artifact group: {}", header.artifact_group());
    }
    println!(
        "Payload type: {}",
        if header.is_empty_payload() {
            "(empty payload)"
        } else {
            header.payload_type()
        }
    );
    for (key, values) in header.combined_depends() {
        println!("Depends: {key}={}", values.join(","));
    }
    if let Some(provides) = header.provides() {
        for (key, value) in provides {
            println!("Provides: {key}={value}");
        }
    }
    if let Some(clears) = header.clears_provides() {
        for pattern in clears {
            println!("Clears provides: {pattern}");
        }
    }
    Ok(0)
}

fn show_provides(ctx: &EngineContext) -> Result<i32> {
    for (key, value) in ctx.device.load_provides()? {
        println!("{key}={value}");
    }
    Ok(0)
}

async fn run_daemon(cli: &Cli) -> Result<i32> {
    let ctx = engine_context(cli)?;
    if ctx.config.server_url.is_empty() {
        bail!("daemon mode needs a ServerURL in the configuration");
    }

    let cancel = cancel_on_interrupt();
    standalone::install_bootstrap_artifact(&ctx, &cancel)
        .await
        .unwrap_or_else(|err| error!(%err, "bootstrap artifact install failed"));

    let token = std::fs::read_to_string(ctx.config.data_dir.join("authtoken"))
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    let api = airlift_api::ApiClient::new(
        &ctx.config.server_url,
        ctx.http.clone(),
        Arc::new(airlift_api::StaticTokenProvider::new(token)),
    )?;

    let pid_file = ctx.config.pid_file_path();
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .with_context(|| format!("cannot write pid file {}", pid_file.display()))?;

    info!(server = %ctx.config.server_url, "daemon starting");
    let daemon = Daemon::new(
        ctx,
        api,
        Arc::new(SystemRebooter),
        Arc::new(NoopInventory),
        cancel.clone(),
    );
    let result = daemon.run().await;

    if let Err(err) = std::fs::remove_file(&pid_file) {
        warn!(%err, "could not remove pid file");
    }
    match result {
        Ok(()) => Ok(0),
        Err(err) => {
            if err.is(ErrorKind::Cancelled) {
                Ok(0)
            } else {
                Err(anyhow::anyhow!(err.to_string()))
            }
        }
    }
}

fn signal_daemon(cli: &Cli, signal: nix::sys::signal::Signal) -> Result<i32> {
    let config = load_config(cli)?;
    let pid_file = config.pid_file_path();
    let raw = std::fs::read_to_string(&pid_file)
        .with_context(|| format!("no running daemon (cannot read {})", pid_file.display()))?;
    let pid: i32 = raw
        .trim()
        .parse()
        .with_context(|| format!("bad pid file {}", pid_file.display()))?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
        .with_context(|| format!("cannot signal daemon process {pid}"))?;
    info!(pid, signal = %signal, "daemon notified");
    Ok(0)
}
