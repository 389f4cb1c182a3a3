//! apphost-remote — browse a hosted app's files and open debug tunnels.
//!
//! Subcommands:
//!   - `tunnel`               — relay a local port to the host's debug tunnel
//!   - `ls [PATH]`            — list a directory
//!   - `stat PATH`            — show entry metadata
//!   - `cat PATH`             — write a file to stdout
//!   - `put PATH --from FILE` — upload a local file
//!   - `mkdir PATH`           — create a directory
//!   - `rm [-r] PATH`         — delete a file or directory
//!
//! Paths are relative to the host's home directory.  Host and credentials
//! come from flags or `APPHOST_*` environment variables.

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use apphost_remote::cache::EntryKind;
use apphost_remote::client::kudu::KuduClient;
use apphost_remote::config::Config;
use apphost_remote::errors::RemoteResult;
use apphost_remote::host::{HostHandle, HostRegistry};
use apphost_remote::orchestrator::{
    DebuggerAttach, RemoteDebugOrchestrator, RemoteSettings, SettingsOutcome,
};
use apphost_remote::vfs::RemoteFs;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "apphost-remote",
    version,
    about = "Browse a hosted web app's files and tunnel a debugger to it"
)]
struct Cli {
    /// JSON configuration file
    #[arg(long, short = 'c', env = "APPHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short = 'v')]
    verbose: bool,

    #[command(flatten)]
    host: HostArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct HostArgs {
    /// Management host name, e.g. myapp.scm.azurewebsites.net
    #[arg(long, env = "APPHOST_SCM_HOST")]
    scm_host: String,

    /// Public site host name, probed by the keep-alive
    #[arg(long, env = "APPHOST_SITE_HOST")]
    site_host: Option<String>,

    /// Host identifier used in addresses (default: the management host)
    #[arg(long, env = "APPHOST_ID")]
    host_id: Option<String>,

    /// Publishing user name
    #[arg(long, env = "APPHOST_USER")]
    user: String,

    /// Publishing password
    #[arg(long, env = "APPHOST_PASSWORD", hide_env_values = true)]
    password: String,

    /// Refuse every modification
    #[arg(long)]
    read_only: bool,
}

impl HostArgs {
    fn handle(&self) -> HostHandle {
        let id = self.host_id.clone().unwrap_or_else(|| self.scm_host.clone());
        let handle = HostHandle::new(id, &self.scm_host, &self.user, &self.password);
        match &self.site_host {
            Some(site) => handle.with_site_host(site),
            None => handle,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Relay a local port to the host's debug tunnel until interrupted
    Tunnel {
        /// Local port (default: configured, else OS-assigned)
        #[arg(long, short = 'p')]
        port: Option<u16>,

        /// Probe the site while the tunnel comes up
        #[arg(long)]
        keepalive: bool,
    },
    /// List a directory
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Show entry metadata
    Stat { path: String },
    /// Write a file to stdout
    Cat { path: String },
    /// Upload a local file
    Put {
        path: String,

        /// Local file to upload
        #[arg(long)]
        from: PathBuf,
    },
    /// Create a directory
    Mkdir { path: String },
    /// Delete a file or directory
    Rm {
        path: String,

        #[arg(long, short = 'r')]
        recursive: bool,
    },
}

// ---------------------------------------------------------------------------
// Debugger collaborators
// ---------------------------------------------------------------------------

/// Host settings are managed outside this tool.
struct ManagedElsewhere;

#[async_trait]
impl RemoteSettings for ManagedElsewhere {
    async fn ensure_remote_debugging(&self, host: &HostHandle) -> RemoteResult<SettingsOutcome> {
        info!(host = %host.id, "assuming remote debugging is enabled on the host");
        Ok(SettingsOutcome::AlreadyEnabled)
    }
}

/// Tells the user where to point their debugger.
struct PrintAddress;

#[async_trait]
impl DebuggerAttach for PrintAddress {
    async fn attach(&self, local_addr: SocketAddr) -> RemoteResult<()> {
        println!("debug tunnel listening on {local_addr}");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn tunnel(
    handle: HostHandle,
    mut config: Config,
    port: Option<u16>,
    keepalive: bool,
) -> anyhow::Result<()> {
    config.keepalive.enabled |= keepalive;
    let orchestrator = RemoteDebugOrchestrator::new(
        handle,
        config,
        Arc::new(ManagedElsewhere),
        Arc::new(PrintAddress),
    )?;
    let session = orchestrator
        .attach(port)
        .await
        .context("failed to open the debug tunnel")?;

    tokio::select! {
        outcome = session.wait() => outcome.context("debug tunnel closed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, closing the tunnel"),
    }
    session.detach().await;
    Ok(())
}

fn open_fs(handle: &HostHandle, config: &Config) -> anyhow::Result<RemoteFs> {
    let client = KuduClient::new(handle)
        .with_context(|| format!("cannot reach {}", handle.scm_host))?;
    let hosts = Arc::new(HostRegistry::new());
    hosts.register(handle.clone(), Arc::new(client))?;
    Ok(RemoteFs::new(hosts, config))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.read_only |= cli.host.read_only;
    let handle = cli.host.handle();

    if let Command::Tunnel { port, keepalive } = cli.command {
        return tunnel(handle, config, port, keepalive).await;
    }

    let fs = open_fs(&handle, &config)?;
    let uri = |path: &str| fs.uri_for(&handle.id, path);

    match cli.command {
        Command::Tunnel { .. } => {}
        Command::Ls { path } => {
            let mut out = std::io::stdout().lock();
            for (name, kind) in fs.read_directory(&uri(&path)).await? {
                let suffix = if kind == EntryKind::Directory { "/" } else { "" };
                writeln!(out, "{name}{suffix}")?;
            }
        }
        Command::Stat { path } => {
            let stat = fs.stat(&uri(&path)).await?;
            let kind = match stat.kind {
                EntryKind::File => "file",
                EntryKind::Directory => "directory",
            };
            println!("kind:     {kind}");
            println!("size:     {}", stat.size);
            if let Some(created) = stat.created {
                println!("created:  {}", created.to_rfc3339());
            }
            if let Some(modified) = stat.modified {
                println!("modified: {}", modified.to_rfc3339());
            }
        }
        Command::Cat { path } => {
            let data = fs.read_file(&uri(&path)).await?;
            std::io::stdout().lock().write_all(&data)?;
        }
        Command::Put { path, from } => {
            let data = tokio::fs::read(&from)
                .await
                .with_context(|| format!("cannot read {}", from.display()))?;
            fs.write_file(&uri(&path), Bytes::from(data)).await?;
        }
        Command::Mkdir { path } => fs.create_directory(&uri(&path)).await?,
        Command::Rm { path, recursive } => fs.delete(&uri(&path), recursive).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("apphost-remote: {e:#}");
            ExitCode::FAILURE
        }
    }
}
