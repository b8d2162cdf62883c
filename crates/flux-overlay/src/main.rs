use std::io::IsTerminal;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use flux_core::{Handle, Reactor, RpcFlags};

use flux_overlay::errors::errors_report;
use flux_overlay::fsd;
use flux_overlay::health::{StatusFilter, StatusOptions, highlight_ranks, status_report};
use flux_overlay::topology::OverlayCtx;

#[derive(Debug, Parser)]
#[command(name = "flux-overlay", version, about = "Manage the overlay network")]
struct Cli {
    /// Broker URI (tcp://HOST:PORT or unix://PATH)
    #[arg(long, env = "FLUX_URI")]
    uri: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Display overlay subtree health status
    Status(StatusArgs),
    /// Summarize overlay errors
    Errors(ErrorsArgs),
    /// Translate a rank idset to a hostlist or the reverse
    Lookup {
        target: String,
    },
    /// Show the parent of RANK
    Parentof {
        rank: u32,
    },
    /// Disconnect a subtree rooted at TARGET (hostname or rank)
    Disconnect(DisconnectArgs),
}

#[derive(Debug, Args)]
struct StatusArgs {
    /// Check health of the subtree rooted at NODEID
    #[arg(short, long, value_name = "NODEID", default_value_t = 0)]
    rank: u32,

    /// Reporting detail: 1=show time in state, 2=show round-trip RPC times
    #[arg(short, long, value_name = "LEVEL", default_value_t = 0)]
    verbose: i32,

    /// RPC timeout (FSD), 0 disables
    #[arg(short, long, value_name = "FSD", default_value = "0.5")]
    timeout: String,

    /// Show only the root subtree status
    #[arg(long, conflicts_with = "down")]
    summary: bool,

    /// Show only the partial/degraded subtrees
    #[arg(long)]
    down: bool,

    /// Do not indent entries or draw the overlay tree structure
    #[arg(long)]
    no_pretty: bool,

    /// Do not fill in the presumed state of nodes that are inaccessible
    /// behind offline/lost overlay parents
    #[arg(long)]
    no_ghost: bool,

    /// Colorize output: always, never, or auto
    #[arg(long, value_name = "WHEN", default_value = "auto")]
    color: String,

    /// Highlight one or more TARGETs (rank idset or hostlist) and their
    /// ancestors
    #[arg(long, value_name = "TARGET")]
    highlight: Vec<String>,

    /// Wait until the subtree enters STATE before reporting
    /// (full, partial, degraded, offline, lost)
    #[arg(short, long, value_name = "STATE")]
    wait: Option<String>,
}

#[derive(Debug, Args)]
struct ErrorsArgs {
    /// RPC timeout (FSD), 0 disables
    #[arg(short, long, value_name = "FSD", default_value = "0.5")]
    timeout: String,
}

#[derive(Debug, Args)]
struct DisconnectArgs {
    target: String,

    /// Parent rank (default: determine from topology)
    #[arg(short = 'r', long, value_name = "NODEID")]
    parent: Option<u32>,
}

fn parse_timeout(fsd: &str) -> Result<Option<Duration>> {
    let secs = fsd::parse_duration(fsd)?;
    if secs == 0.0 {
        Ok(None)
    } else {
        Ok(Some(Duration::from_secs_f64(secs)))
    }
}

fn use_color(when: &str) -> Result<bool> {
    match when {
        "always" => Ok(true),
        "never" => Ok(false),
        "auto" => Ok(std::io::stdout().is_terminal()),
        other => bail!("invalid argument to --color: {:?}", other),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    tracing::debug!(uri = %cli.uri, "connecting to broker");
    let handle = Handle::connect(&cli.uri)
        .await
        .with_context(|| format!("connecting to {}", cli.uri))?;
    let reactor = Reactor::new();
    let pump = reactor.handle_watcher(handle.clone());
    pump.start();
    tokio::spawn({
        let reactor = reactor.clone();
        async move {
            let _ = reactor.run().await;
        }
    });

    let ctx = OverlayCtx::new(handle);
    let mut stdout = std::io::stdout();

    match cli.command {
        Command::Status(args) => {
            let filter = if args.summary {
                StatusFilter::Summary
            } else if args.down {
                StatusFilter::Down
            } else {
                StatusFilter::All
            };
            let opts = StatusOptions {
                verbose: args.verbose,
                timeout: parse_timeout(&args.timeout)?,
                color: use_color(&args.color)?,
                no_pretty: args.no_pretty,
                no_ghost: args.no_ghost,
                wait: args.wait,
                highlight: highlight_ranks(&ctx, &args.highlight).await?,
            };
            status_report(&ctx, opts, args.rank, filter, &mut stdout).await?;
        }
        Command::Errors(args) => {
            errors_report(&ctx, parse_timeout(&args.timeout)?, &mut stdout).await?;
        }
        Command::Lookup { target } => {
            let hostmap = ctx.hostmap().await?;
            println!("{}", hostmap.lookup(&target)?);
        }
        Command::Parentof { rank } => {
            println!("{}", ctx.parent_of(rank).await?);
        }
        Command::Disconnect(args) => {
            let rank = ctx.resolve_rank(&args.target).await?;
            let parent = match args.parent {
                Some(parent) => parent,
                None => ctx.parent_of(rank).await?,
            };
            eprintln!(
                "asking {} (rank {}) to disconnect child {} (rank {})",
                ctx.host_by_rank(parent).await,
                parent,
                ctx.host_by_rank(rank).await,
                rank
            );
            let rpc = ctx
                .handle()
                .rpc_pack(
                    "overlay.disconnect-subtree",
                    &json!({ "rank": rank }),
                    parent,
                    RpcFlags::empty(),
                )
                .await?;
            rpc.get()
                .await
                .map_err(|e| anyhow!("overlay.disconnect-subtree: {}", e.to_display_string()))?;
        }
    }
    Ok(())
}
