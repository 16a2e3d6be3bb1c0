//! Member binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use stockgroup::member::{console, http};
use stockgroup::{Config, Member, TcpNetwork};
use tokio::io::BufReader;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "stockd")]
#[command(about = "stockgroup member: replicated stock prices")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join a cluster and serve until interrupted
    Serve {
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Member display name
        #[arg(long)]
        name: Option<String>,

        /// Cluster name
        #[arg(long)]
        cluster: Option<String>,

        /// Bind address for member traffic
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Address other members should dial
        #[arg(long)]
        advertise: Option<String>,

        /// Bind address for the HTTP admin API
        #[arg(long)]
        http: Option<SocketAddr>,

        /// Seed members (comma-separated)
        #[arg(long, value_delimiter = ',')]
        seeds: Vec<String>,

        /// Read commands from stdin
        #[arg(long)]
        console: bool,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            name,
            cluster,
            bind,
            advertise,
            http: http_addr,
            seeds,
            console: with_console,
        } => {
            // File and environment first, CLI flags win
            let mut config = Config::load(config.as_deref())?;
            if let Some(name) = name {
                config.group.name = name;
            }
            if let Some(cluster) = cluster {
                config.group.cluster = cluster;
            }
            if let Some(bind) = bind {
                config.node.bind_addr = bind;
            }
            if advertise.is_some() {
                config.node.advertise_addr = advertise;
            }
            if http_addr.is_some() {
                config.node.http_addr = http_addr;
            }
            if !seeds.is_empty() {
                config.group.seeds = seeds;
            }
            config.validate()?;
            init_tracing(&config.node.log_level);

            serve(config, with_console).await?;
        }
    }

    Ok(())
}

async fn serve(config: Config, with_console: bool) -> anyhow::Result<()> {
    let (network, inbox) = TcpNetwork::bind(
        &config.group.name,
        config.node.bind_addr,
        config.node.advertise_addr.clone(),
    )
    .await?;
    let member = Arc::new(Member::join(network, inbox, config.group.clone()).await?);

    let (stop, stopped) = watch::channel(false);
    let http_task = config.node.http_addr.map(|addr| {
        let member = member.clone();
        let mut stopped = stopped.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.changed().await;
            };
            if let Err(e) = http::serve(member, addr, shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        })
    });

    if with_console {
        let input = BufReader::new(tokio::io::stdin());
        tokio::select! {
            res = console::run(&member, input, tokio::io::stdout()) => {
                res?;
            }
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Interrupted");
    }

    member.leave().await?;
    stop.send_replace(true);
    if let Some(task) = http_task {
        let _ = task.await;
    }
    Ok(())
}
