use clap::{Parser, Subcommand};
use lib::verify::VerificationCoordinator;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config.json.
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the configured agents and the admin HTTP API.
    Gateway {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// HTTP port (default from config or 15151)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// List outstanding verification challenges in the shared store.
    Challenges {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Publish the solved value of a challenge.
    Solve {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Agent id the challenge belongs to.
        #[arg(long)]
        agent: i64,

        /// Challenge id (captcha sid).
        #[arg(long)]
        sid: String,

        /// Solved value.
        #[arg(long)]
        key: String,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config).map_err(|e| ("init", e)),
        Some(Commands::Gateway { config, port }) => {
            run_gateway(config, port).await.map_err(|e| ("gateway", e))
        }
        Some(Commands::Challenges { config }) => {
            run_challenges(config).await.map_err(|e| ("challenges", e))
        }
        Some(Commands::Solve {
            config,
            agent,
            sid,
            key,
        }) => run_solve(config, agent, &sid, &key)
            .await
            .map_err(|e| ("solve", e)),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err((what, e)) = result {
        log::error!("{} failed: {:#}", what, e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    lib::gateway::run_gateway(config, path).await
}

async fn coordinator_for(config_path: Option<PathBuf>) -> anyhow::Result<VerificationCoordinator> {
    let (config, _) = lib::config::load_config(config_path)?;
    let store = lib::gateway::open_shared_store(&config).await?;
    Ok(VerificationCoordinator::new(store))
}

async fn run_challenges(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let coordinator = coordinator_for(config_path).await?;
    let all = coordinator.get_all().await?;
    if all.is_empty() {
        println!("no outstanding challenges");
    }
    for (agent_id, sids) in all {
        println!("id{}: {}", agent_id, sids.join(", "));
    }
    Ok(())
}

async fn run_solve(
    config_path: Option<PathBuf>,
    agent_id: i64,
    sid: &str,
    key: &str,
) -> anyhow::Result<()> {
    let coordinator = coordinator_for(config_path).await?;
    coordinator.submit(agent_id, sid, key).await?;
    println!("published solution for challenge {} of id{}", sid, agent_id);
    Ok(())
}
