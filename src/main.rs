use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use sudoku_tunnel::config::{self, shortlink};
use sudoku_tunnel::crypto;

#[derive(Parser)]
#[command(
    name = "sudoku-tunnel",
    version,
    about = "Sudoku puzzle traffic obfuscation tunnel"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "config.json")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run client or server from the config file (default when no subcommand given)
    Run,

    /// Validate config file and exit
    Check,

    /// Generate a new Ed25519 key pair (master + one split key)
    Keygen {
        /// Existing private key (hex, 32B master or 64B split) to derive another split from
        #[arg(long)]
        more: Option<String>,
    },

    /// Start a client directly from a sudoku:// short link
    Link {
        /// The sudoku:// URL
        url: String,
    },

    /// Print the sudoku:// short link derived from the config
    ExportLink {
        /// Advertised server host (required for server-mode configs)
        #[arg(long, default_value = "")]
        public_host: String,
    },

    /// Interactive setup: write server+client configs and start the server
    Setup {
        /// Advertised server host prefill
        #[arg(long, default_value = "")]
        public_host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check) => cmd_check(&cli.config),
        Some(Commands::Keygen { more }) => cmd_keygen(more.as_deref()),
        Some(Commands::Link { url }) => cmd_link(&url).await,
        Some(Commands::ExportLink { public_host }) => cmd_export_link(&cli.config, &public_host),
        Some(Commands::Setup { public_host }) => cmd_setup(&cli.config, &public_host).await,
        Some(Commands::Run) | None => cmd_run(&cli.config).await,
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

async fn cmd_run(config_path: &str) -> Result<()> {
    init_logging();

    let cfg = config::load(config_path)?;
    info!(path = config_path, mode = %cfg.mode, "config loaded");

    match cfg.mode.as_str() {
        "client" => sudoku_tunnel::app::run_client(cfg).await?,
        _ => sudoku_tunnel::app::run_server(cfg).await?,
    }
    Ok(())
}

fn cmd_check(config_path: &str) -> Result<()> {
    match config::load(config_path) {
        Ok(cfg) => {
            println!("config '{}' is valid", config_path);
            println!("  mode:       {}", cfg.mode);
            println!("  aead:       {}", cfg.aead);
            println!("  encoding:   {}", cfg.ascii);
            println!("  tables:     {}", cfg.table_patterns().len());
            if cfg.mode == "client" {
                println!("  proxy-mode: {} ({} rule urls)", cfg.proxy_mode, cfg.rule_urls.len());
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("config '{}' has errors:", config_path);
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_keygen(more: Option<&str>) -> Result<()> {
    if let Some(existing) = more {
        // 从既有主密钥或拆分密钥再派生一个拆分
        let x = crypto::parse_private_key(existing)?;
        let split = crypto::split_private_key(&x);
        println!("Split Private Key: {}", split);
        return Ok(());
    }

    let pair = crypto::generate_master_key();
    let split = crypto::split_private_key(&pair.private);
    println!("Available Private Key: {}", split);
    println!("Master Private Key: {}", crypto::encode_scalar(&pair.private));
    println!("Master Public Key:  {}", crypto::encode_point(&pair.public));
    Ok(())
}

async fn cmd_link(url: &str) -> Result<()> {
    init_logging();

    let cfg = shortlink::parse_short_link(url)?;
    info!(server = %cfg.server_address, "starting client from short link");
    sudoku_tunnel::app::run_client(cfg).await?;
    Ok(())
}

fn cmd_export_link(config_path: &str, public_host: &str) -> Result<()> {
    let cfg = config::load(config_path)?;
    let link = shortlink::build_short_link(&cfg, public_host)?;
    println!("Short link: {}", link);
    Ok(())
}

async fn cmd_setup(config_path: &str, public_host: &str) -> Result<()> {
    let result = sudoku_tunnel::app::run_setup_wizard(config_path, public_host)?;
    println!("Server config saved to {}", result.server_config_path);
    println!("Client config saved to {}", result.client_config_path);
    println!("Short link: {}", result.short_link);

    init_logging();
    sudoku_tunnel::app::run_server(result.server_config).await?;
    Ok(())
}
