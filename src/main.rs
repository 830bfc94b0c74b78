//! sbsd - ticketed network access daemon
//!
//! Grants client devices time-limited network access by keeping nftables
//! sets in sync with issued tickets and the configured allow/block lists.
//!
//! # Usage
//!
//! ```bash
//! # Run the daemon
//! sbsd run
//! sbsd --config ./sbsd.json run --dry-run   # in-memory filter, nothing touches nft
//!
//! # rpcd exec plugin interface
//! sbsd list                                  # print method signatures
//! echo '{"addr":"aa:bb:cc:dd:ee:ff","duration":3600}' | sbsd call add_ticket
//! ```

use clap::{Parser, Subcommand};
use sbs::audit::AuditLog;
use sbs::config::{DEFAULT_CONFIG_PATH, DaemonConfig, load_config};
use sbs::core::clock::{Clock, SystemClock};
use sbs::core::config_store::ConfigStore;
use sbs::core::filter::{MemoryFilter, PacketFilter};
use sbs::core::nft::NftFilter;
use sbs::core::resolver::HickoryResolver;
use sbs::core::state;
use sbs::core::tickets::TicketStore;
use sbs::rpc;
use sbs::service::{Service, ServiceParts};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sbsd", version)]
#[command(about = "Ticketed network access daemon for nftables", long_about = None)]
struct Cli {
    /// Daemon settings file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground
    Run {
        /// Use an in-memory packet filter and keep tickets in memory
        #[arg(long)]
        dry_run: bool,
        /// Also write logs to sbsd.log in the state directory
        #[arg(long)]
        log_file: bool,
    },
    /// Print the RPC method signatures (rpcd `list`)
    List,
    /// Forward one call to the running daemon, params JSON on stdin (rpcd `call`)
    Call {
        /// Method name, e.g. get_tickets
        method: String,
    },
}

fn init_logging(config: &DaemonConfig, log_file: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if log_file {
        let path = config.state_dir.join("sbsd.log");
        if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
        eprintln!("Cannot open {}, logging to stderr", path.display());
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::List => {
            println!("{}", rpc::methods_signature());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Call { method } => {
            let config = load_config(&cli.config).await?;

            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            let params = if input.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&input)?
            };

            let reply = rpc::call_daemon(&config.socket_path, &method, params).await?;
            println!("{reply}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { dry_run, log_file } => {
            let config = load_config(&cli.config).await?;
            if log_file {
                state::ensure_dir(&config.state_dir)?;
            }
            init_logging(&config, log_file);
            info!("Loaded settings from {}", cli.config.display());

            run_daemon(config, dry_run).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn build_service(config: &DaemonConfig, dry_run: bool) -> sbs::Result<Arc<Service>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (tickets, filter, audit): (TicketStore, Arc<dyn PacketFilter>, Option<AuditLog>) = if dry_run {
        warn!("Dry run: tickets are kept in memory and nft is never called");
        (TicketStore::in_memory(), Arc::new(MemoryFilter::new()), None)
    } else {
        state::ensure_dir(&config.state_dir)?;
        let tickets = TicketStore::open(config.tickets_path(), clock.now()).await?;
        info!("Recovered {} active ticket(s)", tickets.len().await);

        let nft = NftFilter::new(config.nft.clone());
        // Sets missing now are retried by the scheduler via failed applies.
        if let Err(e) = nft.ensure_sets().await {
            error!("Could not create nftables sets: {e}");
        }

        let audit = config.audit_log.then(|| AuditLog::new(config.audit_path()));
        (tickets, Arc::new(nft), audit)
    };

    Ok(Arc::new(Service::new(ServiceParts {
        tickets,
        configs: ConfigStore::new(&config.config_root),
        filter,
        resolver: Arc::new(HickoryResolver::new()),
        clock,
        apply_timeout: config.apply_timeout(),
        audit,
    })))
}

async fn run_daemon(config: DaemonConfig, dry_run: bool) -> sbs::Result<()> {
    let service = build_service(&config, dry_run).await?;

    // One initial apply, after every list is loaded and resolved.
    service.process_all().await;

    let recompute = tokio::spawn(Arc::clone(&service).run_recompute_loop());
    let scheduler = tokio::spawn(
        Arc::clone(&service).run_scheduler(config.expiry_interval(), config.domain_refresh_interval()),
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let server = rpc::serve(Arc::clone(&service), &config.socket_path);

    let result = tokio::select! {
        r = server => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Terminated, shutting down");
            Ok(())
        }
    };

    recompute.abort();
    scheduler.abort();
    if let Err(e) = tokio::fs::remove_file(&config.socket_path).await {
        warn!("Could not remove {}: {e}", config.socket_path.display());
    }
    result
}
