use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use rgrid_core::{Config, Master};

mod client;

#[derive(Parser)]
#[command(name = "rgrid")]
#[command(about = "rgrid distributed compute master")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Set log level")]
    log_level: Option<String>,

    #[arg(
        short,
        long,
        global = true,
        env = "RGRID_MASTER",
        default_value = "127.0.0.1:5557",
        help = "Admin address of a running master"
    )]
    master: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the master daemon
    Master {
        #[arg(short = 'H', long, help = "Bind address override")]
        host: Option<String>,

        #[arg(short = 'P', long, help = "Admin port override")]
        port: Option<u16>,
    },

    /// Submit a .job or .meta description file
    Run {
        /// Path to the description file, readable by the master
        file: String,
    },

    /// Stop a job, queued or executing
    Stop { job_id: i64 },

    /// Stop every job of a meta group
    StopGroup { group_id: i64 },

    /// Stop everything, queued and executing
    StopAll,

    /// Stop executing jobs older than the newest queued job
    StopPrev,

    /// Register hosts: alternating GROUP HOST pairs
    AddHosts {
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Remove hosts and rescue their tasks
    DeleteHosts {
        #[arg(required = true)]
        hosts: Vec<String>,
    },

    /// Bulk-add hosts from a host-list file
    AddGroup { file: String },

    /// Remove every host of a group
    DeleteGroup { group: String },

    /// Report the state of one job
    Info { job_id: i64 },

    /// Report global counters
    Stat,
}

fn init_tracing(config: &Config, override_level: Option<&str>) {
    let level = override_level.unwrap_or(&config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_master(mut config: Config, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.admin_port = port;
    }

    let (master, mut channels) = Master::start(config).await?;
    info!(version = rgrid_core::VERSION, "rgrid master starting");

    // Outbound worker IO runs as a separate process layer; its channel
    // ends are drained here so dispatch never backs up.
    tokio::spawn(async move {
        while let Some(assignment) = channels.assignments.recv().await {
            debug!(task = %assignment.task, host = %assignment.host, "assignment ready for transport");
        }
    });
    tokio::spawn(async move {
        while let Some((command, host_ip)) = channels.worker_commands.recv().await {
            debug!(?command, %host_ip, "worker command ready for transport");
        }
    });

    tokio::select! {
        result = rgrid_api::run(master.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            master.shutdown().await;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path.to_str().unwrap_or_default())?,
        None => Config::from_env()?,
    };
    init_tracing(&config, cli.log_level.as_deref());

    match cli.command {
        Commands::Master { host, port } => run_master(config, host, port).await,
        command => run_admin_command(&cli.master, command).await,
    }
}

async fn run_admin_command(master_addr: &str, command: Commands) -> anyhow::Result<()> {
    let (method, params) = match command {
        Commands::Run { file } => ("run", json!({ "file": file })),
        Commands::Stop { job_id } => ("stop", json!({ "job_id": job_id })),
        Commands::StopGroup { group_id } => ("stop_group", json!({ "group_id": group_id })),
        Commands::StopAll => ("stop_all", json!({})),
        Commands::StopPrev => ("stop_prev", json!({})),
        Commands::AddHosts { hosts } => ("add_hosts", json!({ "hosts": hosts })),
        Commands::DeleteHosts { hosts } => ("delete_hosts", json!({ "hosts": hosts })),
        Commands::AddGroup { file } => ("add_group", json!({ "file": file })),
        Commands::DeleteGroup { group } => ("delete_group", json!({ "group": group })),
        Commands::Info { job_id } => ("info", json!({ "job_id": job_id })),
        Commands::Stat => ("stat", json!({})),
        Commands::Master { .. } => unreachable!("handled by the caller"),
    };

    println!("{} {}", "→".cyan(), method.bold());
    let response = client::call(master_addr, method, params).await?;
    client::print_response(&response)
}
