//! Cadence CLI - run the broker and talk to it.

mod client;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cadence_proto::Job;
use cadence_sched::{DriverKind, ListenConfig, Server, ServerConfig, StoreConfig};
use cadence_store::{Driver, MemoryDriver, RedbDriver};

use client::Client;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Periodic task broker")]
#[command(version)]
struct Cli {
    /// Broker address
    #[arg(
        short = 'H',
        long = "host",
        global = true,
        env = "CADENCE_HOST",
        default_value = "unix:///tmp/cadenced.sock"
    )]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    Run {
        /// Listen address, e.g. tcp://127.0.0.1:5000
        #[arg(long)]
        listen: Option<String>,

        /// Store driver
        #[arg(long, value_enum, default_value = "memory")]
        driver: CliDriver,

        /// Database path for the redb driver
        #[arg(long, default_value = "cadence.redb")]
        dbpath: PathBuf,

        /// Per-connection socket deadline in seconds (0 disables)
        #[arg(long, default_value = "0")]
        timeout: u64,
    },

    /// Show per-function status
    Status,

    /// Submit a job
    Submit {
        /// Function name
        #[arg(short, long)]
        func: String,

        /// Job name, unique within the function
        #[arg(short, long)]
        name: String,

        /// Job workload
        #[arg(long, default_value = "")]
        args: String,

        /// Processing timeout in seconds
        #[arg(short, long, default_value = "0")]
        timeout: i64,

        /// Delay the first run by this many seconds
        #[arg(long, default_value = "0")]
        sched_later: i64,

        /// Recurrence: every_<duration> or a cron expression
        #[arg(long, default_value = "")]
        period: String,

        /// Advisory retry budget for workers
        #[arg(long, default_value = "0")]
        fail_retry: i64,
    },

    /// Remove a job
    Remove {
        /// Function name
        #[arg(short, long)]
        func: String,

        /// Job name
        #[arg(short, long)]
        name: String,
    },

    /// Drop a function and all of its jobs
    Drop {
        /// Function name
        func: String,
    },

    /// Dump all jobs to a file
    Dump {
        /// Output path
        #[arg(short, long, default_value = "cadence-dump.json")]
        output: PathBuf,
    },

    /// Load a dump back into the broker
    Load {
        /// Input path
        input: PathBuf,
    },

    /// Ping the broker
    Ping,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliDriver {
    Memory,
    Redb,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            listen,
            driver,
            dbpath,
            timeout,
        } => run_broker(listen.unwrap_or(cli.host), driver, dbpath, timeout).await,
        Commands::Status => {
            let mut client = Client::connect(&cli.host).await?;
            print!("{}", client.status().await?);
            Ok(())
        }
        Commands::Submit {
            func,
            name,
            args,
            timeout,
            sched_later,
            period,
            fail_retry,
        } => {
            let sched_at = if sched_later > 0 {
                chrono::Utc::now().timestamp() + sched_later
            } else {
                0
            };
            let raw = serde_json::json!({
                "func": func,
                "name": name,
                "workload": args,
                "timeout": timeout,
                "sched_at": sched_at,
                "period": period,
                "fail_retry": fail_retry,
            });
            let job = Job::from_json(raw.to_string().as_bytes())?;

            let mut client = Client::connect(&cli.host).await?;
            client.submit(&job).await?;
            println!("submitted {func}/{name}");
            Ok(())
        }
        Commands::Remove { func, name } => {
            let raw = serde_json::json!({ "func": func, "name": name });
            let job = Job::from_json(raw.to_string().as_bytes())?;

            let mut client = Client::connect(&cli.host).await?;
            client.remove(&job).await?;
            println!("removed {func}/{name}");
            Ok(())
        }
        Commands::Drop { func } => {
            let mut client = Client::connect(&cli.host).await?;
            client.drop_func(&func).await?;
            println!("dropped {func}");
            Ok(())
        }
        Commands::Dump { output } => {
            let mut client = Client::connect(&cli.host).await?;
            let jobs = client.dump().await?;
            let count = jobs.len();
            let payload = serde_json::json!({ "jobs": jobs });
            std::fs::write(&output, serde_json::to_vec_pretty(&payload)?)?;
            println!("dumped {count} jobs to {}", output.display());
            Ok(())
        }
        Commands::Load { input } => {
            let payload = std::fs::read(&input)?;
            let mut client = Client::connect(&cli.host).await?;
            client.load(&payload).await?;
            println!("loaded {}", input.display());
            Ok(())
        }
        Commands::Ping => {
            let mut client = Client::connect(&cli.host).await?;
            if client.ping().await? {
                println!("PONG");
                Ok(())
            } else {
                Err("unexpected ping reply".into())
            }
        }
    }
}

async fn run_broker(
    listen: String,
    driver: CliDriver,
    dbpath: PathBuf,
    timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        listen: ListenConfig { url: listen },
        timeout_secs: timeout,
        store: StoreConfig {
            driver: match driver {
                CliDriver::Memory => DriverKind::Memory,
                CliDriver::Redb => DriverKind::Redb,
            },
            path: dbpath,
        },
    };

    let driver: Arc<dyn Driver> = match config.store.driver {
        DriverKind::Memory => Arc::new(MemoryDriver::new()),
        DriverKind::Redb => Arc::new(RedbDriver::open(&config.store.path)?),
    };

    let shutdown = CancellationToken::new();
    let server = Server::new(&config, driver, shutdown.clone())?;

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    server.serve().await?;
    Ok(())
}
