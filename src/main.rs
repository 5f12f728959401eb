use clap::{Parser, Subcommand};
use easy_pm::error::EpmError;
use easy_pm::orchestrator::{resolve_config_path, Orchestrator};
use easy_pm::paths::{absolutize, resolve_home, EpmHome, HOME_ENV};
use easy_pm::router::run_router;
use easy_pm::runas::RunAs;
use easy_pm::supervisor::client::DaemonClient;
use easy_pm::supervisor::daemon::{run_daemon, PKG_NAME, VERSION};
use easy_pm::webhook::Deployer;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// epm - run several web apps behind one port
#[derive(Parser, Debug)]
#[command(name = "epm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding the config registry and daemon state
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a config file and start its apps
    Start {
        /// Path to the config file
        file: String,

        /// Port the router listens on for every config
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Show every managed app grouped by config file
    #[command(alias = "ls")]
    List,

    /// Stop the apps of a config file and unregister it
    Stop {
        /// Path to the config file
        file: String,
    },

    /// Run the router and webhook server (started by `epm start`)
    Serve {
        /// Listen on this port instead of the configured ones
        #[arg(long, env = "PORT")]
        port: Option<u16>,
    },

    /// Run the supervisor daemon (started on demand)
    Daemon,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Long-running processes log progress, one-shot commands only problems
    let default_directive = match cli.command {
        Commands::Serve { .. } | Commands::Daemon => "easy_pm=info",
        _ => "easy_pm=warn",
    };
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter(rust_log.as_deref(), default_directive))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            let code = err
                .downcast_ref::<EpmError>()
                .map(EpmError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir()?;
    let home = EpmHome::new(match cli.home.as_deref() {
        Some(dir) => absolutize(&cwd, &resolve_home(dir)),
        None => EpmHome::default_root(),
    });

    match cli.command {
        Commands::Start { file, port } => {
            let config_path = resolve_config_path(&file, &cwd);
            runtime()?.block_on(async {
                let client = DaemonClient::connect(&home).await?;
                let orchestrator = Orchestrator::new(home, client).with_router_port(port);
                let report = orchestrator.start(&config_path).await?;
                println!("{} started\n", easy_pm::orchestrator::ROUTER_PROCESS_NAME);
                print!("{}", report);
                Ok::<(), anyhow::Error>(())
            })
        }

        Commands::List => runtime()?.block_on(async {
            let client = DaemonClient::connect(&home).await?;
            let report = Orchestrator::new(home, client).list().await?;
            print!("{}", report);
            Ok::<(), anyhow::Error>(())
        }),

        Commands::Stop { file } => {
            let config_path = resolve_config_path(&file, &cwd);
            runtime()?.block_on(async {
                let client = DaemonClient::connect(&home).await?;
                let stopped = Orchestrator::new(home, client).stop(&config_path).await?;
                println!(
                    "Stopped {} app(s) from {}",
                    stopped.len(),
                    config_path.display()
                );
                Ok::<(), anyhow::Error>(())
            })
        }

        Commands::Serve { port } => {
            info!(name = PKG_NAME, version = VERSION, home = %home.root().display(), "Starting router");
            let run_as = RunAs::detect();
            if let RunAs::SudoUser { name } = &run_as {
                info!(user = %name, "Running as root, deploys will run as the invoking user");
            }
            runtime()?.block_on(async {
                let deployer = Deployer::new(run_as);
                run_router(&home, port, deployer, shutdown_signal()).await
            })
        }

        Commands::Daemon => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            rt.block_on(run_daemon(&home, shutdown_signal()))
        }
    }
}

/// `RUST_LOG` when it is set and parses, the command's default otherwise
fn log_filter(rust_log: Option<&str>, default_directive: &str) -> EnvFilter {
    rust_log
        .filter(|value| !value.trim().is_empty())
        .and_then(|value| match EnvFilter::try_new(value) {
            Ok(filter) => Some(filter),
            Err(e) => {
                eprintln!("Ignoring invalid {}: {}", EnvFilter::DEFAULT_ENV, e);
                None
            }
        })
        .unwrap_or_else(|| EnvFilter::new(default_directive))
}

/// Single-threaded runtime for the CLI actions and the router
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received SIGINT (Ctrl+C), shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}
