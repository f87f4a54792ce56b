//! The pion daemon: serves plug-in web services described by a
//! configuration file until SIGINT or SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};

use pion::config::load_service_config;
use pion::http::HttpServer;
use pion::process::{self, ProcessContext};
use pion::services::HelloService;
use pion::Scheduler;

#[derive(Debug, Parser)]
#[command(name = "piond", about = "Lightweight HTTP server daemon", version)]
struct Args {
    /// Service configuration file; without one a hello service is
    /// mounted at /hello.
    config: Option<PathBuf>,

    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Address to bind.
    #[arg(short = 'i', long, default_value = "0.0.0.0")]
    interface: IpAddr,

    /// Number of worker threads (defaults to hardware concurrency).
    #[arg(short, long)]
    threads: Option<usize>,

    /// Run in the background (Unix only).
    #[arg(short, long)]
    daemonize: bool,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if args.daemonize {
        if let Err(e) = process::daemonize() {
            error!(error = %e, "could not daemonize");
            return ExitCode::FAILURE;
        }
    }
    process::ignore_noisy_signals();

    let scheduler = Arc::new(Scheduler::new());
    if let Some(threads) = args.threads {
        scheduler.set_num_threads(threads);
    }

    let context = ProcessContext::new();
    if let Err(e) = process::install_signal_handlers(&scheduler, Arc::clone(&context)) {
        error!(error = %e, "could not install signal handlers");
        return ExitCode::FAILURE;
    }

    let endpoint = SocketAddr::new(args.interface, args.port);
    let server = HttpServer::new(Arc::clone(&scheduler), endpoint);

    match args.config {
        Some(ref path) => {
            // Configuration errors are fatal at startup.
            if let Err(e) = load_service_config(&server, path) {
                error!(error = %e, "invalid service configuration");
                return ExitCode::FAILURE;
            }
        }
        None => {
            server.add_service("/hello", Arc::new(HelloService));
        }
    }

    if let Err(e) = server.start() {
        error!(error = %e, "could not start server");
        return ExitCode::FAILURE;
    }
    info!(%endpoint, "piond is running");

    context.wait_for_shutdown();
    info!("shutting down");
    server.stop();
    scheduler.shutdown();
    ExitCode::SUCCESS
}
