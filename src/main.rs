//! emberkv server entry point: parses configuration, builds the server,
//! and runs the accept loop until a shutdown signal arrives.

use std::sync::Arc;

use emberkv::config::Config;
use emberkv::connection::{handle_connection, ConnectionStats};
use emberkv::database::server::Server;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

fn print_help() {
    println!(
        r#"
emberkv - A Redis-Compatible In-Memory Key-Value Server

USAGE:
    emberkv [OPTIONS]

OPTIONS:
    -c, --config <FILE>        Load settings from a config file
    -h, --bind <ADDR>          Address to bind to (default: 127.0.0.1)
    -p, --port <PORT>          Port to listen on (default: 6379)
        --appendonly           Enable the append-only command log
        --requirepass <PASS>   Require AUTH with the given password
    -v, --version              Print version information
        --help                 Print this help message

CONNECTING:
    Use redis-cli or any Redis client:
    $ redis-cli -p 6379
    127.0.0.1:6379> SET greeting hello
    OK
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
            _               _
   ___ _ __ | |__   ___ _ __| | ____   __
  / _ \ '_ \| '_ \ / _ \ '__| |/ /\ \ / /
 |  __/ | | | |_) |  __/ |  |   <  \ V /
  \___|_| |_|_.__/ \___|_|  |_|\_\  \_/

emberkv v{} - in-memory key-value server
Listening on {}   databases: {}   appendonly: {}
"#,
        emberkv::VERSION,
        config.bind_address(),
        config.databases,
        if config.appendonly { "yes" } else { "no" },
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help") {
        print_help();
        return Ok(());
    }
    if args.iter().any(|a| a == "--version" || a == "-v") {
        println!("emberkv version {}", emberkv::VERSION);
        return Ok(());
    }

    let config = match Config::from_args(&args) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("Error: {message}");
            print_help();
            std::process::exit(1);
        }
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    print_banner(&config);

    let server = Server::new(config.clone());
    info!(databases = config.databases, "server initialized");

    let stats = server.stats();
    let listener = TcpListener::bind(config.bind_address()).await?;
    info!("listening on {}", config.bind_address());

    let shutdown = async {
        signal::ctrl_c().await.expect("failed to install signal handler");
        info!("shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&server), stats) => {}
        _ = shutdown => {}
    }

    server.close().await;
    info!("server shutdown complete");
    Ok(())
}

/// Accepts connections and spawns one handler task per client.
async fn accept_loop(listener: TcpListener, server: Arc<Server>, stats: Arc<ConnectionStats>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let server = Arc::clone(&server);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    handle_connection(stream, addr, server, stats).await;
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}
