//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p replica_server -- [--config server.json] [--addr 0.0.0.0:7777]
//!       [--tick-hz 24] [--name Host] [--password secret]
//!
//! Flags override values from the config file. The server hosts an empty
//! [`SimWorld`]; the game proper embeds `ServerSession` with its own world.
//!
//! Console commands:
//!   status         - Show tick and players
//!   kick <name>    - Disconnect a player
//!   say <text>     - Chat as the host
//!   quit           - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use replica_server::server::GameServer;
use replica_server::world::SimWorld;
use replica_shared::config::SessionConfig;
use replica_shared::event::SessionEvent;
use replica_shared::task::TaskRegistry;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<SessionConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            SessionConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        _ => SessionConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.password = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting server");

    let mut server = GameServer::bind(cfg.clone(), SimWorld::new(), Vec::new(), TaskRegistry::new())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, server_id = %server.session().server_id(), "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = cfg.tick_duration();
    let mut next_tick = tokio::time::Instant::now();

    while !server.is_stopped() {
        server.step().await?;
        for event in server.drain_events() {
            match event {
                SessionEvent::Chat { text } => println!("{text}"),
                other => info!(event = ?other, "Session event"),
            }
        }

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    Ok(())
}
