//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p replica_client -- [--config client.json] [--addr 127.0.0.1:7777]
//!       [--name Player] [--password secret]
//!   cargo run -p replica_client -- --browse [--directory servers.json]
//!
//! The client mirrors the host into a [`MirrorWorld`] and reports itself
//! loaded as soon as the login is accepted. `--browse` lists LAN servers
//! (and any directory file) with their ping instead of connecting.
//!
//! Console commands:
//!   status                    - Show connection state
//!   players                   - List other players
//!   say <text>                - Chat
//!   take <job>                - Ask for a job
//!   validate <job> [booklet]  - Validate a job paper
//!   disconnect                - Leave the server
//!   quit                      - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use replica_client::browser::ServerBrowser;
use replica_client::client::GameClient;
use replica_client::session::ClientState;
use replica_client::world::MirrorWorld;
use replica_shared::config::SessionConfig;
use replica_shared::event::SessionEvent;
use tokio::sync::mpsc;
use tracing::info;

/// How long `--browse` listens for answers.
const BROWSE_FOR: Duration = Duration::from_secs(6);

struct Args {
    cfg: SessionConfig,
    browse: bool,
    directory: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    let cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            SessionConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        _ => SessionConfig::default(),
    };
    let mut parsed = Args {
        cfg,
        browse: false,
        directory: None,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                parsed.cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                parsed.cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                parsed.cfg.password = args[i + 1].clone();
                i += 2;
            }
            "--directory" if i + 1 < args.len() => {
                parsed.directory = Some(args[i + 1].clone());
                i += 2;
            }
            "--browse" => {
                parsed.browse = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(parsed)
}

async fn browse(cfg: &SessionConfig, directory: Option<&str>) -> anyhow::Result<()> {
    let mut browser = ServerBrowser::bind(cfg.ping.clone()).await?;
    if let Some(path) = directory {
        let text = std::fs::read_to_string(path).with_context(|| format!("read directory {path}"))?;
        let n = browser.load_directory_json(&text)?;
        info!(servers = n, "Loaded lobby directory");
    }
    browser.discover().await?;

    let deadline = tokio::time::Instant::now() + BROWSE_FOR;
    while tokio::time::Instant::now() < deadline {
        browser.step().await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for s in browser.servers() {
        let ping = if s.ping < 0 { "-".to_string() } else { format!("{}ms", s.ping) };
        println!(
            "{:<32} {:>2}/{:<2} {:>6}  {}:{}",
            s.name, s.current_players, s.max_players, ping, s.ipv4, s.port
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    if args.browse {
        return browse(&args.cfg, args.directory.as_deref()).await;
    }
    let cfg = args.cfg;
    info!(server = %cfg.server_addr, name = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(cfg.clone(), MirrorWorld::new(), Vec::new())
        .await
        .context("connect")?;

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    client.set_console_input(console_rx);

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

    let tick_interval = cfg.tick_duration();
    let mut next_tick = tokio::time::Instant::now();

    while !client.is_stopped() {
        client.step().await?;
        if client.state() == ClientState::Connected {
            client.session_mut().mark_loaded(std::time::Instant::now());
        }
        for event in client.drain_events() {
            match event {
                SessionEvent::Chat { text } => println!("{text}"),
                SessionEvent::LoginDenied(denied) => println!("Login denied: {}", denied.describe()),
                SessionEvent::Disconnected { detail, .. } => {
                    println!("Disconnected: {detail}");
                    return Ok(());
                }
                other => info!(event = ?other, "Session event"),
            }
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
    Ok(())
}
