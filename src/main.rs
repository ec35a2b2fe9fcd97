use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use chatrelay::client::{ClientEvent, Connector};
use chatrelay::config::Config;
use chatrelay::error::ClientError;
use chatrelay::image::{self, ImageKind};
use chatrelay::manager::{Indicator, PortManager, RestartPolicy};
use chatrelay::watchdog::Watchdog;

#[derive(Parser)]
#[command(name = "chatrelay", about = "Multi-port TCP chat relay")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the relay with its watchdog and operator console
    Serve {
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Comma separated, e.g. 12345,12346
        #[arg(long, value_delimiter = ',')]
        ports: Option<Vec<u16>>,
    },

    /// Join a port as a chat client
    Chat {
        #[arg(long)]
        port: u16,

        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let command = cli.command.unwrap_or(Cmd::Serve {
        data_dir: None,
        ports: None,
    });

    match command {
        Cmd::Serve { data_dir, ports } => {
            if let Some(dir) = data_dir {
                cfg.data_dir = dir;
            }
            if let Some(ports) = ports {
                cfg.ports = ports;
            }

            serve(cfg).await
        }
        Cmd::Chat { port, user } => chat(cfg, port, user).await,
    }
}

async fn serve(cfg: Config) -> Result<()> {
    let manager_cfg = cfg.manager();

    let indicator: Indicator = Arc::new(|port: u16, running: bool| {
        info!(port, running, "port indicator");
    });

    let manager = PortManager::with_indicator(manager_cfg.clone(), indicator.clone());

    match manager.restore_state().await? {
        Some(ports) => info!(?ports, "restored desired state"),
        None => {
            for port in manager.ports() {
                if let Err(e) = manager.start(port) {
                    warn!(port, error = %e, "could not start port");
                }
            }
        }
    }

    let factory_cfg = manager_cfg.clone();
    let watchdog = Arc::new(Watchdog::new(
        cfg.watchdog(),
        manager,
        Arc::new(move || PortManager::with_indicator(factory_cfg.clone(), indicator.clone())),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let dog = watchdog.clone();
    let dog_task = tokio::spawn(async move { dog.run(stop_rx).await });

    println!("commands: start N | stop N | halt N | users N | status | quit");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            line = stdin.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !console(&watchdog.manager(), line.trim()).await {
                            break;
                        }
                    }

                    // no console attached, serve until interrupted
                    Ok(None) => {
                        tokio::signal::ctrl_c().await?;
                        break;
                    }

                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    let _ = stop_tx.send(true);
    let _ = dog_task.await;

    watchdog.manager().shutdown().await?;
    info!("desired state saved, bye");

    Ok(())
}

/// Runs one operator command. Returns false on `quit`.
async fn console(manager: &PortManager, line: &str) -> bool {
    let mut parts = line.split_whitespace();

    let cmd = parts.next().unwrap_or("").to_lowercase();
    let port = parts.next().and_then(|p| p.parse::<u16>().ok());

    let outcome = match (cmd.as_str(), port) {
        ("start", Some(port)) => manager.start(port),
        ("stop", Some(port)) => manager.stop(port).await,
        ("halt", Some(port)) => manager.stop_with(port, RestartPolicy::Permanent).await,
        ("users", Some(port)) => {
            println!("[{port}] {}", manager.list_users(port).join(", "));
            Ok(())
        }
        ("status", _) => {
            for port in manager.ports() {
                let running = if manager.is_running(port) { "on" } else { "off" };
                let wanted = if manager.is_enabled(port) { "enabled" } else { "disabled" };
                println!("{port}: {running} ({wanted})");
            }
            Ok(())
        }
        ("quit" | "exit", _) => return false,
        ("", _) => Ok(()),
        _ => {
            println!("commands: start N | stop N | halt N | users N | status | quit");
            Ok(())
        }
    };

    if let Err(e) = outcome {
        println!("[error] {e}");
    }

    true
}

async fn chat(cfg: Config, port: u16, user: String) -> Result<()> {
    let client_cfg = cfg.client();
    let max_attempts = client_cfg.max_attempts;

    let (connector, mut events) = Connector::new(client_cfg);
    connector.connect(port, &user).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(port, max_attempts, event);
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = if line == "/quit" {
            break;
        } else if line == "/reconnect" {
            connector.reconnect().await
        } else if let Some(rest) = line.strip_prefix("/to ") {
            match rest.split_once(' ') {
                Some((to, text)) => {
                    println!("[private to {to}] {user}: {text}");
                    connector.send_private(to, text.trim()).await
                }
                None => {
                    println!("usage: /to <user> <text>");
                    Ok(())
                }
            }
        } else if let Some(path) = line.strip_prefix("/img ") {
            match tokio::fs::read(path.trim()).await {
                Ok(bytes) => {
                    println!("{user} sent an image: {}", path.trim());
                    connector.send_image(&bytes).await
                }
                Err(e) => Err(ClientError::from(e)),
            }
        } else {
            println!("{user}: {line}");
            connector.send_message(line).await
        };

        if let Err(e) = result {
            eprintln!("[error] {e}");
        }
    }

    connector.disconnect().await;
    printer.abort();

    Ok(())
}

fn print_event(port: u16, max_attempts: u32, event: ClientEvent) {
    match event {
        ClientEvent::Users(users) => println!("[users] {}", users.join(", ")),
        ClientEvent::Message { user, time, text } => println!("{user} [{time}]: {text}"),
        ClientEvent::Image { user, time, data } => match image::decode(&data) {
            Ok(bytes) => println!(
                "{user} [{time}] sent an image ({} bytes, {})",
                bytes.len(),
                ImageKind::detect(&bytes).extension()
            ),
            Err(e) => println!("{user} [{time}] sent an unreadable image: {e}"),
        },
        ClientEvent::System { time, text } => println!("[{time}] {text}"),
        ClientEvent::Private { from, text } => println!("[private from {from}] {text}"),
        ClientEvent::Other(line) => println!("Server({port}): {line}"),
        ClientEvent::ConnectionLost => println!("Connection lost. Trying to reconnect..."),
        ClientEvent::ReconnectFailed { attempt, error } => {
            println!("Reconnect attempt {attempt}/{max_attempts} failed: {error}")
        }
        ClientEvent::Reconnected => println!("Reconnected to port {port}"),
        ClientEvent::GaveUp { attempts } => {
            println!("{}. Type /reconnect to try again.", ClientError::ReconnectExhausted { attempts })
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, prelude::*};

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,chatrelay=debug"));

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}
