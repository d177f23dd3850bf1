pub mod core;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

pub use crate::core::{ClientError, RoomClient};

use crate::core::config::load_config;
use crate::core::events::LogView;
use crate::core::media::{HeadlessEngine, TransportFactory, TransportRegistry};
use crate::core::signaling::WebSocketSignaling;

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Join,
    Leave,
    Room(String),
    Name(String),
    Mute,
    Aec,
    NoiseSuppression,
    LocalSources,
    Threshold(f32),
    Status,
    Quit,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb {
        "join" => Ok(Command::Join),
        "leave" => Ok(Command::Leave),
        "room" if !rest.is_empty() => Ok(Command::Room(rest.to_string())),
        "room" => Err("usage: room <id>".to_string()),
        "name" => Ok(Command::Name(rest.to_string())),
        "mute" => Ok(Command::Mute),
        "aec" => Ok(Command::Aec),
        "ns" => Ok(Command::NoiseSuppression),
        "local" => Ok(Command::LocalSources),
        "threshold" => rest
            .parse()
            .map(Command::Threshold)
            .map_err(|_| "usage: threshold <dB>".to_string()),
        "status" => Ok(Command::Status),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Connects to the configured signaling server with the headless engine
/// and drives the client from stdin until `quit` or end of input.
pub async fn run() -> Result<(), ClientError> {
    let loaded = load_config()?;
    log::info!(
        "config {} (dev override: {})",
        loaded.path.display(),
        loaded.is_dev_override
    );

    let transports = TransportRegistry::new();
    if transports.capabilities(loaded.config.transport).is_none() {
        log::warn!(
            "{} transport is not available in this build; joins will fail until the config selects loopback",
            loaded.config.transport
        );
    }

    let socket = WebSocketSignaling::connect(&loaded.config.signaling_url).await?;
    let client = RoomClient::start(
        loaded,
        socket,
        Arc::new(HeadlessEngine::new()),
        Arc::new(transports),
        Arc::new(LogView::new()),
    )
    .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(message) => {
                log::warn!("{message}");
                continue;
            }
        };

        let ticket = match command {
            Command::Join => client.join(),
            Command::Leave => client.leave(),
            Command::Room(room) => client.switch_room(room),
            Command::Name(name) => client.set_username(&name),
            Command::Mute => client.toggle_mute(),
            Command::Aec => client.toggle_aec(),
            Command::NoiseSuppression => client.toggle_noise_suppression(),
            Command::LocalSources => client.toggle_local_sources(),
            Command::Threshold(threshold) => client.set_threshold(threshold),
            Command::Status => {
                let context = client.session().context().await;
                log::info!(
                    "phase={:?} room={:?} server_room={:?} pending={}",
                    context.phase,
                    context.current_room,
                    context.server_room,
                    client.pending_actions()
                );
                continue;
            }
            Command::Quit => break,
        };

        // Commands stay ordered through the queue; the prompt only reports.
        tokio::spawn(async move {
            if let Err(err) = ticket.wait().await {
                log::warn!("command failed: {err}");
            }
        });
    }

    if client.session().context().await.is_joined() {
        if let Err(err) = client.leave().wait().await {
            log::warn!("leave on exit failed: {err}");
        }
    }
    Ok(())
}
