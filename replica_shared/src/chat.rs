//! Server-side chat processing.
//!
//! # Commands
//! - `/server <text>`, `/s <text>`: message as the server (host only)
//! - `/whisper <name> <text>`, `/w "<name with spaces>" <text>`: private
//! - `/help`, `/?`: command list, sent back to the sender
//!
//! Anything else, including unknown commands, is broadcast as
//! `<sender>: <text>` with player text wrapped so it can't inject markup.

use tracing::debug;

use crate::player::{PlayerRoster, HOST_PLAYER_ID};

/// Longer messages are cut to this many characters.
pub const MAX_MESSAGE_LENGTH: usize = 256;

pub const SERVER_COLOUR: &str = "9CDCFE";
pub const HELP_COLOUR: &str = "00FF00";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Say(String),
    Server(String),
    Whisper { recipient: String, text: String },
    Help,
}

/// Where a processed chat line goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelivery {
    /// To everyone except `exclude`.
    Broadcast { text: String, exclude: Option<u8> },
    Whisper { to: u8, text: String },
}

/// Parses one raw chat line. Empty lines and malformed whispers yield `None`.
pub fn parse(message: &str) -> Option<ChatCommand> {
    if message.is_empty() {
        return None;
    }
    let Some(body) = message.strip_prefix('/') else {
        return Some(ChatCommand::Say(message.to_string()));
    };
    let (command, rest) = match body.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (body, ""),
    };
    match command {
        "server" | "s" => Some(ChatCommand::Server(rest.to_string())),
        "whisper" | "w" => parse_whisper(rest),
        "help" | "?" => Some(ChatCommand::Help),
        _ => Some(ChatCommand::Say(message.to_string())),
    }
}

fn parse_whisper(rest: &str) -> Option<ChatCommand> {
    if rest.is_empty() {
        return None;
    }
    let (recipient, text) = if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        if end == 0 {
            return None;
        }
        let text = quoted[end + 1..].strip_prefix(' ').unwrap_or(&quoted[end + 1..]);
        (&quoted[..end], text)
    } else {
        match rest.split_once(' ') {
            Some((name, text)) => (name, text),
            None => (rest, ""),
        }
    };
    Some(ChatCommand::Whisper {
        recipient: recipient.to_string(),
        text: text.to_string(),
    })
}

/// Removes every case-insensitive `</noparse>` so player text stays inside
/// its wrapper.
pub fn sanitize(text: &str) -> String {
    const CLOSE: &str = "</noparse>";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.to_ascii_lowercase().find(CLOSE) {
            Some(at) => {
                out.push_str(&rest[..at]);
                rest = &rest[at + CLOSE.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(MAX_MESSAGE_LENGTH) {
        Some((at, _)) => &text[..at],
        None => text,
    }
}

pub fn help_text() -> String {
    format!(
        "<color=#{HELP_COLOUR}>Available commands:\
         \r\n\r\n\tSend a message as the server (host only)\r\n\t\t/server <message>\r\n\t\t/s <message>\
         \r\n\r\n\tWhisper to a player\r\n\t\t/whisper <PlayerName> <message>\r\n\t\t/w <PlayerName> <message>\
         \r\n\r\n\tDisplay this help message\r\n\t\t/help\r\n\t\t/?</color>"
    )
}

/// Turns one chat line from `sender` into deliveries.
pub fn process(sender: u8, message: &str, roster: &PlayerRoster) -> Vec<ChatDelivery> {
    let Some(player) = roster.get(sender) else {
        return Vec::new();
    };
    let Some(command) = parse(truncate(message)) else {
        return Vec::new();
    };
    match command {
        ChatCommand::Say(text) => vec![ChatDelivery::Broadcast {
            text: format!(
                "<alpha=#50>{}:</color> <noparse>{}</noparse>",
                player.username,
                sanitize(&text)
            ),
            exclude: Some(sender),
        }],
        ChatCommand::Server(text) => {
            if sender != HOST_PLAYER_ID {
                debug!(player = sender, "Ignored /server from non-host");
                return Vec::new();
            }
            vec![ChatDelivery::Broadcast {
                text: format!("<color=#{SERVER_COLOUR}>{text}</color>"),
                exclude: None,
            }]
        }
        ChatCommand::Whisper { recipient, text } => match roster.find_by_name(&recipient) {
            Some(to) => vec![ChatDelivery::Whisper {
                to: to.id,
                text: format!(
                    "<i><alpha=#50>{}:</color> <noparse>{}</noparse></i>",
                    player.username,
                    sanitize(&text)
                ),
            }],
            None => {
                debug!(player = sender, recipient = %recipient, "Whisper recipient not found");
                vec![ChatDelivery::Whisper {
                    to: sender,
                    text: format!(
                        "<color=#{SERVER_COLOUR}>{recipient} not found - you're whispering into the void!</color>"
                    ),
                }]
            }
        },
        ChatCommand::Help => vec![ChatDelivery::Whisper {
            to: sender,
            text: help_text(),
        }],
    }
}
