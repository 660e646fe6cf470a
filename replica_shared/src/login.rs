//! Login handshake: what a client announces and how the host answers.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::config::SessionConfig;

/// One entry of a mod manifest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModInfo {
    pub id: String,
    pub version: String,
}

impl ModInfo {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ModInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.id, self.version)
    }
}

impl Encode for ModInfo {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(&self.id);
        w.put_str(&self.version);
    }
}

impl Decode for ModInfo {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            id: r.get_str()?,
            version: r.get_str()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    pub username: String,
    /// Stable external identity of the player.
    pub guid: Uuid,
    pub password: Option<String>,
    pub build_version: String,
    pub mods: Vec<ModInfo>,
}

impl Encode for LoginRequest {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(&self.username);
        w.put(self.guid.as_bytes());
        w.put(&self.password);
        w.put_str(&self.build_version);
        w.put_array(&self.mods);
    }
}

impl Decode for LoginRequest {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            username: r.get_str()?,
            guid: Uuid::from_bytes(r.get()?),
            password: r.get()?,
            build_version: r.get_str()?,
            mods: r.get_array()?,
        })
    }
}

/// Why the host refused a login.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoginDenied {
    #[error("Invalid password!")]
    InvalidPassword,
    #[error("Game version mismatch! Server version: {expected}, your version: {got}")]
    VersionMismatch { expected: String, got: String },
    #[error("The server is full!")]
    ServerFull { max_players: u8 },
    #[error("Mod mismatch! {} missing, {} extra", .missing.len(), .extra.len())]
    ModMismatch {
        missing: Vec<ModInfo>,
        extra: Vec<ModInfo>,
    },
}

impl LoginDenied {
    pub fn locale_key(&self) -> &'static str {
        match self {
            LoginDenied::InvalidPassword => "disconn/invalid_password",
            LoginDenied::VersionMismatch { .. } => "disconn/game_version",
            LoginDenied::ServerFull { .. } => "disconn/full_server",
            LoginDenied::ModMismatch { .. } => "disconn/mods",
        }
    }

    /// Placeholder arguments for the locale string.
    pub fn locale_args(&self) -> Vec<String> {
        match self {
            LoginDenied::VersionMismatch { expected, got } => vec![expected.clone(), got.clone()],
            LoginDenied::ServerFull { max_players } => vec![max_players.to_string()],
            _ => Vec::new(),
        }
    }

    /// Full text shown to the player, mod lists included.
    pub fn describe(&self) -> String {
        let mut text = self.to_string();
        if let LoginDenied::ModMismatch { missing, extra } = self {
            if !missing.is_empty() {
                text.push_str("\n\nMissing mods:");
                for m in missing {
                    text.push_str(&format!("\n - {m}"));
                }
            }
            if !extra.is_empty() {
                text.push_str("\n\nExtra mods:");
                for m in extra {
                    text.push_str(&format!("\n - {m}"));
                }
            }
        }
        text
    }
}

impl Encode for LoginDenied {
    fn encode(&self, w: &mut PacketWriter) {
        match self {
            LoginDenied::InvalidPassword => w.put_u8(0),
            LoginDenied::VersionMismatch { expected, got } => {
                w.put_u8(1);
                w.put_str(expected);
                w.put_str(got);
            }
            LoginDenied::ServerFull { max_players } => {
                w.put_u8(2);
                w.put_u8(*max_players);
            }
            LoginDenied::ModMismatch { missing, extra } => {
                w.put_u8(3);
                w.put_array(missing);
                w.put_array(extra);
            }
        }
    }
}

impl Decode for LoginDenied {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(LoginDenied::InvalidPassword),
            1 => Ok(LoginDenied::VersionMismatch {
                expected: r.get_str()?,
                got: r.get_str()?,
            }),
            2 => Ok(LoginDenied::ServerFull {
                max_players: r.get_u8()?,
            }),
            3 => Ok(LoginDenied::ModMismatch {
                missing: r.get_array()?,
                extra: r.get_array()?,
            }),
            other => Err(DecodeError::UnknownVariant {
                kind: "login denial",
                value: other,
            }),
        }
    }
}

/// Host-side admission rules, checked in order: password, version,
/// capacity, mods.
#[derive(Debug, Clone)]
pub struct LoginPolicy {
    pub password: String,
    pub build_version: String,
    pub max_players: u8,
    pub mods: BTreeSet<ModInfo>,
}

impl LoginPolicy {
    pub fn from_config(config: &SessionConfig, mods: impl IntoIterator<Item = ModInfo>) -> Self {
        Self {
            password: config.password.clone(),
            build_version: config.build_version.clone(),
            max_players: config.max_players,
            mods: mods.into_iter().collect(),
        }
    }

    pub fn evaluate(&self, request: &LoginRequest, connected: usize) -> Result<(), LoginDenied> {
        let given = request.password.as_deref().unwrap_or("");
        if !self.password.is_empty() && given != self.password {
            warn!(username = %request.username, "Denied login due to invalid password");
            return Err(LoginDenied::InvalidPassword);
        }

        if request.build_version != self.build_version {
            warn!(
                username = %request.username,
                got = %request.build_version,
                expected = %self.build_version,
                "Denied login due to game version"
            );
            return Err(LoginDenied::VersionMismatch {
                expected: self.build_version.clone(),
                got: request.build_version.clone(),
            });
        }

        if connected >= self.max_players as usize {
            warn!(username = %request.username, connected, "Denied login, server full");
            return Err(LoginDenied::ServerFull {
                max_players: self.max_players,
            });
        }

        let theirs: BTreeSet<ModInfo> = request.mods.iter().cloned().collect();
        if theirs != self.mods {
            let missing: Vec<ModInfo> = self.mods.difference(&theirs).cloned().collect();
            let extra: Vec<ModInfo> = theirs.difference(&self.mods).cloned().collect();
            warn!(
                username = %request.username,
                missing = missing.len(),
                extra = extra.len(),
                "Denied login due to mod mismatch"
            );
            return Err(LoginDenied::ModMismatch { missing, extra });
        }

        info!(username = %request.username, "Login accepted");
        Ok(())
    }
}
