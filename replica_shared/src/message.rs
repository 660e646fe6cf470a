//! Application messages and their binding to delivery classes.
//!
//! A message payload is `id: u8` followed by the message body. Ids are
//! grouped by delivery class: `1..=9` unconnected, `10..=39` reliable
//! ordered, `40..` sequenced.

use bytes::Bytes;
use uuid::Uuid;

use crate::channel::DeliveryMethod;
use crate::codec::{DecodeError, PacketReader, PacketWriter};
use crate::error::{DisconnectReason, ProtocolError};
use crate::identity::{EntityKind, NetId};
use crate::item::{read_item_batch, write_item_batch, ItemUpdate, DEFAULT_COMPRESS_AFTER};
use crate::job::{JobData, JobUpdate, ValidationRequest, ValidationResponse};
use crate::lobby::LobbyServerData;
use crate::login::{LoginDenied, LoginRequest};
use crate::player::PlayerTransform;
use crate::replication::SnapshotBatch;
use crate::task::TaskRegistry;
use crate::trainset::{TrainsetDescribe, TrainsetPhysics};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    // Unconnected
    /// Server-browser probe; the id is the probed server's.
    ServerPing { server_id: Uuid },
    ServerPong { server_id: Uuid },
    DiscoveryRequest,
    DiscoveryResponse(Box<LobbyServerData>),
    Login(LoginRequest),
    LoginDenied(LoginDenied),
    Disconnect(DisconnectReason),

    // Reliable ordered
    LoginAccepted { player: u8, tick: u32, tick_rate: u32 },
    PlayerJoined { player: u8, username: String, guid: Uuid },
    PlayerLeft { player: u8 },
    TickSync { tick: u32 },
    EntitySpawn { id: NetId, kind: EntityKind, game_id: String },
    EntityDespawn { id: NetId },
    FullSnapshots(SnapshotBatch),
    TrainsetDescribe(TrainsetDescribe),
    /// Aggregate escalated to reliable because it carries a full resync.
    TrainsetSync(TrainsetPhysics),
    JobsCreate { station: NetId, jobs: Vec<JobData> },
    JobsUpdate(Vec<JobUpdate>),
    JobTakeRequest { job: NetId },
    JobTakeResponse { job: NetId, granted: bool, player: u8 },
    JobValidateRequest(ValidationRequest),
    JobValidateResponse(ValidationResponse),
    ItemUpdates(Vec<ItemUpdate>),
    Chat { text: String },
    PingUpdate { player: u8, ping_ms: u32 },
    ClientLoaded,

    // Sequenced
    DeltaSnapshots(SnapshotBatch),
    TrainsetPhysics(TrainsetPhysics),
    PlayerTransform { player: u8, transform: PlayerTransform },
}

impl Message {
    pub fn id(&self) -> u8 {
        match self {
            Message::ServerPing { .. } => 1,
            Message::ServerPong { .. } => 2,
            Message::DiscoveryRequest => 3,
            Message::DiscoveryResponse(_) => 4,
            Message::Login(_) => 5,
            Message::LoginDenied(_) => 6,
            Message::Disconnect(_) => 7,
            Message::LoginAccepted { .. } => 10,
            Message::PlayerJoined { .. } => 11,
            Message::PlayerLeft { .. } => 12,
            Message::TickSync { .. } => 13,
            Message::EntitySpawn { .. } => 14,
            Message::EntityDespawn { .. } => 15,
            Message::FullSnapshots(_) => 16,
            Message::TrainsetDescribe(_) => 17,
            Message::TrainsetSync(_) => 18,
            Message::JobsCreate { .. } => 19,
            Message::JobsUpdate(_) => 20,
            Message::JobTakeRequest { .. } => 21,
            Message::JobTakeResponse { .. } => 22,
            Message::JobValidateRequest(_) => 23,
            Message::JobValidateResponse(_) => 24,
            Message::ItemUpdates(_) => 25,
            Message::Chat { .. } => 26,
            Message::PingUpdate { .. } => 27,
            Message::ClientLoaded => 28,
            Message::DeltaSnapshots(_) => 40,
            Message::TrainsetPhysics(_) => 41,
            Message::PlayerTransform { .. } => 42,
        }
    }

    pub fn delivery(&self) -> DeliveryMethod {
        delivery_for_id(self.id())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::ServerPing { .. } => "ServerPing",
            Message::ServerPong { .. } => "ServerPong",
            Message::DiscoveryRequest => "DiscoveryRequest",
            Message::DiscoveryResponse(_) => "DiscoveryResponse",
            Message::Login(_) => "Login",
            Message::LoginDenied(_) => "LoginDenied",
            Message::Disconnect(_) => "Disconnect",
            Message::LoginAccepted { .. } => "LoginAccepted",
            Message::PlayerJoined { .. } => "PlayerJoined",
            Message::PlayerLeft { .. } => "PlayerLeft",
            Message::TickSync { .. } => "TickSync",
            Message::EntitySpawn { .. } => "EntitySpawn",
            Message::EntityDespawn { .. } => "EntityDespawn",
            Message::FullSnapshots(_) => "FullSnapshots",
            Message::TrainsetDescribe(_) => "TrainsetDescribe",
            Message::TrainsetSync(_) => "TrainsetSync",
            Message::JobsCreate { .. } => "JobsCreate",
            Message::JobsUpdate(_) => "JobsUpdate",
            Message::JobTakeRequest { .. } => "JobTakeRequest",
            Message::JobTakeResponse { .. } => "JobTakeResponse",
            Message::JobValidateRequest(_) => "JobValidateRequest",
            Message::JobValidateResponse(_) => "JobValidateResponse",
            Message::ItemUpdates(_) => "ItemUpdates",
            Message::Chat { .. } => "Chat",
            Message::PingUpdate { .. } => "PingUpdate",
            Message::ClientLoaded => "ClientLoaded",
            Message::DeltaSnapshots(_) => "DeltaSnapshots",
            Message::TrainsetPhysics(_) => "TrainsetPhysics",
            Message::PlayerTransform { .. } => "PlayerTransform",
        }
    }
}

pub fn delivery_for_id(id: u8) -> DeliveryMethod {
    match id {
        0..=9 => DeliveryMethod::Unconnected,
        10..=39 => DeliveryMethod::ReliableOrdered,
        _ => DeliveryMethod::Sequenced,
    }
}

/// Encoder/decoder for [`Message`] with the session's task registry and
/// compression threshold.
#[derive(Debug, Clone)]
pub struct Protocol {
    pub tasks: TaskRegistry,
    pub item_compress_after: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            tasks: TaskRegistry::new(),
            item_compress_after: DEFAULT_COMPRESS_AFTER,
        }
    }
}

impl Protocol {
    pub fn new(tasks: TaskRegistry, item_compress_after: usize) -> Self {
        Self {
            tasks,
            item_compress_after,
        }
    }

    pub fn encode(&self, msg: &Message) -> Result<Bytes, ProtocolError> {
        let mut w = PacketWriter::new();
        w.put_u8(msg.id());
        match msg {
            Message::ServerPing { server_id } | Message::ServerPong { server_id } => {
                w.put(server_id.as_bytes());
            }
            Message::DiscoveryRequest | Message::ClientLoaded => {}
            Message::DiscoveryResponse(data) => w.put(data.as_ref()),
            Message::Login(req) => w.put(req),
            Message::LoginDenied(denied) => w.put(denied),
            Message::Disconnect(reason) => w.put(reason),
            Message::LoginAccepted {
                player,
                tick,
                tick_rate,
            } => {
                w.put_u8(*player);
                w.put_u32(*tick);
                w.put_u32(*tick_rate);
            }
            Message::PlayerJoined {
                player,
                username,
                guid,
            } => {
                w.put_u8(*player);
                w.put_str(username);
                w.put(guid.as_bytes());
            }
            Message::PlayerLeft { player } => w.put_u8(*player),
            Message::TickSync { tick } => w.put_u32(*tick),
            Message::EntitySpawn { id, kind, game_id } => {
                w.put(id);
                w.put(kind);
                w.put_str(game_id);
            }
            Message::EntityDespawn { id } => w.put(id),
            Message::FullSnapshots(batch) | Message::DeltaSnapshots(batch) => w.put(batch),
            Message::TrainsetDescribe(d) => w.put(d),
            Message::TrainsetSync(p) | Message::TrainsetPhysics(p) => w.put(p),
            Message::JobsCreate { station, jobs } => {
                w.put(station);
                if jobs.len() > u16::MAX as usize {
                    return Err(ProtocolError::TooMany {
                        what: "jobs",
                        count: jobs.len(),
                        limit: u16::MAX as usize,
                    });
                }
                w.put_u16(jobs.len() as u16);
                for job in jobs {
                    job.write(&mut w, &self.tasks)?;
                }
            }
            Message::JobsUpdate(updates) => w.put_array(updates),
            Message::JobTakeRequest { job } => w.put(job),
            Message::JobTakeResponse {
                job,
                granted,
                player,
            } => {
                w.put(job);
                w.put_bool(*granted);
                w.put_u8(*player);
            }
            Message::JobValidateRequest(req) => w.put(req),
            Message::JobValidateResponse(resp) => w.put(resp),
            Message::ItemUpdates(items) => {
                write_item_batch(&mut w, items, self.item_compress_after)?;
            }
            Message::Chat { text } => w.put_str(text),
            Message::PingUpdate { player, ping_ms } => {
                w.put_u8(*player);
                w.put_u32(*ping_ms);
            }
            Message::PlayerTransform { player, transform } => {
                w.put_u8(*player);
                w.put(transform);
            }
        }
        w.check_limits()?;
        Ok(w.freeze())
    }

    /// Decodes one payload; trailing bytes are an error.
    pub fn decode(&self, payload: &[u8]) -> Result<Message, DecodeError> {
        let mut r = PacketReader::new(payload);
        let id = r.get_u8()?;
        let msg = match id {
            1 => Message::ServerPing {
                server_id: Uuid::from_bytes(r.get()?),
            },
            2 => Message::ServerPong {
                server_id: Uuid::from_bytes(r.get()?),
            },
            3 => Message::DiscoveryRequest,
            4 => Message::DiscoveryResponse(Box::new(r.get()?)),
            5 => Message::Login(r.get()?),
            6 => Message::LoginDenied(r.get()?),
            7 => Message::Disconnect(r.get()?),
            10 => Message::LoginAccepted {
                player: r.get_u8()?,
                tick: r.get_u32()?,
                tick_rate: r.get_u32()?,
            },
            11 => Message::PlayerJoined {
                player: r.get_u8()?,
                username: r.get_str()?,
                guid: Uuid::from_bytes(r.get()?),
            },
            12 => Message::PlayerLeft { player: r.get_u8()? },
            13 => Message::TickSync { tick: r.get_u32()? },
            14 => Message::EntitySpawn {
                id: r.get()?,
                kind: r.get()?,
                game_id: r.get_str()?,
            },
            15 => Message::EntityDespawn { id: r.get()? },
            16 => Message::FullSnapshots(r.get()?),
            17 => Message::TrainsetDescribe(r.get()?),
            18 => Message::TrainsetSync(r.get()?),
            19 => {
                let station = r.get()?;
                let count = r.get_u16()? as usize;
                let mut jobs = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    jobs.push(JobData::read(&mut r, &self.tasks)?);
                }
                Message::JobsCreate { station, jobs }
            }
            20 => Message::JobsUpdate(r.get_array()?),
            21 => Message::JobTakeRequest { job: r.get()? },
            22 => Message::JobTakeResponse {
                job: r.get()?,
                granted: r.get_bool()?,
                player: r.get_u8()?,
            },
            23 => Message::JobValidateRequest(r.get()?),
            24 => Message::JobValidateResponse(r.get()?),
            25 => Message::ItemUpdates(read_item_batch(&mut r)?),
            26 => Message::Chat { text: r.get_str()? },
            27 => Message::PingUpdate {
                player: r.get_u8()?,
                ping_ms: r.get_u32()?,
            },
            28 => Message::ClientLoaded,
            40 => Message::DeltaSnapshots(r.get()?),
            41 => Message::TrainsetPhysics(r.get()?),
            42 => Message::PlayerTransform {
                player: r.get_u8()?,
                transform: r.get()?,
            },
            other => {
                return Err(DecodeError::UnknownVariant {
                    kind: "message",
                    value: other,
                })
            }
        };
        if !r.is_empty() {
            return Err(DecodeError::invalid(
                "message",
                format!("{} trailing bytes after {}", r.remaining(), msg.name()),
            ));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{ValidationKind, ValidationOutcome};
    use crate::math::{Quat, Vec3};
    use crate::replication::EntitySnapshot;

    fn round_trip(msg: Message) {
        let proto = Protocol::default();
        let bytes = proto.encode(&msg).unwrap();
        assert_eq!(bytes[0], msg.id());
        assert_eq!(proto.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn every_message_has_one_delivery_class() {
        assert_eq!(
            Message::ServerPing {
                server_id: Uuid::nil()
            }
            .delivery(),
            DeliveryMethod::Unconnected
        );
        assert_eq!(Message::TickSync { tick: 1 }.delivery(), DeliveryMethod::ReliableOrdered);
        assert_eq!(
            Message::Chat { text: String::new() }.delivery(),
            DeliveryMethod::ReliableOrdered
        );
        let physics = TrainsetPhysics {
            tick: 1,
            trainset: NetId(1),
            parts: vec![],
        };
        assert_eq!(
            Message::TrainsetPhysics(physics.clone()).delivery(),
            DeliveryMethod::Sequenced
        );
        assert_eq!(
            Message::TrainsetSync(physics).delivery(),
            DeliveryMethod::ReliableOrdered
        );
    }

    #[test]
    fn representative_messages_survive_the_wire() {
        round_trip(Message::ServerPong {
            server_id: Uuid::from_u128(77),
        });
        round_trip(Message::LoginAccepted {
            player: 2,
            tick: 4_800,
            tick_rate: 24,
        });
        round_trip(Message::DeltaSnapshots(SnapshotBatch {
            tick: 9,
            snapshots: vec![EntitySnapshot {
                id: NetId(3),
                payload: Bytes::from_static(&[1, 0, 1]),
            }],
        }));
        round_trip(Message::JobValidateRequest(ValidationRequest {
            job: NetId(12),
            station: NetId(4),
            kind: ValidationKind::Booklet,
        }));
        round_trip(Message::JobValidateResponse(ValidationResponse {
            job: NetId(12),
            outcome: ValidationOutcome::Approved,
        }));
        round_trip(Message::PlayerTransform {
            player: 1,
            transform: PlayerTransform {
                position: Vec3::new(1.0, 2.0, 3.0),
                rotation_y: 90.0,
                car: Some(NetId(8)),
            },
        });
        round_trip(Message::ItemUpdates(vec![
            ItemUpdate::create(NetId(5), "lantern", Vec3::ZERO, Quat::IDENTITY),
            ItemUpdate::destroy(NetId(6)),
        ]));
    }

    #[test]
    fn jobs_create_carries_task_trees() {
        round_trip(Message::JobsCreate {
            station: NetId(40),
            jobs: vec![JobData {
                net_id: NetId(41),
                game_id: "SM-FH-01".into(),
                ..Default::default()
            }],
        });
    }

    #[test]
    fn unknown_message_id_is_a_decode_error() {
        let proto = Protocol::default();
        assert!(matches!(
            proto.decode(&[200]),
            Err(DecodeError::UnknownVariant { kind: "message", value: 200 })
        ));
        assert!(proto.decode(&[13, 1, 0, 0, 0, 9]).is_err());
    }

    #[test]
    fn oversized_chat_is_refused_at_encode() {
        let proto = Protocol::default();
        let text = "a".repeat(u16::MAX as usize + 1);
        assert!(matches!(
            proto.encode(&Message::Chat { text }),
            Err(ProtocolError::TooMany { what: "string bytes", .. })
        ));
        assert!(proto.encode(&Message::Chat { text: "hi".into() }).is_ok());
    }
}
