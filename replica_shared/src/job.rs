//! Job lifecycle: host-side board, client-side mirror and the validation
//! handshake between them.
//!
//! The host owns every state transition. Clients hold a read-only mirror
//! built from creation batches and state updates, and ask the host to take
//! or complete jobs when the player validates a paper at a station.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};
use crate::compression;
use crate::error::ProtocolError;
use crate::identity::NetId;
use crate::math::{Quat, Vec3};
use crate::task::{Task, TaskRegistry};
use crate::tick::DeferredQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JobState {
    #[default]
    Available = 0,
    InProgress = 1,
    Completed = 2,
    Abandoned = 3,
    Expired = 4,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Abandoned | JobState::Expired
        )
    }
}

impl Encode for JobState {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for JobState {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(JobState::Available),
            1 => Ok(JobState::InProgress),
            2 => Ok(JobState::Completed),
            3 => Ok(JobState::Abandoned),
            4 => Ok(JobState::Expired),
            other => Err(DecodeError::UnknownVariant {
                kind: "job state",
                value: other,
            }),
        }
    }
}

/// Origin and destination yard ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StationsChain {
    pub origin: String,
    pub destination: String,
}

impl Encode for StationsChain {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_str(&self.origin);
        w.put_str(&self.destination);
    }
}

impl Decode for StationsChain {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            origin: r.get_str()?,
            destination: r.get_str()?,
        })
    }
}

/// Where a job's paper item lies in the world.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ItemPlacement {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Encode for ItemPlacement {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.position);
        w.put(&self.rotation);
    }
}

impl Decode for ItemPlacement {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            position: r.get()?,
            rotation: r.get()?,
        })
    }
}

/// Everything a client needs to rebuild one job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobData {
    pub net_id: NetId,
    pub job_type: u8,
    /// Stable game-side id, e.g. `"FF-SU-04"`.
    pub game_id: String,
    pub tasks: Vec<Task>,
    pub chain: StationsChain,
    pub required_licenses: i32,
    pub start_time: f32,
    pub finish_time: f32,
    pub initial_wage: f32,
    pub state: JobState,
    pub time_limit: f32,
    /// Paper item (overview or booklet) currently representing the job.
    pub item: NetId,
    pub item_placement: Option<ItemPlacement>,
}

impl JobData {
    /// Task lists travel as a gzip blob inside the job record.
    pub fn write(&self, w: &mut PacketWriter, tasks: &TaskRegistry) -> Result<(), ProtocolError> {
        let mut inner = PacketWriter::new();
        tasks.write_task_list(&self.tasks, &mut inner)?;
        let packed = compression::compress(inner.as_slice())?;

        w.put(&self.net_id);
        w.put_u8(self.job_type);
        w.put_str(&self.game_id);
        w.put_blob(&packed);
        w.put(&self.chain);
        w.put_i32(self.required_licenses);
        w.put_f32(self.start_time);
        w.put_f32(self.finish_time);
        w.put_f32(self.initial_wage);
        w.put(&self.state);
        w.put_f32(self.time_limit);
        w.put(&self.item);
        w.put(&self.item_placement);
        Ok(())
    }

    pub fn read(r: &mut PacketReader<'_>, tasks: &TaskRegistry) -> Result<Self, DecodeError> {
        let net_id = r.get()?;
        let job_type = r.get_u8()?;
        let game_id = r.get_str()?;
        let inflated = compression::decompress(r.get_blob()?)?;
        let mut inner = PacketReader::new(&inflated);
        let task_list = tasks.read_task_list(&mut inner)?;
        if !inner.is_empty() {
            return Err(DecodeError::invalid(
                "job tasks",
                format!("{} trailing bytes", inner.remaining()),
            ));
        }
        Ok(Self {
            net_id,
            job_type,
            game_id,
            tasks: task_list,
            chain: r.get()?,
            required_licenses: r.get_i32()?,
            start_time: r.get_f32()?,
            finish_time: r.get_f32()?,
            initial_wage: r.get_f32()?,
            state: r.get()?,
            time_limit: r.get_f32()?,
            item: r.get()?,
            item_placement: r.get()?,
        })
    }
}

/// New state of a job that still exists.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JobChange {
    pub state: JobState,
    pub start_time: f32,
    pub finish_time: f32,
    pub item: NetId,
    /// Station whose validator last handled the job.
    pub validation_station: NetId,
    pub item_placement: Option<ItemPlacement>,
}

/// One entry of a `JobsUpdate` batch. `change == None` removes the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobUpdate {
    pub job: NetId,
    pub change: Option<JobChange>,
}

impl JobUpdate {
    pub fn invalid(job: NetId) -> Self {
        Self { job, change: None }
    }

    pub fn is_invalid(&self) -> bool {
        self.change.is_none()
    }
}

impl Encode for JobUpdate {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.job);
        w.put_bool(self.change.is_none());
        if let Some(c) = &self.change {
            w.put(&c.state);
            w.put_f32(c.start_time);
            w.put_f32(c.finish_time);
            w.put(&c.item);
            w.put(&c.validation_station);
            w.put(&c.item_placement);
        }
    }
}

impl Decode for JobUpdate {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        let job = r.get()?;
        if r.get_bool()? {
            return Ok(Self::invalid(job));
        }
        Ok(Self {
            job,
            change: Some(JobChange {
                state: r.get()?,
                start_time: r.get_f32()?,
                finish_time: r.get_f32()?,
                item: r.get()?,
                validation_station: r.get()?,
                item_placement: r.get()?,
            }),
        })
    }
}

/// Which paper the player handed to the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    /// Job overview: taking the job.
    Overview = 0,
    /// Job booklet: handing the job in.
    Booklet = 1,
}

impl Encode for ValidationKind {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for ValidationKind {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(ValidationKind::Overview),
            1 => Ok(ValidationKind::Booklet),
            other => Err(DecodeError::UnknownVariant {
                kind: "validation kind",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRequest {
    pub job: NetId,
    pub station: NetId,
    pub kind: ValidationKind,
}

impl Encode for ValidationRequest {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.job);
        w.put(&self.station);
        w.put(&self.kind);
    }
}

impl Decode for ValidationRequest {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            job: r.get()?,
            station: r.get()?,
            kind: r.get()?,
        })
    }
}

/// Why a take or validation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDenial {
    UnknownJob = 0,
    NotAvailable = 1,
    NotOwner = 2,
    NotInProgress = 3,
    /// Produced locally when the host never answered.
    TimedOut = 4,
}

impl Encode for JobDenial {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_u8(*self as u8);
    }
}

impl Decode for JobDenial {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(JobDenial::UnknownJob),
            1 => Ok(JobDenial::NotAvailable),
            2 => Ok(JobDenial::NotOwner),
            3 => Ok(JobDenial::NotInProgress),
            4 => Ok(JobDenial::TimedOut),
            other => Err(DecodeError::UnknownVariant {
                kind: "job denial",
                value: other,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Approved,
    Denied(JobDenial),
}

impl ValidationOutcome {
    pub fn is_approved(self) -> bool {
        self == ValidationOutcome::Approved
    }
}

impl From<Result<(), JobDenial>> for ValidationOutcome {
    fn from(r: Result<(), JobDenial>) -> Self {
        match r {
            Ok(()) => ValidationOutcome::Approved,
            Err(d) => ValidationOutcome::Denied(d),
        }
    }
}

impl Encode for ValidationOutcome {
    fn encode(&self, w: &mut PacketWriter) {
        match self {
            ValidationOutcome::Approved => w.put_bool(true),
            ValidationOutcome::Denied(d) => {
                w.put_bool(false);
                w.put(d);
            }
        }
    }
}

impl Decode for ValidationOutcome {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        if r.get_bool()? {
            Ok(ValidationOutcome::Approved)
        } else {
            Ok(ValidationOutcome::Denied(r.get()?))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResponse {
    pub job: NetId,
    pub outcome: ValidationOutcome,
}

impl Encode for ValidationResponse {
    fn encode(&self, w: &mut PacketWriter) {
        w.put(&self.job);
        w.put(&self.outcome);
    }
}

impl Decode for ValidationResponse {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            job: r.get()?,
            outcome: r.get()?,
        })
    }
}

#[derive(Debug)]
struct BoardEntry {
    station: NetId,
    data: JobData,
    owner: Option<u8>,
    validation_station: NetId,
}

/// Host-side job table. Every transition queues a [`JobUpdate`].
#[derive(Debug, Default)]
pub struct JobBoard {
    jobs: BTreeMap<NetId, BoardEntry>,
    updates: Vec<JobUpdate>,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job offered at `station`. The job's `net_id` must already be
    /// allocated.
    pub fn add(&mut self, station: NetId, job: JobData) -> Result<(), ProtocolError> {
        if !job.net_id.is_assigned() {
            return Err(ProtocolError::UnknownIdentity(job.net_id));
        }
        debug!(job = %job.net_id, game_id = %job.game_id, station = %station, "Job added");
        self.jobs.insert(
            job.net_id,
            BoardEntry {
                station,
                data: job,
                owner: None,
                validation_station: NetId::UNASSIGNED,
            },
        );
        Ok(())
    }

    pub fn get(&self, job: NetId) -> Option<&JobData> {
        self.jobs.get(&job).map(|e| &e.data)
    }

    pub fn owner_of(&self, job: NetId) -> Option<u8> {
        self.jobs.get(&job).and_then(|e| e.owner)
    }

    /// Station of the last approved validation.
    pub fn validation_station(&self, job: NetId) -> Option<NetId> {
        self.jobs
            .get(&job)
            .map(|e| e.validation_station)
            .filter(|s| s.is_assigned())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs grouped by offering station, for creation broadcasts.
    pub fn by_station(&self) -> BTreeMap<NetId, Vec<&JobData>> {
        let mut out: BTreeMap<NetId, Vec<&JobData>> = BTreeMap::new();
        for entry in self.jobs.values() {
            out.entry(entry.station).or_default().push(&entry.data);
        }
        out
    }

    /// Available → InProgress; `player` becomes the owner.
    pub fn take(&mut self, job: NetId, player: u8, game_time: f32) -> Result<(), JobDenial> {
        let entry = self.jobs.get_mut(&job).ok_or(JobDenial::UnknownJob)?;
        if entry.data.state != JobState::Available {
            return Err(JobDenial::NotAvailable);
        }
        entry.data.state = JobState::InProgress;
        entry.data.start_time = game_time;
        entry.owner = Some(player);
        info!(job = %job, player, "Job taken");
        self.queue_change(job);
        Ok(())
    }

    /// InProgress → Completed, only by the owner.
    pub fn complete(&mut self, job: NetId, player: u8, game_time: f32) -> Result<(), JobDenial> {
        self.finish(job, Some(player), JobState::Completed, game_time)
    }

    /// InProgress → Abandoned, only by the owner.
    pub fn abandon(&mut self, job: NetId, player: u8, game_time: f32) -> Result<(), JobDenial> {
        self.finish(job, Some(player), JobState::Abandoned, game_time)
    }

    /// Available → Expired.
    pub fn expire(&mut self, job: NetId, game_time: f32) -> Result<(), JobDenial> {
        let entry = self.jobs.get_mut(&job).ok_or(JobDenial::UnknownJob)?;
        if entry.data.state != JobState::Available {
            return Err(JobDenial::NotAvailable);
        }
        entry.data.state = JobState::Expired;
        entry.data.finish_time = game_time;
        self.queue_change(job);
        Ok(())
    }

    fn finish(
        &mut self,
        job: NetId,
        player: Option<u8>,
        to: JobState,
        game_time: f32,
    ) -> Result<(), JobDenial> {
        let entry = self.jobs.get_mut(&job).ok_or(JobDenial::UnknownJob)?;
        if entry.data.state != JobState::InProgress {
            return Err(JobDenial::NotInProgress);
        }
        if player.is_some() && entry.owner != player {
            return Err(JobDenial::NotOwner);
        }
        entry.data.state = to;
        entry.data.finish_time = game_time;
        info!(job = %job, state = ?to, "Job finished");
        self.queue_change(job);
        Ok(())
    }

    /// Authorizes a validator request: an overview takes the job, a booklet
    /// hands in a job the requester owns.
    pub fn validate(
        &mut self,
        request: &ValidationRequest,
        player: u8,
        game_time: f32,
    ) -> ValidationOutcome {
        // The approved transition's update carries the validating station.
        let previous = self
            .jobs
            .get_mut(&request.job)
            .map(|entry| std::mem::replace(&mut entry.validation_station, request.station));
        let result = match request.kind {
            ValidationKind::Overview => self.take(request.job, player, game_time),
            ValidationKind::Booklet => self.complete(request.job, player, game_time),
        };
        if let Err(denial) = result {
            debug!(job = %request.job, player, ?denial, kind = ?request.kind, "Validation denied");
            if let (Some(entry), Some(previous)) = (self.jobs.get_mut(&request.job), previous) {
                entry.validation_station = previous;
            }
        }
        result.into()
    }

    /// Drops a job and queues its removal.
    pub fn remove(&mut self, job: NetId) -> Option<JobData> {
        let entry = self.jobs.remove(&job)?;
        self.updates.push(JobUpdate::invalid(job));
        Some(entry.data)
    }

    /// Releases every job a leaving player owned back to Available.
    pub fn release_owner(&mut self, player: u8) -> usize {
        let owned: Vec<NetId> = self
            .jobs
            .iter()
            .filter(|(_, e)| e.owner == Some(player) && e.data.state == JobState::InProgress)
            .map(|(id, _)| *id)
            .collect();
        for id in &owned {
            if let Some(entry) = self.jobs.get_mut(id) {
                entry.owner = None;
                entry.data.state = JobState::Available;
            }
            self.queue_change(*id);
        }
        owned.len()
    }

    pub fn drain_updates(&mut self) -> Vec<JobUpdate> {
        std::mem::take(&mut self.updates)
    }

    fn queue_change(&mut self, job: NetId) {
        let Some(entry) = self.jobs.get(&job) else {
            return;
        };
        let change = JobChange {
            state: entry.data.state,
            start_time: entry.data.start_time,
            finish_time: entry.data.finish_time,
            item: entry.data.item,
            validation_station: entry.validation_station,
            item_placement: entry.data.item_placement,
        };
        // Later changes to the same job in one batch supersede earlier ones.
        if let Some(existing) = self.updates.iter_mut().find(|u| u.job == job) {
            existing.change = Some(change);
        } else {
            self.updates.push(JobUpdate {
                job,
                change: Some(change),
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingValidation {
    request: ValidationRequest,
    attempt: u32,
}

/// Client-side copy of the host's jobs plus in-flight validations.
#[derive(Debug, Default)]
pub struct JobMirror {
    jobs: BTreeMap<NetId, JobData>,
    stations: HashMap<NetId, NetId>,
    pending: HashMap<NetId, PendingValidation>,
    timeouts: DeferredQueue<(NetId, u32)>,
    attempts: u32,
}

impl JobMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job: NetId) -> Option<&JobData> {
        self.jobs.get(&job)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn station_of(&self, job: NetId) -> Option<NetId> {
        self.stations.get(&job).copied()
    }

    pub fn apply_create(&mut self, station: NetId, jobs: Vec<JobData>) -> usize {
        let n = jobs.len();
        for job in jobs {
            self.stations.insert(job.net_id, station);
            self.jobs.insert(job.net_id, job);
        }
        debug!(station = %station, jobs = n, "Jobs created");
        n
    }

    /// Applies a `JobsUpdate` batch; returns how many entries matched a job.
    pub fn apply_updates(&mut self, updates: &[JobUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            match update.change {
                None => {
                    if self.jobs.remove(&update.job).is_some() {
                        self.stations.remove(&update.job);
                        self.pending.remove(&update.job);
                        applied += 1;
                    }
                }
                Some(change) => {
                    let Some(job) = self.jobs.get_mut(&update.job) else {
                        debug!(job = %update.job, "Update for unknown job");
                        continue;
                    };
                    job.state = change.state;
                    job.start_time = change.start_time;
                    job.finish_time = change.finish_time;
                    job.item = change.item;
                    job.item_placement = change.item_placement;
                    applied += 1;
                }
            }
        }
        applied
    }

    /// Blocks the job's paper and returns the request to send, or `None` if
    /// a validation for this job is already in flight.
    pub fn request_validation(
        &mut self,
        job: NetId,
        station: NetId,
        kind: ValidationKind,
        now_tick: u32,
        timeout_ticks: u32,
    ) -> Option<ValidationRequest> {
        if self.pending.contains_key(&job) {
            debug!(job = %job, "Validation already pending");
            return None;
        }
        self.attempts = self.attempts.wrapping_add(1);
        let request = ValidationRequest { job, station, kind };
        self.pending.insert(
            job,
            PendingValidation {
                request,
                attempt: self.attempts,
            },
        );
        self.timeouts
            .schedule(now_tick.wrapping_add(timeout_ticks.max(1)), (job, self.attempts));
        Some(request)
    }

    pub fn is_blocked(&self, job: NetId) -> bool {
        self.pending.contains_key(&job)
    }

    /// Resolves a pending validation. Responses that arrive after the local
    /// timeout already fired are ignored.
    pub fn on_validate_response(&mut self, response: &ValidationResponse) -> Option<ValidationOutcome> {
        let Some(pending) = self.pending.remove(&response.job) else {
            debug!(job = %response.job, "Late validation response ignored");
            return None;
        };
        self.timeouts
            .cancel_where(|(job, attempt)| *job == response.job && *attempt == pending.attempt);
        Some(response.outcome)
    }

    /// Expired requests resolve as local-only denials and unblock the job.
    pub fn poll_timeouts(&mut self, now_tick: u32) -> Vec<(ValidationRequest, ValidationOutcome)> {
        let mut out = Vec::new();
        for (job, attempt) in self.timeouts.due(now_tick) {
            let Some(pending) = self.pending.get(&job) else {
                continue;
            };
            if pending.attempt != attempt {
                continue;
            }
            let request = pending.request;
            self.pending.remove(&job);
            warn!(job = %job, kind = ?request.kind, "Validation timed out");
            out.push((request, ValidationOutcome::Denied(JobDenial::TimedOut)));
        }
        out
    }
}
