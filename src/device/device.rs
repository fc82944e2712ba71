//! One replicated block device
//!
//! Ties the components together: application writes flow through the
//! transfer log and out as packets, incoming packets mutate the log,
//! the bitmap and the state machine, and committed transitions queue
//! deferred work drained by a single dispatch loop. The device never
//! talks to a socket itself; it fills an outbox the embedding layer
//! pumps into a session, and consumes packets the session produced.

use super::config::{DeviceConfig, DurabilityMode, LostWritePolicy};
use super::errors::{DeviceError, DeviceResult};
use super::notify::Notifier;
use super::worker::{DeferredWork, WorkQueue};
use crate::bitmap::{decode_chunk, encode_chunk, plain_chunk, BitmapStore, ChunkOutcome,
    DecodeState, EncodedChunk, DEFAULT_MAX_CHUNK_BYTES};
use crate::meta::{MetaGeometry, Superblock, FLAG_CONSISTENT, FLAG_CRASHED_PRIMARY,
    FLAG_FULL_SYNC_PENDING, FLAG_PEER_OUTDATED, FLAG_WAS_CONNECTED, FLAG_WAS_PRIMARY,
    FLAG_WAS_UP_TO_DATE, META_BLOCK_SIZE, UUID_FLAG_CRASHED_PRIMARY, UUID_FLAG_INCONSISTENT};
use crate::observability::{emit, emit_error, emit_warn, Event};
use crate::proto::{Packet, ProtoError, WritePacket, WRITE_FLAG_MARK_IN_SYNC};
use crate::resync::{decide, PeerUuids, ResyncChunk, ResyncCoordinator, ResyncError,
    ResyncPhase, ResyncProgress, SyncDecision, SyncDirection};
use crate::state::{ConnectionState, DiskState, Policy, RejectionReason, Role, SideEffect,
    StateChange, StateMachine, Transition};
use crate::storage::{BlockStorage, SECTOR_SIZE};
use crate::tlog::{Disposition, TransferLog};
use rand::{rngs::StdRng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::Receiver;

/// Sectors of the activity-log area in the metadata layout.
const ACTIVITY_LOG_SECTORS: u32 = 8;

/// How an application write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Durable according to the configured durability mode.
    Durable,
    /// Locally durable but lost to the peer; resync will cover it.
    OutOfSync,
    /// Hard failure surfaced to the submitter.
    Failed,
}

/// Completion of one submitted write, surfaced to the embedding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCompletion {
    pub correlation_id: u64,
    pub outcome: WriteOutcome,
}

impl std::fmt::Debug for ReplicaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaDevice").finish_non_exhaustive()
    }
}

pub struct ReplicaDevice {
    config: DeviceConfig,
    machine: StateMachine,
    tlog: TransferLog,
    bitmap: BitmapStore,
    superblock: Superblock,
    resync: ResyncCoordinator,
    storage: Box<dyn BlockStorage>,
    rng: StdRng,

    outbox: VecDeque<Packet>,
    work: WorkQueue,
    completions: Vec<WriteCompletion>,
    notifier: Notifier,

    peer_uuids: Option<PeerUuids>,
    /// Generation the running resync will leave us on (target side).
    sync_uuid: Option<u64>,
    /// Peer bitmap being received, staged until complete then merged.
    recv_bitmap: Option<(BitmapStore, DecodeState)>,
    /// Resync data in flight, by correlation id.
    resync_inflight: HashMap<u64, ResyncChunk>,
    /// Writes received since the last barrier, for the barrier ack.
    recv_epoch_writes: u32,
    /// Device size both sides agreed on; writes past it are refused.
    agreed_sectors: u64,
    /// Outcome of the last cluster-wide change, for the requester.
    cluster_outcome: Option<Result<(), RejectionReason>>,
    /// Loaded metadata said the previous Primary incarnation never
    /// demoted cleanly; forces at least a partial resync on reconnect.
    crashed_primary: bool,
    /// The in-memory superblock has diverged from its on-disk image.
    meta_dirty: bool,
    next_correlation: u64,
}

impl ReplicaDevice {
    pub fn new(config: DeviceConfig, storage: Box<dyn BlockStorage>) -> DeviceResult<Self> {
        config.validate()?;
        let rng = StdRng::from_entropy();
        let bitmap = BitmapStore::new(config.bitmap_blocks());
        let (device_uuid, _) = config.node_id.as_u64_pair();
        let superblock = Superblock::new(device_uuid, derive_geometry(&config));
        let policy = Policy {
            allow_two_primaries: config.allow_two_primaries,
            verify_configured: config.verify_configured,
        };
        let agreed_sectors = config.device_sectors.min(storage.capacity_sectors());
        Ok(Self {
            config,
            machine: StateMachine::new(policy),
            tlog: TransferLog::new(),
            bitmap,
            superblock,
            resync: ResyncCoordinator::new(),
            storage,
            rng,
            outbox: VecDeque::new(),
            work: WorkQueue::new(),
            completions: Vec::new(),
            notifier: Notifier::new(),
            peer_uuids: None,
            sync_uuid: None,
            recv_bitmap: None,
            resync_inflight: HashMap::new(),
            recv_epoch_writes: 0,
            agreed_sectors,
            cluster_outcome: None,
            crashed_primary: false,
            meta_dirty: false,
            next_correlation: 1,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> crate::state::ReplicaState {
        self.machine.state()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn dirty_blocks(&self) -> u64 {
        self.bitmap.weight()
    }

    pub fn resync_phase(&self) -> ResyncPhase {
        self.resync.phase()
    }

    /// Packets queued for the peer, in order.
    pub fn drain_outbox(&mut self) -> Vec<Packet> {
        self.outbox.drain(..).collect()
    }

    /// Write completions since the last drain.
    pub fn drain_completions(&mut self) -> Vec<WriteCompletion> {
        std::mem::take(&mut self.completions)
    }

    /// Resolution of the last cluster-wide change, once available.
    pub fn take_cluster_outcome(&mut self) -> Option<Result<(), RejectionReason>> {
        self.cluster_outcome.take()
    }

    /// Encoded superblock to persist, if it changed since the last
    /// take. The embedder writes the block and the device considers the
    /// metadata synced.
    pub fn take_dirty_metadata(&mut self) -> Option<[u8; META_BLOCK_SIZE]> {
        if !self.meta_dirty {
            return None;
        }
        self.meta_dirty = false;
        emit(
            Event::MetaSync,
            &[("minor", &self.config.minor.to_string())],
        );
        Some(self.superblock.encode())
    }

    /// Adopt a previously persisted superblock. Geometry disagreement
    /// means the record belongs to a different device and is rejected.
    pub fn load_metadata(&mut self, block: &[u8]) -> DeviceResult<()> {
        let expected = derive_geometry(&self.config);
        let superblock = match Superblock::decode(block, expected) {
            Ok(sb) => sb,
            Err(err) => {
                emit_error(
                    Event::MetaInvalid,
                    &[
                        ("detail", &err.to_string()),
                        ("minor", &self.config.minor.to_string()),
                    ],
                );
                return Err(err.into());
            }
        };
        self.crashed_primary =
            superblock.has_flag(FLAG_CRASHED_PRIMARY) && superblock.has_flag(FLAG_WAS_PRIMARY);
        if superblock.effective_size_sectors != 0 {
            self.agreed_sectors = self.agreed_sectors.min(superblock.effective_size_sectors);
        }
        self.superblock = superblock;
        // an interrupted full sync leaves the whole device suspect
        if self.superblock.has_flag(FLAG_FULL_SYNC_PENDING) {
            self.bitmap.set_all();
            self.superblock.clear_flag(FLAG_FULL_SYNC_PENDING);
            self.meta_dirty = true;
            emit_warn(
                Event::FullSyncPending,
                &[("minor", &self.config.minor.to_string())],
            );
        }
        Ok(())
    }

    /// Waiter channel for committed state transitions.
    pub fn subscribe_state_changed(&mut self) -> Receiver<crate::state::ReplicaState> {
        self.notifier.subscribe_state_changed()
    }

    /// Waiter channel for successful barrier releases.
    pub fn subscribe_barrier_released(&mut self) -> Receiver<u32> {
        self.notifier.subscribe_barrier_released()
    }

    /// Waiter channel for resync progress steps.
    pub fn subscribe_resync_progress(&mut self) -> Receiver<ResyncProgress> {
        self.notifier.subscribe_resync_progress()
    }

    // ---- lifecycle -----------------------------------------------------

    /// Attach the backing disk, ending at `target` freshness.
    pub fn attach(&mut self, target: DiskState) -> DeviceResult<()> {
        let t = self
            .machine
            .propose(StateChange::new().disk(DiskState::Attaching))?;
        self.apply_transition(&t, false);
        let t = self.machine.propose(StateChange::new().disk(target))?;
        self.apply_transition(&t, false);
        Ok(())
    }

    /// Leave StandAlone and start looking for the peer.
    pub fn begin_connection(&mut self) -> DeviceResult<()> {
        let t = self
            .machine
            .propose(StateChange::new().connection(ConnectionState::Unconnected))?;
        self.apply_transition(&t, false);
        let t = self
            .machine
            .propose(StateChange::new().connection(ConnectionState::Connecting))?;
        self.apply_transition(&t, false);
        Ok(())
    }

    /// The transport handshake finished; the link is live. Queues our
    /// state, UUID chain and sizes for the peer.
    pub fn establish_connection(&mut self) -> DeviceResult<()> {
        let t = self
            .machine
            .force(StateChange::new().connection(ConnectionState::Connected));
        emit(
            Event::PeerConnected,
            &[("minor", &self.config.minor.to_string())],
        );
        self.apply_transition(&t, true);
        self.outbox.push_back(Packet::UuidSet {
            uuids: self.local_uuids_for_wire(),
        });
        self.outbox.push_back(Packet::Sizes {
            device_sectors: self.config.device_sectors,
            size_limit_sectors: 0,
            max_segment_bytes: DEFAULT_MAX_CHUNK_BYTES as u32,
            queue_order: 0,
        });
        Ok(())
    }

    /// The link died. Forces the error state and fails the transfer log.
    pub fn handle_disconnect(&mut self, reason: ConnectionState) {
        debug_assert!(reason.is_network_error() || reason == ConnectionState::Unconnected);
        emit_warn(
            Event::PeerLost,
            &[
                ("minor", &self.config.minor.to_string()),
                ("reason", &format!("{reason:?}")),
            ],
        );
        let t = self.machine.force(StateChange::new().connection(reason));
        self.apply_transition(&t, true);
    }

    // ---- role management ----------------------------------------------

    /// Ask to become Primary. Cluster-wide while connected: the request
    /// is staged and sent to the peer, and resolves asynchronously
    /// through [`take_cluster_outcome`](Self::take_cluster_outcome).
    pub fn promote(&mut self, now_millis: u64) -> DeviceResult<()> {
        let change = StateChange::new().role(Role::Primary);
        if self.machine.is_cluster_wide(change) {
            let deadline = now_millis + self.config.cluster_change_timeout_millis;
            self.machine.stage_cluster_change(change, deadline)?;
            emit(
                Event::ClusterChangeStaged,
                &[("minor", &self.config.minor.to_string()), ("target_role", "Primary")],
            );
            self.outbox.push_back(Packet::StateChangeRequest { change });
            return Ok(());
        }
        let t = self.machine.propose(change)?;
        self.apply_transition(&t, false);
        Ok(())
    }

    pub fn demote(&mut self) -> DeviceResult<()> {
        let t = self
            .machine
            .propose(StateChange::new().role(Role::Secondary))?;
        self.apply_transition(&t, false);
        Ok(())
    }

    /// Expire a staged cluster-wide change whose peer never answered.
    pub fn poll_timeouts(&mut self, now_millis: u64) {
        if let Some(reason) = self.machine.poll_cluster_timeout(now_millis) {
            emit_warn(
                Event::ClusterChangeResolved,
                &[
                    ("minor", &self.config.minor.to_string()),
                    ("outcome", "timeout"),
                ],
            );
            self.cluster_outcome = Some(Err(reason));
        }
    }

    // ---- application i/o ----------------------------------------------

    /// Submit one application write. Returns the correlation id its
    /// completion will carry.
    pub fn submit_write(&mut self, sector: u64, data: &[u8]) -> DeviceResult<u64> {
        let state = self.machine.state();
        if state.role != Role::Primary {
            return Err(DeviceError::NotPrimary);
        }
        if state.suspended {
            return Err(DeviceError::Suspended);
        }
        let sectors = (data.len() / SECTOR_SIZE) as u64;
        if sector + sectors > self.agreed_sectors {
            return Err(DeviceError::BeyondAgreedSize {
                sector,
                sectors,
                agreed: self.agreed_sectors,
            });
        }

        self.storage.write_sectors(sector, data)?;
        let correlation_id = self.next_correlation;
        self.next_correlation += 1;

        if state.connection >= ConnectionState::Connected {
            let handle = self.tlog.admit(
                sector,
                data.len() as u32,
                correlation_id,
                Disposition::BothPending,
            );
            // the local write above is already durable
            self.tlog.local_complete(handle)?;
            if self.config.durability == DurabilityMode::WriteBehind {
                self.completions.push(WriteCompletion {
                    correlation_id,
                    outcome: WriteOutcome::Durable,
                });
            }
            self.outbox.push_back(Packet::Data(WritePacket {
                sector,
                correlation_id,
                flags: 0,
                payload: data.to_vec(),
                digest: None,
            }));
        } else {
            // no peer: the write is out of sync until a resync covers it
            self.mark_sectors_dirty(sector, sectors)?;
            self.completions.push(WriteCompletion {
                correlation_id,
                outcome: WriteOutcome::Durable,
            });
        }
        Ok(correlation_id)
    }

    /// Read back sectors, for the embedder and the verify path.
    pub fn read(&self, sector: u64, buf: &mut [u8]) -> DeviceResult<()> {
        self.storage.read_sectors(sector, buf)?;
        Ok(())
    }

    /// Close the current epoch and queue the barrier packet.
    pub fn issue_barrier(&mut self) -> u32 {
        let barrier_number = self.tlog.open_barrier();
        emit(
            Event::BarrierOpened,
            &[
                ("minor", &self.config.minor.to_string()),
                ("barrier", &barrier_number.to_string()),
            ],
        );
        self.outbox.push_back(Packet::Barrier { barrier_number });
        barrier_number
    }

    // ---- resync --------------------------------------------------------

    /// Compare UUID chains and start whatever sync the comparison
    /// demands. Call once both sides exchanged their UUID sets.
    pub fn decide_resync(&mut self) -> DeviceResult<SyncDecision> {
        let peer = self
            .peer_uuids
            .ok_or(DeviceError::Rejected(RejectionReason::NeedConnection))?;
        let decision = decide(&self.superblock.uuids, self.local_uuid_flags(), &peer);
        emit(
            Event::ResyncDecision,
            &[
                ("decision", &format!("{decision:?}")),
                ("minor", &self.config.minor.to_string()),
            ],
        );
        match decision {
            SyncDecision::NoSync => {}
            SyncDecision::Partial(direction) => self.enter_sync_state(direction)?,
            SyncDecision::Full(direction) => {
                self.bitmap.set_all();
                // must survive a crash until the full sync completes
                self.superblock.set_flag(FLAG_FULL_SYNC_PENDING);
                self.flush_metadata();
                self.enter_sync_state(direction)?;
            }
            SyncDecision::Unrelated => {
                return Err(ResyncError::UnrelatedData.into());
            }
        }
        Ok(decision)
    }

    /// Queue our whole bitmap for the peer, compressed where it pays.
    pub fn send_bitmap(&mut self) {
        let mut cursor = 0u64;
        loop {
            match encode_chunk(&self.bitmap, cursor, DEFAULT_MAX_CHUNK_BYTES) {
                ChunkOutcome::Compressed {
                    chunk,
                    cursor: next,
                    finished,
                } => {
                    self.outbox.push_back(Packet::BitmapCompressed {
                        start_is_set: chunk.start_is_set,
                        runs: chunk.runs,
                    });
                    cursor = next;
                    if finished {
                        break;
                    }
                }
                ChunkOutcome::Incompressible => {
                    let (chunk, next, finished) =
                        plain_chunk(&self.bitmap, cursor, DEFAULT_MAX_CHUNK_BYTES);
                    self.outbox.push_back(Packet::BitmapPlain {
                        word_offset: chunk.word_offset as u32,
                        words: chunk.words,
                    });
                    cursor = next;
                    if finished {
                        break;
                    }
                }
            }
        }
    }

    /// Drive one step of a running source resync: pick the next dirty
    /// run, read it, queue the data. Returns false when there was
    /// nothing to do.
    pub fn resync_step(&mut self) -> DeviceResult<bool> {
        if self.resync.direction() != SyncDirection::Source {
            return Ok(false);
        }
        let chunk = match self
            .resync
            .next_chunk(&self.bitmap, self.config.max_resync_chunk_blocks)
        {
            Some(chunk) => chunk,
            None => return Ok(false),
        };
        let sector = chunk.block * self.config.sectors_per_block();
        let sectors = (chunk.count * self.config.sectors_per_block())
            .min(self.agreed_sectors.saturating_sub(sector));
        let mut data = vec![0u8; sectors as usize * SECTOR_SIZE];
        self.storage.read_sectors(sector, &mut data)?;

        let correlation_id = self.next_correlation;
        self.next_correlation += 1;
        self.resync_inflight.insert(correlation_id, chunk);
        self.outbox.push_back(Packet::Data(WritePacket {
            sector,
            correlation_id,
            flags: WRITE_FLAG_MARK_IN_SYNC,
            payload: data,
            digest: None,
        }));
        Ok(true)
    }

    /// Pause or resume the running resync on behalf of the operator.
    pub fn set_resync_user_pause(&mut self, paused: bool) -> DeviceResult<()> {
        let t = self
            .machine
            .propose(StateChange::new().user_paused(paused))?;
        emit(
            Event::ResyncPauseToggle,
            &[
                ("minor", &self.config.minor.to_string()),
                ("paused", if paused { "true" } else { "false" }),
            ],
        );
        if paused {
            let _ = self.resync.pause();
        } else {
            let _ = self.resync.resume();
        }
        self.apply_transition(&t, false);
        Ok(())
    }

    // ---- packet handling -----------------------------------------------

    /// Apply one packet from the peer. A protocol violation forces the
    /// connection into the error state before the error is returned.
    pub fn handle_packet(&mut self, packet: Packet) -> DeviceResult<()> {
        match packet {
            Packet::Data(w) => self.handle_data(w),
            Packet::DataAck {
                correlation_id, ..
            } => self.handle_data_ack(correlation_id),
            Packet::Barrier { barrier_number } => {
                let count = self.recv_epoch_writes;
                self.recv_epoch_writes = 0;
                self.outbox.push_back(Packet::BarrierAck {
                    barrier_number,
                    expected_count: count,
                });
                Ok(())
            }
            Packet::BarrierAck {
                barrier_number,
                expected_count,
            } => self.handle_barrier_ack(barrier_number, expected_count),
            Packet::StateBroadcast { state } => {
                let t = self.machine.force(
                    StateChange::new()
                        .peer_role(state.role)
                        .peer_disk(state.disk),
                );
                self.apply_transition(&t, true);
                Ok(())
            }
            Packet::StateChangeRequest { change } => {
                let (code, transition) = self.machine.handle_peer_request(mirror_change(change));
                self.outbox.push_back(Packet::StateChangeReply { code });
                if let Some(t) = transition {
                    self.apply_transition(&t, false);
                }
                Ok(())
            }
            Packet::StateChangeReply { code } => {
                match self.machine.resolve_cluster_change(code) {
                    Ok(t) => {
                        emit(
                            Event::ClusterChangeResolved,
                            &[
                                ("minor", &self.config.minor.to_string()),
                                ("outcome", "committed"),
                            ],
                        );
                        self.cluster_outcome = Some(Ok(()));
                        self.apply_transition(&t, false);
                    }
                    Err(reason) => {
                        emit_warn(
                            Event::ClusterChangeResolved,
                            &[
                                ("minor", &self.config.minor.to_string()),
                                ("outcome", &reason.to_string()),
                            ],
                        );
                        self.cluster_outcome = Some(Err(reason));
                    }
                }
                Ok(())
            }
            Packet::UuidSet { uuids } => {
                self.peer_uuids = Some(uuids);
                Ok(())
            }
            Packet::Sizes {
                device_sectors,
                size_limit_sectors,
                ..
            } => {
                let mut agreed = self
                    .config
                    .device_sectors
                    .min(device_sectors)
                    .min(self.storage.capacity_sectors());
                if size_limit_sectors != 0 {
                    agreed = agreed.min(size_limit_sectors);
                }
                // data past the old agreed size may already be in use
                if self.superblock.effective_size_sectors != 0
                    && agreed < self.superblock.effective_size_sectors
                {
                    let err = ProtoError::MalformedPacket {
                        command: "Sizes",
                        reason: "peer shrank the device below the agreed size",
                    };
                    self.poison_connection("size negotiation");
                    return Err(err.into());
                }
                self.agreed_sectors = agreed;
                self.superblock.effective_size_sectors = agreed;
                self.work.push(DeferredWork::FlushMetadata);
                self.run_deferred();
                Ok(())
            }
            Packet::BitmapCompressed { start_is_set, runs } => {
                let chunk = EncodedChunk {
                    start_is_set,
                    covered: 0,
                    runs,
                };
                let blocks = self.bitmap.blocks();
                let (staging, state) = self
                    .recv_bitmap
                    .get_or_insert_with(|| (BitmapStore::new(blocks), DecodeState::new()));
                match decode_chunk(staging, state, &chunk, DEFAULT_MAX_CHUNK_BYTES) {
                    Ok(finished) => {
                        if finished {
                            self.finish_bitmap_receive()?;
                        }
                        Ok(())
                    }
                    Err(err) => {
                        self.poison_connection("bitmap decode");
                        Err(err.into())
                    }
                }
            }
            Packet::BitmapPlain { word_offset, words } => {
                let blocks = self.bitmap.blocks();
                let (staging, state) = self
                    .recv_bitmap
                    .get_or_insert_with(|| (BitmapStore::new(blocks), DecodeState::new()));
                match crate::bitmap::decode_plain(
                    staging,
                    state,
                    &crate::bitmap::PlainChunk {
                        word_offset: word_offset as usize,
                        words,
                    },
                ) {
                    Ok(finished) => {
                        if finished {
                            self.finish_bitmap_receive()?;
                        }
                        Ok(())
                    }
                    Err(err) => {
                        self.poison_connection("bitmap decode");
                        Err(err.into())
                    }
                }
            }
            Packet::SyncUuid { uuid } => {
                self.sync_uuid = Some(uuid);
                Ok(())
            }
        }
    }

    // ---- internals -----------------------------------------------------

    fn handle_data(&mut self, w: WritePacket) -> DeviceResult<()> {
        let sectors = (w.payload.len() / SECTOR_SIZE) as u64;
        self.storage.write_sectors(w.sector, &w.payload)?;
        if w.flags & WRITE_FLAG_MARK_IN_SYNC != 0 {
            // resync data: durable now, clear the covered bits
            let (block, count) = self.sector_span_to_blocks(w.sector, sectors);
            let phase = self.resync.record_synced(&mut self.bitmap, block, count)?;
            self.notifier
                .notify_resync_progress(self.resync.progress(&self.bitmap));
            if phase == ResyncPhase::Done {
                self.finish_target_resync()?;
            }
        } else {
            self.recv_epoch_writes += 1;
        }
        self.outbox.push_back(Packet::DataAck {
            sector: w.sector,
            correlation_id: w.correlation_id,
            length: w.payload.len() as u32,
        });
        Ok(())
    }

    fn handle_data_ack(&mut self, correlation_id: u64) -> DeviceResult<()> {
        if let Some(chunk) = self.resync_inflight.remove(&correlation_id) {
            let phase = self
                .resync
                .record_synced(&mut self.bitmap, chunk.block, chunk.count)?;
            self.notifier
                .notify_resync_progress(self.resync.progress(&self.bitmap));
            if phase == ResyncPhase::Done {
                self.finish_source_resync()?;
            }
            return Ok(());
        }
        if let Some(handle) = self.tlog.find_by_correlation(correlation_id) {
            let disposition = self.tlog.remote_ack(handle)?;
            if disposition == Disposition::Completed
                && self.config.durability != DurabilityMode::WriteBehind
            {
                self.completions.push(WriteCompletion {
                    correlation_id,
                    outcome: WriteOutcome::Durable,
                });
            }
        }
        Ok(())
    }

    fn handle_barrier_ack(&mut self, barrier_number: u32, expected_count: u32) -> DeviceResult<()> {
        match self.tlog.release(barrier_number, expected_count) {
            Ok(outcome) => {
                emit(
                    Event::BarrierReleased,
                    &[
                        ("barrier", &barrier_number.to_string()),
                        ("minor", &self.config.minor.to_string()),
                        ("retired", &outcome.retired.to_string()),
                    ],
                );
                if self.config.durability != DurabilityMode::WriteBehind {
                    for correlation_id in outcome.completed {
                        self.completions.push(WriteCompletion {
                            correlation_id,
                            outcome: WriteOutcome::Durable,
                        });
                    }
                }
                self.notifier.notify_barrier_released(barrier_number);
                Ok(())
            }
            Err(err) => {
                emit_error(
                    Event::BarrierMismatch,
                    &[
                        ("acked", &barrier_number.to_string()),
                        ("detail", &err.to_string()),
                        ("minor", &self.config.minor.to_string()),
                    ],
                );
                self.poison_connection("barrier mismatch");
                Err(err.into())
            }
        }
    }

    /// Force the protocol-error state and tear the link state down.
    fn poison_connection(&mut self, detail: &str) {
        emit_error(
            Event::ProtocolViolation,
            &[
                ("detail", detail),
                ("minor", &self.config.minor.to_string()),
            ],
        );
        let t = self
            .machine
            .force(StateChange::new().connection(ConnectionState::ProtocolError));
        self.apply_transition(&t, true);
    }

    fn finish_bitmap_receive(&mut self) -> DeviceResult<()> {
        if let Some((staging, _)) = self.recv_bitmap.take() {
            self.bitmap.merge(&staging)?;
        }
        Ok(())
    }

    fn enter_sync_state(&mut self, direction: SyncDirection) -> DeviceResult<()> {
        // the source ships its dirty map first so the target can merge
        // it and both sides agree on what travels
        if direction == SyncDirection::Source {
            self.send_bitmap();
        }
        let conn = match direction {
            SyncDirection::Source => ConnectionState::SyncSource,
            SyncDirection::Target => ConnectionState::SyncTarget,
        };
        let t = self.machine.propose(StateChange::new().connection(conn))?;
        self.apply_transition(&t, false);
        Ok(())
    }

    fn finish_source_resync(&mut self) -> DeviceResult<()> {
        self.superblock.uuids.rotate_after_resync();
        emit(
            Event::UuidRotated,
            &[("minor", &self.config.minor.to_string())],
        );
        self.finish_resync_common()
    }

    fn finish_target_resync(&mut self) -> DeviceResult<()> {
        if let Some(uuid) = self.sync_uuid.take() {
            self.superblock.uuids.adopt_current(uuid);
        }
        self.superblock.uuids.rotate_after_resync();
        emit(
            Event::UuidRotated,
            &[("minor", &self.config.minor.to_string())],
        );
        self.finish_resync_common()
    }

    fn finish_resync_common(&mut self) -> DeviceResult<()> {
        self.crashed_primary = false;
        emit(
            Event::ResyncComplete,
            &[("minor", &self.config.minor.to_string())],
        );
        match self.machine.propose(
            StateChange::new()
                .connection(ConnectionState::Connected)
                .disk(DiskState::UpToDate)
                .peer_disk(DiskState::UpToDate),
        ) {
            Ok(t) => self.apply_transition(&t, false),
            // already there when the resync had nothing left to move
            Err(RejectionReason::NothingToDo) => {}
            Err(reason) => return Err(reason.into()),
        }
        // rotated chain and settled state go to disk together
        self.superblock.clear_flag(FLAG_FULL_SYNC_PENDING);
        self.flush_metadata();
        self.outbox.push_back(Packet::UuidSet {
            uuids: self.local_uuids_for_wire(),
        });
        Ok(())
    }

    /// Queue the side effects of a committed transition and drain them.
    fn apply_transition(&mut self, t: &Transition, forced: bool) {
        if t.old == t.new {
            return;
        }
        let event = if forced {
            Event::StateForced
        } else {
            Event::StateChange
        };
        emit(
            event,
            &[
                ("conn", &format!("{:?}", t.new.connection)),
                ("disk", &format!("{:?}", t.new.disk)),
                ("minor", &self.config.minor.to_string()),
                ("peer_disk", &format!("{:?}", t.new.peer_disk)),
                ("role", &format!("{:?}", t.new.role)),
            ],
        );
        self.notifier.notify_state_changed(t.new);
        for effect in &t.effects {
            let job = match effect {
                SideEffect::NotifyPeer => DeferredWork::NotifyPeer,
                SideEffect::ConnectionLost => DeferredWork::ClearTransferLog,
                SideEffect::ResyncStarted { as_source } => DeferredWork::StartResync {
                    as_source: *as_source,
                },
                SideEffect::ResyncAborted => DeferredWork::AbortResync,
                SideEffect::FlushMetadata => DeferredWork::FlushMetadata,
                SideEffect::Promoted => {
                    // a promotion without a reachable up-to-date peer
                    // opens a new data generation
                    if t.new.peer_disk < DiskState::UpToDate {
                        DeferredWork::NewCurrentUuid
                    } else {
                        DeferredWork::FlushMetadata
                    }
                }
                SideEffect::Demoted => DeferredWork::FlushMetadata,
            };
            self.work.push(job);
        }
        self.run_deferred();
    }

    /// The single dispatch loop for deferred work.
    fn run_deferred(&mut self) {
        while let Some(job) = self.work.pop() {
            match job {
                DeferredWork::NotifyPeer => {
                    let state = self.machine.state();
                    self.outbox.push_back(Packet::StateBroadcast { state });
                }
                DeferredWork::ClearTransferLog => self.clear_transfer_log(),
                DeferredWork::FlushMetadata => self.flush_metadata(),
                DeferredWork::StartResync { as_source } => {
                    self.start_resync(as_source);
                    // nothing to move: retire the sync state right away
                    if self.resync.phase() == ResyncPhase::Done {
                        let finished = if as_source {
                            self.finish_source_resync()
                        } else {
                            self.finish_target_resync()
                        };
                        if let Err(err) = finished {
                            emit_warn(
                                Event::ResyncAborted,
                                &[
                                    ("detail", &err.to_string()),
                                    ("minor", &self.config.minor.to_string()),
                                ],
                            );
                        }
                    }
                }
                DeferredWork::AbortResync => {
                    self.resync.abort();
                    self.resync_inflight.clear();
                    self.sync_uuid = None;
                    emit_warn(
                        Event::ResyncAborted,
                        &[
                            ("minor", &self.config.minor.to_string()),
                            ("remaining", &self.bitmap.weight().to_string()),
                        ],
                    );
                }
                DeferredWork::NewCurrentUuid => {
                    let while_primary = self.machine.state().role == Role::Primary;
                    self.superblock.uuids.new_current(&mut self.rng, while_primary);
                    emit(
                        Event::UuidNewCurrent,
                        &[("minor", &self.config.minor.to_string())],
                    );
                    self.flush_metadata();
                }
            }
        }
    }

    fn clear_transfer_log(&mut self) {
        let lost = self.tlog.clear_on_disconnect();
        emit_warn(
            Event::TransferLogCleared,
            &[
                ("lost_writes", &lost.len().to_string()),
                ("minor", &self.config.minor.to_string()),
            ],
        );
        for write in lost {
            let sectors = u64::from(write.length).div_ceil(SECTOR_SIZE as u64);
            // lost writes are out of sync until a resync covers them
            let _ = self.mark_sectors_dirty(write.sector, sectors);
            if self.config.durability != DurabilityMode::WriteBehind {
                let outcome = match self.config.lost_write_policy {
                    LostWritePolicy::OutOfSync => WriteOutcome::OutOfSync,
                    LostWritePolicy::Fail => WriteOutcome::Failed,
                };
                self.completions.push(WriteCompletion {
                    correlation_id: write.correlation_id,
                    outcome,
                });
            }
        }
        self.resync_inflight.clear();
        self.recv_bitmap = None;
        self.recv_epoch_writes = 0;
        self.peer_uuids = None;
    }

    fn start_resync(&mut self, as_source: bool) {
        let direction = if as_source {
            SyncDirection::Source
        } else {
            SyncDirection::Target
        };
        if as_source {
            self.superblock.uuids.set_bitmap_from_current();
            self.outbox.push_back(Packet::SyncUuid {
                uuid: self.superblock.uuids.current,
            });
        }
        if self.resync.start(direction, &self.bitmap).is_ok() {
            emit(
                Event::ResyncStart,
                &[
                    ("as_source", if as_source { "true" } else { "false" }),
                    ("dirty_blocks", &self.bitmap.weight().to_string()),
                    ("minor", &self.config.minor.to_string()),
                ],
            );
        }
    }

    /// Re-derive persistent flags from the live state and mark the
    /// superblock dirty. The crashed-primary flag stands while we are
    /// Primary; only an orderly demotion clears it, so a crash leaves
    /// it behind for the next incarnation to find.
    fn flush_metadata(&mut self) {
        let state = self.machine.state();
        if state.role == Role::Primary {
            self.superblock.set_flag(FLAG_WAS_PRIMARY);
            self.superblock.set_flag(FLAG_CRASHED_PRIMARY);
        } else {
            self.superblock.clear_flag(FLAG_WAS_PRIMARY);
            self.superblock.clear_flag(FLAG_CRASHED_PRIMARY);
        }
        if state.disk >= DiskState::Outdated {
            self.superblock.set_flag(FLAG_CONSISTENT);
        } else {
            self.superblock.clear_flag(FLAG_CONSISTENT);
        }
        if state.disk == DiskState::UpToDate {
            self.superblock.set_flag(FLAG_WAS_UP_TO_DATE);
        } else {
            self.superblock.clear_flag(FLAG_WAS_UP_TO_DATE);
        }
        if state.connection >= ConnectionState::Connected {
            self.superblock.set_flag(FLAG_WAS_CONNECTED);
        } else {
            self.superblock.clear_flag(FLAG_WAS_CONNECTED);
        }
        if state.peer_disk == DiskState::Outdated {
            self.superblock.set_flag(FLAG_PEER_OUTDATED);
        } else {
            self.superblock.clear_flag(FLAG_PEER_OUTDATED);
        }
        self.meta_dirty = true;
    }

    fn local_uuid_flags(&self) -> u32 {
        let mut flags = 0;
        if self.crashed_primary {
            flags |= UUID_FLAG_CRASHED_PRIMARY;
        }
        if self.machine.state().disk == DiskState::Inconsistent {
            flags |= UUID_FLAG_INCONSISTENT;
        }
        flags
    }

    fn local_uuids_for_wire(&self) -> PeerUuids {
        PeerUuids {
            current: self.superblock.uuids.current,
            bitmap: self.superblock.uuids.bitmap,
            history: self.superblock.uuids.history,
            flags: self.local_uuid_flags(),
        }
    }

    fn mark_sectors_dirty(&mut self, sector: u64, sectors: u64) -> DeviceResult<()> {
        let (block, count) = self.sector_span_to_blocks(sector, sectors);
        self.bitmap.mark_dirty(block..block + count)?;
        Ok(())
    }

    fn sector_span_to_blocks(&self, sector: u64, sectors: u64) -> (u64, u64) {
        let spb = self.config.sectors_per_block();
        let block = sector / spb;
        let end = (sector + sectors).div_ceil(spb).max(block + 1);
        (block, (end - block).min(self.bitmap.blocks() - block))
    }
}

/// A peer's state change request is phrased from its side of the link;
/// swap roles, disks and sync directions into our frame of reference
/// before judging it.
fn mirror_change(change: StateChange) -> StateChange {
    use ConnectionState as C;
    let mut out = change;
    out.role = change.peer_role;
    out.peer_role = change.role;
    out.disk = change.peer_disk;
    out.peer_disk = change.disk;
    out.connection = change.connection.map(|c| match c {
        C::StartingSyncSource => C::StartingSyncTarget,
        C::StartingSyncTarget => C::StartingSyncSource,
        C::WaitBitmapSource => C::WaitBitmapTarget,
        C::WaitBitmapTarget => C::WaitBitmapSource,
        C::SyncSource => C::SyncTarget,
        C::SyncTarget => C::SyncSource,
        C::PausedSyncSource => C::PausedSyncTarget,
        C::PausedSyncTarget => C::PausedSyncSource,
        C::VerifySource => C::VerifyTarget,
        C::VerifyTarget => C::VerifySource,
        C::Disconnecting => C::TearDown,
        other => other,
    });
    out
}

fn derive_geometry(config: &DeviceConfig) -> MetaGeometry {
    let bitmap_bytes = config.bitmap_blocks().div_ceil(8);
    let bitmap_sectors = bitmap_bytes.div_ceil(SECTOR_SIZE as u64) as u32;
    MetaGeometry {
        md_size_sectors: 1 + ACTIVITY_LOG_SECTORS + bitmap_sectors,
        activity_log_offset: 1,
        activity_log_extents: 257,
        bitmap_offset: (1 + ACTIVITY_LOG_SECTORS) as i32,
        bytes_per_bitmap_bit: config.bytes_per_bitmap_bit,
    }
}
