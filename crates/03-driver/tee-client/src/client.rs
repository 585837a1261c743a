//! Submitting commands and waiting for their completion.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tee_transport::wait::poll_until;
use tee_transport::{Clock, Doorbell, Slot, SlotState, WaitResult};

use crate::config::ClientConfig;
use crate::error::{BusyReason, IoError, TeeError, TeeResult};
use crate::liveness::Liveness;
use crate::ring::RingManager;
use crate::transport::RingTransport;

/// Result code reported by the remote for a completed command.
pub type Status = u32;

/// Point-in-time copy of the client counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Commands published to the remote.
    pub submitted: u64,
    /// Commands whose response was collected.
    pub completed: u64,
    pub timed_out: u64,
    /// Submissions turned away with `Busy`.
    pub busy: u64,
    /// Completions carrying an earlier occupant's sequence.
    pub stale: u64,
}

#[derive(Default)]
struct ClientStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    busy: AtomicU64,
    stale: AtomicU64,
}

enum Outcome {
    Submitted,
    Completed,
    TimedOut,
    Busy,
    Stale,
}

impl ClientStats {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Submitted => &self.submitted,
            Outcome::Completed => &self.completed,
            Outcome::TimedOut => &self.timed_out,
            Outcome::Busy => &self.busy,
            Outcome::Stale => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe front end of the command ring.
///
/// Any number of threads may call [`CommandClient::submit`] through a shared
/// reference; claims are serialized by the ring, waits are lock-free polls of
/// the claimed slot.
pub struct CommandClient {
    ring: RingManager,
    liveness: Liveness,
    poll_interval: Duration,
    command_timeout: Duration,
    stats: ClientStats,
}

impl CommandClient {
    /// Wraps an initialized ring.
    pub fn new(ring: RingManager, config: &ClientConfig) -> Self {
        Self {
            ring,
            liveness: Liveness::new(),
            poll_interval: config.poll_interval,
            command_timeout: config.command_timeout,
            stats: ClientStats::default(),
        }
    }

    /// Brings up a ring over `transport` and wraps it.
    pub fn connect(
        config: &ClientConfig,
        transport: &dyn RingTransport,
        doorbell: Arc<dyn Doorbell>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IoError> {
        let ring = RingManager::init(config, transport, doorbell, clock)?;
        Ok(Self::new(ring, config))
    }

    /// Sends `payload` as command `command_id` and waits up to `timeout`.
    ///
    /// On success the response is copied into `response_out` (truncated to
    /// the shorter of the buffer and the slot payload) and the remote's
    /// status is returned. A timeout marks the remote unresponsive; further
    /// submissions are rejected with `Busy` until [`CommandClient::probe`]
    /// (run implicitly here) sees the last issued slot finish.
    pub fn submit(
        &self,
        command_id: u32,
        payload: &[u8],
        response_out: &mut [u8],
        timeout: Duration,
    ) -> TeeResult<Status> {
        let capacity = self.ring.payload_capacity();
        if payload.len() > capacity {
            return Err(TeeError::InvalidArgument {
                len: payload.len(),
                capacity,
            });
        }

        if !self.liveness.probe(&self.ring) {
            debug!("rejecting command {command_id:#x}: remote unresponsive");
            self.stats.record(Outcome::Busy);
            return Err(TeeError::busy(BusyReason::RemoteUnresponsive));
        }

        let claim = self.ring.claim_slot().inspect_err(|_| {
            self.stats.record(Outcome::Busy);
        })?;
        let slot = claim.slot();
        let sequence = claim.sequence();
        slot.set_command_id(command_id);
        slot.set_state(SlotState::Init);
        slot.set_sequence(sequence);
        slot.set_ack_sequence(0);
        slot.set_status(0);
        slot.set_done(false);
        if let Err(err) = slot.write_payload(payload) {
            // Capacity was checked above; the slot is left claimable.
            return Err(IoError::from(err).into());
        }
        let ticket = claim.publish();
        self.stats.record(Outcome::Submitted);
        debug!(
            "command {command_id:#x} in slot {} (seq {sequence})",
            ticket.index
        );
        self.ring.ring_doorbell(ticket.write_cursor);

        let result = self.await_completion(slot, sequence, timeout);
        let outcome = match result {
            WaitResult::Ready(()) => Ok(self.collect(slot, response_out)),
            WaitResult::TimedOut => self.expire(slot, command_id, sequence, timeout, response_out),
        };
        self.ring.retire(ticket.index);
        outcome
    }

    /// [`CommandClient::submit`] with the configured `command_timeout`.
    pub fn submit_default(
        &self,
        command_id: u32,
        payload: &[u8],
        response_out: &mut [u8],
    ) -> TeeResult<Status> {
        self.submit(command_id, payload, response_out, self.command_timeout)
    }

    fn await_completion(&self, slot: Slot<'_>, sequence: u32, timeout: Duration) -> WaitResult<()> {
        let stale_seen = Cell::new(false);
        poll_until(self.ring.clock(), self.poll_interval, timeout, || {
            if slot.state() != Some(SlotState::Completed) {
                return None;
            }
            let acked = slot.ack_sequence();
            if acked == sequence {
                return Some(());
            }
            if !stale_seen.replace(true) {
                warn!("ignoring stale completion (seq {acked}, waiting for {sequence})");
                self.stats.record(Outcome::Stale);
            }
            None
        })
    }

    fn collect(&self, slot: Slot<'_>, response_out: &mut [u8]) -> Status {
        let copied = slot.read_payload(response_out);
        let status = slot.status();
        slot.set_state(SlotState::ResponseCopied);
        self.stats.record(Outcome::Completed);
        trace!("collected {copied} response bytes, status {status:#x}");
        status
    }

    fn expire(
        &self,
        slot: Slot<'_>,
        command_id: u32,
        sequence: u32,
        timeout: Duration,
        response_out: &mut [u8],
    ) -> TeeResult<Status> {
        match slot.transition(SlotState::WaitingForResponse, SlotState::TimedOut) {
            Ok(()) => {}
            Err(_) if slot.completed_for(sequence) => {
                debug!("command {command_id:#x} completed at the deadline");
                return Ok(self.collect(slot, response_out));
            }
            // The remote wrote the state last; keep it for liveness checks.
            Err(raw) => trace!("slot left in remote-written state {raw}"),
        }
        warn!("command {command_id:#x} (seq {sequence}) timed out after {timeout:?}");
        self.stats.record(Outcome::TimedOut);
        self.liveness.mark_dead();
        Err(TeeError::Timeout {
            command_id,
            timeout,
        })
    }

    /// Re-checks a remote marked unresponsive. See [`Liveness::probe`].
    pub fn probe(&self) -> bool {
        self.liveness.probe(&self.ring)
    }

    pub fn is_remote_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn ring(&self) -> &RingManager {
        &self.ring
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Tears the ring down (see [`RingManager::destroy`]).
    pub fn shutdown(self) {
        let stats = self.stats.snapshot();
        debug!("shutting down: {stats:?}");
        self.ring.destroy(&self.liveness);
    }
}
