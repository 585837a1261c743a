//! Ownership of the command ring and its single write cursor.
//!
//! The ring manager acquires the shared memory, runs the bring-up and teardown
//! handshakes with the remote, and serializes slot claims: one mutex covers
//! "check the slot at the cursor, fill it, publish it, advance the cursor".
//! When the slot at the cursor is still owned by the remote, or by a submitter
//! that has not collected its response yet, the claimer drops the mutex, backs
//! off and retries within a bounded budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, MutexGuard};
use tee_transport::wait::poll_until;
use tee_transport::{
    Clock, Doorbell, RingCommand, SharedRegion, Slot, SlotLayout, SlotSnapshot, SlotState,
    WaitResult, ACK_OK,
};

use crate::config::ClientConfig;
use crate::error::{BusyReason, IoError, TeeError};
use crate::liveness::Liveness;
use crate::transport::{RingTransport, TransportKind};

#[derive(Debug)]
struct Cursor {
    write_cursor: usize,
    next_sequence: u32,
}

impl Cursor {
    fn take_sequence(&mut self) -> u32 {
        let sequence = self.next_sequence;
        // Zero never appears on the wire so a fresh slot cannot look acked.
        self.next_sequence = match sequence.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        sequence
    }
}

/// Where a published command lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotTicket {
    pub index: u32,
    pub sequence: u32,
    /// Write cursor after publishing, as handed to the doorbell.
    pub write_cursor: u32,
}

/// Exclusive right to fill the slot at the write cursor.
///
/// Holds the ring mutex until [`ClaimGuard::publish`] (or drop).
pub struct ClaimGuard<'a> {
    ring: &'a RingManager,
    cursor: MutexGuard<'a, Cursor>,
    slot: Slot<'a>,
    index: u32,
    sequence: u32,
}

impl<'a> ClaimGuard<'a> {
    pub fn slot(&self) -> Slot<'a> {
        self.slot
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Sequence number the claimed request must carry.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Hands the slot to the remote, advances the cursor and releases the
    /// mutex. The doorbell is not rung here.
    pub fn publish(mut self) -> SlotTicket {
        self.ring.in_flight[self.index as usize].store(true, Ordering::Release);
        self.slot.set_state(SlotState::WaitingForResponse);
        let layout = &self.ring.layout;
        self.cursor.write_cursor = layout.next_offset(self.cursor.write_cursor);
        let ticket = SlotTicket {
            index: self.index,
            sequence: self.sequence,
            write_cursor: self.cursor.write_cursor as u32,
        };
        trace!(
            "published slot {} (seq {}), cursor now {:#x}",
            ticket.index,
            ticket.sequence,
            ticket.write_cursor
        );
        ticket
    }
}

/// Owner of the ring memory and the write cursor.
pub struct RingManager {
    region: SharedRegion,
    layout: SlotLayout,
    kind: TransportKind,
    doorbell: Arc<dyn Doorbell>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    handshake_timeout: Duration,
    claim_retries: u32,
    claim_backoff: Duration,
    cursor: Mutex<Cursor>,
    /// Set from publish until the submitter retires the slot. A stale
    /// completion can flip a slot to `Completed` while its current owner is
    /// still polling; this keeps such a slot from being handed out again.
    in_flight: Box<[AtomicBool]>,
}

impl RingManager {
    /// Acquires and zero-fills the ring, then completes the bring-up
    /// handshake. On failure the ring memory is released.
    pub fn init(
        config: &ClientConfig,
        transport: &dyn RingTransport,
        doorbell: Arc<dyn Doorbell>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IoError> {
        let layout = config.validate()?;
        let region = transport.acquire(layout.ring_size())?;
        region.zero();

        let ring = Self {
            region,
            layout,
            kind: transport.kind(),
            doorbell,
            clock,
            poll_interval: config.poll_interval,
            handshake_timeout: config.handshake_timeout,
            claim_retries: config.claim_retries,
            claim_backoff: config.claim_backoff,
            cursor: Mutex::new(Cursor {
                write_cursor: 0,
                next_sequence: 1,
            }),
            in_flight: (0..layout.slot_count())
                .map(|_| AtomicBool::new(false))
                .collect(),
        };

        if let Err(err) = ring.handshake() {
            warn!("ring bring-up failed: {err}");
            return Err(err);
        }
        info!(
            "ring up: {} slots x {} bytes ({:?})",
            layout.slot_count(),
            layout.slot_size(),
            ring.kind
        );
        Ok(ring)
    }

    fn handshake(&self) -> Result<(), IoError> {
        if self.kind.announces_address() {
            debug!(
                "announcing ring at {:#x}, {} bytes",
                self.region.bus_address(),
                self.layout.ring_size()
            );
            self.doorbell.write_ring_base(self.region.bus_address());
            self.doorbell.write_ring_size(self.layout.ring_size() as u32);
            self.doorbell.issue(RingCommand::RingInit);
        } else {
            debug!("fixed ring: waiting for remote to report ready");
        }
        self.await_ack(RingCommand::RingInit)
    }

    fn await_ack(&self, command: RingCommand) -> Result<(), IoError> {
        let result = poll_until(
            &*self.clock,
            self.poll_interval,
            self.handshake_timeout,
            || self.doorbell.poll_ack(),
        );
        match result {
            WaitResult::Ready(ACK_OK) => Ok(()),
            WaitResult::Ready(status) => Err(IoError::HandshakeRejected { command, status }),
            WaitResult::TimedOut => Err(IoError::HandshakeTimeout {
                command,
                timeout: self.handshake_timeout,
            }),
        }
    }

    /// Tears the ring down. The remote is told only when believed alive;
    /// a missing ack is logged, not returned. Memory is released (or
    /// unbound) regardless.
    pub fn destroy(self, liveness: &Liveness) {
        if liveness.is_alive() {
            self.doorbell.issue(RingCommand::RingDestroy);
            match self.await_ack(RingCommand::RingDestroy) {
                Ok(()) => debug!("remote released the ring"),
                Err(err) => warn!("ring teardown: {err}"),
            }
        } else {
            warn!("remote unresponsive; releasing ring without {}", RingCommand::RingDestroy);
        }
        info!(
            "ring {}",
            if self.region.is_owned() {
                "released"
            } else {
                "unbound"
            }
        );
    }

    /// Claims the slot at the write cursor.
    ///
    /// Never waits while holding the mutex: an occupied slot releases it,
    /// sleeps `claim_backoff` and retries up to `claim_retries` times.
    pub fn claim_slot(&self) -> Result<ClaimGuard<'_>, TeeError> {
        let mut attempts = 0;
        loop {
            let mut cursor = self.cursor.lock();
            let index = self.layout.index_of(cursor.write_cursor);
            let slot = self.layout.slot(&self.region, index);
            let raw = slot.state_raw();
            let owned = self.in_flight[index as usize].load(Ordering::Acquire);
            if !owned && SlotState::is_claimable_raw(raw) {
                let sequence = cursor.take_sequence();
                return Ok(ClaimGuard {
                    ring: self,
                    cursor,
                    slot,
                    index,
                    sequence,
                });
            }
            drop(cursor);

            if attempts >= self.claim_retries {
                debug!("slot {index} still in flight after {attempts} retries");
                return Err(TeeError::busy(BusyReason::RingFull));
            }
            attempts += 1;
            trace!("slot {index} occupied (state {raw}, owned {owned}), backing off");
            self.clock.sleep(self.claim_backoff);
        }
    }

    /// Gives a published slot back once its submitter is done with it.
    pub(crate) fn retire(&self, index: u32) {
        self.in_flight[index as usize].store(false, Ordering::Release);
    }

    /// Rings the doorbell for everything published up to `write_cursor`.
    pub fn ring_doorbell(&self, write_cursor: u32) {
        self.doorbell.notify(write_cursor);
    }

    /// Control fields of the most recently issued slot.
    pub fn last_issued(&self) -> SlotSnapshot {
        let cursor = self.cursor.lock();
        let index = self
            .layout
            .index_of(self.layout.prev_offset(cursor.write_cursor));
        self.layout.slot(&self.region, index).snapshot()
    }

    pub fn slot(&self, index: u32) -> Slot<'_> {
        self.layout.slot(&self.region, index)
    }

    pub fn slot_state(&self, index: u32) -> Option<SlotState> {
        self.slot(index).state()
    }

    /// Current write cursor (a byte offset).
    pub fn write_cursor(&self) -> usize {
        self.cursor.lock().write_cursor
    }

    /// Capacity in slots.
    pub fn capacity(&self) -> u32 {
        self.layout.slot_count()
    }

    pub fn slot_size(&self) -> usize {
        self.layout.slot_size()
    }

    pub fn payload_capacity(&self) -> usize {
        self.layout.payload_capacity()
    }

    pub fn layout(&self) -> SlotLayout {
        self.layout
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        &*self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HostRing, MappedRing};
    use tee_remote_sim::{SimConfig, SimRemote};
    use tee_transport::{ManualClock, TransportError};

    fn config() -> ClientConfig {
        ClientConfig::default()
            .with_slots(4, 64)
            .with_handshake_timeout(Duration::from_millis(100))
            .with_claim_budget(3, Duration::from_millis(2))
    }

    fn sim(config: SimConfig) -> Arc<SimRemote> {
        SimRemote::new(SimConfig {
            slot_size: 64,
            ..config
        })
        .expect("sim")
    }

    #[test]
    fn host_ring_announces_itself() {
        let remote = sim(SimConfig::default());
        let ring = RingManager::init(
            &config(),
            &HostRing,
            remote.clone(),
            Arc::new(ManualClock::new()),
        )
        .expect("init");

        assert_eq!(remote.announced_base(), ring.region.bus_address());
        assert_eq!(remote.announced_size(), 256);
        assert_eq!(remote.commands(), vec![RingCommand::RingInit]);
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(ring.capacity(), 4);
        assert_eq!(ring.payload_capacity(), 40);

        ring.destroy(&Liveness::new());
        assert_eq!(
            remote.commands(),
            vec![RingCommand::RingInit, RingCommand::RingDestroy]
        );
        assert!(!remote.is_bound());
    }

    #[test]
    fn handshake_times_out_against_silent_remote() {
        let remote = sim(SimConfig {
            ack_status: None,
            ..SimConfig::default()
        });
        let clock = Arc::new(ManualClock::new());
        let err = RingManager::init(&config(), &HostRing, remote, clock.clone())
            .err()
            .expect("handshake must fail");
        assert_eq!(
            err,
            IoError::HandshakeTimeout {
                command: RingCommand::RingInit,
                timeout: Duration::from_millis(100),
            }
        );
        assert_eq!(clock.elapsed(), Duration::from_millis(100));
    }

    #[test]
    fn handshake_rejection_carries_status() {
        let remote = sim(SimConfig {
            ack_status: Some(0x13),
            ..SimConfig::default()
        });
        let err = RingManager::init(
            &config(),
            &HostRing,
            remote,
            Arc::new(ManualClock::new()),
        )
        .err()
        .expect("handshake must fail");
        assert_eq!(
            err,
            IoError::HandshakeRejected {
                command: RingCommand::RingInit,
                status: 0x13,
            }
        );
    }

    #[test]
    fn zero_capacity_is_rejected_before_touching_the_remote() {
        let remote = sim(SimConfig::default());
        let err = RingManager::init(
            &config().with_slots(0, 64),
            &HostRing,
            remote.clone(),
            Arc::new(ManualClock::new()),
        )
        .err()
        .expect("invalid capacity");
        assert!(matches!(
            err,
            IoError::Transport(TransportError::InvalidCapacity { .. })
        ));
        assert!(remote.commands().is_empty());
    }

    #[test]
    fn fixed_ring_skips_address_exchange() {
        let remote = sim(SimConfig {
            mapped_slots: Some(4),
            ..SimConfig::default()
        });
        let (base, len) = remote.mapped_window().expect("window");
        // SAFETY: the remote owns the window and outlives the ring.
        let transport = unsafe { MappedRing::new(base, len) };
        let ring = RingManager::init(
            &config(),
            &transport,
            remote.clone(),
            Arc::new(ManualClock::new()),
        )
        .expect("init");

        assert_eq!(ring.kind(), TransportKind::FixedRegion);
        assert_eq!(remote.announced_base(), 0);
        assert!(remote.commands().is_empty());
        ring.destroy(&Liveness::new());
        assert_eq!(remote.commands(), vec![RingCommand::RingDestroy]);
    }

    #[test]
    fn claim_backs_off_then_reports_full() {
        let remote = sim(SimConfig::default());
        let clock = Arc::new(ManualClock::new());
        let ring =
            RingManager::init(&config(), &HostRing, remote, clock.clone()).expect("init");
        let before = clock.elapsed();

        ring.slot(0).set_state(SlotState::WaitingForResponse);
        let err = ring.claim_slot().err().expect("slot occupied");
        assert_eq!(err, TeeError::busy(BusyReason::RingFull));
        assert_eq!(clock.elapsed() - before, Duration::from_millis(6));
        assert_eq!(ring.write_cursor(), 0);

        ring.slot(0).set_state(SlotState::TimedOut);
        let guard = ring.claim_slot().expect("timed-out slot is reclaimable");
        assert_eq!(guard.index(), 0);
        drop(guard);
        ring.destroy(&Liveness::new());
    }

    #[test]
    fn publish_advances_and_wraps_cursor() {
        let remote = sim(SimConfig::default());
        remote.hold();
        let ring = RingManager::init(
            &config(),
            &HostRing,
            remote,
            Arc::new(ManualClock::new()),
        )
        .expect("init");

        let mut sequences = Vec::new();
        for expected in 0..4u32 {
            let guard = ring.claim_slot().expect("claim");
            assert_eq!(guard.index(), expected);
            guard.slot().set_sequence(guard.sequence());
            let ticket = guard.publish();
            sequences.push(ticket.sequence);
            assert_eq!(ticket.write_cursor as usize, ((expected as usize + 1) % 4) * 64);
            ring.slot(expected).set_state(SlotState::ResponseCopied);
            ring.retire(expected);
        }
        assert_eq!(ring.write_cursor(), 0);
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(ring.last_issued().sequence, 4);
        ring.destroy(&Liveness::new());
    }

    #[test]
    fn unretired_slot_is_not_reclaimed_after_a_stale_completion() {
        let remote = sim(SimConfig::default());
        remote.hold();
        let ring = RingManager::init(
            &config().with_slots(1, 64),
            &HostRing,
            remote,
            Arc::new(ManualClock::new()),
        )
        .expect("init");

        let ticket = ring.claim_slot().expect("claim").publish();
        // A late completion for an older occupant lands while the owner polls.
        ring.slot(0)
            .complete(ticket.sequence.wrapping_sub(1), 0, b"old")
            .expect("complete");
        assert_eq!(ring.slot_state(0), Some(SlotState::Completed));
        assert_eq!(
            ring.claim_slot().err(),
            Some(TeeError::busy(BusyReason::RingFull))
        );

        ring.retire(ticket.index);
        assert!(ring.claim_slot().is_ok());
        ring.destroy(&Liveness::new());
    }

    #[test]
    fn dead_remote_is_not_told_on_destroy() {
        let remote = sim(SimConfig::default());
        let ring = RingManager::init(
            &config(),
            &HostRing,
            remote.clone(),
            Arc::new(ManualClock::new()),
        )
        .expect("init");
        let liveness = Liveness::new();
        liveness.mark_dead();
        ring.destroy(&liveness);
        assert_eq!(remote.commands(), vec![RingCommand::RingInit]);
    }

    #[test]
    fn destroy_gives_up_after_handshake_timeout() {
        let remote = sim(SimConfig::default());
        let clock = Arc::new(ManualClock::new());
        let ring = RingManager::init(&config(), &HostRing, remote.clone(), clock.clone())
            .expect("init");
        remote.set_ack_status(None);
        let before = clock.elapsed();

        ring.destroy(&Liveness::new());
        assert_eq!(
            remote.commands(),
            vec![RingCommand::RingInit, RingCommand::RingDestroy]
        );
        assert_eq!(clock.elapsed() - before, Duration::from_millis(100));
    }

    #[test]
    fn sequence_skips_zero_on_wrap() {
        let mut cursor = Cursor {
            write_cursor: 0,
            next_sequence: u32::MAX,
        };
        assert_eq!(cursor.take_sequence(), u32::MAX);
        assert_eq!(cursor.take_sequence(), 1);
    }
}
