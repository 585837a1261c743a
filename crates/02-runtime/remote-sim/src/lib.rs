#![deny(missing_docs)]
//! In-process stand-in for the remote coprocessor.
//!
//! [`SimRemote`] implements [`Doorbell`]: it adopts the ring announced through
//! the base/size registers on `RingInit`, releases it on `RingDestroy`, and on
//! every notification services each `WaitingForResponse` slot through a
//! handler (echo by default). It can withhold completions to model a stalled
//! remote and deliver them later, which is how late completions are exercised.
//!
//! Two execution modes are offered: [`SimMode::Inline`] services slots on the
//! notifying thread (deterministic, pairs with a manual clock), while
//! [`SimMode::Threaded`] hands notifications to a worker over a channel.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use tee_transport::{
    join_address, Doorbell, RingCommand, SharedRegion, Slot, SlotLayout, SlotState,
    TransportResult, ACK_OK, DEFAULT_SLOT_SIZE,
};

/// Reply produced by a [`Handler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Result code written into the slot.
    pub status: u32,
    /// Bytes written into the slot payload (truncated to capacity).
    pub payload: Vec<u8>,
}

/// Services one request: `(command_id, request bytes) -> response`.
///
/// The request slice spans the whole payload area; the protocol carries no length.
pub type Handler = dyn Fn(u32, &[u8]) -> Response + Send + Sync;

/// Where slot servicing happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimMode {
    /// Service synchronously inside `notify`.
    Inline,
    /// Service on a worker thread fed by a channel.
    Threaded,
}

/// Construction parameters.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Slot size the simulated firmware expects.
    pub slot_size: usize,
    /// Status acked for reserved commands; `None` never acks.
    pub ack_status: Option<u32>,
    /// Delay applied before each servicing pass in threaded mode.
    pub latency: Duration,
    /// Execution mode.
    pub mode: SimMode,
    /// When set, the remote owns a fixed ring of this many slots.
    pub mapped_slots: Option<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            ack_status: Some(ACK_OK),
            latency: Duration::ZERO,
            mode: SimMode::Inline,
            mapped_slots: None,
        }
    }
}

#[derive(Clone, Copy)]
struct Binding {
    base: *mut u8,
    len: usize,
}

// SAFETY: the binding is only dereferenced while the host keeps the ring
// alive, which the RingInit/RingDestroy handshake guarantees.
unsafe impl Send for Binding {}

#[derive(Default)]
struct State {
    binding: Option<Binding>,
    hold: bool,
    held: Vec<(u32, u32)>,
}

#[derive(Default)]
struct Registers {
    base_lo: AtomicU32,
    base_hi: AtomicU32,
    size: AtomicU32,
    command: AtomicU32,
}

struct Core {
    slot_size: usize,
    latency: Duration,
    regs: Registers,
    ack: Mutex<Option<u32>>,
    ack_policy: Mutex<Option<u32>>,
    state: Mutex<State>,
    handler: RwLock<Box<Handler>>,
    commands: Mutex<Vec<RingCommand>>,
    notifications: AtomicU64,
    pending: AtomicU64,
    serviced: AtomicU64,
    violations: AtomicU64,
    mapped: Option<SharedRegion>,
}

enum Msg {
    Notify,
    Shutdown,
}

struct Worker {
    tx: Sender<Msg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Simulated remote coprocessor.
pub struct SimRemote {
    core: Arc<Core>,
    worker: Option<Worker>,
}

fn echo(_command_id: u32, request: &[u8]) -> Response {
    Response {
        status: 0,
        payload: request.to_vec(),
    }
}

impl SimRemote {
    /// Builds a remote with the echo handler.
    pub fn new(config: SimConfig) -> TransportResult<Arc<Self>> {
        let mapped = match config.mapped_slots {
            Some(slots) => {
                let layout = SlotLayout::new(config.slot_size, slots)?;
                Some(SharedRegion::new_zeroed(layout.ring_size(), 4096)?)
            }
            None => None,
        };

        let mut state = State::default();
        let mut ack = None;
        if let Some(region) = &mapped {
            state.binding = Some(Binding {
                base: region.base_ptr(),
                len: region.len(),
            });
            // A fixed ring is live from reset; the ack register reports readiness.
            ack = config.ack_status;
        }

        let core = Arc::new(Core {
            slot_size: config.slot_size,
            latency: config.latency,
            regs: Registers::default(),
            ack: Mutex::new(ack),
            ack_policy: Mutex::new(config.ack_status),
            state: Mutex::new(state),
            handler: RwLock::new(Box::new(echo)),
            commands: Mutex::new(Vec::new()),
            notifications: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            serviced: AtomicU64::new(0),
            violations: AtomicU64::new(0),
            mapped,
        });

        let worker = match config.mode {
            SimMode::Inline => None,
            SimMode::Threaded => {
                let (tx, rx) = unbounded();
                let worker_core = Arc::clone(&core);
                let handle = thread::Builder::new()
                    .name("remote-sim".into())
                    .spawn(move || worker_loop(worker_core, rx))
                    .expect("spawn remote-sim worker");
                Some(Worker {
                    tx,
                    handle: Mutex::new(Some(handle)),
                })
            }
        };

        Ok(Arc::new(Self { core, worker }))
    }

    /// Replaces the request handler.
    pub fn set_handler(&self, handler: impl Fn(u32, &[u8]) -> Response + Send + Sync + 'static) {
        *self.core.handler.write() = Box::new(handler);
    }

    /// Changes the status acked for subsequent reserved commands.
    pub fn set_ack_status(&self, status: Option<u32>) {
        *self.core.ack_policy.lock() = status;
    }

    /// Stops completing requests; pending slots are remembered.
    pub fn hold(&self) {
        self.core.state.lock().hold = true;
    }

    /// Completes every withheld request (even if the host already gave up on
    /// it), then resumes normal servicing.
    pub fn release_held(&self) {
        {
            let mut state = self.core.state.lock();
            state.hold = false;
            let held = std::mem::take(&mut state.held);
            if let Some(binding) = state.binding {
                self.core.with_ring(binding, |layout, region| {
                    for (index, sequence) in held {
                        let slot = layout.slot(region, index);
                        debug!("late completion of slot {index} (seq {sequence})");
                        self.core.respond(&slot, sequence, false);
                    }
                });
            }
        }
        self.core.service();
    }

    /// Number of requests currently withheld.
    pub fn held_count(&self) -> usize {
        self.core.state.lock().held.len()
    }

    /// Base address announced by the host.
    pub fn announced_base(&self) -> u64 {
        join_address(
            self.core.regs.base_lo.load(Ordering::Acquire),
            self.core.regs.base_hi.load(Ordering::Acquire),
        )
    }

    /// Ring size announced by the host.
    pub fn announced_size(&self) -> u32 {
        self.core.regs.size.load(Ordering::Acquire)
    }

    /// Whether a ring is currently adopted.
    pub fn is_bound(&self) -> bool {
        self.core.state.lock().binding.is_some()
    }

    /// Reserved commands received so far.
    pub fn commands(&self) -> Vec<RingCommand> {
        self.core.commands.lock().clone()
    }

    /// Doorbell notifications received.
    pub fn notifications(&self) -> u64 {
        self.core.notifications.load(Ordering::Relaxed)
    }

    /// Requests completed.
    pub fn serviced(&self) -> u64 {
        self.core.serviced.load(Ordering::Relaxed)
    }

    /// Requests whose slot was rewritten by the host while still pending.
    pub fn violations(&self) -> u64 {
        self.core.violations.load(Ordering::Relaxed)
    }

    /// The fixed ring window when configured with `mapped_slots`.
    pub fn mapped_window(&self) -> Option<(*mut u8, usize)> {
        self.core
            .mapped
            .as_ref()
            .map(|region| (region.base_ptr(), region.len()))
    }

    /// Waits until the worker drained every notification queued so far.
    ///
    /// Inline remotes return immediately.
    pub fn settle(&self) {
        while self.core.pending.load(Ordering::Acquire) != 0 {
            thread::yield_now();
        }
    }
}

impl Drop for SimRemote {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            let _ = worker.tx.send(Msg::Shutdown);
            if let Some(handle) = worker.handle.lock().take() {
                let _ = handle.join();
            }
        }
    }
}

impl Doorbell for SimRemote {
    fn write_ring_base(&self, addr: u64) {
        let (lo, hi) = tee_transport::split_address(addr);
        self.core.regs.base_lo.store(lo, Ordering::Release);
        self.core.regs.base_hi.store(hi, Ordering::Release);
    }

    fn write_ring_size(&self, bytes: u32) {
        self.core.regs.size.store(bytes, Ordering::Release);
    }

    fn issue(&self, cmd: RingCommand) {
        *self.core.ack.lock() = None;
        self.core.regs.command.store(cmd.as_raw(), Ordering::Release);
        self.core.commands.lock().push(cmd);

        let Some(status) = *self.core.ack_policy.lock() else {
            debug!("ignoring {cmd}: remote unresponsive");
            return;
        };

        match cmd {
            RingCommand::RingInit if status == ACK_OK => {
                let base = self.announced_base();
                let len = self.announced_size() as usize;
                if base != 0 && len != 0 {
                    debug!("adopting ring at {base:#x} ({len} bytes)");
                    self.core.state.lock().binding = Some(Binding {
                        base: base as usize as *mut u8,
                        len,
                    });
                }
            }
            RingCommand::RingDestroy => {
                let mut state = self.core.state.lock();
                state.binding = None;
                state.held.clear();
                debug!("ring released");
            }
            RingCommand::RingInit => {}
        }
        *self.core.ack.lock() = Some(status);
    }

    fn poll_ack(&self) -> Option<u32> {
        *self.core.ack.lock()
    }

    fn notify(&self, write_cursor: u32) {
        self.core.notifications.fetch_add(1, Ordering::Relaxed);
        trace!("doorbell rung, write cursor {write_cursor:#x}");
        match &self.worker {
            None => self.core.service(),
            Some(worker) => {
                self.core.pending.fetch_add(1, Ordering::AcqRel);
                if worker.tx.send(Msg::Notify).is_err() {
                    self.core.pending.fetch_sub(1, Ordering::AcqRel);
                    warn!("remote worker gone; notification dropped");
                }
            }
        }
    }
}

impl Core {
    fn with_ring<R>(&self, binding: Binding, f: impl FnOnce(&SlotLayout, &SharedRegion) -> R) -> Option<R> {
        let slots = u32::try_from(binding.len / self.slot_size).ok()?;
        let layout = SlotLayout::new(self.slot_size, slots).ok()?;
        // SAFETY: the host keeps the announced ring alive until RingDestroy,
        // which unbinds under the state lock held by every caller.
        let region = unsafe { SharedRegion::from_raw_parts(binding.base, binding.len) }.ok()?;
        Some(f(&layout, &region))
    }

    fn service(&self) {
        let mut state = self.state.lock();
        let Some(binding) = state.binding else {
            trace!("notification without a bound ring");
            return;
        };
        self.with_ring(binding, |layout, region| {
            for index in 0..layout.slot_count() {
                let slot = layout.slot(region, index);
                if slot.state() != Some(SlotState::WaitingForResponse) {
                    continue;
                }
                let sequence = slot.sequence();
                if state.hold {
                    if !state.held.contains(&(index, sequence)) {
                        trace!("withholding slot {index} (seq {sequence})");
                        state.held.push((index, sequence));
                    }
                    continue;
                }
                self.respond(&slot, sequence, true);
            }
        });
    }

    fn respond(&self, slot: &Slot<'_>, sequence: u32, strict: bool) {
        let mut request = vec![0u8; slot.payload_capacity()];
        slot.read_payload(&mut request);
        let response = (self.handler.read())(slot.command_id(), &request);

        if strict
            && (slot.sequence() != sequence
                || slot.state() != Some(SlotState::WaitingForResponse))
        {
            warn!("slot rewritten by host while pending (seq {sequence})");
            self.violations.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let len = response.payload.len().min(slot.payload_capacity());
        if slot
            .complete(sequence, response.status, &response.payload[..len])
            .is_ok()
        {
            self.serviced.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn worker_loop(core: Arc<Core>, rx: Receiver<Msg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Notify => {
                if !core.latency.is_zero() {
                    thread::sleep(core.latency);
                }
                core.service();
                core.pending.fetch_sub(1, Ordering::AcqRel);
            }
            Msg::Shutdown => break,
        }
    }
    trace!("remote worker exiting");
}
