//! Transport primitives for the shared command ring.
//!
//! This crate holds the pieces both sides of the ring agree on:
//! * [`SharedRegion`] – contiguous memory visible to host and remote, owned or bound.
//! * [`SlotLayout`] / [`Slot`] – the fixed-size slot codec and its state machine words.
//! * [`Doorbell`] – the notify/ack register interface.
//! * [`wait`] – injectable clocks and bounded polling.
//! * [`TransportError`] – allocation and layout failures.

mod doorbell;
mod error;
mod region;
mod slot;
pub mod wait;

pub use doorbell::{join_address, split_address, Doorbell, RingCommand, ACK_OK};
pub use error::{TransportError, TransportResult};
pub use region::{SharedRegion, MAPPED_REGION_ALIGNMENT};
pub use slot::{
    Slot, SlotLayout, SlotSnapshot, SlotState, DEFAULT_SLOT_SIZE, SLOT_ALIGNMENT, SLOT_OVERHEAD,
};
pub use wait::{Clock, ManualClock, SystemClock, WaitResult};
