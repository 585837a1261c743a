//! Host-side client for the coprocessor command ring.
//!
//! A [`RingManager`] owns the ring memory and write cursor and runs the
//! bring-up/teardown handshakes, [`Liveness`] tracks whether the remote is
//! answering, and [`CommandClient`] ties them together behind
//! [`CommandClient::submit`].

#![allow(missing_docs)]

mod client;
mod config;
mod error;
mod liveness;
mod ring;
mod transport;

pub use client::{CommandClient, StatsSnapshot, Status};
pub use config::ClientConfig;
pub use error::{BusyReason, IoError, TeeError, TeeResult};
pub use liveness::Liveness;
pub use ring::{ClaimGuard, RingManager, SlotTicket};
pub use transport::{HostRing, MappedRing, RingTransport, TransportKind, HOST_RING_ALIGNMENT};

pub use tee_transport::{
    Clock, Doorbell, ManualClock, RingCommand, SlotState, SystemClock, TransportError,
};
