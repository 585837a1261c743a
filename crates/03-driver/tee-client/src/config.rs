//! Tunables for ring bring-up and command submission.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tee_transport::{SlotLayout, TransportResult, DEFAULT_SLOT_SIZE};

/// Ring shape and timing knobs.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bytes per slot; shared contract with the remote firmware.
    pub slot_size: usize,
    /// Capacity of the ring in slots.
    pub slot_count: u32,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    #[serde(with = "millis")]
    pub handshake_timeout: Duration,
    /// Deadline used by [`crate::CommandClient::submit_default`].
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    /// How many times a claim re-checks an occupied slot before giving up.
    pub claim_retries: u32,
    #[serde(with = "millis")]
    pub claim_backoff: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            slot_size: DEFAULT_SLOT_SIZE,
            slot_count: 32,
            poll_interval: Duration::from_millis(1),
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
            claim_retries: 16,
            claim_backoff: Duration::from_millis(1),
        }
    }
}

impl ClientConfig {
    pub fn with_slots(mut self, slot_count: u32, slot_size: usize) -> Self {
        self.slot_count = slot_count;
        self.slot_size = slot_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_claim_budget(mut self, retries: u32, backoff: Duration) -> Self {
        self.claim_retries = retries;
        self.claim_backoff = backoff;
        self
    }

    /// Checks the ring shape, returning the validated slot layout.
    pub fn validate(&self) -> TransportResult<SlotLayout> {
        SlotLayout::new(self.slot_size, self.slot_count)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
