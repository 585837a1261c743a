use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use tee_transport::SlotState;

use crate::ring::RingManager;

/// Whether the remote is believed to be responding.
///
/// A single flag shared by all submitters. Races between a timeout marking it
/// dead and a probe reviving it are benign; the next submission settles it.
#[derive(Debug, Default)]
pub struct Liveness {
    dead: AtomicBool,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Relaxed)
    }

    pub fn is_alive(&self) -> bool {
        !self.is_dead()
    }

    pub fn mark_dead(&self) {
        if !self.dead.swap(true, Ordering::Relaxed) {
            info!("remote marked unresponsive");
        }
    }

    pub fn mark_alive(&self) {
        if self.dead.swap(false, Ordering::Relaxed) {
            info!("remote responsive again");
        }
    }

    /// Looks at the most recently issued slot and revives the remote if it
    /// has since finished it.
    ///
    /// Returns `true` when the remote is (now) considered alive.
    pub fn probe(&self, ring: &RingManager) -> bool {
        if self.is_alive() {
            return true;
        }
        match ring.last_issued().state {
            Some(SlotState::Completed | SlotState::ResponseCopied) => {
                self.mark_alive();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::ClientConfig;
    use crate::transport::HostRing;
    use tee_remote_sim::{SimConfig, SimRemote};
    use tee_transport::ManualClock;

    fn ring() -> RingManager {
        let remote = SimRemote::new(SimConfig {
            slot_size: 64,
            ..SimConfig::default()
        })
        .expect("sim");
        RingManager::init(
            &ClientConfig::default()
                .with_slots(2, 64)
                .with_handshake_timeout(Duration::from_millis(10)),
            &HostRing,
            remote,
            Arc::new(ManualClock::new()),
        )
        .expect("init")
    }

    #[test]
    fn starts_alive_and_flips() {
        let liveness = Liveness::new();
        assert!(liveness.is_alive());
        liveness.mark_dead();
        liveness.mark_dead();
        assert!(liveness.is_dead());
        liveness.mark_alive();
        assert!(liveness.is_alive());
    }

    #[test]
    fn probe_revives_only_after_last_slot_finishes() {
        let ring = ring();
        let liveness = Liveness::new();
        liveness.mark_dead();

        // Last issued slot wraps to index 1 while the cursor sits at 0.
        ring.slot(1).set_state(SlotState::WaitingForResponse);
        assert!(!liveness.probe(&ring));
        assert!(liveness.is_dead());

        ring.slot(1).set_state(SlotState::TimedOut);
        assert!(!liveness.probe(&ring));

        ring.slot(1).set_state(SlotState::ResponseCopied);
        assert!(liveness.probe(&ring));
        assert!(liveness.is_alive());

        liveness.mark_dead();
        ring.slot(1).set_state(SlotState::Completed);
        assert!(liveness.probe(&ring));
        ring.destroy(&liveness);
    }
}
