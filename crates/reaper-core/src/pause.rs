//! Cooperative pause/resume broadcast.
//!
//! The controller owns a [`PauseSignal`]; workers only ever see a
//! [`PauseToken`], which can observe and acknowledge a pause but never
//! request one.
//!
//! ```text
//! Running --pause()--> PauseRequested --worker waits--> PauseAcknowledged
//!    ^                       |                                |
//!    +-------resume()--------+--------------------------------+
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

/// Observable phase of the current pause cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausePhase {
    Running,
    PauseRequested,
    PauseAcknowledged,
}

impl fmt::Display for PausePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PausePhase::Running => write!(f, "running"),
            PausePhase::PauseRequested => write!(f, "pause-requested"),
            PausePhase::PauseAcknowledged => write!(f, "paused"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct PauseState {
    paused: bool,
    acknowledged: bool,
    /// Bumped on every pause so a waiter can't miss a resume that was
    /// immediately followed by another pause.
    cycle: u64,
}

impl PauseState {
    fn phase(&self) -> PausePhase {
        match (self.paused, self.acknowledged) {
            (false, _) => PausePhase::Running,
            (true, false) => PausePhase::PauseRequested,
            (true, true) => PausePhase::PauseAcknowledged,
        }
    }
}

/// Controller side of the pause protocol.
#[derive(Debug, Clone)]
pub struct PauseSignal {
    state: Arc<watch::Sender<PauseState>>,
}

impl PauseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(PauseState::default());
        Self {
            state: Arc::new(tx),
        }
    }

    /// Hands out a worker-facing token bound to this signal.
    pub fn token(&self) -> PauseToken {
        PauseToken {
            state: self.state.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    pub fn phase(&self) -> PausePhase {
        self.state.borrow().phase()
    }

    /// Requests a pause. Returns `false` if already paused.
    pub fn pause(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.paused {
                return false;
            }
            state.paused = true;
            state.acknowledged = false;
            state.cycle += 1;
            true
        })
    }

    /// Requests a pause and returns a future that resolves once a worker has
    /// observed it (or the cycle ended by `resume`).
    pub fn pause_with_ack(&self) -> impl Future<Output = ()> + Send + 'static {
        self.pause();
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx
                .wait_for(|state| !state.paused || state.acknowledged)
                .await;
        }
    }

    /// Releases paused workers. Returns `false` if not paused.
    pub fn resume(&self) -> bool {
        self.state.send_if_modified(|state| {
            if !state.paused {
                return false;
            }
            state.paused = false;
            state.acknowledged = false;
            true
        })
    }
}

impl Default for PauseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker side of the pause protocol: observe and acknowledge only.
#[derive(Debug, Clone)]
pub struct PauseToken {
    state: Arc<watch::Sender<PauseState>>,
}

impl PauseToken {
    /// A token that is never paused, for callers outside a scheduler.
    pub fn none() -> Self {
        PauseSignal::new().token()
    }

    pub fn is_paused(&self) -> bool {
        self.state.borrow().paused
    }

    /// Resolves once a pause has been requested.
    pub async fn paused(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| state.paused).await;
    }

    /// If paused, acknowledges the pause and waits for the matching resume.
    /// Returns immediately when not paused.
    pub async fn wait_while_paused_with_ack(&self) {
        let mut rx = self.state.subscribe();
        let cycle = {
            let state = rx.borrow_and_update();
            if !state.paused {
                return;
            }
            state.cycle
        };

        self.state.send_if_modified(|state| {
            if state.paused && state.cycle == cycle && !state.acknowledged {
                state.acknowledged = true;
                true
            } else {
                false
            }
        });

        let _ = rx
            .wait_for(|state| !state.paused || state.cycle != cycle)
            .await;
    }
}
