use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::domain::{height_ordered_presets, ConnectionState, DeskId, Direction, Preset};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    controller::{DeskChange, DeskController, MoveOutcome},
    error::DeviceError,
};

const EVENT_BUFFER: usize = 64;

/// Identifies one activation. Tokens are never reused within a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetToken(u64);

impl fmt::Display for TargetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Reached,
    TimedOut,
    /// The stream dropped or the device went offline; the final height is unknown.
    Interrupted,
    Failed(DeviceError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTarget {
    pub token: TargetToken,
    pub desk: DeskId,
    pub preset: Preset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerEvent {
    Started {
        desk: DeskId,
        preset: Preset,
        rising: bool,
    },
    Resolved {
        desk: DeskId,
        preset: Preset,
        token: TargetToken,
        outcome: TargetOutcome,
    },
    Cancelled {
        desk: DeskId,
        preset: Preset,
        token: TargetToken,
    },
}

struct InFlight {
    target: ActiveTarget,
    watcher: JoinHandle<()>,
}

/// Drives desks to preset heights, at most one target per desk.
pub struct PresetSequencer {
    next_token: AtomicU64,
    targets: Mutex<HashMap<DeskId, InFlight>>,
    events: broadcast::Sender<SequencerEvent>,
}

impl PresetSequencer {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            next_token: AtomicU64::new(1),
            targets: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencerEvent> {
        self.events.subscribe()
    }

    pub async fn active_target(&self, desk: &DeskId) -> Option<ActiveTarget> {
        self.targets
            .lock()
            .await
            .get(desk)
            .map(|in_flight| in_flight.target.clone())
    }

    /// Replaces any target in flight for the desk and queues the move. Returns immediately.
    pub async fn activate(
        self: &Arc<Self>,
        controller: &Arc<DeskController>,
        preset: Preset,
    ) -> TargetToken {
        let desk = controller.id().clone();
        let current_height = controller.snapshot().await.height;
        let rising = current_height.map_or(true, |height| preset.height > height);

        let (token, pending) = {
            let mut targets = self.targets.lock().await;
            let token = TargetToken(self.next_token.fetch_add(1, Ordering::Relaxed));
            if let Some(previous) = targets.remove(&desk) {
                self.cancel_in_flight(previous);
            }

            let changes = controller.subscribe_changes();
            let watcher = tokio::spawn(Arc::clone(self).watch(desk.clone(), token, changes));
            targets.insert(
                desk.clone(),
                InFlight {
                    target: ActiveTarget {
                        token,
                        desk: desk.clone(),
                        preset: preset.clone(),
                    },
                    watcher,
                },
            );
            info!(desk_id = %desk, %token, height = preset.height, rising, "sequencer: target started");
            let _ = self.events.send(SequencerEvent::Started {
                desk: desk.clone(),
                preset: preset.clone(),
                rising,
            });
            (token, controller.queue_height(preset.height))
        };

        let sequencer = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = pending.outcome().await {
                if let Some(in_flight) = sequencer
                    .resolve(&desk, token, TargetOutcome::Failed(err))
                    .await
                {
                    in_flight.watcher.abort();
                }
            }
        });
        token
    }

    /// Drops the desk's target without resolving it. Returns false when none was in flight.
    pub async fn cancel(&self, desk: &DeskId) -> bool {
        let mut targets = self.targets.lock().await;
        match targets.remove(desk) {
            Some(in_flight) => {
                self.cancel_in_flight(in_flight);
                true
            }
            None => false,
        }
    }

    fn cancel_in_flight(&self, in_flight: InFlight) {
        in_flight.watcher.abort();
        let ActiveTarget {
            token,
            desk,
            preset,
        } = in_flight.target;
        debug!(desk_id = %desk, %token, "sequencer: target cancelled");
        let _ = self.events.send(SequencerEvent::Cancelled {
            desk,
            preset,
            token,
        });
    }

    async fn watch(
        self: Arc<Self>,
        desk: DeskId,
        token: TargetToken,
        mut changes: broadcast::Receiver<DeskChange>,
    ) {
        let outcome = loop {
            match changes.recv().await {
                Ok(change) => {
                    if let Some(outcome) = outcome_for(&change) {
                        break outcome;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(desk_id = %desk, %token, skipped, "sequencer: lost desk changes");
                    break TargetOutcome::Interrupted;
                }
                Err(broadcast::error::RecvError::Closed) => break TargetOutcome::Interrupted,
            }
        };
        self.resolve(&desk, token, outcome).await;
    }

    /// Clears the target only if `token` is still the current one for the desk.
    async fn resolve(
        &self,
        desk: &DeskId,
        token: TargetToken,
        outcome: TargetOutcome,
    ) -> Option<InFlight> {
        let mut targets = self.targets.lock().await;
        if targets.get(desk).map(|in_flight| in_flight.target.token) != Some(token) {
            debug!(desk_id = %desk, %token, "sequencer: ignoring outcome of superseded target");
            return None;
        }
        let in_flight = targets.remove(desk)?;
        match &outcome {
            TargetOutcome::Failed(err) => {
                warn!(desk_id = %desk, %token, "sequencer: move failed: {err}")
            }
            other => info!(desk_id = %desk, %token, outcome = ?other, "sequencer: target resolved"),
        }
        let _ = self.events.send(SequencerEvent::Resolved {
            desk: desk.clone(),
            preset: in_flight.target.preset.clone(),
            token,
            outcome,
        });
        Some(in_flight)
    }
}

fn outcome_for(change: &DeskChange) -> Option<TargetOutcome> {
    match change {
        DeskChange::MoveFinished(MoveOutcome::TargetReached)
        | DeskChange::Direction(Direction::Stopped) => Some(TargetOutcome::Reached),
        DeskChange::MoveFinished(MoveOutcome::Timeout) => Some(TargetOutcome::TimedOut),
        DeskChange::Connection(ConnectionState::Closed | ConnectionState::Connecting)
        | DeskChange::Online(false) => Some(TargetOutcome::Interrupted),
        _ => None,
    }
}

/// Next preset above the desk: the one after `current_target` in height order, or the
/// lowest preset whose ±1 cm band lies wholly above `current_height`.
pub fn next_preset_above(
    presets: &[Preset],
    current_height: i32,
    current_target: Option<&Preset>,
) -> Option<Preset> {
    step_from(&height_ordered_presets(presets), current_target)
        .or_else(|| {
            height_ordered_presets(presets).into_iter().find(|preset| {
                preset.height > current_height && !preset.matches_height(current_height)
            })
        })
}

/// Mirror of [`next_preset_above`].
pub fn next_preset_below(
    presets: &[Preset],
    current_height: i32,
    current_target: Option<&Preset>,
) -> Option<Preset> {
    let mut descending = height_ordered_presets(presets);
    descending.reverse();
    step_from(&descending, current_target).or_else(|| {
        descending.into_iter().find(|preset| {
            preset.height < current_height && !preset.matches_height(current_height)
        })
    })
}

fn step_from(ordered: &[Preset], current_target: Option<&Preset>) -> Option<Preset> {
    let target = current_target?;
    let index = ordered.iter().position(|preset| preset == target)?;
    ordered.get(index + 1).cloned()
}

#[cfg(test)]
#[path = "tests/sequencer_tests.rs"]
mod tests;
