use std::time::Duration;

use anyhow::{bail, Context, Result};
use desk_core::{
    DeskChange, DeskController, DeskSnapshot, MoveOutcome, SequencerEvent, TargetOutcome,
    TargetToken,
};
use shared::domain::{display_name, ordered_presets, ConnectionState, Preset};
use tokio::sync::broadcast::{self, error::RecvError};

/// Finds a preset by case-insensitive name or by `#n`, its 1-based position in display order.
pub fn find_preset(presets: &[Preset], query: &str) -> Option<Preset> {
    let ordered = ordered_presets(presets);
    if let Some(position) = query.strip_prefix('#') {
        let index = position.parse::<usize>().ok()?.checked_sub(1)?;
        return ordered.get(index).cloned();
    }
    ordered
        .iter()
        .find(|preset| display_name(preset, presets).eq_ignore_ascii_case(query))
        .cloned()
}

pub fn describe(snapshot: &DeskSnapshot) -> String {
    format!(
        "{} [{}]: {}, height {}, {:?}",
        snapshot.name,
        snapshot.id,
        snapshot.status_text(),
        snapshot.height_text(),
        snapshot.direction
    )
}

/// Waits until the stream is open and a height has been read.
pub async fn wait_until_ready(desk: &DeskController, limit: Duration) -> Result<DeskSnapshot> {
    let mut changes = desk.subscribe_changes();
    tokio::time::timeout(limit, async {
        loop {
            let snapshot = desk.snapshot().await;
            if snapshot.connection == ConnectionState::Open && snapshot.height.is_some() {
                return Ok(snapshot);
            }
            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("desk {} went away", desk.id()),
            }
        }
    })
    .await
    .with_context(|| format!("desk {} did not connect within {}s", desk.id(), limit.as_secs()))?
}

/// Waits for the desk to report the end of a move it was already sent.
pub async fn wait_for_move(
    changes: &mut broadcast::Receiver<DeskChange>,
    limit: Duration,
) -> Result<MoveOutcome> {
    tokio::time::timeout(limit, async {
        loop {
            match changes.recv().await {
                Ok(DeskChange::MoveFinished(outcome)) => return Ok(outcome),
                Ok(DeskChange::CommandFailed { error, .. }) => {
                    return Err(error).context("desk rejected the move")
                }
                Ok(DeskChange::Connection(ConnectionState::Closed)) => {
                    bail!("event stream closed before the move finished")
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("desk went away"),
            }
        }
    })
    .await
    .with_context(|| format!("move did not finish within {}s", limit.as_secs()))?
}

pub async fn wait_for_target(
    events: &mut broadcast::Receiver<SequencerEvent>,
    token: TargetToken,
    limit: Duration,
) -> Result<TargetOutcome> {
    tokio::time::timeout(limit, async {
        loop {
            match events.recv().await {
                Ok(SequencerEvent::Resolved {
                    token: resolved,
                    outcome,
                    ..
                }) if resolved == token => return Ok(outcome),
                Ok(SequencerEvent::Cancelled {
                    token: cancelled, ..
                }) if cancelled == token => bail!("preset move was cancelled"),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => bail!("sequencer went away"),
            }
        }
    })
    .await
    .with_context(|| format!("preset not reached within {}s", limit.as_secs()))?
}

#[cfg(test)]
#[path = "tests/commands_tests.rs"]
mod tests;
