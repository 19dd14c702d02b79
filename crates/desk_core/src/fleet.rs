use std::{collections::HashSet, sync::Arc};

use shared::{
    domain::{ordered_presets, DeskId, Preset},
    protocol::ApiEndpoints,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::{
    controller::{DeskConfig, DeskController},
    device_api::DeviceApi,
    error::FleetError,
    sequencer::{next_preset_above, next_preset_below, PresetSequencer, TargetToken},
    stream::EventStreamConnector,
};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    DeskAdded(DeskId),
    DeskRemoved(DeskId),
    ActiveDeskChanged(Option<DeskId>),
}

struct DeskEntry {
    controller: Arc<DeskController>,
    presets: Vec<Preset>,
}

#[derive(Default)]
struct FleetState {
    desks: Vec<DeskEntry>,
    active: Option<DeskId>,
}

impl FleetState {
    fn entry(&self, id: &DeskId) -> Result<&DeskEntry, FleetError> {
        self.desks
            .iter()
            .find(|entry| entry.controller.id() == id)
            .ok_or_else(|| FleetError::UnknownDesk(id.clone()))
    }

    fn entry_mut(&mut self, id: &DeskId) -> Result<&mut DeskEntry, FleetError> {
        self.desks
            .iter_mut()
            .find(|entry| entry.controller.id() == id)
            .ok_or_else(|| FleetError::UnknownDesk(id.clone()))
    }

    fn active_entry(&self) -> Result<&DeskEntry, FleetError> {
        let active = self.active.as_ref().ok_or(FleetError::NoActiveDesk)?;
        self.entry(active)
    }
}

/// Every configured desk, its presets, and which one the hot-key commands act on.
pub struct FleetRegistry {
    endpoints: ApiEndpoints,
    api: Arc<dyn DeviceApi>,
    connector: Arc<dyn EventStreamConnector>,
    sequencer: Arc<PresetSequencer>,
    inner: Mutex<FleetState>,
    events: broadcast::Sender<FleetEvent>,
}

impl FleetRegistry {
    pub fn new(
        endpoints: ApiEndpoints,
        api: Arc<dyn DeviceApi>,
        connector: Arc<dyn EventStreamConnector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            endpoints,
            api,
            connector,
            sequencer: PresetSequencer::new(),
            inner: Mutex::new(FleetState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    pub fn sequencer(&self) -> &Arc<PresetSequencer> {
        &self.sequencer
    }

    /// Registers and starts a desk. The first desk registered becomes active.
    pub async fn add_desk(
        &self,
        config: DeskConfig,
        presets: Vec<Preset>,
    ) -> Result<Arc<DeskController>, FleetError> {
        let id = config.credentials.id.clone();
        validate_presets(&id, &presets)?;

        let controller = {
            let mut state = self.inner.lock().await;
            if state.entry(&id).is_ok() {
                return Err(FleetError::DuplicateDesk(id));
            }
            let controller = DeskController::new(
                config,
                self.endpoints.clone(),
                Arc::clone(&self.api),
                Arc::clone(&self.connector),
            );
            state.desks.push(DeskEntry {
                controller: Arc::clone(&controller),
                presets,
            });
            info!(desk_id = %id, "fleet: desk added");
            let _ = self.events.send(FleetEvent::DeskAdded(id.clone()));
            if state.active.is_none() {
                state.active = Some(id.clone());
                let _ = self.events.send(FleetEvent::ActiveDeskChanged(Some(id)));
            }
            controller
        };

        controller.start().await;
        Ok(controller)
    }

    /// Stops the desk and forgets it. An active desk hands over to the next registered one.
    pub async fn remove_desk(&self, id: &DeskId) -> Result<(), FleetError> {
        let controller = {
            let mut state = self.inner.lock().await;
            let index = state
                .desks
                .iter()
                .position(|entry| entry.controller.id() == id)
                .ok_or_else(|| FleetError::UnknownDesk(id.clone()))?;
            let entry = state.desks.remove(index);
            info!(desk_id = %id, "fleet: desk removed");
            let _ = self.events.send(FleetEvent::DeskRemoved(id.clone()));

            if state.active.as_ref() == Some(id) {
                let next = state
                    .desks
                    .get(index)
                    .or_else(|| state.desks.first())
                    .map(|entry| entry.controller.id().clone());
                state.active = next.clone();
                let _ = self.events.send(FleetEvent::ActiveDeskChanged(next));
            }
            entry.controller
        };

        self.sequencer.cancel(id).await;
        controller.shutdown().await;
        Ok(())
    }

    /// Returns whether the token differed and the stream was restarted.
    pub async fn update_credentials(
        &self,
        id: &DeskId,
        access_token: impl Into<String>,
    ) -> Result<bool, FleetError> {
        let controller = self.desk(id).await?;
        Ok(controller.update_access_token(access_token).await)
    }

    pub async fn set_presets(&self, id: &DeskId, presets: Vec<Preset>) -> Result<(), FleetError> {
        validate_presets(id, &presets)?;
        let mut state = self.inner.lock().await;
        state.entry_mut(id)?.presets = presets;
        debug!(desk_id = %id, "fleet: presets replaced");
        Ok(())
    }

    /// Presets in display order.
    pub async fn presets(&self, id: &DeskId) -> Result<Vec<Preset>, FleetError> {
        let state = self.inner.lock().await;
        Ok(ordered_presets(&state.entry(id)?.presets))
    }

    pub async fn set_active(&self, id: &DeskId) -> Result<(), FleetError> {
        let mut state = self.inner.lock().await;
        state.entry(id)?;
        if state.active.as_ref() == Some(id) {
            return Ok(());
        }
        state.active = Some(id.clone());
        info!(desk_id = %id, "fleet: active desk changed");
        let _ = self
            .events
            .send(FleetEvent::ActiveDeskChanged(Some(id.clone())));
        Ok(())
    }

    pub async fn active_desk(&self) -> Option<Arc<DeskController>> {
        let state = self.inner.lock().await;
        state
            .active_entry()
            .ok()
            .map(|entry| Arc::clone(&entry.controller))
    }

    pub async fn desk(&self, id: &DeskId) -> Result<Arc<DeskController>, FleetError> {
        let state = self.inner.lock().await;
        Ok(Arc::clone(&state.entry(id)?.controller))
    }

    /// Registration order.
    pub async fn desk_ids(&self) -> Vec<DeskId> {
        let state = self.inner.lock().await;
        state
            .desks
            .iter()
            .map(|entry| entry.controller.id().clone())
            .collect()
    }

    pub async fn activate_preset(&self, id: &DeskId, order: i32) -> Result<TargetToken, FleetError> {
        let (controller, preset) = {
            let state = self.inner.lock().await;
            let entry = state.entry(id)?;
            let preset = entry
                .presets
                .iter()
                .find(|preset| preset.order == order)
                .cloned()
                .ok_or_else(|| FleetError::UnknownPreset {
                    desk_id: id.clone(),
                    order,
                })?;
            (Arc::clone(&entry.controller), preset)
        };
        Ok(self.sequencer.activate(&controller, preset).await)
    }

    /// Moves the active desk to the next preset up. `None` when there is nowhere to go.
    pub async fn raise_to_next_preset(&self) -> Result<Option<TargetToken>, FleetError> {
        self.step_active(next_preset_above).await
    }

    pub async fn lower_to_next_preset(&self) -> Result<Option<TargetToken>, FleetError> {
        self.step_active(next_preset_below).await
    }

    async fn step_active(
        &self,
        choose: fn(&[Preset], i32, Option<&Preset>) -> Option<Preset>,
    ) -> Result<Option<TargetToken>, FleetError> {
        let (controller, presets) = {
            let state = self.inner.lock().await;
            let entry = state.active_entry()?;
            (Arc::clone(&entry.controller), entry.presets.clone())
        };

        let Some(height) = controller.snapshot().await.height else {
            debug!(desk_id = %controller.id(), "fleet: height unknown, not stepping presets");
            return Ok(None);
        };
        let target = self
            .sequencer
            .active_target(controller.id())
            .await
            .map(|target| target.preset);

        match choose(&presets, height, target.as_ref()) {
            Some(preset) => Ok(Some(self.sequencer.activate(&controller, preset).await)),
            None => Ok(None),
        }
    }

    /// Stops every desk's stream. Registrations are kept.
    pub async fn shutdown(&self) {
        let controllers: Vec<_> = {
            let state = self.inner.lock().await;
            state
                .desks
                .iter()
                .map(|entry| Arc::clone(&entry.controller))
                .collect()
        };
        for controller in controllers {
            self.sequencer.cancel(controller.id()).await;
            controller.shutdown().await;
        }
    }
}

fn validate_presets(id: &DeskId, presets: &[Preset]) -> Result<(), FleetError> {
    let mut seen = HashSet::new();
    for preset in presets {
        if !seen.insert(preset.order) {
            return Err(FleetError::DuplicatePresetOrder {
                desk_id: id.clone(),
                order: preset.order,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/fleet_tests.rs"]
mod tests;
