use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use shared::{
    domain::{ConnectionState, DeskCredentials, DeskId, Direction, HeightLimits},
    protocol::ApiEndpoints,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    device_api::{DeviceApi, HeightReading},
    error::{DeskError, DeviceError},
    parser::{parse_event, DeskEvent},
    status::{self, Indicator},
    stream::{EventStream, EventStreamConnector, StreamRequest, StreamSignal},
};

const CHANGE_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct DeskConfig {
    pub credentials: DeskCredentials,
    pub name: String,
    pub limits: HeightLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    TargetReached,
    Timeout,
}

/// A change to one observable field of a desk. Published only when the value differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeskChange {
    Height(i32),
    Direction(Direction),
    Connection(ConnectionState),
    Online(bool),
    LastError(Option<DeskError>),
    MoveFinished(MoveOutcome),
    CommandFailed { height_cm: i32, error: DeviceError },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeskSnapshot {
    pub id: DeskId,
    pub name: String,
    pub height: Option<i32>,
    pub direction: Direction,
    pub connection: ConnectionState,
    pub is_online: bool,
    pub last_error: Option<DeskError>,
}

impl DeskSnapshot {
    pub fn status_text(&self) -> &'static str {
        status::status_text(self.connection, self.is_online, self.last_error.as_ref())
    }

    pub fn indicator(&self) -> Indicator {
        status::indicator(self.connection, self.is_online, self.direction)
    }

    pub fn height_text(&self) -> String {
        status::height_text(self.connection, self.is_online, self.height)
    }
}

struct DeskState {
    access_token: String,
    height: Option<i32>,
    direction: Direction,
    connection: ConnectionState,
    is_online: bool,
    last_error: Option<DeskError>,
    generation: u64,
    stream_task: Option<JoinHandle<()>>,
}

impl DeskState {
    fn set_height(&mut self, height: i32, changes: &mut Vec<DeskChange>) {
        if self.height != Some(height) {
            self.height = Some(height);
            changes.push(DeskChange::Height(height));
        }
    }

    fn set_direction(&mut self, direction: Direction, changes: &mut Vec<DeskChange>) {
        if self.direction != direction {
            self.direction = direction;
            changes.push(DeskChange::Direction(direction));
        }
    }

    fn set_connection(&mut self, connection: ConnectionState, changes: &mut Vec<DeskChange>) {
        if self.connection != connection {
            self.connection = connection;
            changes.push(DeskChange::Connection(connection));
        }
    }

    fn set_online(&mut self, is_online: bool, changes: &mut Vec<DeskChange>) {
        if self.is_online != is_online {
            self.is_online = is_online;
            changes.push(DeskChange::Online(is_online));
        }
    }

    fn set_last_error(&mut self, error: Option<DeskError>, changes: &mut Vec<DeskChange>) {
        if self.last_error != error {
            self.last_error = error.clone();
            changes.push(DeskChange::LastError(error));
        }
    }

    /// Closed and Connecting force the desk to Stopped; Connection is published first.
    fn leave_open(&mut self, connection: ConnectionState, changes: &mut Vec<DeskChange>) {
        self.set_connection(connection, changes);
        self.set_direction(Direction::Stopped, changes);
    }

    /// Returns true when the event calls for an authoritative height fetch.
    fn apply_event(&mut self, event: DeskEvent, changes: &mut Vec<DeskChange>) -> bool {
        match event {
            DeskEvent::MovingUp | DeskEvent::MovingDown
                if self.connection != ConnectionState::Open =>
            {
                debug!(?event, connection = ?self.connection, "desk: ignoring motion while stream not open");
                false
            }
            DeskEvent::MovingUp => {
                self.set_direction(Direction::MovingUp, changes);
                false
            }
            DeskEvent::MovingDown => {
                self.set_direction(Direction::MovingDown, changes);
                false
            }
            DeskEvent::TargetReached => {
                changes.push(DeskChange::MoveFinished(MoveOutcome::TargetReached));
                self.set_direction(Direction::Stopped, changes);
                true
            }
            DeskEvent::MoveTimeout => {
                changes.push(DeskChange::MoveFinished(MoveOutcome::Timeout));
                self.set_direction(Direction::Stopped, changes);
                true
            }
            DeskEvent::Height(height) => {
                self.set_height(height, changes);
                false
            }
            DeskEvent::DeviceOnline => {
                self.set_online(true, changes);
                false
            }
            DeskEvent::DeviceOffline => {
                self.set_online(false, changes);
                false
            }
        }
    }
}

struct QueuedCommand {
    seq: u64,
    height_cm: i32,
    reply: oneshot::Sender<Result<(), DeviceError>>,
}

/// A move command waiting in the desk's queue. Dropping it does not withdraw the command.
#[derive(Debug)]
pub struct PendingCommand {
    reply: oneshot::Receiver<Result<(), DeviceError>>,
}

impl PendingCommand {
    /// Resolves once the proxy accepted or rejected the command, or it was skipped.
    pub async fn outcome(self) -> Result<(), DeviceError> {
        self.reply.await.unwrap_or(Err(DeviceError::Superseded))
    }
}

/// Owns one desk's event stream and observable state. All mutations go through `inner`.
pub struct DeskController {
    id: DeskId,
    name: String,
    limits: HeightLimits,
    endpoints: ApiEndpoints,
    api: Arc<dyn DeviceApi>,
    connector: Arc<dyn EventStreamConnector>,
    inner: Mutex<DeskState>,
    changes: broadcast::Sender<DeskChange>,
    commands: mpsc::UnboundedSender<QueuedCommand>,
    latest_command: AtomicU64,
    command_worker: JoinHandle<()>,
}

impl DeskController {
    pub fn new(
        config: DeskConfig,
        endpoints: ApiEndpoints,
        api: Arc<dyn DeviceApi>,
        connector: Arc<dyn EventStreamConnector>,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (commands, queue) = mpsc::unbounded_channel();
        Arc::new_cyclic(|controller| Self {
            id: config.credentials.id,
            name: config.name,
            limits: config.limits,
            endpoints,
            api,
            connector,
            inner: Mutex::new(DeskState {
                access_token: config.credentials.access_token,
                height: None,
                direction: Direction::Stopped,
                connection: ConnectionState::Closed,
                is_online: false,
                last_error: None,
                generation: 0,
                stream_task: None,
            }),
            changes,
            commands,
            latest_command: AtomicU64::new(0),
            command_worker: tokio::spawn(run_commands(controller.clone(), queue)),
        })
    }

    pub fn id(&self) -> &DeskId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> HeightLimits {
        self.limits
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<DeskChange> {
        self.changes.subscribe()
    }

    pub async fn snapshot(&self) -> DeskSnapshot {
        let state = self.inner.lock().await;
        DeskSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            height: state.height,
            direction: state.direction,
            connection: state.connection,
            is_online: state.is_online,
            last_error: state.last_error.clone(),
        }
    }

    /// Opens a fresh stream, replacing any previous one, and seeds state with a fetch.
    pub async fn start(self: &Arc<Self>) {
        let (generation, credentials) = {
            let mut state = self.inner.lock().await;
            state.generation += 1;
            let generation = state.generation;
            if let Some(task) = state.stream_task.take() {
                task.abort();
            }

            let mut changes = Vec::new();
            state.leave_open(ConnectionState::Connecting, &mut changes);
            state.set_last_error(None, &mut changes);

            let stream = self.connector.open(StreamRequest {
                url: self.endpoints.events_url(&self.id),
                access_token: state.access_token.clone(),
            });
            state.stream_task = Some(self.spawn_stream_consumer(generation, stream));
            self.publish(changes);
            (generation, self.credentials(&state))
        };

        info!(desk_id = %self.id, generation, "desk: stream started");
        self.spawn_refresh(generation, credentials);
    }

    /// Rotating the token restarts the stream. Returns false when the token is unchanged.
    pub async fn update_access_token(self: &Arc<Self>, access_token: impl Into<String>) -> bool {
        let access_token = access_token.into();
        {
            let mut state = self.inner.lock().await;
            if state.access_token == access_token {
                return false;
            }
            state.access_token = access_token;
        }
        info!(desk_id = %self.id, "desk: credentials changed, restarting stream");
        self.start().await;
        true
    }

    /// Closes the stream; nothing from earlier streams or fetches is applied afterwards.
    pub async fn shutdown(&self) {
        let mut state = self.inner.lock().await;
        state.generation += 1;
        if let Some(task) = state.stream_task.take() {
            task.abort();
        }
        let mut changes = Vec::new();
        state.leave_open(ConnectionState::Closed, &mut changes);
        self.publish(changes);
        info!(desk_id = %self.id, "desk: shut down");
    }

    /// Re-reads height and presence from the device proxy.
    pub async fn refresh(self: &Arc<Self>) {
        let (generation, credentials) = {
            let state = self.inner.lock().await;
            (state.generation, self.credentials(&state))
        };
        self.spawn_refresh(generation, credentials);
    }

    pub fn set_height(&self, height_cm: i32) {
        let _ = self.queue_height(height_cm);
    }

    /// Issues the move command and waits only for the proxy to accept it.
    pub async fn send_height(&self, height_cm: i32) -> Result<(), DeviceError> {
        self.queue_height(height_cm).outcome().await
    }

    /// Appends a move to the desk's command queue. Commands go out one at a time in call
    /// order; one still waiting when a newer command is queued is skipped.
    pub fn queue_height(&self, height_cm: i32) -> PendingCommand {
        let (reply, pending) = oneshot::channel();
        let seq = self.latest_command.fetch_add(1, Ordering::SeqCst) + 1;
        let command = QueuedCommand {
            seq,
            height_cm,
            reply,
        };
        if let Err(mpsc::error::SendError(command)) = self.commands.send(command) {
            let _ = command.reply.send(Err(DeviceError::Superseded));
        }
        PendingCommand { reply: pending }
    }

    async fn run_command(&self, command: QueuedCommand) {
        let QueuedCommand {
            seq,
            height_cm,
            reply,
        } = command;
        if seq != self.latest_command.load(Ordering::SeqCst) {
            debug!(desk_id = %self.id, height_cm, "desk: skipping command replaced by a newer one");
            let _ = reply.send(Err(DeviceError::Superseded));
            return;
        }

        let (generation, credentials) = {
            let state = self.inner.lock().await;
            (state.generation, self.credentials(&state))
        };
        info!(desk_id = %self.id, height_cm, "desk: setting height");
        let result = self.api.set_height(&credentials, height_cm).await;
        if let Err(err) = &result {
            warn!(desk_id = %self.id, height_cm, "desk: setHeight failed: {err}");
            let mut state = self.inner.lock().await;
            if state.generation == generation {
                let mut changes = Vec::new();
                state.set_last_error(Some(err.clone().into()), &mut changes);
                changes.push(DeskChange::CommandFailed {
                    height_cm,
                    error: err.clone(),
                });
                self.publish(changes);
            }
        }
        let _ = reply.send(result);
    }

    /// Moves to the standing height unless already there or on the way up.
    pub async fn raise(&self) -> bool {
        self.move_towards(self.limits.standing_cm, Direction::MovingUp)
            .await
    }

    /// Moves to the sitting height unless already there or on the way down.
    pub async fn lower(&self) -> bool {
        self.move_towards(self.limits.sitting_cm, Direction::MovingDown)
            .await
    }

    async fn move_towards(&self, target_cm: i32, heading: Direction) -> bool {
        let snapshot = self.snapshot().await;
        if !needs_move(&snapshot, target_cm, heading) {
            debug!(desk_id = %self.id, target_cm, "desk: already at or heading to target");
            return false;
        }
        self.set_height(target_cm);
        true
    }

    fn credentials(&self, state: &DeskState) -> DeskCredentials {
        DeskCredentials::new(self.id.clone(), state.access_token.clone())
    }

    fn publish(&self, changes: Vec<DeskChange>) {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }

    fn spawn_stream_consumer(
        self: &Arc<Self>,
        generation: u64,
        mut stream: EventStream,
    ) -> JoinHandle<()> {
        let controller: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = stream.next_signal().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                controller.handle_stream_signal(generation, signal).await;
            }
        })
    }

    pub(crate) async fn handle_stream_signal(self: &Arc<Self>, generation: u64, signal: StreamSignal) {
        let (refresh, credentials) = {
            let mut state = self.inner.lock().await;
            if state.generation != generation {
                debug!(desk_id = %self.id, generation, current = state.generation, "desk: discarding signal from superseded stream");
                return;
            }

            let mut changes = Vec::new();
            let mut refresh = false;
            match signal {
                StreamSignal::Connecting => {
                    state.leave_open(ConnectionState::Connecting, &mut changes);
                    state.set_last_error(None, &mut changes);
                }
                StreamSignal::Open => {
                    state.set_connection(ConnectionState::Open, &mut changes);
                    refresh = true;
                }
                StreamSignal::Error(err) => {
                    warn!(desk_id = %self.id, "desk: stream closed: {err}");
                    state.leave_open(ConnectionState::Closed, &mut changes);
                    state.set_last_error(Some(err.into()), &mut changes);
                }
                StreamSignal::Message { name, data } => match parse_event(&name, &data) {
                    Some(event) => {
                        debug!(desk_id = %self.id, ?event, "desk: event");
                        refresh = state.apply_event(event, &mut changes);
                    }
                    None => debug!(desk_id = %self.id, event = %name, "desk: dropping unrecognized event"),
                },
            }
            self.publish(changes);
            (refresh, self.credentials(&state))
        };

        if refresh {
            self.spawn_refresh(generation, credentials);
        }
    }

    fn spawn_refresh(self: &Arc<Self>, generation: u64, credentials: DeskCredentials) {
        let controller = Arc::downgrade(self);
        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let result = api.get_height(&credentials).await;
            if let Some(controller) = controller.upgrade() {
                controller.apply_reading(generation, result).await;
            }
        });
    }

    pub(crate) async fn apply_reading(
        &self,
        generation: u64,
        result: Result<HeightReading, DeviceError>,
    ) {
        let mut state = self.inner.lock().await;
        if state.generation != generation {
            debug!(desk_id = %self.id, generation, "desk: discarding reading from superseded stream");
            return;
        }

        let mut changes = Vec::new();
        match result {
            Ok(reading) => {
                debug!(desk_id = %self.id, height = reading.height_cm, online = reading.is_online, "desk: reading");
                state.set_height(reading.height_cm, &mut changes);
                state.set_online(reading.is_online, &mut changes);
            }
            Err(err) => {
                warn!(desk_id = %self.id, "desk: getHeight failed: {err}");
                state.set_last_error(Some(err.into()), &mut changes);
            }
        }
        self.publish(changes);
    }
}

async fn run_commands(
    controller: Weak<DeskController>,
    mut queue: mpsc::UnboundedReceiver<QueuedCommand>,
) {
    while let Some(command) = queue.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.run_command(command).await;
    }
}

impl Drop for DeskController {
    fn drop(&mut self) {
        self.command_worker.abort();
        if let Some(task) = self.inner.get_mut().stream_task.take() {
            task.abort();
        }
    }
}

fn needs_move(snapshot: &DeskSnapshot, target_cm: i32, heading: Direction) -> bool {
    if snapshot.direction == heading {
        return false;
    }
    let at_target = snapshot
        .height
        .is_some_and(|height| (target_cm - 1..=target_cm + 1).contains(&height));
    !(snapshot.direction == Direction::Stopped && snapshot.is_online && at_target)
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
