use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use shared::{
    domain::{DeskCredentials, DeskId, HeightLimits},
    protocol::ApiEndpoints,
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    controller::{DeskChange, DeskConfig, DeskController, DeskSnapshot},
    device_api::{DeviceApi, HeightReading},
    error::DeviceError,
    stream::{EventStream, EventStreamConnector, StreamRequest, StreamSignal},
};

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    GetHeight { desk: DeskId, token: String },
    SetHeight { desk: DeskId, height_cm: i32 },
}

pub struct FakeDeviceApi {
    reading: Mutex<Result<HeightReading, DeviceError>>,
    set_result: Mutex<Result<(), DeviceError>>,
    held: Mutex<Option<oneshot::Receiver<()>>>,
    calls_tx: mpsc::UnboundedSender<ApiCall>,
    calls_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ApiCall>>,
}

impl FakeDeviceApi {
    pub fn new(height_cm: i32) -> Arc<Self> {
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            reading: Mutex::new(Ok(HeightReading {
                height_cm,
                is_online: true,
            })),
            set_result: Mutex::new(Ok(())),
            held: Mutex::new(None),
            calls_tx,
            calls_rx: tokio::sync::Mutex::new(calls_rx),
        })
    }

    pub fn set_reading(&self, reading: Result<HeightReading, DeviceError>) {
        *self.reading.lock().expect("reading lock") = reading;
    }

    pub fn fail_set_height(&self, error: DeviceError) {
        *self.set_result.lock().expect("set lock") = Err(error);
    }

    /// The next setHeight call is recorded, then blocks until the returned sender fires or drops.
    pub fn hold_next_set_height(&self) -> oneshot::Sender<()> {
        let (release, held) = oneshot::channel();
        *self.held.lock().expect("held lock") = Some(held);
        release
    }

    pub async fn next_call(&self) -> ApiCall {
        let mut calls = self.calls_rx.lock().await;
        tokio::time::timeout(WAIT, calls.recv())
            .await
            .expect("api call within timeout")
            .expect("api still alive")
    }

    pub async fn next_set_height(&self) -> i32 {
        loop {
            if let ApiCall::SetHeight { height_cm, .. } = self.next_call().await {
                return height_cm;
            }
        }
    }

    /// Drains calls made so far without waiting for new ones.
    pub async fn drain_calls(&self) -> Vec<ApiCall> {
        let mut calls = self.calls_rx.lock().await;
        let mut drained = Vec::new();
        while let Ok(call) = calls.try_recv() {
            drained.push(call);
        }
        drained
    }
}

#[async_trait]
impl DeviceApi for FakeDeviceApi {
    async fn get_height(&self, desk: &DeskCredentials) -> Result<HeightReading, DeviceError> {
        let _ = self.calls_tx.send(ApiCall::GetHeight {
            desk: desk.id.clone(),
            token: desk.access_token.clone(),
        });
        self.reading.lock().expect("reading lock").clone()
    }

    async fn set_height(&self, desk: &DeskCredentials, height_cm: i32) -> Result<(), DeviceError> {
        let _ = self.calls_tx.send(ApiCall::SetHeight {
            desk: desk.id.clone(),
            height_cm,
        });
        let held = self.held.lock().expect("held lock").take();
        if let Some(held) = held {
            let _ = held.await;
        }
        self.set_result.lock().expect("set lock").clone()
    }
}

/// Hands out in-memory streams; tests push signals through the recorded senders.
#[derive(Default)]
pub struct FakeConnector {
    opened: Mutex<Vec<(StreamRequest, mpsc::Sender<StreamSignal>)>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened_count(&self) -> usize {
        self.opened.lock().expect("opened lock").len()
    }

    pub fn request(&self, index: usize) -> StreamRequest {
        self.opened.lock().expect("opened lock")[index].0.clone()
    }

    pub fn sender(&self, index: usize) -> mpsc::Sender<StreamSignal> {
        self.opened.lock().expect("opened lock")[index].1.clone()
    }

    pub fn latest(&self) -> mpsc::Sender<StreamSignal> {
        let opened = self.opened.lock().expect("opened lock");
        opened.last().expect("a stream was opened").1.clone()
    }

    pub async fn send(&self, signal: StreamSignal) {
        self.latest().send(signal).await.expect("stream consumer alive");
    }

    pub async fn send_event(&self, name: &str, data: &str) {
        self.send(StreamSignal::Message {
            name: name.to_string(),
            data: data.to_string(),
        })
        .await;
    }
}

impl EventStreamConnector for FakeConnector {
    fn open(&self, request: StreamRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(64);
        self.opened.lock().expect("opened lock").push((request, tx));
        EventStream::new(rx, None)
    }
}

pub fn desk_config(id: &str) -> DeskConfig {
    DeskConfig {
        credentials: DeskCredentials::new(DeskId::new(id), "token-1"),
        name: format!("Desk {id}"),
        limits: HeightLimits::default(),
    }
}

pub fn endpoints() -> ApiEndpoints {
    ApiEndpoints::parse("https://proxy.test").expect("endpoints")
}

pub fn controller(
    id: &str,
    api: &Arc<FakeDeviceApi>,
    connector: &Arc<FakeConnector>,
) -> Arc<DeskController> {
    DeskController::new(desk_config(id), endpoints(), api.clone(), connector.clone())
}

pub async fn wait_until(
    controller: &DeskController,
    predicate: impl Fn(&DeskSnapshot) -> bool,
) -> DeskSnapshot {
    tokio::time::timeout(WAIT, async {
        loop {
            let snapshot = controller.snapshot().await;
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("desk reached expected state")
}

pub async fn next_change(changes: &mut broadcast::Receiver<DeskChange>) -> DeskChange {
    tokio::time::timeout(WAIT, changes.recv())
        .await
        .expect("change within timeout")
        .expect("change channel open")
}

/// Collects changes until `last` is seen, inclusive.
pub async fn changes_until(
    changes: &mut broadcast::Receiver<DeskChange>,
    last: &DeskChange,
) -> Vec<DeskChange> {
    let mut seen = Vec::new();
    loop {
        let change = next_change(changes).await;
        let done = &change == last;
        seen.push(change);
        if done {
            return seen;
        }
    }
}

/// Starts a controller and drives its stream to Open with the seed reading applied.
pub async fn open_controller(
    id: &str,
    api: &Arc<FakeDeviceApi>,
    connector: &Arc<FakeConnector>,
) -> Arc<DeskController> {
    let controller = controller(id, api, connector);
    controller.start().await;
    connector.send(StreamSignal::Open).await;
    wait_until(&controller, |s| {
        s.connection == shared::domain::ConnectionState::Open && s.height.is_some()
    })
    .await;
    controller
}
