use std::{fmt, time::Duration};

use futures::StreamExt;
use reqwest::{header::ACCEPT, Client};
use shared::protocol::EventEnvelope;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::StreamError, sse::SseDecoder};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
const SIGNAL_BUFFER: usize = 64;

#[derive(Clone)]
pub struct StreamRequest {
    pub url: Url,
    pub access_token: String,
}

impl fmt::Debug for StreamRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRequest")
            .field("url", &self.url.as_str())
            .field("access_token", &"<redacted>")
            .finish()
    }
}

/// What one stream instance reports, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Connecting,
    Open,
    Message { name: String, data: String },
    Error(StreamError),
}

/// Receiving end of one opened stream instance. Dropping it closes the instance.
pub struct EventStream {
    signals: mpsc::Receiver<StreamSignal>,
    task: Option<JoinHandle<()>>,
}

impl EventStream {
    pub fn new(signals: mpsc::Receiver<StreamSignal>, task: Option<JoinHandle<()>>) -> Self {
        Self { signals, task }
    }

    pub async fn next_signal(&mut self) -> Option<StreamSignal> {
        self.signals.recv().await
    }

    pub fn close(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.abort();
    }
}

pub trait EventStreamConnector: Send + Sync {
    /// Starts a new instance. Reconnecting after failures is the instance's own job.
    fn open(&self, request: StreamRequest) -> EventStream;
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub idle_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Server-sent-events client for the device proxy's event endpoint.
pub struct SseConnector {
    http: Client,
    options: StreamOptions,
}

impl SseConnector {
    pub fn new(options: StreamOptions) -> Self {
        Self::with_client(Client::new(), options)
    }

    pub fn with_client(http: Client, options: StreamOptions) -> Self {
        Self { http, options }
    }
}

impl EventStreamConnector for SseConnector {
    fn open(&self, request: StreamRequest) -> EventStream {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let task = tokio::spawn(run_stream(
            self.http.clone(),
            self.options.clone(),
            request,
            tx,
        ));
        EventStream::new(rx, Some(task))
    }
}

enum SessionEnd {
    Failed { opened: bool, error: StreamError },
    ReceiverGone,
}

async fn run_stream(
    http: Client,
    options: StreamOptions,
    request: StreamRequest,
    signals: mpsc::Sender<StreamSignal>,
) {
    let mut backoff = options.initial_backoff;
    loop {
        if signals.send(StreamSignal::Connecting).await.is_err() {
            return;
        }
        let (opened, error) = match read_session(&http, &options, &request, &signals).await {
            SessionEnd::Failed { opened, error } => (opened, error),
            SessionEnd::ReceiverGone => return,
        };
        warn!(url = %request.url, "event stream: {error}");
        if signals.send(StreamSignal::Error(error)).await.is_err() {
            return;
        }
        if opened {
            backoff = options.initial_backoff;
        }
        debug!(url = %request.url, delay_ms = backoff.as_millis() as u64, "event stream: reconnecting");
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(options.max_backoff);
    }
}

async fn read_session(
    http: &Client,
    options: &StreamOptions,
    request: &StreamRequest,
    signals: &mpsc::Sender<StreamSignal>,
) -> SessionEnd {
    let response = match http
        .get(request.url.clone())
        .bearer_auth(&request.access_token)
        .header(ACCEPT, "text/event-stream")
        .send()
        .await
    {
        Ok(response) => response,
        Err(err) => {
            return SessionEnd::Failed {
                opened: false,
                error: StreamError::Connect(err.to_string()),
            }
        }
    };

    let status = response.status();
    if !status.is_success() {
        return SessionEnd::Failed {
            opened: false,
            error: StreamError::from_status(status.as_u16()),
        };
    }

    info!(url = %request.url, "event stream: open");
    if signals.send(StreamSignal::Open).await.is_err() {
        return SessionEnd::ReceiverGone;
    }

    let mut body = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    loop {
        let chunk = match tokio::time::timeout(options.idle_timeout, body.next()).await {
            Err(_) => {
                return SessionEnd::Failed {
                    opened: true,
                    error: StreamError::IdleTimeout(options.idle_timeout),
                }
            }
            Ok(None) => {
                return SessionEnd::Failed {
                    opened: true,
                    error: StreamError::Ended,
                }
            }
            Ok(Some(Err(err))) => {
                return SessionEnd::Failed {
                    opened: true,
                    error: StreamError::Read(err.to_string()),
                }
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        for frame in decoder.push(&chunk) {
            let envelope = match serde_json::from_str::<EventEnvelope>(&frame.data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    debug!(event = %frame.event, "event stream: dropping undecodable payload: {err}");
                    continue;
                }
            };
            let signal = StreamSignal::Message {
                name: frame.event,
                data: envelope.data,
            };
            if signals.send(signal).await.is_err() {
                return SessionEnd::ReceiverGone;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
