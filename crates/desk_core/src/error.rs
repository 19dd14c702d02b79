use std::time::Duration;

use shared::{domain::DeskId, error::ApiException};
use thiserror::Error;

/// A single device-proxy request failed. Never retried by the core.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("access token rejected: {0}")]
    Unauthorized(String),
    #[error("device proxy returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Not sent: a newer command for the same desk replaced it, or the desk shut down.
    #[error("command replaced by a newer one")]
    Superseded,
}

impl DeviceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl From<ApiException> for DeviceError {
    fn from(value: ApiException) -> Self {
        match value.code {
            shared::error::ErrorCode::Unauthorized => Self::Unauthorized(value.message),
            _ => Self::Status {
                status: value.status,
                message: value.message,
            },
        }
    }
}

impl From<reqwest::Error> for DeviceError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Malformed(value.to_string())
        } else {
            Self::Network(value.to_string())
        }
    }
}

/// Connection-level failure of the push channel. Recovered by the stream's own reconnect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("could not reach event stream: {0}")]
    Connect(String),
    #[error("event stream rejected access token")]
    Unauthorized,
    #[error("event stream returned status {0}")]
    Status(u16),
    #[error("event stream idle for {}s", .0.as_secs())]
    IdleTimeout(Duration),
    #[error("event stream read failed: {0}")]
    Read(String),
    #[error("event stream closed by server")]
    Ended,
}

impl StreamError {
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            other => Self::Status(other),
        }
    }
}

/// Last failure recorded on a desk, exposed through its snapshot.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeskError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl DeskError {
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Self::Stream(StreamError::Connect(_)) | Self::Device(DeviceError::Network(_))
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("desk {0} is already registered")]
    DuplicateDesk(DeskId),
    #[error("desk {0} is not registered")]
    UnknownDesk(DeskId),
    #[error("desk {desk_id} has no preset with order {order}")]
    UnknownPreset { desk_id: DeskId, order: i32 },
    #[error("desk {desk_id} has duplicate preset order {order}")]
    DuplicatePresetOrder { desk_id: DeskId, order: i32 },
    #[error("no active desk")]
    NoActiveDesk,
}
