use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::DeskId;

pub const DEFAULT_API_BASE_URL: &str = "https://api.particle.io";

pub const GET_HEIGHT_FUNCTION: &str = "getHeight";
pub const SET_HEIGHT_FUNCTION: &str = "setHeight";

pub const EVENT_MOVING_DOWN: &str = "movingdown";
pub const EVENT_MOVING_UP: &str = "movingup";
pub const EVENT_TARGET_REACHED: &str = "targetreached";
pub const EVENT_MOVE_TIMEOUT: &str = "movetimeout";
pub const EVENT_HEIGHT: &str = "height";
pub const EVENT_DEVICE_STATUS: &str = "spark/status";

/// URL layout of the device proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiEndpoints {
    base: Url,
}

impl ApiEndpoints {
    pub fn new(base: Url) -> Result<Self, url::ParseError> {
        if base.cannot_be_a_base() {
            return Err(url::ParseError::RelativeUrlWithCannotBeABaseBase);
        }
        Ok(Self { base })
    }

    pub fn parse(base: &str) -> Result<Self, url::ParseError> {
        Self::new(Url::parse(base)?)
    }

    pub fn function_url(&self, desk_id: &DeskId, function: &str) -> Url {
        self.device_url(desk_id, function)
    }

    pub fn events_url(&self, desk_id: &DeskId) -> Url {
        self.device_url(desk_id, "events")
    }

    fn device_url(&self, desk_id: &DeskId, tail: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "devices", desk_id.as_str(), tail]);
        }
        url
    }
}

impl Default for ApiEndpoints {
    fn default() -> Self {
        Self::parse(DEFAULT_API_BASE_URL).unwrap_or_else(|_| unreachable!("default base url is valid"))
    }
}

/// Response to a cloud function call. `return_value` carries the function result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_value: Option<i64>,
}

/// JSON envelope carried in the `data:` field of every pushed event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coreid: Option<String>,
}
