use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use shared::{
    domain::DeskCredentials,
    error::{ApiErrorBody, ApiException},
    protocol::{ApiEndpoints, FunctionCallResponse, GET_HEIGHT_FUNCTION, SET_HEIGHT_FUNCTION},
};
use tracing::debug;

use crate::error::DeviceError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeightReading {
    pub height_cm: i32,
    pub is_online: bool,
}

/// Request/response calls against the device proxy. Implementations do not retry.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn get_height(&self, desk: &DeskCredentials) -> Result<HeightReading, DeviceError>;
    async fn set_height(&self, desk: &DeskCredentials, height_cm: i32) -> Result<(), DeviceError>;
}

pub struct CloudDeviceApi {
    http: Client,
    endpoints: ApiEndpoints,
}

impl CloudDeviceApi {
    pub fn new(endpoints: ApiEndpoints) -> Self {
        Self::with_client(Client::new(), endpoints)
    }

    pub fn with_client(http: Client, endpoints: ApiEndpoints) -> Self {
        Self { http, endpoints }
    }

    async fn call_function(
        &self,
        desk: &DeskCredentials,
        function: &str,
        arg: String,
    ) -> Result<String, DeviceError> {
        let url = self.endpoints.function_url(&desk.id, function);
        debug!(desk_id = %desk.id, function, "device api: calling function");
        let response = self
            .http
            .post(url)
            .bearer_auth(&desk.access_token)
            .timeout(REQUEST_TIMEOUT)
            .form(&[("arg", arg)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body = serde_json::from_str::<ApiErrorBody>(&body).unwrap_or_default();
            return Err(ApiException::new(status.as_u16(), &body).into());
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl DeviceApi for CloudDeviceApi {
    async fn get_height(&self, desk: &DeskCredentials) -> Result<HeightReading, DeviceError> {
        let body = self
            .call_function(desk, GET_HEIGHT_FUNCTION, String::new())
            .await?;
        let response: FunctionCallResponse = serde_json::from_str(&body).map_err(|err| {
            DeviceError::Malformed(format!("{GET_HEIGHT_FUNCTION} response is not valid JSON: {err}"))
        })?;
        let raw = response.return_value.ok_or_else(|| {
            DeviceError::Malformed(format!("{GET_HEIGHT_FUNCTION} response missing return_value"))
        })?;
        let height_cm = i32::try_from(raw).map_err(|_| {
            DeviceError::Malformed(format!("{GET_HEIGHT_FUNCTION} returned out of range height {raw}"))
        })?;
        Ok(HeightReading {
            height_cm,
            is_online: response.connected.unwrap_or(true),
        })
    }

    async fn set_height(&self, desk: &DeskCredentials, height_cm: i32) -> Result<(), DeviceError> {
        self.call_function(desk, SET_HEIGHT_FUNCTION, height_cm.to_string())
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
#[path = "tests/device_api_tests.rs"]
mod tests;
