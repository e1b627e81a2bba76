//! TP-Link Kasa cloud integration.
//!
//! Discovers the smart plugs registered to a Kasa account and switches their
//! relays through the cloud passthrough endpoint.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bay_core::{Device, DeviceError, DeviceId, PowerState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;
use tokio::sync::Mutex;

/// Default request timeout for cloud calls.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);
const CLOUD_URL: &str = "https://wap.tplinkcloud.com";
const APP_TYPE: &str = "Kasa_Android";

const ERR_ACCOUNT_NOT_FOUND: i64 = -20600;
const ERR_WRONG_PASSWORD: i64 = -20601;
const ERR_TOKEN_EXPIRED: i64 = -20651;

/// Kasa client errors.
#[derive(Debug, Error)]
pub enum KasaError {
    /// The account rejected the username or password.
    #[error("invalid credentials: {reason}")]
    InvalidCredentials { reason: String },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
    /// HTTP request failed.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The cloud answered with a non-zero error code.
    #[error("cloud error {code}: {message}")]
    Api { code: i64, message: String },
    /// Failed to parse response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl KasaError {
    fn is_token_expired(&self) -> bool {
        matches!(self, Self::Api { code, .. } if *code == ERR_TOKEN_EXPIRED)
    }
}

impl From<KasaError> for DeviceError {
    fn from(err: KasaError) -> Self {
        match err {
            KasaError::InvalidCredentials { reason } => Self::invalid_credentials(reason),
            other => Self::connection(other.to_string()),
        }
    }
}

/// A plug as listed by the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudDevice {
    pub device_id: String,
    pub alias: String,
    pub app_server_url: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub status: i64,
}

impl CloudDevice {
    pub fn to_device(&self) -> Device {
        Device::new(self.device_id.as_str(), self.alias.as_str())
    }
}

/// Kasa cloud HTTP client.
///
/// # Thread Safety
///
/// The client is safe to clone and share across threads. Each clone shares
/// the underlying HTTP connection pool.
#[derive(Clone)]
pub struct KasaClient {
    http: reqwest::Client,
    cloud_url: String,
    username: String,
    password: String,
    terminal_uuid: String,
}

impl fmt::Debug for KasaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KasaClient")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("terminal_uuid", &self.terminal_uuid)
            .finish_non_exhaustive()
    }
}

impl KasaClient {
    /// Creates a client for the given account.
    ///
    /// # Errors
    ///
    /// Returns an error if either credential is blank, or if the HTTP client
    /// fails to build.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self, KasaError> {
        let username = username.into();
        let password = password.into();
        if username.trim().is_empty() {
            return Err(KasaError::InvalidCredentials {
                reason: "username cannot be empty".to_string(),
            });
        }
        if password.is_empty() {
            return Err(KasaError::InvalidCredentials {
                reason: "password cannot be empty".to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(KasaError::ClientBuild)?;

        Ok(Self {
            http,
            cloud_url: CLOUD_URL.to_string(),
            username,
            password,
            terminal_uuid: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Logs in and returns a fresh token.
    pub async fn login(&self) -> Result<String, KasaError> {
        #[derive(Deserialize)]
        struct LoginResult {
            token: String,
        }

        let request = CloudRequest {
            method: "login",
            params: Some(LoginParams {
                app_type: APP_TYPE,
                cloud_user_name: &self.username,
                cloud_password: &self.password,
                terminal_uuid: &self.terminal_uuid,
            }),
        };
        let result: LoginResult = match self.call(&self.cloud_url, None, &request).await {
            Err(KasaError::Api { code, message })
                if code == ERR_ACCOUNT_NOT_FOUND || code == ERR_WRONG_PASSWORD =>
            {
                return Err(KasaError::InvalidCredentials { reason: message });
            }
            other => other?,
        };
        Ok(result.token)
    }

    /// Lists every device registered to the account.
    pub async fn device_list(&self, token: &str) -> Result<Vec<CloudDevice>, KasaError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct DeviceListResult {
            device_list: Vec<CloudDevice>,
        }

        let request: CloudRequest<'_, ()> = CloudRequest {
            method: "getDeviceList",
            params: None,
        };
        let result: DeviceListResult = self.call(&self.cloud_url, Some(token), &request).await?;
        Ok(result.device_list)
    }

    /// Switches the relay of a plug.
    pub async fn set_relay_state(
        &self,
        token: &str,
        device: &CloudDevice,
        state: PowerState,
    ) -> Result<(), KasaError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct PassthroughResult {
            response_data: String,
        }

        let request_data = relay_request_data(state);
        let request = CloudRequest {
            method: "passthrough",
            params: Some(PassthroughParams {
                device_id: &device.device_id,
                request_data: &request_data,
            }),
        };
        let result: PassthroughResult = self
            .call(&device.app_server_url, Some(token), &request)
            .await?;
        check_relay_response(&result.response_data)
    }

    async fn call<P: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&str>,
        request: &CloudRequest<'_, P>,
    ) -> Result<T, KasaError> {
        let mut builder = self.http.post(url).json(request);
        if let Some(token) = token {
            builder = builder.query(&[("token", token)]);
        }
        let response = builder.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(KasaError::Api {
                code: i64::from(status.as_u16()),
                message: format!("status {status}: {body}"),
            });
        }
        parse_envelope(&body)
    }
}

/// A logged-in account with a cached device directory.
///
/// Discovery always logs in afresh. Power commands reuse the last token and
/// log in once more when the cloud reports it expired.
#[derive(Debug)]
pub struct KasaAccount {
    client: KasaClient,
    session: Mutex<Option<CloudSession>>,
}

#[derive(Clone)]
struct CloudSession {
    token: String,
    devices: HashMap<DeviceId, CloudDevice>,
}

impl fmt::Debug for CloudSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSession")
            .field("token", &"[REDACTED]")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl KasaAccount {
    pub fn new(client: KasaClient) -> Self {
        Self {
            client,
            session: Mutex::new(None),
        }
    }

    /// Logs in and lists the account's devices.
    pub async fn discover(&self) -> Result<Vec<Device>, KasaError> {
        let session = self.open_session().await?;
        let devices = session.devices.values().map(CloudDevice::to_device).collect();
        *self.session.lock().await = Some(session);
        Ok(devices)
    }

    /// Switches a previously discovered device.
    pub async fn set_power(&self, device_id: &DeviceId, state: PowerState) -> Result<(), KasaError> {
        let current = self.session.lock().await.clone();
        let session = match current {
            Some(session) => session,
            None => self.refresh_session().await?,
        };
        let device = lookup(&session, device_id)?;
        match self.client.set_relay_state(&session.token, &device, state).await {
            Err(err) if err.is_token_expired() => {
                tracing::debug!(device = %device_id, "token expired, logging in again");
                let session = self.refresh_session().await?;
                let device = lookup(&session, device_id)?;
                self.client.set_relay_state(&session.token, &device, state).await
            }
            other => other,
        }
    }

    async fn refresh_session(&self) -> Result<CloudSession, KasaError> {
        let session = self.open_session().await?;
        *self.session.lock().await = Some(session.clone());
        Ok(session)
    }

    async fn open_session(&self) -> Result<CloudSession, KasaError> {
        let token = self.client.login().await?;
        let devices = self
            .client
            .device_list(&token)
            .await?
            .into_iter()
            .map(|device| (DeviceId::new(device.device_id.clone()), device))
            .collect();
        Ok(CloudSession { token, devices })
    }
}

fn lookup(session: &CloudSession, device_id: &DeviceId) -> Result<CloudDevice, KasaError> {
    session
        .devices
        .get(device_id)
        .cloned()
        .ok_or_else(|| KasaError::InvalidResponse(format!("unknown device {device_id}")))
}

#[derive(Debug, Serialize)]
struct CloudRequest<'a, P> {
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<P>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginParams<'a> {
    app_type: &'a str,
    cloud_user_name: &'a str,
    cloud_password: &'a str,
    #[serde(rename = "terminalUUID")]
    terminal_uuid: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PassthroughParams<'a> {
    device_id: &'a str,
    request_data: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    error_code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    result: Option<Box<RawValue>>,
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<T, KasaError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|err| KasaError::InvalidResponse(err.to_string()))?;
    if envelope.error_code != 0 {
        return Err(KasaError::Api {
            code: envelope.error_code,
            message: envelope.msg.unwrap_or_else(|| "unknown error".to_string()),
        });
    }
    let result = envelope
        .result
        .ok_or_else(|| KasaError::InvalidResponse("missing result".to_string()))?;
    serde_json::from_str(result.get()).map_err(|err| KasaError::InvalidResponse(err.to_string()))
}

fn relay_request_data(state: PowerState) -> String {
    let relay = match state {
        PowerState::On => 1,
        PowerState::Off => 0,
    };
    serde_json::json!({ "system": { "set_relay_state": { "state": relay } } }).to_string()
}

fn check_relay_response(data: &str) -> Result<(), KasaError> {
    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|err| KasaError::InvalidResponse(err.to_string()))?;
    let err_code = value
        .pointer("/system/set_relay_state/err_code")
        .and_then(serde_json::Value::as_i64)
        .ok_or_else(|| KasaError::InvalidResponse(format!("unexpected relay response: {data}")))?;
    if err_code != 0 {
        return Err(KasaError::Api {
            code: err_code,
            message: "relay rejected command".to_string(),
        });
    }
    Ok(())
}
