//! Blocking HTTP client for the household's device controllers.
//!
//! - Lighting hub: group state (`PUT /api/{key}/groups/{group}/action`).
//! - Thermostat controller: relay switching and the temperature sensor.
//!
//! Endpoints are the `ip` of a registered device; callers resolve them through
//! the delegation graph. Timeouts come from the agent config, retries are the
//! caller's business (the automation engine simply tries again next tick).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, url: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    /// The lighting hub answered 200 with an error entry.
    Hub(String),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, url } => write!(f, "http {} from {}", status, url),
            ClientError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            ClientError::Hub(s) => write!(f, "hub error: {}", s),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<serde_path_to_error::Error<serde_json::Error>> for ClientError {
    fn from(value: serde_path_to_error::Error<serde_json::Error>) -> Self {
        ClientError::Json(value)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacSystem {
    Furnace,
    AirConditioning,
}

impl HvacSystem {
    fn path(&self) -> &'static str {
        match self {
            HvacSystem::Furnace => "furnace",
            HvacSystem::AirConditioning => "air_conditioning",
        }
    }
}

/// Outbound device calls made by the automation engine.
pub trait DeviceControl: Send + Sync {
    fn set_group_state(
        &self,
        hub: &str,
        api_key: &str,
        group_id: &str,
        on: bool,
        brightness: u8,
    ) -> Result<(), ClientError>;

    fn read_temperature(&self, endpoint: &str) -> Result<f64, ClientError>;

    fn turn_on(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError>;

    fn turn_off(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError>;
}

#[derive(Serialize)]
struct GroupAction {
    on: bool,
    bri: u8,
}

#[derive(Deserialize)]
struct HubErrorDetail {
    description: String,
}

#[derive(Deserialize)]
struct HubReply {
    #[serde(default)]
    error: Option<HubErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct TemperatureReading {
    celsius: f64,
}

pub struct DeviceClient {
    agent: ureq::Agent,
}

impl DeviceClient {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder().timeout_global(Some(timeout)).build();
        DeviceClient {
            agent: ureq::Agent::new_with_config(config),
        }
    }

    fn url(endpoint: &str, path: &str) -> String {
        let base = endpoint.trim_end_matches('/');
        if base.starts_with("http://") || base.starts_with("https://") {
            format!("{}{}", base, path)
        } else {
            format!("http://{}{}", base, path)
        }
    }

    fn map_err(url: &str, e: ureq::Error) -> ClientError {
        match e {
            ureq::Error::StatusCode(status) => ClientError::Http {
                status,
                url: url.to_string(),
            },
            other => ClientError::Transport(other.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
        let de = &mut serde_json::Deserializer::from_str(body);
        Ok(serde_path_to_error::deserialize(de)?)
    }
}

impl DeviceControl for DeviceClient {
    fn set_group_state(
        &self,
        hub: &str,
        api_key: &str,
        group_id: &str,
        on: bool,
        brightness: u8,
    ) -> Result<(), ClientError> {
        let url = Self::url(hub, &format!("/api/{}/groups/{}/action", api_key, group_id));
        let mut resp = self
            .agent
            .put(&url)
            .header("Accept", "application/json")
            .send_json(&GroupAction { on, bri: brightness })
            .map_err(|e| Self::map_err(&url, e))?;
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| Self::map_err(&url, e))?;
        let replies: Vec<HubReply> = Self::decode(&body)?;
        match replies.into_iter().find_map(|r| r.error) {
            Some(err) => Err(ClientError::Hub(err.description)),
            None => Ok(()),
        }
    }

    fn read_temperature(&self, endpoint: &str) -> Result<f64, ClientError> {
        let url = Self::url(endpoint, "/sensor/temperature");
        let mut resp = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .call()
            .map_err(|e| Self::map_err(&url, e))?;
        let body = resp
            .body_mut()
            .read_to_string()
            .map_err(|e| Self::map_err(&url, e))?;
        let reading: TemperatureReading = Self::decode(&body)?;
        Ok(reading.celsius)
    }

    fn turn_on(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError> {
        let url = Self::url(endpoint, &format!("/relay/{}/on", system.path()));
        self.agent.post(&url).send_empty().map_err(|e| Self::map_err(&url, e))?;
        Ok(())
    }

    fn turn_off(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError> {
        let url = Self::url(endpoint, &format!("/relay/{}/off", system.path()));
        self.agent.post(&url).send_empty().map_err(|e| Self::map_err(&url, e))?;
        Ok(())
    }
}

/// Test double that records every call instead of talking to devices.
#[cfg(test)]
pub mod recording {
    use super::{ClientError, DeviceControl, HvacSystem};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub struct GroupPush {
        pub hub: String,
        pub group: String,
        pub on: bool,
        pub brightness: u8,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RelayCall {
        pub system: HvacSystem,
        pub on: bool,
    }

    #[derive(Default)]
    pub struct RecordingControl {
        pushes: Mutex<Vec<GroupPush>>,
        relays: Mutex<Vec<(String, RelayCall)>>,
        temperature: Mutex<f64>,
        reads: Mutex<usize>,
        failing: Mutex<bool>,
    }

    impl RecordingControl {
        pub fn with_temperature(celsius: f64) -> Self {
            let control = Self::default();
            control.set_temperature(celsius);
            control
        }

        pub fn set_temperature(&self, celsius: f64) {
            *self.temperature.lock().unwrap() = celsius;
        }

        /// Make every call fail with a transport error.
        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        pub fn pushes(&self) -> Vec<GroupPush> {
            self.pushes.lock().unwrap().clone()
        }

        pub fn pushes_for(&self, group: &str) -> Vec<u8> {
            self.pushes().into_iter().filter(|p| p.group == group).map(|p| p.brightness).collect()
        }

        pub fn relay_calls(&self) -> Vec<(String, RelayCall)> {
            self.relays.lock().unwrap().clone()
        }

        pub fn temperature_reads(&self) -> usize {
            *self.reads.lock().unwrap()
        }

        pub fn clear(&self) {
            self.pushes.lock().unwrap().clear();
            self.relays.lock().unwrap().clear();
            *self.reads.lock().unwrap() = 0;
        }

        fn check(&self) -> Result<(), ClientError> {
            if *self.failing.lock().unwrap() {
                return Err(ClientError::Transport("device unreachable".into()));
            }
            Ok(())
        }

        fn relay(&self, endpoint: &str, system: HvacSystem, on: bool) -> Result<(), ClientError> {
            self.check()?;
            self.relays.lock().unwrap().push((endpoint.to_string(), RelayCall { system, on }));
            Ok(())
        }
    }

    impl DeviceControl for RecordingControl {
        fn set_group_state(
            &self,
            hub: &str,
            _api_key: &str,
            group_id: &str,
            on: bool,
            brightness: u8,
        ) -> Result<(), ClientError> {
            self.check()?;
            self.pushes.lock().unwrap().push(GroupPush {
                hub: hub.to_string(),
                group: group_id.to_string(),
                on,
                brightness,
            });
            Ok(())
        }

        fn read_temperature(&self, _endpoint: &str) -> Result<f64, ClientError> {
            self.check()?;
            *self.reads.lock().unwrap() += 1;
            Ok(*self.temperature.lock().unwrap())
        }

        fn turn_on(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError> {
            self.relay(endpoint, system, true)
        }

        fn turn_off(&self, endpoint: &str, system: HvacSystem) -> Result<(), ClientError> {
            self.relay(endpoint, system, false)
        }
    }
}
