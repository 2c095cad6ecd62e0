use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registration status of a device.
///
/// `PendingClaim` is accepted wherever `Unclaimed` is: ingestion stores its
/// readings without an owner and `claim` moves it to `Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    Unclaimed,
    PendingClaim,
    Registered,
}

impl RegistrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Unclaimed => "unclaimed",
            RegistrationState::PendingClaim => "pending_claim",
            RegistrationState::Registered => "registered",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegistrationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unclaimed" => Ok(RegistrationState::Unclaimed),
            "pending_claim" => Ok(RegistrationState::PendingClaim),
            "registered" => Ok(RegistrationState::Registered),
            other => Err(format!("unknown registration state '{}'", other)),
        }
    }
}

/// A telemetry-producing device. `owner_id` is set exactly when the device
/// is `Registered`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    pub owner_id: Option<String>,
    pub registration_state: RegistrationState,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Device {
    /// A device first seen through its telemetry.
    pub fn unclaimed(device_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            owner_id: None,
            registration_state: RegistrationState::Unclaimed,
            display_name: None,
            created_at,
        }
    }

    /// A device provisioned directly for an owner.
    pub fn registered(
        device_id: impl Into<String>,
        owner_id: impl Into<String>,
        display_name: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            owner_id: Some(owner_id.into()),
            registration_state: RegistrationState::Registered,
            display_name,
            created_at,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registration_state == RegistrationState::Registered
    }

    /// Checks the owner/state invariant.
    pub fn is_consistent(&self) -> bool {
        self.is_registered() == self.owner_id.is_some()
    }
}

/// Sensor payload as published by devices, before validation.
///
/// All measurement fields are required; only the timestamp may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorPayload {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub luminosity: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// An accepted, timestamped telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub device_id: String,
    /// Owner of the device when the reading was accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub temperature: f64,
    pub humidity: f64,
    pub luminosity: i64,
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    pub fn from_payload(
        payload: SensorPayload,
        owner_id: Option<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id: payload.device_id,
            owner_id,
            temperature: payload.temperature,
            humidity: payload.humidity,
            luminosity: payload.luminosity,
            timestamp: payload.timestamp.unwrap_or(received_at),
        }
    }
}

/// A user account. The username doubles as the owner id of devices.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub username: String,
    pub credential_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Filter for reading queries. Every field is optional; an empty filter
/// selects the whole collection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingFilter {
    /// Current owner of the device that produced the reading.
    pub user_id: Option<String>,
    pub device_id: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ReadingFilter {
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }
}

/// Filter for device queries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    /// Current owner. Only `Registered` devices have one.
    pub user_id: Option<String>,
    pub device_id: Option<String>,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct QueryResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for QueryResponse<T> {
    fn from(data: Vec<T>) -> Self {
        let total = data.len();
        Self { data, total }
    }
}
