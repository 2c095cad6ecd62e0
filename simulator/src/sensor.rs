use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload published on the sensor topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub luminosity: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}
