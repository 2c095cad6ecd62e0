use crate::model::SensorPayload;
use thiserror::Error;

const TEMP_MIN: f64 = -50.0;
const TEMP_MAX: f64 = 100.0;
const HUMIDITY_MIN: f64 = 0.0;
const HUMIDITY_MAX: f64 = 100.0;
const LUMINOSITY_MIN: i64 = 0;

/// Why a sensor payload was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,

    #[error("Temperature {value} out of range [{min}, {max}]")]
    TemperatureOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Humidity {value} out of range [{min}, {max}]")]
    HumidityOutOfRange { value: f64, min: f64, max: f64 },

    #[error("Luminosity {value} is below {min}")]
    LuminosityOutOfRange { value: i64, min: i64 },
}

impl Rejection {
    /// Short label used for metrics.
    pub fn field(&self) -> &'static str {
        match self {
            Rejection::EmptyDeviceId => "device_id",
            Rejection::TemperatureOutOfRange { .. } => "temperature",
            Rejection::HumidityOutOfRange { .. } => "humidity",
            Rejection::LuminosityOutOfRange { .. } => "luminosity",
        }
    }
}

/// Shape and range checks for inbound telemetry. Bounds are inclusive.
#[derive(Debug, Clone, Copy)]
pub struct Validator {
    temperature: (f64, f64),
    humidity: (f64, f64),
    luminosity_min: i64,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            temperature: (TEMP_MIN, TEMP_MAX),
            humidity: (HUMIDITY_MIN, HUMIDITY_MAX),
            luminosity_min: LUMINOSITY_MIN,
        }
    }
}

impl Validator {
    /// Validates a payload, stopping at the first violated rule.
    ///
    /// Pure: the verdict depends only on the payload.
    pub fn validate(&self, payload: &SensorPayload) -> Result<(), Rejection> {
        if payload.device_id.is_empty() {
            return Err(Rejection::EmptyDeviceId);
        }

        let (min, max) = self.temperature;
        // NaN fails the range check as well
        if !(min..=max).contains(&payload.temperature) {
            return Err(Rejection::TemperatureOutOfRange {
                value: payload.temperature,
                min,
                max,
            });
        }

        let (min, max) = self.humidity;
        if !(min..=max).contains(&payload.humidity) {
            return Err(Rejection::HumidityOutOfRange {
                value: payload.humidity,
                min,
                max,
            });
        }

        if payload.luminosity < self.luminosity_min {
            return Err(Rejection::LuminosityOutOfRange {
                value: payload.luminosity,
                min: self.luminosity_min,
            });
        }

        Ok(())
    }
}

/// Validates with the default bounds.
pub fn validate(payload: &SensorPayload) -> Result<(), Rejection> {
    Validator::default().validate(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(device_id: &str, temperature: f64, humidity: f64, luminosity: i64) -> SensorPayload {
        SensorPayload {
            device_id: device_id.to_string(),
            temperature,
            humidity,
            luminosity,
            timestamp: None,
        }
    }

    #[test]
    fn test_valid_payload() {
        assert!(validate(&payload("dev-1", 25.0, 60.0, 300)).is_ok());
    }

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(validate(&payload("dev-1", -50.0, 0.0, 0)).is_ok());
        assert!(validate(&payload("dev-1", 100.0, 100.0, 0)).is_ok());
    }

    #[test]
    fn test_invalid_temperature() {
        let err = validate(&payload("dev-1", 100.1, 60.0, 300)).unwrap_err();
        assert_eq!(err.field(), "temperature");

        let err = validate(&payload("dev-1", -50.5, 60.0, 300)).unwrap_err();
        assert_eq!(err.field(), "temperature");
    }

    #[test]
    fn test_nan_temperature() {
        assert!(validate(&payload("dev-1", f64::NAN, 60.0, 300)).is_err());
    }

    #[test]
    fn test_invalid_humidity() {
        let err = validate(&payload("dev-1", 25.0, 150.0, 300)).unwrap_err();
        assert_eq!(err.field(), "humidity");

        let err = validate(&payload("dev-1", 25.0, -0.1, 300)).unwrap_err();
        assert_eq!(err.field(), "humidity");
    }

    #[test]
    fn test_negative_luminosity() {
        let err = validate(&payload("dev-1", 25.0, 60.0, -1)).unwrap_err();
        assert_eq!(err, Rejection::LuminosityOutOfRange { value: -1, min: 0 });
    }

    #[test]
    fn test_empty_device_id() {
        let err = validate(&payload("", 25.0, 60.0, 300)).unwrap_err();
        assert_eq!(err, Rejection::EmptyDeviceId);
    }

    #[test]
    fn test_first_violation_wins() {
        // Every rule fails; the device id check comes first
        let err = validate(&payload("", 500.0, 500.0, -5)).unwrap_err();
        assert_eq!(err, Rejection::EmptyDeviceId);

        let err = validate(&payload("dev-1", 500.0, 500.0, -5)).unwrap_err();
        assert_eq!(err.field(), "temperature");
    }

    #[test]
    fn test_verdict_is_deterministic() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let validator = Validator::default();

        for _ in 0..500 {
            let p = payload(
                if rng.gen_bool(0.1) { "" } else { "dev-1" },
                rng.gen_range(-80.0..130.0),
                rng.gen_range(-20.0..120.0),
                rng.gen_range(-100..1000),
            );
            assert_eq!(validator.validate(&p), validator.validate(&p));
        }
    }
}
