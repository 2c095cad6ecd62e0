use crate::errors::{Error, Result};
use crate::metrics::{
    DECODE_FAILURES_TOTAL, INVALID_MESSAGES_TOTAL, READINGS_DROPPED_TOTAL,
    READINGS_PERSISTED_TOTAL, REGISTRY_REJECTS_TOTAL,
};
use crate::model::{Reading, SensorPayload};
use crate::registry::{DeviceRegistry, Resolution};
use crate::store::{ReadingStore, SharedStore};
use crate::validate::Validator;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Decodes a raw transport payload. Missing required fields fail here.
pub fn decode(payload: &[u8]) -> Result<SensorPayload> {
    Ok(serde_json::from_slice(payload)?)
}

/// Validation, registry resolution and persistence for decoded payloads.
pub struct Pipeline {
    store: SharedStore,
    registry: Arc<DeviceRegistry>,
    validator: Validator,
}

impl Pipeline {
    pub fn new(store: SharedStore, registry: Arc<DeviceRegistry>, validator: Validator) -> Self {
        Self {
            store,
            registry,
            validator,
        }
    }

    /// Turns a candidate into a reading ready to persist, or says why it is
    /// dropped. May create the device as a side effect.
    pub async fn admit(&self, candidate: SensorPayload) -> Result<Reading> {
        self.validator.validate(&candidate)?;

        match self
            .registry
            .resolve_for_ingestion(&candidate.device_id)
            .await?
        {
            Resolution::Accept { owner_id } => {
                Ok(Reading::from_payload(candidate, owner_id, Utc::now()))
            }
            Resolution::Reject => Err(Error::Unregistered(candidate.device_id)),
        }
    }

    pub async fn persist(&self, readings: &[Reading]) -> Result<()> {
        self.store.insert_readings(readings).await?;
        READINGS_PERSISTED_TOTAL.inc_by(readings.len() as f64);
        Ok(())
    }

    /// Runs one message through every stage and stores it.
    pub async fn process(&self, payload: &[u8]) -> Result<Reading> {
        let candidate = decode(payload)?;
        let reading = self.admit(candidate).await?;
        self.persist(std::slice::from_ref(&reading)).await?;
        debug!("Stored reading from {}", reading.device_id);
        Ok(reading)
    }
}

/// Logs and counts a dropped message. Devices get no feedback, so this is the
/// only trace a drop leaves.
pub fn report_drop(err: &Error) {
    match err {
        Error::Decode(e) => {
            DECODE_FAILURES_TOTAL.inc();
            warn!("Dropping undecodable message: {}", e);
        }
        Error::Validation(rejection) => {
            INVALID_MESSAGES_TOTAL
                .with_label_values(&[rejection.field()])
                .inc();
            warn!("Dropping invalid reading: {}", rejection);
        }
        Error::Unregistered(device_id) => {
            REGISTRY_REJECTS_TOTAL.inc();
            warn!("Dropping reading from unregistered device {}", device_id);
        }
        other => {
            READINGS_DROPPED_TOTAL.inc();
            error!("Dropping reading: {}", other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::ReadingFilter;
    use crate::registry::UnregisteredPolicy;
    use crate::store::DeviceStore;

    fn pipeline(policy: UnregisteredPolicy) -> (Arc<MemoryStore>, Pipeline) {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(DeviceRegistry::new(store.clone(), policy));
        let pipeline = Pipeline::new(store.clone(), registry, Validator::default());
        (store, pipeline)
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(decode(b"invalid json"), Err(Error::Decode(_))));
    }

    #[test]
    fn test_process_valid_message() {
        tokio_test::block_on(async {
            let (store, pipeline) = pipeline(UnregisteredPolicy::AutoRegister);
            let payload =
                br#"{"deviceId":"test-dev","temperature":25.0,"humidity":60.0,"luminosity":80}"#;

            let reading = pipeline.process(payload).await.unwrap();
            assert_eq!(reading.device_id, "test-dev");

            let stored = store.find_readings(&ReadingFilter::default()).await.unwrap();
            assert_eq!(stored, vec![reading]);
        });
    }

    #[test]
    fn test_process_invalid_temperature() {
        tokio_test::block_on(async {
            let (store, pipeline) = pipeline(UnregisteredPolicy::AutoRegister);
            let payload = br#"{"deviceId":"test-dev","temperature":999.0,"humidity":60.0,"luminosity":80}"#; // Out of range

            assert!(matches!(
                pipeline.process(payload).await,
                Err(Error::Validation(_))
            ));
            assert!(store.find_device("test-dev").await.unwrap().is_none());
            assert!(store
                .find_readings(&ReadingFilter::default())
                .await
                .unwrap()
                .is_empty());
        });
    }

    #[tokio::test]
    async fn test_process_rejects_unregistered_under_reject_policy() {
        let (store, pipeline) = pipeline(UnregisteredPolicy::Reject);
        let payload = br#"{"deviceId":"test-dev","temperature":25.0,"humidity":60.0,"luminosity":80}"#;

        assert!(matches!(
            pipeline.process(payload).await,
            Err(Error::Unregistered(_))
        ));
        assert!(store
            .find_readings(&ReadingFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_report_drop_handles_every_class() {
        report_drop(&Error::Decode(serde_json::from_str::<u8>("x").unwrap_err()));
        report_drop(&Error::Validation(crate::validate::Rejection::EmptyDeviceId));
        report_drop(&Error::Unregistered("dev-1".to_string()));
        report_drop(&Error::StorageTimeout(std::time::Duration::from_secs(1)));
    }
}
