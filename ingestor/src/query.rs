use crate::errors::Result;
use crate::model::{Device, DeviceFilter, Reading, ReadingFilter};
use crate::store::{DeviceStore, ReadingStore, SharedStore};

/// Filtered reads over stored readings and devices. Not access controlled:
/// an empty filter returns the whole collection.
#[derive(Clone)]
pub struct QueryGateway {
    store: SharedStore,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl QueryGateway {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn readings(&self, mut filter: ReadingFilter) -> Result<Vec<Reading>> {
        filter.user_id = non_empty(filter.user_id);
        filter.device_id = non_empty(filter.device_id);
        self.store.find_readings(&filter).await
    }

    pub async fn devices(&self, mut filter: DeviceFilter) -> Result<Vec<Device>> {
        filter.user_id = non_empty(filter.user_id);
        filter.device_id = non_empty(filter.device_id);
        self.store.find_devices(&filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_empty_strings_mean_no_filter() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_device_if_absent(&Device::unclaimed("dev-1", Utc::now()))
            .await
            .unwrap();
        let gateway = QueryGateway::new(store);

        let devices = gateway
            .devices(DeviceFilter {
                user_id: Some(String::new()),
                device_id: Some(String::new()),
            })
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let gateway = QueryGateway::new(Arc::new(MemoryStore::new()));
        let readings = gateway
            .readings(ReadingFilter::for_device("nothing"))
            .await
            .unwrap();
        assert!(readings.is_empty());
    }
}
