use crate::errors::Result;
use crate::model::{Account, Device, DeviceFilter, Reading, ReadingFilter, RegistrationState};
use crate::store::{AccountStore, DeviceStore, ReadingStore};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-process store. Conditional updates run under a single write lock, which
/// gives them the same all-or-nothing behaviour as the Postgres statements.
#[derive(Debug, Default)]
pub struct MemoryStore {
    devices: RwLock<BTreeMap<String, Device>>,
    readings: RwLock<Vec<Reading>>,
    accounts: RwLock<HashMap<String, Account>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn insert_device_if_absent(&self, device: &Device) -> Result<bool> {
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.device_id) {
            return Ok(false);
        }
        devices.insert(device.device_id.clone(), device.clone());
        Ok(true)
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let devices = self.devices.read().await;
        Ok(devices
            .values()
            .filter(|d| {
                filter.user_id.as_ref().map_or(true, |user| {
                    d.is_registered() && d.owner_id.as_ref() == Some(user)
                })
            })
            .filter(|d| {
                filter
                    .device_id
                    .as_ref()
                    .map_or(true, |id| &d.device_id == id)
            })
            .cloned()
            .collect())
    }

    async fn claim_device(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            return Ok(0);
        };

        match device.owner_id.as_deref() {
            Some(current) if current != owner_id => Ok(0),
            _ => {
                device.owner_id = Some(owner_id.to_string());
                device.registration_state = RegistrationState::Registered;
                if let Some(name) = display_name {
                    device.display_name = Some(name.to_string());
                }
                Ok(1)
            }
        }
    }

    async fn release_device(&self, device_id: &str, expected_owner: Option<&str>) -> Result<u64> {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(device_id) else {
            return Ok(0);
        };

        if let (Some(expected), Some(current)) = (expected_owner, device.owner_id.as_deref()) {
            if expected != current {
                return Ok(0);
            }
        }

        device.owner_id = None;
        device.registration_state = RegistrationState::Unclaimed;
        Ok(1)
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        self.readings.write().await.extend_from_slice(readings);
        Ok(())
    }

    async fn find_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>> {
        // Snapshot ownership first so the owner filter sees current owners
        let owned: Option<Vec<String>> = match &filter.user_id {
            Some(user) => Some(
                self.devices
                    .read()
                    .await
                    .values()
                    .filter(|d| d.owner_id.as_ref() == Some(user))
                    .map(|d| d.device_id.clone())
                    .collect(),
            ),
            None => None,
        };

        let readings = self.readings.read().await;
        let mut matched: Vec<(usize, &Reading)> = readings
            .iter()
            .enumerate()
            .filter(|(_, r)| owned.as_ref().map_or(true, |ids| ids.contains(&r.device_id)))
            .filter(|(_, r)| {
                filter
                    .device_id
                    .as_ref()
                    .map_or(true, |id| &r.device_id == id)
            })
            .filter(|(_, r)| filter.start.map_or(true, |start| r.timestamp >= start))
            .filter(|(_, r)| filter.end.map_or(true, |end| r.timestamp <= end))
            .collect();

        // Timestamp first, insertion order breaks ties
        matched.sort_by(|(ia, a), (ib, b)| a.timestamp.cmp(&b.timestamp).then(ia.cmp(ib)));

        Ok(matched
            .into_iter()
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn find_account(&self, username: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().await.get(username).cloned())
    }

    async fn insert_account_if_absent(&self, account: &Account) -> Result<bool> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.username) {
            return Ok(false);
        }
        accounts.insert(account.username.clone(), account.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn reading(device_id: &str, offset_secs: i64) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            owner_id: None,
            temperature: 20.0,
            humidity: 50.0,
            luminosity: 100,
            timestamp: "2024-01-01T00:00:00Z".parse::<chrono::DateTime<Utc>>().unwrap()
                + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn test_claim_matches_only_free_or_same_owner() {
        let store = MemoryStore::new();
        store
            .insert_device_if_absent(&Device::unclaimed("dev-1", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.claim_device("dev-1", "alice", None).await.unwrap(), 1);
        assert_eq!(store.claim_device("dev-1", "alice", None).await.unwrap(), 1);
        assert_eq!(store.claim_device("dev-1", "bob", None).await.unwrap(), 0);
        assert_eq!(store.claim_device("dev-404", "bob", None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_first() {
        let store = MemoryStore::new();
        let now = Utc::now();

        assert!(store
            .insert_device_if_absent(&Device::registered("dev-1", "alice", None, now))
            .await
            .unwrap());
        assert!(!store
            .insert_device_if_absent(&Device::unclaimed("dev-1", now))
            .await
            .unwrap());

        let device = store.find_device("dev-1").await.unwrap().unwrap();
        assert_eq!(device.owner_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_readings_ordered_and_paged() {
        let store = MemoryStore::new();
        store
            .insert_readings(&[reading("dev-1", 30), reading("dev-1", 10), reading("dev-2", 20)])
            .await
            .unwrap();

        let all = store.find_readings(&ReadingFilter::default()).await.unwrap();
        let offsets: Vec<_> = all.iter().map(|r| r.timestamp.timestamp() % 60).collect();
        assert_eq!(offsets, vec![10, 20, 30]);

        let page = store
            .find_readings(&ReadingFilter {
                limit: Some(1),
                offset: Some(1),
                ..ReadingFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].device_id, "dev-2");
    }
}
