//! Device ownership and registration state.
//!
//! State machine:
//!
//! ```text
//! Unclaimed | PendingClaim --claim(o)--> Registered(o)
//! Registered(o)            --claim(o)--> Registered(o)
//! Registered(o)            --claim(p)--> Conflict, unchanged
//! any                      --release--> Unclaimed
//! ```
//!
//! Devices are never deleted.

use crate::errors::{Error, Result};
use crate::metrics::{CLAIM_CONFLICTS_TOTAL, DEVICES_AUTO_REGISTERED_TOTAL};
use crate::model::{Device, DeviceFilter, RegistrationState};
use crate::store::{DeviceStore, SharedStore};
use chrono::Utc;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// What ingestion does with telemetry from devices that are not `Registered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisteredPolicy {
    /// Create unseen devices as `Unclaimed` and keep their readings.
    AutoRegister,
    /// Drop readings from any device that is not `Registered`.
    Reject,
}

impl FromStr for UnregisteredPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto-register" | "auto_register" | "autoregister" => {
                Ok(UnregisteredPolicy::AutoRegister)
            }
            "reject" => Ok(UnregisteredPolicy::Reject),
            other => Err(Error::Config(format!(
                "unknown unregistered-device policy '{}'",
                other
            ))),
        }
    }
}

/// Registry verdict for an inbound reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Accept { owner_id: Option<String> },
    Reject,
}

#[derive(Debug, Clone)]
struct CachedDevice {
    state: RegistrationState,
    owner_id: Option<String>,
}

/// `device_id -> (state, owner)` cache in front of the store.
///
/// Every invalidation bumps a generation counter. A lookup remembers the
/// generation it started at and only installs its result if no invalidation
/// happened in between, so a lookup racing a claim cannot leave a stale entry.
///
/// Holds at most `capacity` entries; a full cache is emptied before the next
/// insert.
#[derive(Debug)]
struct DeviceCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Debug, Default)]
struct CacheInner {
    generation: u64,
    entries: HashMap<String, CachedDevice>,
}

impl DeviceCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, device_id: &str) -> Option<CachedDevice> {
        self.lock().entries.get(device_id).cloned()
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    fn insert_if_current(&self, generation: u64, device: &Device) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }

        if inner.entries.len() >= self.capacity && !inner.entries.contains_key(&device.device_id) {
            debug!("Device cache full ({} entries), clearing", inner.entries.len());
            inner.entries.clear();
        }

        inner.entries.insert(
            device.device_id.clone(),
            CachedDevice {
                state: device.registration_state,
                owner_id: device.owner_id.clone(),
            },
        );
    }

    fn invalidate(&self, device_id: &str) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.entries.remove(device_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

pub const DEFAULT_CACHE_CAPACITY: usize = 100_000;

pub struct DeviceRegistry {
    store: SharedStore,
    policy: UnregisteredPolicy,
    cache: Option<DeviceCache>,
}

impl DeviceRegistry {
    pub fn new(store: SharedStore, policy: UnregisteredPolicy) -> Self {
        Self {
            store,
            policy,
            cache: None,
        }
    }

    /// Fronts the store with an in-process state cache. Only sound while this
    /// registry is the sole writer of claim/release for the store.
    pub fn with_cache(self) -> Self {
        self.with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Some(DeviceCache::new(capacity));
        self
    }

    pub fn policy(&self) -> UnregisteredPolicy {
        self.policy
    }

    /// Decides whether a reading from `device_id` is kept, and under which
    /// owner. With `AutoRegister`, unseen devices are created `Unclaimed`.
    pub async fn resolve_for_ingestion(&self, device_id: &str) -> Result<Resolution> {
        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(device_id) {
                return Ok(self.decide(entry.state, entry.owner_id));
            }
        }

        let generation = self.cache.as_ref().map(DeviceCache::generation);

        let device = match self.store.find_device(device_id).await? {
            Some(device) => device,
            None if self.policy == UnregisteredPolicy::Reject => {
                debug!("Unknown device {} rejected", device_id);
                return Ok(Resolution::Reject);
            }
            None => self.auto_register(device_id).await?,
        };

        if let (Some(cache), Some(generation)) = (&self.cache, generation) {
            cache.insert_if_current(generation, &device);
        }

        Ok(self.decide(device.registration_state, device.owner_id))
    }

    async fn auto_register(&self, device_id: &str) -> Result<Device> {
        let device = Device::unclaimed(device_id, Utc::now());
        if self.store.insert_device_if_absent(&device).await? {
            DEVICES_AUTO_REGISTERED_TOTAL.inc();
            info!("Auto-registered device {} as unclaimed", device_id);
            return Ok(device);
        }

        // Someone else created it between our lookup and insert
        self.store
            .find_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(device_id.to_string()))
    }

    fn decide(&self, state: RegistrationState, owner_id: Option<String>) -> Resolution {
        match (state, self.policy) {
            (RegistrationState::Registered, _) => Resolution::Accept { owner_id },
            (_, UnregisteredPolicy::AutoRegister) => Resolution::Accept { owner_id: None },
            (_, UnregisteredPolicy::Reject) => Resolution::Reject,
        }
    }

    /// Assigns an existing device to `owner_id`. Fails with `Conflict` when it
    /// is registered to someone else and `NotFound` when it does not exist.
    pub async fn claim(&self, device_id: &str, owner_id: &str) -> Result<()> {
        self.claim_with_name(device_id, owner_id, None).await
    }

    async fn claim_with_name(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<()> {
        if owner_id.is_empty() {
            return Err(Error::BadRequest("owner id cannot be empty".to_string()));
        }

        // One more attempt if the device was freed after a refused update
        for attempt in 0..2 {
            let matched = self
                .store
                .claim_device(device_id, owner_id, display_name)
                .await;
            // The update may have landed even when the call failed
            self.invalidate(device_id);

            if matched? > 0 {
                info!("Device {} claimed by {}", device_id, owner_id);
                return Ok(());
            }

            match self.store.find_device(device_id).await? {
                None => return Err(Error::NotFound(device_id.to_string())),
                Some(device) if device.owner_id.is_none() && attempt == 0 => {
                    debug!("Device {} was released during claim, retrying", device_id);
                }
                Some(_) => break,
            }
        }

        CLAIM_CONFLICTS_TOTAL.inc();
        warn!(
            "Claim of device {} by {} refused: registered to another owner",
            device_id, owner_id
        );
        Err(Error::Conflict(device_id.to_string()))
    }

    /// Provisions a device for `owner_id`: creates it `Registered` if it is
    /// unknown, otherwise claims it.
    pub async fn register(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<Device> {
        if device_id.is_empty() || owner_id.is_empty() {
            return Err(Error::BadRequest(
                "device id and owner id are required".to_string(),
            ));
        }

        let device = Device::registered(
            device_id,
            owner_id,
            display_name.map(str::to_string),
            Utc::now(),
        );

        let inserted = self.store.insert_device_if_absent(&device).await;
        self.invalidate(device_id);
        if inserted? {
            info!("Device {} provisioned for {}", device_id, owner_id);
            return Ok(device);
        }

        self.claim_with_name(device_id, owner_id, display_name)
            .await?;
        self.store
            .find_device(device_id)
            .await?
            .ok_or_else(|| Error::NotFound(device_id.to_string()))
    }

    /// Returns the device to `Unclaimed`. Releasing an unclaimed device is a
    /// successful no-op.
    pub async fn release(&self, device_id: &str) -> Result<()> {
        let matched = self.store.release_device(device_id, None).await;
        self.invalidate(device_id);

        if matched? == 0 {
            return Err(Error::NotFound(device_id.to_string()));
        }

        info!("Device {} released", device_id);
        Ok(())
    }

    /// Like `release`, but only when the device is unowned or owned by
    /// `owner_id`. The owner check and the update are one store operation.
    pub async fn release_by(&self, device_id: &str, owner_id: &str) -> Result<()> {
        let matched = self.store.release_device(device_id, Some(owner_id)).await;
        self.invalidate(device_id);

        if matched? > 0 {
            info!("Device {} released by {}", device_id, owner_id);
            return Ok(());
        }

        match self.store.find_device(device_id).await? {
            None => Err(Error::NotFound(device_id.to_string())),
            Some(_) => {
                warn!(
                    "Release of device {} by {} refused: registered to another owner",
                    device_id, owner_id
                );
                Err(Error::Forbidden(format!(
                    "device {} belongs to another owner",
                    device_id
                )))
            }
        }
    }

    /// Devices currently registered to `owner_id`.
    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Device>> {
        self.store
            .find_devices(&DeviceFilter {
                user_id: Some(owner_id.to_string()),
                device_id: None,
            })
            .await
    }

    pub async fn find(&self, device_id: &str) -> Result<Option<Device>> {
        self.store.find_device(device_id).await
    }

    fn invalidate(&self, device_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(device_id);
        }
    }
}
