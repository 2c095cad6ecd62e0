#![allow(dead_code)]

use async_trait::async_trait;
use sensor_ingestor::memory::MemoryStore;
use sensor_ingestor::model::{Account, Device, DeviceFilter, Reading, ReadingFilter};
use sensor_ingestor::store::{AccountStore, DeviceStore, ReadingStore};
use sensor_ingestor::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Memory store whose writes can be told to time out. A timed-out claim or
/// release is still applied, like a statement that commits after the client
/// gave up waiting.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    claims_time_out: AtomicBool,
    releases_time_out: AtomicBool,
    refuse_next_claim: AtomicBool,
    failing_inserts: AtomicUsize,
}

fn timeout() -> Error {
    Error::StorageTimeout(Duration::from_millis(5))
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_out_claims(&self, on: bool) {
        self.claims_time_out.store(on, Ordering::SeqCst);
    }

    pub fn time_out_releases(&self, on: bool) {
        self.releases_time_out.store(on, Ordering::SeqCst);
    }

    /// The next claim matches nothing and changes nothing, as if another
    /// owner held the device until just after the update.
    pub fn refuse_next_claim(&self) {
        self.refuse_next_claim.store(true, Ordering::SeqCst);
    }

    /// The next `n` reading inserts fail without storing anything.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceStore for FlakyStore {
    async fn insert_device_if_absent(&self, device: &Device) -> Result<bool> {
        self.inner.insert_device_if_absent(device).await
    }

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>> {
        self.inner.find_device(device_id).await
    }

    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        self.inner.find_devices(filter).await
    }

    async fn claim_device(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<u64> {
        if self.refuse_next_claim.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }

        let matched = self
            .inner
            .claim_device(device_id, owner_id, display_name)
            .await?;
        if self.claims_time_out.load(Ordering::SeqCst) {
            return Err(timeout());
        }
        Ok(matched)
    }

    async fn release_device(&self, device_id: &str, expected_owner: Option<&str>) -> Result<u64> {
        let matched = self.inner.release_device(device_id, expected_owner).await?;
        if self.releases_time_out.load(Ordering::SeqCst) {
            return Err(timeout());
        }
        Ok(matched)
    }
}

#[async_trait]
impl ReadingStore for FlakyStore {
    async fn insert_readings(&self, readings: &[Reading]) -> Result<()> {
        let failing = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(timeout());
        }
        self.inner.insert_readings(readings).await
    }

    async fn find_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>> {
        self.inner.find_readings(filter).await
    }
}

#[async_trait]
impl AccountStore for FlakyStore {
    async fn find_account(&self, username: &str) -> Result<Option<Account>> {
        self.inner.find_account(username).await
    }

    async fn insert_account_if_absent(&self, account: &Account) -> Result<bool> {
        self.inner.insert_account_if_absent(account).await
    }
}
