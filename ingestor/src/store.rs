//! Storage collaborators.
//!
//! The core only needs document-store style operations: insert-if-absent,
//! filtered finds and conditional updates that report how many records they
//! matched. `PgStore` backs them with Postgres, `MemoryStore` keeps everything
//! in process.

use crate::errors::Result;
use crate::model::{Account, Device, DeviceFilter, Reading, ReadingFilter};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Inserts the device unless one with the same id exists. Returns whether
    /// it was inserted.
    async fn insert_device_if_absent(&self, device: &Device) -> Result<bool>;

    async fn find_device(&self, device_id: &str) -> Result<Option<Device>>;

    /// Devices matching the filter, ordered by device id.
    async fn find_devices(&self, filter: &DeviceFilter) -> Result<Vec<Device>>;

    /// Atomically moves the device to `Registered` for `owner_id`, but only if
    /// it has no owner or is already owned by `owner_id`. `display_name`
    /// replaces the stored name when given. Returns the matched count.
    async fn claim_device(
        &self,
        device_id: &str,
        owner_id: &str,
        display_name: Option<&str>,
    ) -> Result<u64>;

    /// Moves the device back to `Unclaimed` and clears its owner. With
    /// `expected_owner`, only matches while the device is unowned or owned by
    /// that owner. Returns the matched count.
    async fn release_device(&self, device_id: &str, expected_owner: Option<&str>) -> Result<u64>;
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Appends readings in slice order. All or nothing.
    async fn insert_readings(&self, readings: &[Reading]) -> Result<()>;

    /// Readings matching the filter, ordered by timestamp then insertion.
    async fn find_readings(&self, filter: &ReadingFilter) -> Result<Vec<Reading>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_account(&self, username: &str) -> Result<Option<Account>>;

    /// Returns whether the account was inserted.
    async fn insert_account_if_absent(&self, account: &Account) -> Result<bool>;
}

pub trait Store: DeviceStore + ReadingStore + AccountStore {}

impl<T> Store for T where T: DeviceStore + ReadingStore + AccountStore {}

pub type SharedStore = Arc<dyn Store>;
