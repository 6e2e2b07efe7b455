//! Capabilities the pipeline needs from the time-series store.

use crate::error::Result;
use crate::record::ParsedRecord;

/// InfluxDB implementation of [`Sink`] and [`Provisioning`].
pub(crate) mod influxdb;

#[cfg(test)]
pub(crate) mod test_utils;

/// Writes records to the store.
#[trait_variant::make(Sink: Send)]
#[allow(dead_code)]
pub trait LocalSink {
    /// Writes all records or none of them.
    async fn write_batch(&self, records: &[ParsedRecord]) -> Result<()>;

    async fn write_point(&self, record: &ParsedRecord) -> Result<()>;

    /// Fails with [`crate::Error::Rejected`] when the store can never accept `record`, no
    /// matter which batch it is part of.
    fn check(&self, record: &ParsedRecord) -> Result<()>;

    /// Whether the store is reachable and healthy.
    async fn ping(&self) -> Result<bool>;
}

/// Looks up and creates the organization and bucket the records are written to. Lookups
/// return the id of a resource with exactly the given name. Creating a resource that already
/// exists fails with [`crate::Error::Conflict`].
#[trait_variant::make(Provisioning: Send)]
#[allow(dead_code)]
pub trait LocalProvisioning {
    async fn find_organization(&self, name: &str) -> Result<Option<String>>;

    async fn create_organization(&self, name: &str) -> Result<String>;

    async fn find_bucket(&self, org_id: &str, name: &str) -> Result<Option<String>>;

    async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
        retention_seconds: u64,
    ) -> Result<String>;
}
