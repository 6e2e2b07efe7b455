use influxbridge_influxdb::{FieldValue as InfluxField, InfluxClient, Point};

use crate::Error;
use crate::error::Result;
use crate::record::{FieldValue, ParsedRecord};
use crate::sink::{Provisioning, Sink};

fn to_point(record: &ParsedRecord) -> Result<Point> {
    let nanos = record.timestamp().timestamp_nanos_opt().ok_or_else(|| {
        Error::Rejected(format!(
            "timestamp {} is out of the nanosecond range",
            record.timestamp()
        ))
    })?;

    let mut point = Point::new(record.measurement()).timestamp_ns(nanos);
    for (key, value) in record.tags() {
        point = point.tag(key.as_str(), value.as_str());
    }
    for (key, value) in record.fields() {
        let value = match value {
            FieldValue::Float(v) => InfluxField::Float(*v),
            FieldValue::Integer(v) => InfluxField::Integer(*v),
            FieldValue::String(v) => InfluxField::String(v.clone()),
            FieldValue::Boolean(v) => InfluxField::Boolean(*v),
        };
        point = point.field(key.as_str(), value);
    }
    Ok(point)
}

impl Sink for InfluxClient {
    async fn write_batch(&self, records: &[ParsedRecord]) -> Result<()> {
        let points = records.iter().map(to_point).collect::<Result<Vec<_>>>()?;
        Ok(self.write(&points).await?)
    }

    async fn write_point(&self, record: &ParsedRecord) -> Result<()> {
        Ok(self.write(&[to_point(record)?]).await?)
    }

    fn check(&self, record: &ParsedRecord) -> Result<()> {
        to_point(record)?.to_line()?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(InfluxClient::ping(self).await?)
    }
}

impl Provisioning for InfluxClient {
    async fn find_organization(&self, name: &str) -> Result<Option<String>> {
        let org = InfluxClient::find_organization(self, name).await?;
        Ok(org.map(|org| org.id))
    }

    async fn create_organization(&self, name: &str) -> Result<String> {
        Ok(InfluxClient::create_organization(self, name).await?.id)
    }

    async fn find_bucket(&self, org_id: &str, name: &str) -> Result<Option<String>> {
        let bucket = InfluxClient::find_bucket(self, org_id, name).await?;
        Ok(bucket.map(|bucket| bucket.id))
    }

    async fn create_bucket(
        &self,
        org_id: &str,
        name: &str,
        retention_seconds: u64,
    ) -> Result<String> {
        let bucket = InfluxClient::create_bucket(self, org_id, name, retention_seconds).await?;
        Ok(bucket.id)
    }
}
