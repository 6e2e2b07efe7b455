//! Makes sure the organization and bucket exist before anything is written.

use tracing::info;

use crate::Error;
use crate::error::Result;
use crate::sink::Provisioning;

/// Ids of the provisioned resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub org_id: String,
    pub bucket_id: String,
    pub org_created: bool,
    pub bucket_created: bool,
}

/// Finds or creates the organization `org` and the bucket `bucket` in it. Running it again
/// creates nothing. Any failure is an [`Error::Provision`].
pub async fn provision<P: Provisioning>(
    client: &P,
    org: &str,
    bucket: &str,
    retention_seconds: u64,
) -> Result<Provisioned> {
    let (org_id, org_created) = ensure_organization(client, org).await?;
    let (bucket_id, bucket_created) =
        ensure_bucket(client, &org_id, bucket, retention_seconds).await?;

    info!(
        org,
        %org_id,
        org_created,
        bucket,
        %bucket_id,
        bucket_created,
        "Provisioned InfluxDB resources"
    );
    Ok(Provisioned {
        org_id,
        bucket_id,
        org_created,
        bucket_created,
    })
}

async fn ensure_organization<P: Provisioning>(client: &P, name: &str) -> Result<(String, bool)> {
    if let Some(id) = client
        .find_organization(name)
        .await
        .map_err(|e| failed("looking up organization", name, e))?
    {
        return Ok((id, false));
    }

    match client.create_organization(name).await {
        Ok(id) => {
            info!(name, %id, "Created organization");
            Ok((id, true))
        }
        Err(Error::Conflict(_)) => {
            info!(name, "Organization was created concurrently, looking it up again");
            let id = client
                .find_organization(name)
                .await
                .map_err(|e| failed("looking up organization", name, e))?
                .ok_or_else(|| {
                    Error::Provision(format!(
                        "organization {name} conflicts on create but cannot be found"
                    ))
                })?;
            Ok((id, false))
        }
        Err(e) => Err(failed("creating organization", name, e)),
    }
}

async fn ensure_bucket<P: Provisioning>(
    client: &P,
    org_id: &str,
    name: &str,
    retention_seconds: u64,
) -> Result<(String, bool)> {
    if let Some(id) = client
        .find_bucket(org_id, name)
        .await
        .map_err(|e| failed("looking up bucket", name, e))?
    {
        return Ok((id, false));
    }

    match client.create_bucket(org_id, name, retention_seconds).await {
        Ok(id) => {
            info!(name, %id, retention_seconds, "Created bucket");
            Ok((id, true))
        }
        Err(Error::Conflict(_)) => {
            info!(name, "Bucket was created concurrently, looking it up again");
            let id = client
                .find_bucket(org_id, name)
                .await
                .map_err(|e| failed("looking up bucket", name, e))?
                .ok_or_else(|| {
                    Error::Provision(format!(
                        "bucket {name} conflicts on create but cannot be found"
                    ))
                })?;
            Ok((id, false))
        }
        Err(e) => Err(failed("creating bucket", name, e)),
    }
}

fn failed(action: &str, name: &str, error: Error) -> Error {
    Error::Provision(format!("{action} {name}: {error}"))
}
