use crate::error::{Result, VaultError};
use crate::storage::{BlobStore, MetadataStore, ObjectRecord, Visibility};
use bytes::Bytes;
use std::sync::Arc;

/// Object returned from a fetch, with its payload.
pub struct FetchedObject {
    pub record: ObjectRecord,
    pub payload: Bytes,
}

/// Controls who may fetch a stored object. Objects start private; the
/// owner may toggle to public and back, effective immediately. Public
/// fetches bump the object's access counter exactly once per fetch.
pub struct VisibilityGate {
    meta: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
}

impl VisibilityGate {
    pub fn new(meta: Arc<MetadataStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { meta, blobs }
    }

    /// Owner-only visibility toggle.
    pub fn set_visibility(
        &self,
        object_id: &str,
        requester_id: &str,
        visibility: Visibility,
    ) -> Result<()> {
        let updated = self.meta.set_visibility(object_id, requester_id, visibility)?;
        if updated {
            tracing::info!(
                "visibility changed: object={} visibility={}",
                object_id,
                visibility.as_str()
            );
            return Ok(());
        }

        // Distinguish a missing object from someone else's object for the
        // owner-facing surface; public fetches never get this distinction.
        match self.meta.get_object(object_id)? {
            Some(_) => Err(VaultError::Forbidden),
            None => Err(VaultError::NotFound),
        }
    }

    /// Fetch a public object, counting the access. A private object and a
    /// nonexistent one are indistinguishable to the caller.
    pub async fn fetch_public(&self, object_id: &str) -> Result<FetchedObject> {
        let record = self
            .meta
            .record_public_fetch(object_id)?
            .ok_or(VaultError::NotFound)?;

        let payload = self.blobs.read(&record.blob_path).await?;
        Ok(FetchedObject { record, payload })
    }

    /// Owner read path. No access counting; a requester who is not the
    /// owner sees NotFound, never confirmation that the object exists.
    pub async fn fetch_owned(&self, object_id: &str, requester_id: &str) -> Result<FetchedObject> {
        let record = self.meta.get_object(object_id)?.ok_or(VaultError::NotFound)?;
        if record.owner_id != requester_id {
            return Err(VaultError::NotFound);
        }

        let payload = self.blobs.read(&record.blob_path).await?;
        Ok(FetchedObject { record, payload })
    }
}
