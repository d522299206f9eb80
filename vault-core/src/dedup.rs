use crate::error::{Result, VaultError};
use crate::quota::QuotaLedger;
use crate::storage::{BlobStore, MetadataStore, ObjectRecord, StagedBlob, Visibility};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::OwnedMutexGuard;
use ulid::Ulid;

/// Outcome of an admission: the object the upload now points at, and
/// whether it was linked to existing content instead of stored anew.
#[derive(Debug, Clone)]
pub struct Admission {
    pub object_id: String,
    pub linked: bool,
}

/// Outcome of a release: whether the physical payload was freed (last
/// reference) or only a reference was dropped.
#[derive(Debug, Clone)]
pub struct Released {
    pub freed: bool,
}

/// Serializes check-then-act sequences per (owner, fingerprint) so two
/// concurrent admissions of identical content cannot both observe "not
/// found". Entries are pruned once nobody holds them.
struct KeyedLocks {
    inner: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, owner_id: &str, fingerprint: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry((owner_id.to_string(), fingerprint.to_string()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Content-addressable admission: decides store-vs-link on upload and
/// decrement-vs-erase on delete, with quota settlement folded into the
/// same decision. Dedup scope is per-owner; two principals storing the
/// same bytes each get their own record, their own physical payload, and
/// pay their own quota.
pub struct DedupStore {
    meta: Arc<MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    ledger: QuotaLedger,
    admission_locks: KeyedLocks,
}

impl DedupStore {
    pub fn new(meta: Arc<MetadataStore>, blobs: Arc<dyn BlobStore>, ledger: QuotaLedger) -> Self {
        Self {
            meta,
            blobs,
            ledger,
            admission_locks: KeyedLocks::new(),
        }
    }

    /// Admit an upload. The payload streams through a disk spool that
    /// yields its fingerprint and size; the size is then provisionally
    /// charged. The duplicate path refunds the charge in the same
    /// transaction that bumps the reference count, so duplicates end up
    /// net-free. The novel path lets the charge stand and commits the
    /// spooled payload into the owner's namespace; any failure after the
    /// charge is compensated with an equal credit.
    pub async fn admit(
        &self,
        owner_id: &str,
        filename: &str,
        mime_type: &str,
        payload: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<Admission> {
        let staged = self.blobs.stage(payload).await?;
        let declared_size = staged.size;

        let debited = match self.ledger.try_debit(owner_id, declared_size) {
            Ok(debited) => debited,
            Err(error) => {
                self.discard_staged(staged).await;
                return Err(error);
            }
        };
        if !debited {
            let remaining = self.ledger.remaining(owner_id)?;
            self.discard_staged(staged).await;
            return Err(VaultError::QuotaExceeded {
                requested: declared_size,
                remaining,
            });
        }

        let _guard = self
            .admission_locks
            .acquire(owner_id, staged.fingerprint.as_str())
            .await;

        let existing = match self.meta.find_object(owner_id, staged.fingerprint.as_str()) {
            Ok(existing) => existing,
            Err(error) => {
                self.ledger.credit(owner_id, declared_size)?;
                self.discard_staged(staged).await;
                return Err(error);
            }
        };

        if let Some(existing) = existing {
            // Identical content already stored for this owner: link to it,
            // refund the provisional charge, drop the spooled bytes.
            let ref_count =
                match self
                    .meta
                    .increment_ref_and_credit(&existing.id, owner_id, declared_size)
                {
                    Ok(ref_count) => ref_count,
                    Err(error) => {
                        self.ledger.credit(owner_id, declared_size)?;
                        self.discard_staged(staged).await;
                        return Err(error);
                    }
                };
            self.discard_staged(staged).await;

            tracing::info!(
                "linked duplicate upload: owner={} object={} refs={}",
                owner_id,
                existing.id,
                ref_count
            );
            return Ok(Admission {
                object_id: existing.id,
                linked: true,
            });
        }

        let fingerprint = staged.fingerprint.clone();
        let blob_path = match self.blobs.commit(staged, owner_id).await {
            Ok(handle) => handle,
            Err(error) => {
                // Commit failed after the provisional debit (the spool is
                // already gone): compensate so no net quota change remains.
                self.ledger.credit(owner_id, declared_size)?;
                return Err(error);
            }
        };

        let object = ObjectRecord {
            id: Ulid::new().to_string(),
            owner_id: owner_id.to_string(),
            fingerprint: fingerprint.to_string(),
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            size: declared_size,
            ref_count: 1,
            visibility: Visibility::Private,
            download_count: 0,
            blob_path,
            created_at: Utc::now(),
        };

        if let Err(error) = self.meta.insert_object(&object) {
            self.ledger.credit(owner_id, declared_size)?;
            if let Err(delete_error) = self.blobs.delete(&object.blob_path).await {
                tracing::warn!(
                    "failed to remove blob after metadata insert failure: handle={} error={}",
                    object.blob_path,
                    delete_error
                );
            }
            return Err(error);
        }

        tracing::info!(
            "stored new object: owner={} object={} size={} fingerprint={}",
            owner_id,
            object.id,
            declared_size,
            fingerprint
        );
        Ok(Admission {
            object_id: object.id,
            linked: false,
        })
    }

    /// Release one reference. Dropping a non-last reference changes no
    /// quota (the single charge from creation still covers the remaining
    /// references). Dropping the last reference deletes the metadata row
    /// and credits the owner in one transaction, then deletes the payload
    /// best-effort: a blob-delete failure is logged as reclaimable orphan
    /// space, never rolled back. Payloads are owner-scoped, so freeing
    /// one owner's copy of some bytes never touches another owner's.
    pub async fn release(&self, object_id: &str, requester_id: &str) -> Result<Released> {
        let object = self.meta.get_object(object_id)?.ok_or(VaultError::NotFound)?;
        if object.owner_id != requester_id {
            return Err(VaultError::Forbidden);
        }

        let _guard = self
            .admission_locks
            .acquire(&object.owner_id, &object.fingerprint)
            .await;

        // The guarded decrement only fires while other references remain;
        // when it does not, this call holds the last reference.
        if self.meta.decrement_ref(object_id)? {
            tracing::info!(
                "released reference: owner={} object={}",
                requester_id,
                object_id
            );
            return Ok(Released { freed: false });
        }

        // Re-check under the lock: a concurrent release may have already
        // erased the object.
        if self.meta.get_object(object_id)?.is_none() {
            return Err(VaultError::NotFound);
        }

        self.meta
            .delete_object_and_credit(object_id, &object.owner_id, object.size)?;

        if let Err(error) = self.blobs.delete(&object.blob_path).await {
            tracing::warn!(
                "blob deletion failed, leaving orphan payload: handle={} error={}",
                object.blob_path,
                error
            );
        }

        tracing::info!(
            "freed object: owner={} object={} size={}",
            requester_id,
            object_id,
            object.size
        );
        Ok(Released { freed: true })
    }

    /// An unpublished spool is never user-visible; losing one costs a
    /// stale temp file, not correctness.
    async fn discard_staged(&self, staged: StagedBlob) {
        if let Err(error) = self.blobs.discard(staged).await {
            tracing::warn!("failed to discard staged payload: {}", error);
        }
    }
}
