use crate::config::Config;
use crate::dedup::{Admission, DedupStore, Released};
use crate::error::{Result, VaultError};
use crate::fingerprint::{verify_fingerprint, Fingerprint};
use crate::quota::QuotaLedger;
use crate::rate_limit::RateLimiter;
use crate::storage::{
    FsBlobStore, GlobalStats, MetadataStore, ObjectRecord, Principal, Role, StorageStats,
    Visibility,
};
use crate::visibility::{FetchedObject, VisibilityGate};
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Facade wiring the admission pipeline together. Every mutating
/// operation passes the rate limiter first; uploads then take the quota
/// pre-check, spool-and-hash staging, and the dedup store's admission,
/// in that order. Reads bypass the limiter.
pub struct Vault {
    config: Config,
    meta: Arc<MetadataStore>,
    ledger: QuotaLedger,
    limiter: RateLimiter,
    dedup: DedupStore,
    gate: VisibilityGate,
}

impl Vault {
    pub fn open(config: Config) -> Result<Self> {
        let data_dir = config.storage.data_dir.clone();
        let meta = Arc::new(MetadataStore::new(&data_dir)?);
        let blobs: Arc<FsBlobStore> = Arc::new(FsBlobStore::new(&data_dir)?);
        let ledger = QuotaLedger::new(meta.clone());
        let limiter = RateLimiter::new(config.rate_limit);
        let dedup = DedupStore::new(meta.clone(), blobs.clone(), ledger.clone());
        let gate = VisibilityGate::new(meta.clone(), blobs);

        tracing::info!("vault opened at {:?}", data_dir);
        Ok(Self {
            config,
            meta,
            ledger,
            limiter,
            dedup,
            gate,
        })
    }

    // === Principals ===

    pub fn create_principal(&self, name: &str, role: Role, quota: Option<i64>) -> Result<Principal> {
        let quota = quota.unwrap_or(self.config.quota.default_quota_bytes);
        if quota < 0 {
            return Err(VaultError::InvalidRequest(
                "quota cannot be negative".to_string(),
            ));
        }
        self.meta.create_principal(name, role, quota)
    }

    pub fn principal(&self, id: &str) -> Result<Principal> {
        self.meta
            .get_principal(id)?
            .ok_or_else(|| VaultError::PrincipalNotFound(id.to_string()))
    }

    pub fn principal_by_name(&self, name: &str) -> Result<Principal> {
        self.meta
            .get_principal_by_name(name)?
            .ok_or_else(|| VaultError::PrincipalNotFound(name.to_string()))
    }

    // === Mutating operations (rate limited) ===

    /// Store an upload, deduplicating against the owner's existing
    /// content. The payload streams through a disk spool; it is never
    /// held in memory whole.
    pub async fn upload<R>(
        &self,
        principal_id: &str,
        filename: &str,
        mime_type: &str,
        mut payload: R,
    ) -> Result<Admission>
    where
        R: AsyncRead + Send + Unpin,
    {
        self.limiter.check(principal_id)?;

        // Cheap pre-check before spooling; the payload size is unknown
        // until staged, so a rejection here reports requested as 0. The
        // authoritative charge happens inside the admission.
        let remaining = self.ledger.remaining(principal_id)?;
        if remaining <= 0 {
            return Err(VaultError::QuotaExceeded {
                requested: 0,
                remaining,
            });
        }

        self.dedup
            .admit(principal_id, filename, mime_type, &mut payload)
            .await
    }

    /// Drop the caller's reference to an object, erasing it when it was
    /// the last one.
    pub async fn delete(&self, principal_id: &str, object_id: &str) -> Result<Released> {
        self.limiter.check(principal_id)?;
        self.dedup.release(object_id, principal_id).await
    }

    pub fn set_visibility(
        &self,
        principal_id: &str,
        object_id: &str,
        visibility: Visibility,
    ) -> Result<()> {
        self.limiter.check(principal_id)?;
        self.gate.set_visibility(object_id, principal_id, visibility)
    }

    // === Reads ===

    /// Owner download, with integrity verification against the stored
    /// fingerprint.
    pub async fn download(&self, principal_id: &str, object_id: &str) -> Result<FetchedObject> {
        let fetched = self.gate.fetch_owned(object_id, principal_id).await?;
        let expected: Fingerprint = fetched.record.fingerprint.parse()?;
        verify_fingerprint(&fetched.payload, &expected)?;
        Ok(fetched)
    }

    /// Anonymous download of a public object; counts the access.
    pub async fn download_public(&self, object_id: &str) -> Result<FetchedObject> {
        let fetched = self.gate.fetch_public(object_id).await?;
        let expected: Fingerprint = fetched.record.fingerprint.parse()?;
        verify_fingerprint(&fetched.payload, &expected)?;
        Ok(fetched)
    }

    pub fn list(&self, principal_id: &str) -> Result<Vec<ObjectRecord>> {
        self.meta.list_objects(principal_id)
    }

    pub fn stats(&self, principal_id: &str) -> Result<StorageStats> {
        self.meta.storage_stats(principal_id)
    }

    /// System-wide totals; callers gate this behind the admin role.
    pub fn global_stats(&self, requester_id: &str) -> Result<GlobalStats> {
        let requester = self.principal(requester_id)?;
        if requester.role != Role::Admin {
            return Err(VaultError::Forbidden);
        }
        self.meta.global_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::fingerprint::fingerprint_bytes;
    use bytes::Bytes;

    fn open_vault(rate_limit: RateLimitConfig) -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_data_dir(dir.path().to_path_buf());
        config.rate_limit = rate_limit;
        let vault = Vault::open(config).unwrap();
        (dir, vault)
    }

    fn generous_limit() -> RateLimitConfig {
        RateLimitConfig {
            rate: 1000.0,
            burst: 1000.0,
        }
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault.create_principal("alice", Role::User, None).unwrap();

        let content = Bytes::from_static(b"round trip payload");
        let admission = vault
            .upload(&alice.id, "trip.txt", "text/plain", &content[..])
            .await
            .unwrap();

        let fetched = vault.download(&alice.id, &admission.object_id).await.unwrap();
        assert_eq!(fetched.payload, content);
        assert_eq!(
            fetched.record.fingerprint,
            fingerprint_bytes(&content).to_string()
        );
        assert_eq!(fetched.record.filename, "trip.txt");
    }

    #[tokio::test]
    async fn test_upload_is_rate_limited() {
        let (_dir, vault) = open_vault(RateLimitConfig {
            rate: 2.0,
            burst: 2.0,
        });
        let alice = vault.create_principal("alice", Role::User, None).unwrap();

        for i in 0..2u8 {
            vault
                .upload(&alice.id, "f", "text/plain", &[i][..])
                .await
                .unwrap();
        }

        let third = vault
            .upload(&alice.id, "f", "text/plain", &b"x"[..])
            .await;
        assert!(matches!(third, Err(VaultError::RateLimited { .. })));

        // Reads are not gated.
        vault.list(&alice.id).unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_quota_rejected_before_spooling() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault.create_principal("alice", Role::User, Some(0)).unwrap();

        let result = vault
            .upload(&alice.id, "f", "text/plain", &b"data"[..])
            .await;
        assert!(matches!(result, Err(VaultError::QuotaExceeded { .. })));
    }

    #[tokio::test]
    async fn test_share_then_public_download() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault.create_principal("alice", Role::User, None).unwrap();

        let admission = vault
            .upload(&alice.id, "pub.txt", "text/plain", &b"open"[..])
            .await
            .unwrap();

        assert!(matches!(
            vault.download_public(&admission.object_id).await,
            Err(VaultError::NotFound)
        ));

        vault
            .set_visibility(&alice.id, &admission.object_id, Visibility::Public)
            .unwrap();

        let fetched = vault.download_public(&admission.object_id).await.unwrap();
        assert_eq!(fetched.payload, Bytes::from_static(b"open"));
        assert_eq!(fetched.record.download_count, 1);
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault.create_principal("alice", Role::User, None).unwrap();

        let content = Bytes::from_static(b"counted twice");
        vault
            .upload(&alice.id, "a.txt", "text/plain", &content[..])
            .await
            .unwrap();
        vault
            .upload(&alice.id, "b.txt", "text/plain", &content[..])
            .await
            .unwrap();

        let listed = vault.list(&alice.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].ref_count, 2);

        let stats = vault.stats(&alice.id).unwrap();
        assert_eq!(stats.physical_bytes, content.len() as i64);
        assert_eq!(stats.logical_bytes, 2 * content.len() as i64);
    }

    #[tokio::test]
    async fn test_global_stats_admin_only() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault.create_principal("alice", Role::User, None).unwrap();
        let root = vault.create_principal("root", Role::Admin, None).unwrap();

        assert!(matches!(
            vault.global_stats(&alice.id),
            Err(VaultError::Forbidden)
        ));

        let stats = vault.global_stats(&root.id).unwrap();
        assert_eq!(stats.total_principals, 2);
    }

    #[tokio::test]
    async fn test_delete_frees_quota() {
        let (_dir, vault) = open_vault(generous_limit());
        let alice = vault
            .create_principal("alice", Role::User, Some(100))
            .unwrap();

        let admission = vault
            .upload(&alice.id, "f", "text/plain", &[0u8; 100][..])
            .await
            .unwrap();
        assert_eq!(vault.principal(&alice.id).unwrap().quota_remaining, 0);

        let released = vault.delete(&alice.id, &admission.object_id).await.unwrap();
        assert!(released.freed);
        assert_eq!(vault.principal(&alice.id).unwrap().quota_remaining, 100);
    }
}
