//! FileVault Core - deduplicating file storage with per-user quotas
//!
//! The admission-and-deduplication core:
//! - SHA-256 content fingerprints as the dedup key, scoped per owner
//! - reference-counted stored objects backed by SQLite metadata
//! - quota accounting committed atomically with storage decisions
//! - per-principal token-bucket rate limiting on mutating operations
//! - private/public sharing with counted public access

pub mod config;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod quota;
pub mod rate_limit;
pub mod storage;
pub mod vault;
pub mod visibility;

pub use config::{Config, QuotaConfig, RateLimitConfig, StorageConfig};
pub use dedup::{Admission, DedupStore, Released};
pub use error::{Result, VaultError};
pub use fingerprint::{fingerprint_bytes, fingerprint_reader, verify_fingerprint, Fingerprint};
pub use quota::QuotaLedger;
pub use rate_limit::RateLimiter;
pub use storage::{
    BlobStore, FsBlobStore, GlobalStats, MetadataStore, ObjectRecord, Principal, Role,
    StagedBlob, StorageStats, Visibility,
};
pub use vault::Vault;
pub use visibility::{FetchedObject, VisibilityGate};
