pub mod blob_store;
pub mod metadata_store;

pub use blob_store::{BlobStore, FsBlobStore, StagedBlob};
pub use metadata_store::{
    GlobalStats, MetadataStore, ObjectRecord, Principal, Role, StorageStats, Visibility,
};
