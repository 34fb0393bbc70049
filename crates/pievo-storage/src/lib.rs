//! Concrete storage implementations with encryption at rest.
//! Uses AES-GCM with a key persisted next to the data (or test doubles).

pub mod key_provider;
pub mod secure_file_store;
