//! Registry services — reconciliation, ingest, tags, credentials.

pub mod admin_service;
pub mod artifact_service;
pub mod credentials;
pub mod drone_service;
pub mod key_service;
pub mod listing;
pub mod password;
pub mod reconciler;
pub mod retention;
pub mod sweeper;
pub mod tag_service;

#[cfg(test)]
pub(crate) mod testing;
