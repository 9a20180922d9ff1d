//! Database layer for coedit

mod activity_repository;
mod connection;
mod migrations;
mod version_store;

pub use activity_repository::{ActivityStore, LibSqlActivityRepository};
pub use connection::{Database, MAX_READERS};
pub use version_store::{LibSqlVersionStore, VersionStore};
