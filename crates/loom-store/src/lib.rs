pub mod branches;
pub mod checkpoints;
pub mod chunks;
pub mod database;
pub mod error;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
