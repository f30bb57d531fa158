pub mod database;
pub mod error;
pub mod events;
pub mod memory;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod turns;

pub use database::Database;
pub use error::StoreError;
