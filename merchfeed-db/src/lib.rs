pub mod migrations;
pub mod models;
pub mod pool;
mod rows;
mod schema;
mod storage;

pub use pool::{ConnectionPool, get_pool};
pub use storage::{Postgres, StorageError};
