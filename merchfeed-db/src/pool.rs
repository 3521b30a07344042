use diesel_async::AsyncPgConnection;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::pooled_connection::deadpool::{BuildError, Pool};

pub type ConnectionPool = Pool<AsyncPgConnection>;

/// Builds the shared connection pool. Every storage operation checks out one
/// connection for the lifetime of its transaction.
pub fn get_pool(database_url: &str, max_size: usize) -> Result<ConnectionPool, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);

    Pool::builder(manager).max_size(max_size).build()
}
