/// Process-local store used by tests and single-node embedding.
pub mod memory;

/// PostgreSQL store for durable, multi-node deployments.
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
