// Persistence layer: typed storage for definitions, executions, delayed
// calls and cron triggers, behind the StateStore trait with an in-memory
// backend (tests, single-process) and a Postgres backend (sqlx).

pub mod limits;
pub mod memory;
pub mod models;
pub mod pg;
pub mod store;

pub use memory::MemoryStore;
pub use models::*;
pub use pg::PgStore;
pub use store::StateStore;
