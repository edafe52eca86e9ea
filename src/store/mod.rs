//! Persistence layer: libSQL-backed history, emotions, module catalog, identities
//! and scheduled tasks.

mod author_locks;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use author_locks::AuthorLocks;
pub use libsql_backend::LibSqlBackend;
pub use traits::{
    EmotionStore, HistoryRecord, HistoryStore, IdentityStore, ModuleCatalog, TaskStore,
};
