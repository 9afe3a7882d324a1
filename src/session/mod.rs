//! 会话层：持久状态、快照存储、会话注册表

pub mod registry;
pub mod state;
pub mod store;

pub use registry::{normalize_key, Session, SessionLease, SessionRegistry, DEFAULT_SESSION_KEY};
pub use state::{now_ms, PersistedState, PersistedThreadEntry, PlannerSnapshot};
pub use store::{InMemorySnapshotStore, JsonFileSnapshotStore, NoopSnapshotStore, SnapshotStore};
