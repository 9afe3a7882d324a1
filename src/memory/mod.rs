//! 记忆层：紧凑记忆行、按会话的记忆日志、胶囊压缩

pub mod book;
pub mod capsule;
pub mod line;
pub mod scope;

pub use book::{MemoryBook, MemoryEntry};
pub use capsule::{build_capsule, CapsuleMode, DroppedCounts, MemoryCapsule};
pub use line::{final_line, plan_line, FinalLineInput, LineKind, MemoryLine, NO_ACTIONS};
pub use scope::FocusScope;
