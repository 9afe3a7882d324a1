//! 核心层：错误分类与恢复策略、协作式取消、优雅关闭

pub mod cancel;
pub mod error;
pub mod recovery;
pub mod shutdown;

pub use cancel::{ensure_active, race_cancel};
pub use error::{ErrorKind, PlannerError};
pub use recovery::{RecoveryAction, RecoveryEngine};
pub use shutdown::{ShutdownManager, ShutdownReason};
