//! 协议层：行分隔 JSON 信封、子进程 Runner 与 Runner 工厂

pub mod envelope;
pub mod factory;
pub mod runner;

pub use envelope::{Envelope, Notification, RpcErrorBody};
pub use factory::{ProcessRunnerFactory, RunnerFactory};
pub use runner::{NotificationListener, ProtocolRunner, RunnerOptions, Subscription};
