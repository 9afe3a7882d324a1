//! 协作式取消：所有等待点都与调用方的 CancellationToken 竞速

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::core::PlannerError;

/// 已取消则立即以 Aborted 失败
pub fn ensure_active(signal: Option<&CancellationToken>) -> Result<(), PlannerError> {
    match signal {
        Some(token) if token.is_cancelled() => Err(PlannerError::Aborted),
        _ => Ok(()),
    }
}

/// 与取消信号竞速；取消时丢弃 `fut`（其内部登记的等待者随 Drop 一起移除）
pub async fn race_cancel<F, T>(signal: Option<&CancellationToken>, fut: F) -> Result<T, PlannerError>
where
    F: Future<Output = Result<T, PlannerError>>,
{
    ensure_active(signal)?;
    match signal {
        None => fut.await,
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(PlannerError::Aborted),
                result = fut => result,
            }
        }
    }
}
