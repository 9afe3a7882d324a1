//! 快照存储：只负责把快照整体读写到某处，快照的形状由 [`PlannerSnapshot`] 决定
//!
//! - [`JsonFileSnapshotStore`]：单文件 JSON，临时文件 + rename 原子替换
//! - [`InMemorySnapshotStore`]：进程内保存，供嵌入方与测试使用
//! - [`NoopSnapshotStore`]：不持久化

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use async_trait::async_trait;

use crate::session::state::PlannerSnapshot;

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// 读取快照；不存在时返回 None
    async fn load_snapshot(&self) -> anyhow::Result<Option<PlannerSnapshot>>;

    async fn save_snapshot(&self, snapshot: &PlannerSnapshot) -> anyhow::Result<()>;
}

/// 单文件 JSON 快照；父目录不存在时自动创建
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    /// 文件损坏时记录警告并视为无快照，不阻止启动
    async fn load_snapshot(&self) -> anyhow::Result<Option<PlannerSnapshot>> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read snapshot {}", self.path.display()))
            }
        };
        match serde_json::from_str(&data) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "snapshot file is corrupt, ignoring");
                Ok(None)
            }
        }
    }

    async fn save_snapshot(&self, snapshot: &PlannerSnapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("rename {} -> {}", tmp.display(), self.path.display()))?;
        Ok(())
    }
}

/// 进程内快照，记录写入次数
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    inner: Mutex<(Option<PlannerSnapshot>, usize)>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: PlannerSnapshot) -> Self {
        Self {
            inner: Mutex::new((Some(snapshot), 0)),
        }
    }

    pub fn current(&self) -> Option<PlannerSnapshot> {
        self.inner.lock().ok().and_then(|g| g.0.clone())
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|g| g.1).unwrap_or(0)
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load_snapshot(&self) -> anyhow::Result<Option<PlannerSnapshot>> {
        Ok(self.current())
    }

    async fn save_snapshot(&self, snapshot: &PlannerSnapshot) -> anyhow::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow::anyhow!("snapshot store poisoned"))?;
        guard.0 = Some(snapshot.clone());
        guard.1 += 1;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSnapshotStore;

#[async_trait]
impl SnapshotStore for NoopSnapshotStore {
    async fn load_snapshot(&self) -> anyhow::Result<Option<PlannerSnapshot>> {
        Ok(None)
    }

    async fn save_snapshot(&self, _snapshot: &PlannerSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}
