//! 跨重启的持久状态：会话 key → 远端线程 id 的映射，以及每个会话的记忆日志
//!
//! 会话注册表与编排器共享同一个 [`PersistedState`]；写盘走 [`SnapshotStore`]。
//! 非强制写入按固定间隔节流，节流期间的变更标记为 dirty，在下一次写入或关闭时落盘。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::{MemorySection, SessionSection};
use crate::core::PlannerError;
use crate::memory::{LineKind, MemoryBook, MemoryEntry};
use crate::session::store::SnapshotStore;

/// 当前 Unix 毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 持久化的线程映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedThreadEntry {
    pub session_key: String,
    pub remote_thread_id: String,
    pub updated_at_ms: i64,
}

/// 写入存储的快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerSnapshot {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub sessions: Vec<PersistedThreadEntry>,
    #[serde(default)]
    pub memories: Vec<MemoryEntry>,
}

impl PlannerSnapshot {
    pub const VERSION: u32 = 1;
}

struct StateInner {
    threads: HashMap<String, PersistedThreadEntry>,
    memory: MemoryBook,
    dirty: bool,
    last_saved: Option<Instant>,
}

pub struct PersistedState {
    inner: Mutex<StateInner>,
    store: Arc<dyn SnapshotStore>,
    session: SessionSection,
    memory_settings: MemorySection,
    /// 串行化写盘，避免旧快照覆盖新快照
    save_lock: tokio::sync::Mutex<()>,
}

impl PersistedState {
    /// 不加载快照的空状态
    pub fn empty(
        store: Arc<dyn SnapshotStore>,
        session: SessionSection,
        memory_settings: MemorySection,
    ) -> Self {
        Self {
            inner: Mutex::new(StateInner {
                threads: HashMap::new(),
                memory: MemoryBook::new(&memory_settings),
                dirty: false,
                last_saved: None,
            }),
            store,
            session,
            memory_settings,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// 从存储加载快照，并立即按 TTL 与条数上限丢弃过期 / 最旧的条目
    pub async fn restore(
        store: Arc<dyn SnapshotStore>,
        session: SessionSection,
        memory_settings: MemorySection,
    ) -> Self {
        let state = Self::empty(store, session, memory_settings);
        let snapshot = match state.store.load_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return state,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load planner snapshot, starting empty");
                return state;
            }
        };
        if snapshot.version > PlannerSnapshot::VERSION {
            tracing::warn!(version = snapshot.version, "snapshot written by a newer version");
        }

        let now = now_ms();
        let thread_total = snapshot.sessions.len();
        let memory_total = snapshot.memories.len();
        let (threads, memories) = {
            let mut inner = state.lock();
            let ttl_ms = secs_to_ms(state.session.persisted_ttl_secs);
            let mut fresh: Vec<_> = snapshot
                .sessions
                .into_iter()
                .filter(|e| !e.remote_thread_id.trim().is_empty())
                .filter(|e| now.saturating_sub(e.updated_at_ms) <= ttl_ms)
                .collect();
            fresh.sort_by(|a, b| b.updated_at_ms.cmp(&a.updated_at_ms));
            fresh.truncate(state.session.max_persisted_entries);
            for entry in fresh {
                inner.threads.insert(entry.session_key.clone(), entry);
            }

            let restored = inner.memory.restore(
                snapshot.memories,
                now,
                secs_to_ms(state.memory_settings.memory_ttl_secs),
                state.memory_settings.max_memory_entries,
            );
            (inner.threads.len(), restored)
        };
        if threads < thread_total || memories < memory_total {
            tracing::warn!(
                dropped_threads = thread_total - threads,
                dropped_memories = memory_total - memories,
                "pruned stale snapshot entries"
            );
        }
        tracing::info!(threads, memories, "restored planner snapshot");
        state
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// 未过期的持久化线程 id
    pub fn thread_for(&self, session_key: &str) -> Option<String> {
        let ttl_ms = secs_to_ms(self.session.persisted_ttl_secs);
        let now = now_ms();
        self.lock()
            .threads
            .get(session_key)
            .filter(|e| now.saturating_sub(e.updated_at_ms) <= ttl_ms)
            .map(|e| e.remote_thread_id.clone())
    }

    /// 记录 / 刷新线程映射；新 key 或线程 id 变化时返回 true（调用方应强制写盘）
    pub fn record_thread(&self, session_key: &str, thread_id: &str) -> bool {
        let mut inner = self.lock();
        let changed = inner
            .threads
            .get(session_key)
            .map_or(true, |e| e.remote_thread_id != thread_id);
        inner.threads.insert(
            session_key.to_string(),
            PersistedThreadEntry {
                session_key: session_key.to_string(),
                remote_thread_id: thread_id.to_string(),
                updated_at_ms: now_ms(),
            },
        );
        let cap = self.session.max_persisted_entries.max(1);
        while inner.threads.len() > cap {
            let oldest = inner
                .threads
                .values()
                .min_by_key(|e| e.updated_at_ms)
                .map(|e| e.session_key.clone());
            match oldest {
                Some(key) => {
                    inner.threads.remove(&key);
                }
                None => break,
            }
        }
        inner.dirty = true;
        changed
    }

    pub fn forget_thread(&self, session_key: &str) {
        let mut inner = self.lock();
        if inner.threads.remove(session_key).is_some() {
            inner.dirty = true;
        }
    }

    /// 追加一行记忆；与上一行相同时返回 false
    pub fn append_memory(&self, session_key: &str, line: String) -> bool {
        let mut inner = self.lock();
        let appended = inner.memory.append(session_key, line, now_ms());
        if appended {
            inner.dirty = true;
        }
        appended
    }

    pub fn memory_lines(&self, session_key: &str) -> Vec<String> {
        self.lock().memory.lines(session_key).to_vec()
    }

    pub fn last_memory_of_kind(&self, session_key: &str, kind: LineKind) -> Option<String> {
        self.lock()
            .memory
            .last_of_kind(session_key, kind)
            .map(str::to_string)
    }

    pub fn memory_settings(&self) -> &MemorySection {
        &self.memory_settings
    }

    pub fn thread_count(&self) -> usize {
        self.lock().threads.len()
    }

    pub fn snapshot(&self) -> PlannerSnapshot {
        let inner = self.lock();
        let mut sessions: Vec<_> = inner.threads.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        PlannerSnapshot {
            version: PlannerSnapshot::VERSION,
            sessions,
            memories: inner.memory.entries(),
        }
    }

    /// 写入快照。非强制写入在节流窗口内只标记 dirty；返回是否真正写盘
    pub async fn persist(&self, force: bool) -> Result<bool, PlannerError> {
        let _serial = self.save_lock.lock().await;
        let snapshot = {
            let mut inner = self.lock();
            if !force {
                let throttled = inner
                    .last_saved
                    .map_or(false, |at| at.elapsed() < self.session.persist_debounce());
                if throttled || !inner.dirty {
                    return Ok(false);
                }
            }
            inner.dirty = false;
            inner.last_saved = Some(Instant::now());
            drop(inner);
            self.snapshot()
        };
        if let Err(e) = self.store.save_snapshot(&snapshot).await {
            self.lock().dirty = true;
            return Err(PlannerError::Store(format!("{:#}", e)));
        }
        tracing::debug!(
            threads = snapshot.sessions.len(),
            memories = snapshot.memories.len(),
            force,
            "persisted planner snapshot"
        );
        Ok(true)
    }

    /// 有未写入的变更时立即写盘
    pub async fn flush(&self) -> Result<bool, PlannerError> {
        if !self.lock().dirty {
            return Ok(false);
        }
        self.persist(true).await
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}
