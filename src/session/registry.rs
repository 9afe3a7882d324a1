//! 会话注册表：每个会话 key 对应唯一一个 Runner + 远端线程
//!
//! - 获取：先做空闲 / 容量清理，不存在时创建（同一 key 并发创建时复用先创建者）
//! - 释放：引用计数减一、刷新线程映射（节流写盘），随后再做一次空闲清理
//! - 线程恢复：重新 `thread/start`，标记需要 bootstrap，并立即写盘
//! - 致命错误：会话标记为损坏，释放时无论引用计数都会被拆除
//!
//! 清理只在获取 / 释放时顺带进行，不依赖后台定时任务。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde_json::{json, Value};

use crate::config::SessionSection;
use crate::core::PlannerError;
use crate::protocol::{ProtocolRunner, RunnerFactory};
use crate::session::state::PersistedState;

/// 空 key 的替代值
pub const DEFAULT_SESSION_KEY: &str = "default";

pub fn normalize_key(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        DEFAULT_SESSION_KEY.to_string()
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug)]
struct SessionInner {
    thread_id: String,
    in_use: usize,
    last_used: Instant,
    needs_bootstrap: bool,
    broken: bool,
}

/// 池化的会话：一个 Runner + 一个远端线程
pub struct Session {
    key: String,
    runner: ProtocolRunner,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn runner(&self) -> &ProtocolRunner {
        &self.runner
    }

    pub fn thread_id(&self) -> String {
        self.lock().thread_id.clone()
    }

    pub fn needs_bootstrap(&self) -> bool {
        self.lock().needs_bootstrap
    }

    pub fn mark_bootstrapped(&self) {
        self.lock().needs_bootstrap = false;
    }

    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    fn is_usable(&self) -> bool {
        !self.lock().broken && self.runner.is_alive()
    }

    fn is_idle_expired(&self, settings: &SessionSection) -> bool {
        let inner = self.lock();
        inner.in_use == 0 && inner.last_used.elapsed() >= settings.idle_ttl()
    }
}

/// 一次获取的凭证；必须交还给 [`SessionRegistry::release`]
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub fn key(&self) -> &str {
        &self.session.key
    }
}

impl std::ops::Deref for SessionLease {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

pub struct SessionRegistry {
    factory: Arc<dyn RunnerFactory>,
    state: Arc<PersistedState>,
    settings: SessionSection,
    model: Option<String>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    creating: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn RunnerFactory>,
        state: Arc<PersistedState>,
        settings: SessionSection,
        model: Option<String>,
    ) -> Self {
        Self {
            factory,
            state,
            settings,
            model,
            sessions: Mutex::new(HashMap::new()),
            creating: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> &Arc<PersistedState> {
        &self.state
    }

    pub fn active_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.sessions().contains_key(&normalize_key(key))
    }

    fn creation_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut creating = match self.creating.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(creating.entry(key.to_string()).or_default())
    }

    /// 获取会话；不存在或已损坏时创建新的
    pub async fn acquire(&self, raw_key: &str) -> Result<SessionLease, PlannerError> {
        let key = normalize_key(raw_key);
        self.cleanup(Some(&key)).await;

        let creation = self.creation_lock(&key);
        let _creating = creation.lock().await;

        let existing = self.sessions().get(&key).cloned();
        let session = match existing {
            Some(session) if session.is_usable() => session,
            stale => {
                if let Some(stale) = stale {
                    tracing::info!(session = %key, "replacing unusable session");
                    self.teardown(&stale).await;
                }
                let session = Arc::new(self.create_session(&key).await?);
                self.sessions().insert(key.clone(), Arc::clone(&session));
                session
            }
        };

        {
            let mut inner = session.lock();
            inner.in_use += 1;
            inner.last_used = Instant::now();
        }
        Ok(SessionLease { session })
    }

    async fn create_session(&self, key: &str) -> Result<Session, PlannerError> {
        let runner = self.factory.create(key).await?;
        let result = async {
            handshake(&runner).await?;
            self.open_thread(&runner, key).await
        }
        .await;
        let (thread_id, resumed) = match result {
            Ok(opened) => opened,
            Err(e) => {
                runner.stop().await;
                return Err(e);
            }
        };

        if self.state.record_thread(key, &thread_id) {
            if let Err(e) = self.state.persist(true).await {
                tracing::warn!(session = %key, error = %e, "failed to persist new thread mapping");
            }
        }
        tracing::info!(session = %key, thread = %thread_id, resumed, "session ready");

        Ok(Session {
            key: key.to_string(),
            runner,
            inner: Mutex::new(SessionInner {
                thread_id,
                in_use: 0,
                last_used: Instant::now(),
                // 恢复的线程不保证看到过记忆胶囊
                needs_bootstrap: true,
                broken: false,
            }),
        })
    }

    /// 优先恢复持久化的线程，失败时开新线程；返回 (线程 id, 是否恢复)
    async fn open_thread(&self, runner: &ProtocolRunner, key: &str) -> Result<(String, bool), PlannerError> {
        if let Some(persisted) = self.state.thread_for(key) {
            match runner
                .request("thread/resume", json!({ "threadId": persisted }))
                .await
            {
                Ok(result) => {
                    let thread_id = thread_id_of(&result).unwrap_or(persisted);
                    return Ok((thread_id, true));
                }
                Err(e @ PlannerError::Rpc { .. }) => {
                    tracing::info!(session = %key, thread = %persisted, error = %e, "thread resume rejected, starting new thread");
                    self.state.forget_thread(key);
                }
                Err(e) => return Err(e),
            }
        }
        let thread_id = start_thread(runner, self.model.as_deref()).await?;
        Ok((thread_id, false))
    }

    /// 释放会话：损坏的会话立即拆除，否则刷新线程映射并顺带清理空闲会话
    pub async fn release(&self, lease: SessionLease) {
        let session = lease.session;
        let (broken, thread_id) = {
            let mut inner = session.lock();
            inner.in_use = inner.in_use.saturating_sub(1);
            inner.last_used = Instant::now();
            (inner.broken || !session.runner.is_alive(), inner.thread_id.clone())
        };

        if broken {
            self.teardown(&session).await;
        } else {
            let force = self.state.record_thread(&session.key, &thread_id);
            if let Err(e) = self.state.persist(force).await {
                tracing::warn!(session = %session.key, error = %e, "failed to persist thread mapping");
            }
        }
        self.cleanup(None).await;
    }

    /// 致命传输错误后调用：会话在释放时被拆除
    pub fn mark_broken(&self, lease: &SessionLease) {
        tracing::warn!(session = %lease.key(), "session marked broken");
        lease.session.lock().broken = true;
    }

    /// 远端线程丢失时在同一个 Runner 上开新线程，并立即写盘
    pub async fn recover_thread(&self, lease: &SessionLease) -> Result<String, PlannerError> {
        let session = &lease.session;
        let previous = session.thread_id();
        let thread_id = start_thread(&session.runner, self.model.as_deref()).await?;
        {
            let mut inner = session.lock();
            inner.thread_id = thread_id.clone();
            inner.needs_bootstrap = true;
        }
        self.state.record_thread(&session.key, &thread_id);
        if let Err(e) = self.state.persist(true).await {
            tracing::warn!(session = %session.key, error = %e, "failed to persist recovered thread");
        }
        tracing::info!(session = %session.key, previous = %previous, thread = %thread_id, "recreated remote thread");
        Ok(thread_id)
    }

    /// 空闲淘汰 + 容量淘汰；`incoming` 为即将创建的 key，需要为它预留一个名额
    async fn cleanup(&self, incoming: Option<&str>) {
        let victims: Vec<Arc<Session>> = {
            let mut sessions = self.sessions();
            let mut victims: Vec<Arc<Session>> = Vec::new();

            let expired: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_idle_expired(&self.settings))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(s) = sessions.remove(&key) {
                    tracing::info!(session = %key, "evicting idle session");
                    victims.push(s);
                }
            }

            let reserve = usize::from(incoming.map_or(false, |k| !sessions.contains_key(k)));
            let max = self.settings.max_sessions.max(1);
            if sessions.len() + reserve > max {
                let mut idle: Vec<(String, Instant)> = sessions
                    .iter()
                    .filter_map(|(k, s)| {
                        let inner = s.lock();
                        (inner.in_use == 0).then(|| (k.clone(), inner.last_used))
                    })
                    .collect();
                idle.sort_by_key(|(_, at)| *at);
                for (key, _) in idle {
                    if sessions.len() + reserve <= max {
                        break;
                    }
                    if let Some(s) = sessions.remove(&key) {
                        tracing::info!(session = %key, "evicting session over capacity");
                        victims.push(s);
                    }
                }
                if sessions.len() + reserve > max {
                    tracing::warn!(active = sessions.len(), max, "all sessions in use, exceeding capacity");
                }
            }
            victims
        };

        for session in victims {
            self.teardown(&session).await;
        }
    }

    fn remove_if_same(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions();
        if sessions
            .get(&session.key)
            .map_or(false, |current| Arc::ptr_eq(current, session))
        {
            sessions.remove(&session.key);
        }
    }

    async fn teardown(&self, session: &Arc<Session>) {
        self.remove_if_same(session);
        session.runner.stop().await;
        tracing::info!(session = %session.key, "session torn down");
    }

    /// 拆除全部会话并写入最终快照
    pub async fn close(&self) {
        let all: Vec<Arc<Session>> = self.sessions().drain().map(|(_, s)| s).collect();
        for session in &all {
            let thread_id = session.thread_id();
            if !thread_id.is_empty() && !session.lock().broken {
                self.state.record_thread(&session.key, &thread_id);
            }
            session.runner.stop().await;
        }
        if let Err(e) = self.state.persist(true).await {
            tracing::warn!(error = %e, "failed to persist final snapshot");
        }
        tracing::info!(closed = all.len(), "session registry closed");
    }
}

/// `initialize` 请求 + `initialized` 通知
async fn handshake(runner: &ProtocolRunner) -> Result<(), PlannerError> {
    runner
        .request(
            "initialize",
            json!({
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
        .await?;
    runner.notify("initialized", json!({})).await
}

async fn start_thread(runner: &ProtocolRunner, model: Option<&str>) -> Result<String, PlannerError> {
    let mut params = json!({});
    if let Some(model) = model {
        params["model"] = Value::String(model.to_string());
    }
    let result = runner.request("thread/start", params).await?;
    thread_id_of(&result)
        .ok_or_else(|| PlannerError::Protocol("thread/start returned no thread id".into()))
}

/// 从 `result.thread.id` / `threadId` / `thread_id` 取线程 id
pub(crate) fn thread_id_of(result: &Value) -> Option<String> {
    result
        .pointer("/thread/id")
        .or_else(|| result.get("threadId"))
        .or_else(|| result.get("thread_id"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
