//! Protocol Runner：单个 Agent 子进程上的请求/通知多路复用
//!
//! - 请求按自增 id 关联响应，超时或子进程退出时以错误结束（不会静默丢弃）
//! - 无 id 的信封分发给所有通知监听者；单个监听者 panic 不影响其它监听者
//! - `turn/completed` 按回合 id 唤醒等待者；等待者登记前到达的完成事件会被暂存
//! - stdin 归独立的写任务所有：调用方超时或取消不会留下半行，后续信封不会被粘连
//!
//! 输入输出流是泛型的：生产环境来自 `tokio::process::Child`，测试里用 `tokio::io::duplex`。

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::AgentSection;
use crate::core::PlannerError;
use crate::protocol::envelope::{
    encode_notification, encode_request, encode_response, parse_line, Envelope, Notification,
};

/// 通知监听者
pub type NotificationListener = Arc<dyn Fn(&Notification) + Send + Sync>;

type Reply = Result<Value, PlannerError>;

/// 交给写任务的一整行；`written` 在整行写完（或写失败）后回执
struct Outgoing {
    line: String,
    written: Option<oneshot::Sender<Result<(), PlannerError>>>,
}

/// 暂存的提前到达的 turn/completed 上限
const EARLY_COMPLETION_CAP: usize = 64;

/// Runner 的超时配置
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// 日志中标识该 Runner（通常是会话 key）
    pub label: String,
    pub request_timeout: Duration,
    pub turn_timeout: Duration,
}

impl RunnerOptions {
    pub fn from_agent(agent: &AgentSection, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            request_timeout: agent.request_timeout(),
            turn_timeout: agent.turn_timeout(),
        }
    }
}

#[derive(Default)]
struct TurnBook {
    waiters: HashMap<String, oneshot::Sender<Reply>>,
    early: VecDeque<(String, Value)>,
}

struct RunnerShared {
    label: String,
    outbox: mpsc::UnboundedSender<Outgoing>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, (String, oneshot::Sender<Reply>)>>,
    turns: Mutex<TurnBook>,
    listeners: Mutex<Vec<(u64, NotificationListener)>>,
    next_listener_id: AtomicU64,
    closed: Mutex<Option<String>>,
}

impl RunnerShared {
    fn closed_reason(&self) -> Option<String> {
        self.closed.lock().ok().and_then(|c| c.clone())
    }

    fn ensure_open(&self) -> Result<(), PlannerError> {
        match self.closed_reason() {
            Some(reason) => Err(PlannerError::TransportClosed(reason)),
            None => Ok(()),
        }
    }

    /// 把整行排进写队列；不等待写完
    fn enqueue(
        &self,
        line: String,
        written: Option<oneshot::Sender<Result<(), PlannerError>>>,
    ) -> Result<(), PlannerError> {
        self.ensure_open()?;
        self.outbox
            .send(Outgoing { line, written })
            .map_err(|_| PlannerError::TransportClosed("planner writer stopped".into()))
    }

    /// 排队一行并在 `limit` 内等待它被完整写出
    async fn write_line(&self, line: String, limit: Duration, what: &str) -> Result<(), PlannerError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(line, Some(tx))?;
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PlannerError::TransportClosed(
                self.closed_reason()
                    .unwrap_or_else(|| "planner writer stopped".to_string()),
            )),
            Err(_) => Err(PlannerError::timeout(what, limit)),
        }
    }

    /// 标记关闭并让所有在途请求与回合等待者以错误结束
    fn close(&self, reason: &str) {
        if let Ok(mut closed) = self.closed.lock() {
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.to_string());
        }
        let pending: Vec<_> = self
            .pending
            .lock()
            .map(|mut p| p.drain().collect())
            .unwrap_or_default();
        for (_, (_, tx)) in pending {
            let _ = tx.send(Err(PlannerError::TransportClosed(reason.to_string())));
        }
        let waiters: Vec<_> = self
            .turns
            .lock()
            .map(|mut t| t.waiters.drain().collect())
            .unwrap_or_default();
        for (_, tx) in waiters {
            let _ = tx.send(Err(PlannerError::TransportClosed(reason.to_string())));
        }
        tracing::info!(runner = %self.label, reason, "protocol runner closed");
    }

    fn dispatch(&self, line: &str) {
        match parse_line(line) {
            None => {
                tracing::debug!(runner = %self.label, line = %truncate_for_log(line), "discarded non-envelope output");
            }
            Some(Envelope::Response { id, result }) => {
                let entry = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
                match entry {
                    Some((method, tx)) => {
                        let reply = result.map_err(|e| PlannerError::Rpc {
                            method,
                            message: e.message,
                            code: e.code,
                        });
                        let _ = tx.send(reply);
                    }
                    None => tracing::debug!(runner = %self.label, id, "response for unknown request id"),
                }
            }
            Some(Envelope::Notification(notification)) => {
                self.fan_out(&notification);
                if notification.method == "turn/completed" {
                    if let Some(turn_id) = notification.turn_id() {
                        self.complete_turn(turn_id.to_string(), notification.params.clone());
                    }
                }
            }
        }
    }

    fn fan_out(&self, notification: &Notification) {
        let listeners: Vec<NotificationListener> = self
            .listeners
            .lock()
            .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
            .unwrap_or_default();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(notification))).is_err() {
                tracing::warn!(runner = %self.label, method = %notification.method, "notification listener panicked");
            }
        }
    }

    fn complete_turn(&self, turn_id: String, params: Value) {
        let Ok(mut turns) = self.turns.lock() else {
            return;
        };
        if let Some(tx) = turns.waiters.remove(&turn_id) {
            let _ = tx.send(Ok(params));
            return;
        }
        turns.early.push_back((turn_id, params));
        while turns.early.len() > EARLY_COMPLETION_CAP {
            turns.early.pop_front();
        }
    }
}

/// 在途请求的登记；Future 被丢弃（超时、取消）时自动移除
struct PendingGuard<'a> {
    shared: &'a RunnerShared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

struct TurnWaiterGuard<'a> {
    shared: &'a RunnerShared,
    turn_id: String,
}

impl Drop for TurnWaiterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut turns) = self.shared.turns.lock() {
            turns.waiters.remove(&self.turn_id);
        }
    }
}

/// 通知订阅句柄：`unsubscribe` 或 Drop 时移除监听者
pub struct Subscription {
    shared: Weak<RunnerShared>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            if let Ok(mut listeners) = shared.listeners.lock() {
                listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// 单个子进程的协议客户端
pub struct ProtocolRunner {
    shared: Arc<RunnerShared>,
    options: RunnerOptions,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolRunner {
    /// 启动 Agent 子进程并在其 stdout 上挂行读取器
    pub fn spawn(agent: &AgentSection, options: RunnerOptions) -> Result<Self, PlannerError> {
        let mut cmd = Command::new(&agent.command);
        cmd.args(&agent.args)
            .envs(&agent.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &agent.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| PlannerError::Spawn(format!("{}: {}", agent.command, e)))?;
        tracing::info!(runner = %options.label, pid = ?child.id(), command = %agent.command, "spawned planner process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PlannerError::Spawn("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlannerError::Spawn("stdout not captured".into()))?;
        let stderr = child.stderr.take();

        let runner = Self::from_streams(stdout, stdin, options);
        if let Some(stderr) = stderr {
            let label = runner.options.label.clone();
            let drain = tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(runner = %label, stderr = %truncate_for_log(&line));
                }
            });
            if let Ok(mut tasks) = runner.tasks.lock() {
                tasks.push(drain);
            }
        }
        if let Ok(mut slot) = runner.child.try_lock() {
            *slot = Some(child);
        }
        Ok(runner)
    }

    /// 基于任意读写流构建 Runner（读端为子进程 stdout，写端为子进程 stdin）
    pub fn from_streams<R, W>(reader: R, writer: W, options: RunnerOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RunnerShared {
            label: options.label.clone(),
            outbox,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            turns: Mutex::new(TurnBook::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
            closed: Mutex::new(None),
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => reader_shared.dispatch(&String::from_utf8_lossy(&buf)),
                    Err(e) => {
                        tracing::warn!(runner = %reader_shared.label, error = %e, "planner stdout read failed");
                        break;
                    }
                }
            }
            reader_shared.close("planner process exited");
        });
        let writer_task = tokio::spawn(write_loop(Arc::downgrade(&shared), writer, outbox_rx));

        Self {
            shared,
            options,
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(vec![reader_task, writer_task]),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.shared.closed_reason().is_none()
    }

    /// 发送请求并等待匹配 id 的响应；排队、写出与等待响应共用同一个超时
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, PlannerError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, (method.to_string(), tx));
        }
        let _guard = PendingGuard {
            shared: self.shared.as_ref(),
            id,
        };

        tracing::debug!(runner = %self.options.label, id, method, "-> request");
        self.shared.enqueue(encode_request(id, method, &params), None)?;

        match tokio::time::timeout(self.options.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PlannerError::TransportClosed(
                self.shared
                    .closed_reason()
                    .unwrap_or_else(|| "runner dropped request".to_string()),
            )),
            Err(_) => Err(PlannerError::timeout(method, self.options.request_timeout)),
        }
    }

    /// 发送客户端通知（无 id，不等待响应）
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), PlannerError> {
        self.shared
            .write_line(
                encode_notification(method, &params),
                self.options.request_timeout,
                method,
            )
            .await
    }

    /// 应答子进程发来的请求（id 原样回传）
    pub async fn respond(&self, request_id: &Value, result: Value) -> Result<(), PlannerError> {
        tracing::debug!(runner = %self.options.label, id = %request_id, "-> response");
        self.shared
            .write_line(
                encode_response(request_id, &result),
                self.options.request_timeout,
                "response",
            )
            .await
    }

    /// 注册通知监听者；返回的句柄被丢弃时自动退订
    pub fn on_notification<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut listeners) = self.shared.listeners.lock() {
            listeners.push((id, Arc::new(listener)));
        }
        Subscription {
            shared: Arc::downgrade(&self.shared),
            id,
        }
    }

    /// 等待指定回合的 `turn/completed`，返回其 params
    pub async fn wait_for_turn_completed(&self, turn_id: &str) -> Result<Value, PlannerError> {
        let rx = {
            let mut turns = self
                .shared
                .turns
                .lock()
                .map_err(|_| PlannerError::TransportClosed("turn book poisoned".into()))?;
            if let Some(pos) = turns.early.iter().position(|(id, _)| id == turn_id) {
                if let Some((_, params)) = turns.early.remove(pos) {
                    return Ok(params);
                }
            }
            self.shared.ensure_open()?;
            let (tx, rx) = oneshot::channel();
            turns.waiters.insert(turn_id.to_string(), tx);
            rx
        };
        let _guard = TurnWaiterGuard {
            shared: self.shared.as_ref(),
            turn_id: turn_id.to_string(),
        };

        match tokio::time::timeout(self.options.turn_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(PlannerError::TransportClosed(
                self.shared
                    .closed_reason()
                    .unwrap_or_else(|| "runner dropped turn waiter".to_string()),
            )),
            Err(_) => Err(PlannerError::timeout(
                format!("turn {}", turn_id),
                self.options.turn_timeout,
            )),
        }
    }

    /// 终止子进程；在途请求与回合等待者以错误结束
    pub async fn stop(&self) {
        self.shared.close("runner stopped");
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.start_kill();
            if tokio::time::timeout(Duration::from_secs(2), child.wait())
                .await
                .is_err()
            {
                tracing::warn!(runner = %self.options.label, "planner process did not exit after kill");
            }
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for ProtocolRunner {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

/// 写任务：逐条把整行写进 stdin，写失败即关闭 Runner
async fn write_loop<W>(shared: Weak<RunnerShared>, writer: W, mut outbox: mpsc::UnboundedReceiver<Outgoing>)
where
    W: AsyncWrite + Send + 'static,
{
    let mut writer = Box::pin(writer);
    while let Some(out) = outbox.recv().await {
        let result = async {
            writer.write_all(out.line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                if let Some(ack) = out.written {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(e) => {
                let reason = format!("write to planner process failed: {}", e);
                if let Some(shared) = shared.upgrade() {
                    shared.close(&reason);
                }
                if let Some(ack) = out.written {
                    let _ = ack.send(Err(PlannerError::TransportClosed(reason)));
                }
                break;
            }
        }
    }
}

fn truncate_for_log(line: &str) -> String {
    let trimmed = line.trim_end();
    if trimmed.chars().count() <= 200 {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(200).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf};

    struct Peer {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl Peer {
        async fn next_request(&mut self) -> Value {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send(&mut self, value: Value) {
            let mut line = value.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn runner_pair(request_ms: u64) -> (ProtocolRunner, Peer) {
        runner_pair_sized(request_ms, 64 * 1024)
    }

    /// `buffer` 是管道容量；调小后对端不读时写端会阻塞
    fn runner_pair_sized(request_ms: u64, buffer: usize) -> (ProtocolRunner, Peer) {
        let (client, server) = tokio::io::duplex(buffer);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        let runner = ProtocolRunner::from_streams(
            client_read,
            client_write,
            RunnerOptions {
                label: "test".into(),
                request_timeout: Duration::from_millis(request_ms),
                turn_timeout: Duration::from_millis(request_ms),
            },
        );
        let peer = Peer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        };
        (runner, peer)
    }

    #[tokio::test]
    async fn test_out_of_order_responses_are_correlated() {
        let (runner, mut peer) = runner_pair(2_000);
        let runner = Arc::new(runner);

        let r1 = Arc::clone(&runner);
        let first = tokio::spawn(async move { r1.request("a", json!({})).await });
        let req_a = peer.next_request().await;
        let r2 = Arc::clone(&runner);
        let second = tokio::spawn(async move { r2.request("b", json!({})).await });
        let req_b = peer.next_request().await;

        peer.send(json!({"id": req_b["id"], "result": {"who": "b"}})).await;
        peer.send(json!({"id": req_a["id"], "result": {"who": "a"}})).await;

        assert_eq!(first.await.unwrap().unwrap()["who"], "a");
        assert_eq!(second.await.unwrap().unwrap()["who"], "b");
    }

    #[tokio::test]
    async fn test_rpc_error_carries_method() {
        let (runner, mut peer) = runner_pair(2_000);
        let fut = runner.request("turn/start", json!({}));
        let responder = async {
            let req = peer.next_request().await;
            peer.send(json!({"id": req["id"], "error": {"message": "thread not found"}}))
                .await;
        };
        let (result, _) = tokio::join!(fut, responder);
        match result {
            Err(PlannerError::Rpc { method, message, .. }) => {
                assert_eq!(method, "turn/start");
                assert_eq!(message, "thread not found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_times_out_and_clears_pending() {
        let (runner, mut peer) = runner_pair(50);
        let result = runner.request("initialize", json!({})).await;
        assert!(matches!(result, Err(PlannerError::Timeout { .. })));
        assert!(result.unwrap_err().to_string().contains("timed out"));
        let _ = peer.next_request().await;
        assert!(runner.shared.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_block_others() {
        let (runner, mut peer) = runner_pair(2_000);
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = runner.on_notification(|_| panic!("listener bug"));
        let counter = Arc::clone(&hits);
        let _good = runner.on_notification(move |n| {
            if n.method == "item/agentMessage/delta" {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        peer.send_raw("not json at all\n").await;
        peer.send(json!({"method": "item/agentMessage/delta", "params": {"delta": "hi"}}))
            .await;
        peer.send(json!({"method": "turn/completed", "params": {"turn": {"id": "t1", "status": "completed"}}}))
            .await;

        let params = runner.wait_for_turn_completed("t1").await.unwrap();
        assert_eq!(params["turn"]["status"], "completed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (runner, mut peer) = runner_pair(2_000);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let sub = runner.on_notification(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        peer.send(json!({"method": "turn/completed", "params": {"turnId": "t9"}}))
            .await;
        runner.wait_for_turn_completed("t9").await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exit_rejects_in_flight_work() {
        let (runner, peer) = runner_pair(5_000);
        let runner = Arc::new(runner);
        let r = Arc::clone(&runner);
        let waiting = tokio::spawn(async move { r.wait_for_turn_completed("t1").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(peer);

        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(PlannerError::TransportClosed(_))));
        assert!(!runner.is_alive());
        assert!(matches!(
            runner.request("initialize", json!({})).await,
            Err(PlannerError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_rejects_pending_request() {
        let (runner, mut peer) = runner_pair(5_000);
        let runner = Arc::new(runner);
        let r = Arc::clone(&runner);
        let pending = tokio::spawn(async move { r.request("thread/start", json!({})).await });
        let _ = peer.next_request().await;
        runner.stop().await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(PlannerError::TransportClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_request_times_out_when_peer_stops_reading() {
        let (runner, _peer) = runner_pair_sized(100, 16);
        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            runner.request("initialize", json!({"pad": "x".repeat(512)})),
        )
        .await
        .expect("request must honor its own timeout");
        assert!(matches!(result, Err(PlannerError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_cancelled_request_still_writes_whole_line() {
        let (runner, mut peer) = runner_pair_sized(2_000, 64);
        let runner = Arc::new(runner);

        let big = json!({"blob": "x".repeat(2048)});
        let cut = tokio::time::timeout(Duration::from_millis(30), runner.request("big", big)).await;
        assert!(cut.is_err());

        let r = Arc::clone(&runner);
        let init = tokio::spawn(async move { r.request("initialize", json!({})).await });

        let first = peer.next_request().await;
        assert_eq!(first["method"], "big");
        assert_eq!(first["params"]["blob"].as_str().unwrap().len(), 2048);
        let second = peer.next_request().await;
        assert_eq!(second["method"], "initialize");
        peer.send(json!({"id": second["id"], "result": {"ok": true}})).await;

        assert_eq!(init.await.unwrap().unwrap()["ok"], true);
        assert!(runner.is_alive());
    }

    #[tokio::test]
    async fn test_respond_echoes_server_request_id() {
        let (runner, mut peer) = runner_pair(2_000);
        runner
            .respond(&json!("srv-1"), json!({"components": []}))
            .await
            .unwrap();
        let line = peer.next_request().await;
        assert_eq!(line["id"], "srv-1");
        assert!(line.get("method").is_none());
        assert_eq!(line["result"]["components"], json!([]));
    }
}
