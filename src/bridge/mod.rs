//! 子进程桥接
//!
//! 持有一个长期运行的辅助进程，通过 stdin/stdout 交换按行分隔的 JSON。
//! 每个请求分配新的 UUID 关联 ID，挂在待决表里直到 complete / error。
//! 进程退出时所有在途请求以 "process exited" 失败，并在固定延迟后重启
//! （`stop()` 之后不再重启）。启动失败通过错误上报回调进入健康监控。

use crate::config::BridgeConfig;
use crate::error::RelayError;
use crate::logger::sanitize_log_message;
use crate::models::{parse_bridge_line, BridgeEvent, BridgeRequest, GenerationRequest};
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::RwLock;
use serde::Serialize;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// 进程退出时在途请求收到的错误消息
pub const PROCESS_EXITED: &str = "process exited";

/// 退出后等待 stdout 读尽的上限
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// 桥接错误上报回调
pub type BridgeErrorReporter = Arc<dyn Fn(&RelayError) + Send + Sync>;

struct RunningProcess {
    stdin: ChildStdin,
    pid: Option<u32>,
    generation: u64,
    /// 发送或丢弃都会让守护任务杀掉进程
    _kill_tx: oneshot::Sender<()>,
}

struct PendingRequest {
    completion: oneshot::Sender<Result<String, RelayError>>,
    chunks: String,
    sink: Option<mpsc::UnboundedSender<String>>,
    generation: u64,
    started_at: Instant,
}

/// 请求 future 被丢弃时移除待决项
struct PendingGuard<'a> {
    pending: &'a DashMap<String, PendingRequest>,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// 桥接状态快照
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub enabled: bool,
    pub running: bool,
    pub ready: bool,
    pub pid: Option<u32>,
    pub pending_requests: usize,
    pub restarts: u64,
}

/// 子进程桥接
pub struct LiveBridge {
    config: BridgeConfig,
    enabled: AtomicBool,
    running: AtomicBool,
    ready_tx: watch::Sender<bool>,
    process: Mutex<Option<RunningProcess>>,
    pending: DashMap<String, PendingRequest>,
    generation: AtomicU64,
    restarts: AtomicU64,
    restart_pending: AtomicBool,
    reporter: RwLock<Option<BridgeErrorReporter>>,
}

impl LiveBridge {
    pub fn new(config: BridgeConfig) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            running: AtomicBool::new(false),
            ready_tx,
            process: Mutex::new(None),
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            restart_pending: AtomicBool::new(false),
            reporter: RwLock::new(None),
        }
    }

    /// 设置错误上报回调
    pub fn set_error_reporter(&self, reporter: BridgeErrorReporter) {
        *self.reporter.write() = Some(reporter);
    }

    fn report(&self, error: &RelayError) {
        let reporter = self.reporter.read().clone();
        if let Some(reporter) = reporter {
            reporter(error);
        }
    }

    pub fn restart_delay(&self) -> Duration {
        self.config.restart_delay()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.is_running() && *self.ready_tx.borrow()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub async fn status(&self) -> BridgeStatus {
        let pid = self.process.lock().await.as_ref().and_then(|p| p.pid);
        BridgeStatus {
            enabled: self.is_enabled(),
            running: self.is_running(),
            ready: self.is_ready(),
            pid,
            pending_requests: self.pending.len(),
            restarts: self.restarts.load(Ordering::SeqCst),
        }
    }

    /// 启动辅助进程；已在运行时直接返回
    pub async fn start(self: &Arc<Self>) -> Result<(), RelayError> {
        self.ensure_started().await.map(|_| ())
    }

    /// 进程不存在时拉起新进程，返回是否真的启动了
    async fn ensure_started(self: &Arc<Self>) -> Result<bool, RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Config("bridge disabled".to_string()));
        }
        let mut guard = self.process.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        match self.spawn_process() {
            Ok(process) => {
                *guard = Some(process);
                Ok(true)
            }
            Err(e) => {
                self.report(&e);
                Err(e)
            }
        }
    }

    /// 在 `restart_delay` 之后重新拉起进程
    ///
    /// 已有排队的重启或桥接已停止时返回 false
    pub fn schedule_restart(self: &Arc<Self>) -> bool {
        if !self.is_enabled() || self.restart_pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let bridge = Arc::clone(self);
        let delay = self.config.restart_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bridge.restart_pending.store(false, Ordering::SeqCst);
            if !bridge.is_enabled() {
                return;
            }
            match bridge.ensure_started().await {
                Ok(true) => {
                    let restarts = bridge.restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::info!("[BRIDGE] 辅助进程已重启，累计 {} 次", restarts);
                }
                Ok(false) => tracing::debug!("[BRIDGE] 辅助进程已在运行，跳过重启"),
                Err(e) => tracing::error!("[BRIDGE] 自动重启失败: {}", e),
            }
        });
        true
    }

    /// 停止辅助进程并禁止自动重启
    pub async fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            tracing::info!(
                "[BRIDGE] 停止辅助进程 pid={:?} generation={}",
                process.pid,
                process.generation
            );
        }
        self.running.store(false, Ordering::SeqCst);
        self.ready_tx.send_replace(false);
    }

    fn spawn_process(self: &Arc<Self>) -> Result<RunningProcess, RelayError> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RelayError::SubprocessCrashed(format!(
                    "failed to spawn {}: {}",
                    self.config.program, e
                ))
            })?;

        let missing = |stream: &str| {
            RelayError::SubprocessCrashed(format!("helper {} unavailable", stream))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();
        let pid = child.id();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let max_line = self.config.max_line_bytes;

        self.ready_tx.send_replace(false);
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(
            "[BRIDGE] 已启动辅助进程 {} pid={:?} generation={}",
            self.config.program,
            pid,
            generation
        );

        let reader = {
            let bridge = Arc::clone(self);
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_line));
                while let Some(line) = lines.next().await {
                    match line {
                        Ok(line) => bridge.handle_line(&line),
                        Err(LinesCodecError::MaxLineLengthExceeded) => {
                            tracing::warn!("[BRIDGE] 丢弃超过 {} 字节的输出行", max_line);
                        }
                        Err(LinesCodecError::Io(e)) => {
                            tracing::warn!("[BRIDGE] 读取 stdout 失败: {}", e);
                            break;
                        }
                    }
                }
            })
        };

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(max_line));
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!("[BRIDGE] stderr: {}", sanitize_log_message(&line));
                }
            });
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // 先读完退出前的输出，再让在途请求失败
            let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await;
            bridge.on_exit(generation, status).await;
        });

        Ok(RunningProcess {
            stdin,
            pid,
            generation,
            _kill_tx: kill_tx,
        })
    }

    async fn on_exit(self: &Arc<Self>, generation: u64, status: io::Result<ExitStatus>) {
        let is_current = {
            let mut guard = self.process.lock().await;
            let is_current = guard
                .as_ref()
                .map(|p| p.generation == generation)
                .unwrap_or(false);
            if is_current {
                *guard = None;
                self.running.store(false, Ordering::SeqCst);
                self.ready_tx.send_replace(false);
            }
            is_current
        };

        match &status {
            Ok(status) => tracing::warn!(
                "[BRIDGE] 辅助进程退出 generation={} status={}",
                generation,
                status
            ),
            Err(e) => tracing::error!(
                "[BRIDGE] 等待辅助进程退出失败 generation={}: {}",
                generation,
                e
            ),
        }

        let in_flight: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.key().clone())
            .collect();
        if !in_flight.is_empty() {
            tracing::warn!("[BRIDGE] {} 个在途请求随进程退出而失败", in_flight.len());
        }
        for id in in_flight {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request
                    .completion
                    .send(Err(RelayError::SubprocessCrashed(PROCESS_EXITED.to_string())));
            }
        }

        if is_current && self.is_enabled() {
            self.schedule_restart();
        }
    }

    fn handle_line(&self, line: &str) {
        let Some(event) = parse_bridge_line(line) else {
            if !line.trim().is_empty() {
                tracing::debug!("[BRIDGE] 非 JSON 输出: {}", sanitize_log_message(line));
            }
            return;
        };

        match event {
            BridgeEvent::Ready => {
                tracing::info!("[BRIDGE] 辅助进程已就绪");
                self.ready_tx.send_replace(true);
            }
            BridgeEvent::Status(status) => {
                tracing::info!("[BRIDGE] 状态: {}", status);
                if status == "shutdown" {
                    self.ready_tx.send_replace(false);
                }
            }
            BridgeEvent::Connecting { request_id, model } => {
                tracing::info!("[BRIDGE] {} 正在连接 {:?}", request_id, model);
            }
            BridgeEvent::Connected { request_id, model } => {
                tracing::info!("[BRIDGE] {} 已连接 {:?}", request_id, model);
            }
            BridgeEvent::Processing { request_id } => {
                tracing::debug!("[BRIDGE] {} 处理中", request_id);
            }
            BridgeEvent::TextChunk { request_id, text } => {
                if let Some(mut request) = self.pending.get_mut(&request_id) {
                    request.chunks.push_str(&text);
                    if let Some(sink) = &request.sink {
                        let _ = sink.send(text);
                    }
                }
            }
            BridgeEvent::AudioChunk { request_id, bytes } => {
                tracing::debug!("[BRIDGE] {} 忽略音频块 {} 字节", request_id, bytes);
            }
            BridgeEvent::Complete { request_id, text } => {
                if let Some((_, request)) = self.pending.remove(&request_id) {
                    let text = text.filter(|t| !t.is_empty()).unwrap_or(request.chunks);
                    tracing::info!(
                        "[BRIDGE] {} 完成，用时 {}ms",
                        request_id,
                        request.started_at.elapsed().as_millis()
                    );
                    let _ = request.completion.send(Ok(text));
                }
            }
            BridgeEvent::Error {
                request_id,
                message,
                trying_next,
            } => {
                if trying_next {
                    tracing::warn!("[BRIDGE] {:?} 辅助进程尝试下一个模型: {}", request_id, message);
                    return;
                }
                match request_id.and_then(|id| self.pending.remove(&id)) {
                    Some((id, request)) => {
                        tracing::warn!("[BRIDGE] {} 失败: {}", id, message);
                        let _ = request.completion.send(Err(RelayError::protocol(message)));
                    }
                    None => tracing::warn!("[BRIDGE] 未关联请求的错误: {}", message),
                }
            }
            BridgeEvent::TestResponse => tracing::debug!("[BRIDGE] 收到 test_response"),
            BridgeEvent::Unknown(kind) => tracing::debug!("[BRIDGE] 未知记录类型 {:?}", kind),
        }
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), RelayError> {
        let mut ready_rx = self.ready_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            ready_rx.wait_for(|ready| *ready).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(RelayError::SubprocessCrashed("bridge shut down".to_string())),
            Err(_) => Err(RelayError::Timeout(format!(
                "bridge not ready within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    /// 发送一次生成请求
    ///
    /// `sink` 提供时每个文本块会实时转发；返回最终文本
    pub async fn send_request(
        &self,
        request: &GenerationRequest,
        sink: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<String, RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Config("bridge disabled".to_string()));
        }
        self.wait_ready(self.config.ready_timeout()).await?;

        let id = uuid::Uuid::new_v4().to_string();
        let line = BridgeRequest::process(
            id.clone(),
            request.model.clone(),
            request.prompt_text(),
            request.response_modalities.clone(),
        )
        .to_line()
        .map_err(|e| RelayError::protocol(format!("failed to encode bridge request: {}", e)))?;

        let (completion_tx, completion_rx) = oneshot::channel();
        let _guard = {
            let mut process = self.process.lock().await;
            let process = process.as_mut().ok_or_else(|| {
                RelayError::SubprocessCrashed("process not running".to_string())
            })?;

            self.pending.insert(
                id.clone(),
                PendingRequest {
                    completion: completion_tx,
                    chunks: String::new(),
                    sink,
                    generation: process.generation,
                    started_at: Instant::now(),
                },
            );
            let guard = PendingGuard {
                pending: &self.pending,
                id: id.clone(),
            };

            process
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| RelayError::SubprocessCrashed(format!("write to helper failed: {}", e)))?;
            process
                .stdin
                .flush()
                .await
                .map_err(|e| RelayError::SubprocessCrashed(format!("write to helper failed: {}", e)))?;
            guard
        };

        tracing::debug!("[BRIDGE] {} 已发送 (model={})", id, request.model);

        match tokio::time::timeout(self.config.request_timeout(), completion_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::SubprocessCrashed(PROCESS_EXITED.to_string())),
            Err(_) => Err(RelayError::Timeout(format!(
                "bridge request {} exceeded {}ms",
                id,
                self.config.request_timeout().as_millis()
            ))),
        }
    }
}
