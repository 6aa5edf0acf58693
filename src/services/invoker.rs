use crate::error::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tokio::sync::mpsc;

/// 触发一次 worker 运行的事件
///
/// 同一条传播链上的事件共享 `chain_started_at`，用于限制整条链的运行时间。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerEvent {
    pub queue: String,
    /// 在传播链中的代数，从 0 开始
    pub generation: u64,
    pub chain_started_at: DateTime<Utc>,
}

impl RunnerEvent {
    /// 新传播链的第一个事件
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            generation: 0,
            chain_started_at: Utc::now(),
        }
    }

    /// 继任 worker 的事件
    pub fn next(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            generation: self.generation + 1,
            chain_started_at: self.chain_started_at,
        }
    }

    /// 传播链已运行的时间
    pub fn chain_elapsed(&self) -> Duration {
        (Utc::now() - self.chain_started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// 启动新 worker 的方式；调用后立即返回，不等待 worker 结束
pub trait RunnerInvoker: Send + Sync + std::fmt::Debug {
    fn invoke(&self, event: RunnerEvent) -> AppResult<()>;
}

/// 进程内 worker 池：事件经通道交给 serve 模式的调度循环
#[derive(Debug, Clone)]
pub struct ChannelInvoker {
    tx: mpsc::UnboundedSender<RunnerEvent>,
}

impl ChannelInvoker {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunnerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RunnerInvoker for ChannelInvoker {
    fn invoke(&self, event: RunnerEvent) -> AppResult<()> {
        self.tx
            .send(event)
            .map_err(|e| AppError::queue(format!("worker 调度通道已关闭: {}", e)))
    }
}

/// 每个 worker 一个进程：以 `worker` 子命令重新启动当前可执行文件
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    exe: PathBuf,
    config_path: PathBuf,
}

impl ProcessInvoker {
    pub fn new(exe: PathBuf, config_path: PathBuf) -> Self {
        Self { exe, config_path }
    }

    pub fn current(config_path: PathBuf) -> AppResult<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }

    fn args(&self, event: &RunnerEvent) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_path.display().to_string(),
            "worker".to_string(),
            "--generation".to_string(),
            event.generation.to_string(),
            "--chain-started-at".to_string(),
            event.chain_started_at.to_rfc3339(),
        ]
    }
}

impl RunnerInvoker for ProcessInvoker {
    fn invoke(&self, event: RunnerEvent) -> AppResult<()> {
        let child = Command::new(&self.exe)
            .args(self.args(&event))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        tracing::info!(
            pid = child.id(),
            generation = event.generation,
            "已启动 worker 进程"
        );
        Ok(())
    }
}
