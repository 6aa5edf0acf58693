pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use crate::error::AppResult;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// 从队列接收到的一条消息
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// 本次接收的回执，删除和修改可见性时使用
    pub receipt: String,
    pub body: String,
    /// 包含本次在内的累计接收次数
    pub receive_count: u32,
}

/// 队列近似计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueAttributes {
    /// 当前可见的消息数
    pub visible: u64,
    /// 已被接收、尚未删除的消息数
    pub in_flight: u64,
}

impl QueueAttributes {
    pub fn outstanding(&self) -> u64 {
        self.visible + self.in_flight
    }
}

/// 带可见性超时语义的检查队列（至少一次投递）
#[async_trait::async_trait]
pub trait CheckQueue: Send + Sync + std::fmt::Debug {
    /// 队列名称
    fn name(&self) -> &str;

    /// 发送消息，返回消息ID
    async fn send(&self, body: String) -> AppResult<String>;

    /// 长轮询接收一条消息，接收后消息在 `visibility` 内对其他消费者不可见
    async fn receive(&self, visibility: Duration, wait: Duration)
    -> AppResult<Option<ReceivedMessage>>;

    /// 删除已处理的消息
    async fn delete(&self, receipt: &str) -> AppResult<()>;

    /// 修改消息的剩余不可见时间，0 表示立即可见
    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> AppResult<()>;

    async fn attributes(&self) -> AppResult<QueueAttributes>;

    /// 清空队列
    async fn purge(&self) -> AppResult<()>;
}

pub type SharedQueue = Arc<dyn CheckQueue>;
