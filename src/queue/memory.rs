use super::{CheckQueue, QueueAttributes, ReceivedMessage};
use crate::error::{AppError, AppResult};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    receipt: Option<String>,
    receive_count: u32,
    visible_at: Instant,
}

/// 进程内队列，语义与 PostgreSQL 队列一致
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    messages: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// 当前仍在队列中的消息体（含不可见消息），测试使用
    pub async fn bodies(&self) -> Vec<String> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    async fn try_receive(&self, visibility: Duration) -> Option<ReceivedMessage> {
        let now = Instant::now();
        let mut messages = self.messages.lock().await;
        // 最早可见的消息优先，重新可见的消息排在已等待的消息之后
        let message = messages
            .iter_mut()
            .filter(|m| m.visible_at <= now)
            .min_by_key(|m| m.visible_at)?;

        let receipt = Uuid::new_v4().to_string();
        message.receipt = Some(receipt.clone());
        message.receive_count += 1;
        message.visible_at = now + visibility;

        Some(ReceivedMessage {
            message_id: message.message_id.clone(),
            receipt,
            body: message.body.clone(),
            receive_count: message.receive_count,
        })
    }

    async fn next_visible_at(&self) -> Option<Instant> {
        self.messages
            .lock()
            .await
            .iter()
            .map(|m| m.visible_at)
            .min()
    }
}

#[async_trait::async_trait]
impl CheckQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String) -> AppResult<String> {
        let message_id = Uuid::new_v4().to_string();
        self.messages.lock().await.push_back(StoredMessage {
            message_id: message_id.clone(),
            body,
            receipt: None,
            receive_count: 0,
            visible_at: Instant::now(),
        });
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(
        &self,
        visibility: Duration,
        wait: Duration,
    ) -> AppResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            // 先注册通知再检查，避免错过两者之间到达的消息
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_receive(visibility).await {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            // 等待新消息或下一条消息重新可见
            let wake_at = match self.next_visible_at().await {
                Some(visible_at) if visible_at > now => visible_at.min(deadline),
                _ => deadline,
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> AppResult<()> {
        let mut messages = self.messages.lock().await;
        // 回执失效（消息已被重新领取）时与 SQS 一样静默忽略
        messages.retain(|m| m.receipt.as_deref() != Some(receipt));
        Ok(())
    }

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> AppResult<()> {
        let mut messages = self.messages.lock().await;
        let message = messages
            .iter_mut()
            .find(|m| m.receipt.as_deref() == Some(receipt))
            .ok_or_else(|| AppError::queue(format!("回执无效: {}", receipt)))?;
        message.visible_at = Instant::now() + visibility;
        drop(messages);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn attributes(&self) -> AppResult<QueueAttributes> {
        let now = Instant::now();
        let messages = self.messages.lock().await;
        let visible = messages.iter().filter(|m| m.visible_at <= now).count() as u64;
        Ok(QueueAttributes {
            visible,
            in_flight: messages.len() as u64 - visible,
        })
    }

    async fn purge(&self) -> AppResult<()> {
        self.messages.lock().await.clear();
        Ok(())
    }
}
