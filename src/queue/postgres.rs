use super::{CheckQueue, QueueAttributes, ReceivedMessage};
use crate::{
    database::Database,
    error::{AppError, AppResult},
};
use sqlx::Row;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use uuid::Uuid;

/// 长轮询时两次查询之间的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 基于 PostgreSQL 的检查队列
///
/// 接收使用 `FOR UPDATE SKIP LOCKED`，多个 worker 并发接收时不会拿到同一条消息；
/// 接收后把 `visible_at` 推迟到可见性超时之后，worker 崩溃时消息会自动重新投递。
#[derive(Debug, Clone)]
pub struct PgQueue {
    db: Database,
    name: String,
}

impl PgQueue {
    pub fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    async fn try_receive(&self, visibility: Duration) -> AppResult<Option<ReceivedMessage>> {
        let receipt = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE check_queue_messages
            SET receipt = $2,
                receive_count = receive_count + 1,
                visible_at = NOW() + make_interval(secs => $3)
            WHERE id = (
                SELECT id FROM check_queue_messages
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY visible_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING message_id, body, receive_count
            "#,
        )
        .bind(&self.name)
        .bind(receipt)
        .bind(visibility.as_secs_f64())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(row.map(|r| {
            let message_id: Uuid = r.get("message_id");
            let receive_count: i32 = r.get("receive_count");
            ReceivedMessage {
                message_id: message_id.to_string(),
                receipt: receipt.to_string(),
                body: r.get("body"),
                receive_count: receive_count.max(0) as u32,
            }
        }))
    }
}

fn parse_receipt(receipt: &str) -> AppResult<Uuid> {
    Uuid::parse_str(receipt).map_err(|_| AppError::queue(format!("回执无效: {}", receipt)))
}

#[async_trait::async_trait]
impl CheckQueue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: String) -> AppResult<String> {
        let message_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO check_queue_messages (queue_name, message_id, body)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&self.name)
        .bind(message_id)
        .bind(&body)
        .execute(self.db.pool())
        .await?;

        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        visibility: Duration,
        wait: Duration,
    ) -> AppResult<Option<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(message) = self.try_receive(visibility).await? {
                return Ok(Some(message));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn delete(&self, receipt: &str) -> AppResult<()> {
        let receipt = parse_receipt(receipt)?;
        sqlx::query("DELETE FROM check_queue_messages WHERE queue_name = $1 AND receipt = $2")
            .bind(&self.name)
            .bind(receipt)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    async fn change_visibility(&self, receipt: &str, visibility: Duration) -> AppResult<()> {
        let receipt = parse_receipt(receipt)?;
        let result = sqlx::query(
            r#"
            UPDATE check_queue_messages
            SET visible_at = NOW() + make_interval(secs => $3)
            WHERE queue_name = $1 AND receipt = $2
            "#,
        )
        .bind(&self.name)
        .bind(receipt)
        .bind(visibility.as_secs_f64())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::queue(format!("回执无效: {}", receipt)));
        }
        Ok(())
    }

    async fn attributes(&self) -> AppResult<QueueAttributes> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE visible_at <= NOW()) AS visible,
                COUNT(*) FILTER (WHERE visible_at > NOW()) AS in_flight
            FROM check_queue_messages
            WHERE queue_name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_one(self.db.pool())
        .await?;

        let visible: i64 = row.get("visible");
        let in_flight: i64 = row.get("in_flight");
        Ok(QueueAttributes {
            visible: visible.max(0) as u64,
            in_flight: in_flight.max(0) as u64,
        })
    }

    async fn purge(&self) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM check_queue_messages WHERE queue_name = $1")
            .bind(&self.name)
            .execute(self.db.pool())
            .await?;
        tracing::info!("已清空队列 {}，删除 {} 条消息", self.name, result.rows_affected());
        Ok(())
    }
}
