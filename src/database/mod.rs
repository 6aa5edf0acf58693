use crate::{config::DatabaseConfig, error::AppResult};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

/// 检查队列使用的表结构
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS check_queue_messages (
    id BIGSERIAL PRIMARY KEY,
    queue_name TEXT NOT NULL,
    message_id UUID NOT NULL UNIQUE,
    body TEXT NOT NULL,
    receipt UUID,
    receive_count INTEGER NOT NULL DEFAULT 0,
    visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const QUEUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_check_queue_messages_visible
    ON check_queue_messages (queue_name, visible_at, id)
"#;

/// 数据库连接池
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

impl Database {
    /// 创建数据库连接池
    pub async fn new(config: &DatabaseConfig) -> AppResult<Self> {
        tracing::info!("正在连接数据库: {}", mask_database_url(&config.url));

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.url)
            .await?;

        // 测试连接
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        tracing::info!("数据库连接成功，最大连接数: {}", config.max_connections);

        Ok(Self { pool })
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 创建队列表（幂等）
    pub async fn migrate(&self) -> AppResult<()> {
        sqlx::query(QUEUE_SCHEMA).execute(&self.pool).await?;
        sqlx::query(QUEUE_INDEX).execute(&self.pool).await?;
        tracing::info!("检查队列表已就绪");
        Ok(())
    }

    /// 检查数据库健康状态
    pub async fn health_check(&self) -> AppResult<bool> {
        let result = sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;

        Ok(result == 1)
    }
}

/// 隐藏数据库URL中的密码
fn mask_database_url(url: &str) -> String {
    let (Some(protocol_end), Some(at_pos)) = (url.find("://"), url.rfind('@')) else {
        return url.to_string();
    };
    let auth_start = protocol_end + 3;
    if at_pos < auth_start {
        return url.to_string();
    }
    match url[auth_start..at_pos].find(':') {
        Some(colon_pos) => {
            let mut masked = url.to_string();
            masked.replace_range(auth_start + colon_pos + 1..at_pos, "***");
            masked
        }
        None => url.to_string(),
    }
}
