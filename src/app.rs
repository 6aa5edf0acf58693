use crate::{
    checks,
    config::{Config, QueueBackend},
    database::Database,
    error::{AppError, AppResult},
    handlers::AppState,
    queue::{MemoryQueue, PgQueue, SharedQueue},
    services::{CheckExecutor, CheckRegistry, CheckRunner, ConnectionFactory, RunnerInvoker},
};
use std::sync::Arc;

/// 进程内共享的组件
#[derive(Debug, Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub database: Option<Database>,
    pub connections: Arc<ConnectionFactory>,
    pub queue: SharedQueue,
    pub runner: CheckRunner,
}

impl App {
    pub async fn build(config: Config, invoker: Arc<dyn RunnerInvoker>) -> AppResult<Self> {
        let registry = load_registry(&config)?;
        Self::with_registry(config, registry, invoker).await
    }

    pub async fn with_registry(
        config: Config,
        registry: CheckRegistry,
        invoker: Arc<dyn RunnerInvoker>,
    ) -> AppResult<Self> {
        let config = Arc::new(config);

        let database = match config.queue.backend {
            QueueBackend::Postgres => {
                let db = Database::new(&config.database).await?;
                db.migrate().await?;
                Some(db)
            }
            QueueBackend::Memory => None,
        };
        let queue = build_queue(&config, database.as_ref())?;

        let connections = Arc::new(ConnectionFactory::new(config.clone()));
        let executor = CheckExecutor::new(Arc::new(registry), config.runner.check_timeout());
        let runner = CheckRunner::new(
            config.clone(),
            connections.clone(),
            queue.clone(),
            executor,
            invoker,
        );

        Ok(Self {
            config,
            database,
            connections,
            queue,
            runner,
        })
    }

    /// HTTP 处理器状态
    pub fn state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            connections: self.connections.clone(),
            queue: self.queue.clone(),
            database: self.database.clone(),
        }
    }
}

/// 按配置创建检查队列
pub fn build_queue(config: &Config, database: Option<&Database>) -> AppResult<SharedQueue> {
    let name = config.queue_name();
    match (config.queue.backend, database) {
        (QueueBackend::Postgres, Some(db)) => Ok(Arc::new(PgQueue::new(db.clone(), name))),
        (QueueBackend::Postgres, None) => Err(AppError::config("PostgreSQL 队列需要数据库连接")),
        (QueueBackend::Memory, _) => {
            tracing::warn!("使用内存队列 {}，消息不会跨进程共享", name);
            Ok(Arc::new(MemoryQueue::new(name)))
        }
    }
}

/// 注册内置检查并加载检查配置文件（如已配置）
pub fn load_registry(config: &Config) -> AppResult<CheckRegistry> {
    let mut registry = checks::build_registry()?;
    if let Some(path) = &config.check_setup_path {
        let content = std::fs::read_to_string(path)?;
        let raw: serde_json::Value = serde_json::from_str(&content)?;
        let environments: Vec<String> = config.environments.keys().cloned().collect();
        registry.load_check_setup(raw, &environments)?;
        tracing::info!("已加载检查配置: {}", path);
    }
    Ok(registry)
}
