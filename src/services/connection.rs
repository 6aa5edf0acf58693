use crate::{
    config::{Config, Stage, StorageBackend},
    error::{AppError, AppResult},
    repositories::{RunInfoRepository, RunResult},
    services::api_client::ApiClient,
    storage::{MemoryStorage, S3Storage, SharedStorage, s3},
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug)]
struct ConnectionInner {
    environment: String,
    stage: Stage,
    results: SharedStorage,
    runs: SharedStorage,
    api: ApiClient,
}

/// 单个环境的连接：结果存储、运行信息存储和远端API客户端
///
/// 每次检查/动作调用都会收到一份；克隆开销很小。
#[derive(Debug, Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(
        environment: impl Into<String>,
        stage: Stage,
        results: SharedStorage,
        runs: SharedStorage,
        api: ApiClient,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                environment: environment.into(),
                stage,
                results,
                runs,
                api,
            }),
        }
    }

    pub fn environment(&self) -> &str {
        &self.inner.environment
    }

    pub fn stage(&self) -> Stage {
        self.inner.stage
    }

    /// 本环境的结果存储
    pub fn results(&self) -> &SharedStorage {
        &self.inner.results
    }

    pub fn run_info(&self) -> RunInfoRepository {
        RunInfoRepository::new(self.inner.runs.clone())
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// 新建检查结果
    pub fn check_result(&self, name: &str) -> RunResult {
        RunResult::check(self.inner.results.clone(), name)
    }

    /// 新建动作结果
    pub fn action_result(&self, name: &str) -> RunResult {
        RunResult::action(self.inner.results.clone(), name)
    }
}

/// 按配置创建并缓存各环境的连接
#[derive(Debug)]
pub struct ConnectionFactory {
    config: Arc<Config>,
    s3_client: Option<Arc<aws_sdk_s3::Client>>,
    runs: SharedStorage,
    connections: RwLock<HashMap<String, Connection>>,
}

impl ConnectionFactory {
    pub fn new(config: Arc<Config>) -> Self {
        let s3_client = match config.storage.backend {
            StorageBackend::S3 => Some(s3::build_client(&config.storage)),
            StorageBackend::Memory => None,
        };
        let runs: SharedStorage = match &s3_client {
            Some(client) => Arc::new(S3Storage::new(
                client.clone(),
                config.runs_bucket(),
                config.storage.region.clone(),
            )),
            None => Arc::new(MemoryStorage::new()),
        };

        Self {
            config,
            s3_client,
            runs,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// 各环境共享的运行信息
    pub fn run_info(&self) -> RunInfoRepository {
        RunInfoRepository::new(self.runs.clone())
    }

    /// 已配置的环境名
    pub fn environments(&self) -> Vec<String> {
        self.config.environments.keys().cloned().collect()
    }

    /// 获取环境连接；环境不存在时返回 NotFound
    pub async fn connection(&self, environment: &str) -> AppResult<Connection> {
        if let Some(connection) = self.connections.read().await.get(environment) {
            return Ok(connection.clone());
        }

        let env_config = self
            .config
            .environments
            .get(environment)
            .ok_or_else(|| AppError::not_found(format!("环境 {}", environment)))?;

        let results: SharedStorage = match &self.s3_client {
            Some(client) => Arc::new(S3Storage::new(
                client.clone(),
                self.config.results_bucket(environment),
                self.config.storage.region.clone(),
            )),
            None => Arc::new(MemoryStorage::new()),
        };
        let api = ApiClient::new(env_config, self.config.api_retry.clone())?;
        let connection = Connection::new(
            environment,
            self.config.stage,
            results,
            self.runs.clone(),
            api,
        );

        let mut connections = self.connections.write().await;
        // 并发创建时以先写入的为准，保证同一环境只有一份内存存储
        let connection = connections
            .entry(environment.to_string())
            .or_insert(connection)
            .clone();
        tracing::debug!("已创建环境连接: {}", environment);
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> Arc<Config> {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_connections_are_cached_per_environment() {
        let factory = ConnectionFactory::new(memory_config());
        assert_eq!(factory.environments(), vec!["dev".to_string()]);

        let first = factory.connection("dev").await.unwrap();
        let mut result = first.check_result("item_counts");
        result.status = "PASS".to_string();
        result.store_result().await.unwrap();

        let second = factory.connection("dev").await.unwrap();
        assert_eq!(second.environment(), "dev");
        assert_eq!(second.stage(), Stage::Dev);
        assert!(
            second
                .check_result("item_counts")
                .get_latest_result()
                .await
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_unknown_environment() {
        let factory = ConnectionFactory::new(memory_config());
        let err = factory.connection("staging").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }
}
