use crate::{
    config::{EnvironmentConfig, RetryConfig, RetryExecutor},
    error::{AppError, AppResult},
};
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// 单次请求超时，必须明显小于检查的执行上限
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 远端元数据API客户端
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    key: String,
    secret: String,
    retry: RetryExecutor,
}

impl ApiClient {
    pub fn new(env: &EnvironmentConfig, retry: RetryConfig) -> AppResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Self {
            client,
            base_url: env.api_base_url.trim_end_matches('/').to_string(),
            key: env.api_key.clone(),
            secret: env.api_secret.clone(),
            retry: RetryExecutor::new(retry),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 拼接完整URL
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// GET 并解析 JSON，瞬时错误按重试配置重试
    pub async fn get_json(&self, path: &str) -> AppResult<JsonValue> {
        let url = self.url(path);
        self.retry
            .execute_with_retry(|| self.get_json_once(&url), &format!("GET {}", path))
            .await
    }

    async fn get_json_once(&self, url: &str) -> AppResult<JsonValue> {
        debug!("请求远端API: {}", url);

        let response = self
            .client
            .get(url)
            .basic_auth(&self.key, Some(&self.secret))
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;

        if !status.is_success() {
            return Err(AppError::service_unavailable(format!(
                "远端API返回错误状态 {}: {}",
                status.as_u16(),
                response_text
            )));
        }

        serde_json::from_str(&response_text)
            .map_err(|e| AppError::service_unavailable(format!("解析远端API响应失败: {}", e)))
    }

    /// 请求健康检查端点，返回 HTTP 状态码
    pub async fn health(&self) -> AppResult<u16> {
        let url = self.url("/health");
        let response = self
            .retry
            .execute_with_retry(
                || async {
                    self.client
                        .get(&url)
                        .basic_auth(&self.key, Some(&self.secret))
                        .send()
                        .await
                },
                "GET /health",
            )
            .await?;
        Ok(response.status().as_u16())
    }
}
