use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// 远端元数据API的重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 是否启用重试
    pub enabled: bool,
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 初始退避时间（毫秒）
    pub initial_backoff_ms: u64,
    /// 最大退避时间（毫秒）
    pub max_backoff_ms: u64,
    /// 退避倍率
    pub backoff_multiplier: f64,
    /// 添加随机抖动
    pub jitter: bool,
    /// 可重试的错误信息片段
    pub retryable_error_patterns: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            initial_backoff_ms: 500,
            // 单次检查的执行时间有上限，退避不宜过长
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_error_patterns: vec![
                "connection".to_string(),
                "timeout".to_string(),
                "timed out".to_string(),
                "error sending request".to_string(),
                "502".to_string(),
                "503".to_string(),
                "504".to_string(),
            ],
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts 必须大于0".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier 不能小于1.0".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms 不能大于 max_backoff_ms".to_string());
        }
        Ok(())
    }

    /// 不重试的配置，测试和一次性命令使用
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// 通用的重试执行器
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 执行带重试的异步操作
    pub async fn execute_with_retry<F, Fut, T, E>(&self, operation: F, label: &str) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.config.enabled {
            return operation().await;
        }

        let mut attempt = 1;
        let mut backoff_ms = self.config.initial_backoff_ms;

        loop {
            debug!(
                "请求 {} 第 {}/{} 次尝试",
                label, attempt, self.config.max_attempts
            );

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("请求 {} 在第 {} 次尝试后成功", label, attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if attempt >= self.config.max_attempts {
                        error!(
                            "请求 {} 达到最大重试次数 {}，最终失败: {}",
                            label, self.config.max_attempts, error
                        );
                        return Err(error);
                    }

                    if !self.is_retryable_error(&error.to_string()) {
                        return Err(error);
                    }

                    let delay_ms = if self.config.jitter {
                        add_jitter(backoff_ms)
                    } else {
                        backoff_ms
                    };

                    warn!(
                        "请求 {} 第 {} 次尝试失败: {}，{}毫秒后重试",
                        label, attempt, error, delay_ms
                    );

                    sleep(Duration::from_millis(delay_ms)).await;

                    // 指数退避
                    backoff_ms = (backoff_ms as f64 * self.config.backoff_multiplier) as u64;
                    backoff_ms = backoff_ms.min(self.config.max_backoff_ms);

                    attempt += 1;
                }
            }
        }
    }

    fn is_retryable_error(&self, error_msg: &str) -> bool {
        let lowered = error_msg.to_lowercase();
        self.config
            .retryable_error_patterns
            .iter()
            .any(|pattern| lowered.contains(&pattern.to_lowercase()))
    }
}

fn add_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 10).max(1); // 10% 抖动
    base_ms + rand::random_range(0..=jitter_range)
}
