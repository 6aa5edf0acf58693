use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 检查执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// 单次检查/动作的执行上限（秒），超时即终止当前 worker
    pub check_timeout_secs: u64,
    /// 一条传播链的总运行时间预算（秒）
    pub max_chain_runtime_secs: u64,
    /// serve 模式下同时运行的 worker 上限
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default)]
    pub dependency: DependencyRetryConfig,
}

fn default_max_workers() -> usize {
    4
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 280,
            max_chain_runtime_secs: 3600,
            max_workers: default_max_workers(),
            dependency: DependencyRetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.check_timeout_secs == 0 {
            return Err("check_timeout_secs 必须大于0".to_string());
        }
        if self.max_chain_runtime_secs < self.check_timeout_secs {
            return Err("max_chain_runtime_secs 不能小于 check_timeout_secs".to_string());
        }
        if self.max_workers == 0 {
            return Err("max_workers 必须大于0".to_string());
        }
        self.dependency.validate()
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn max_chain_runtime(&self) -> Duration {
        Duration::from_secs(self.max_chain_runtime_secs)
    }
}

/// 依赖未满足时的重新入队策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyRetryConfig {
    /// 最多接收次数，超过后放弃并记录错误结果
    pub max_attempts: u32,
    /// 重新可见的最小延迟（秒）
    pub min_delay_secs: u64,
    /// 重新可见的最大延迟（秒）
    pub max_delay_secs: u64,
}

impl Default for DependencyRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            min_delay_secs: 1,
            max_delay_secs: 10,
        }
    }
}

impl DependencyRetryConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("dependency.max_attempts 必须大于0".to_string());
        }
        if self.min_delay_secs > self.max_delay_secs {
            return Err("dependency.min_delay_secs 不能大于 max_delay_secs".to_string());
        }
        Ok(())
    }

    /// 随机选择一个重新可见延迟
    pub fn next_delay_secs(&self) -> u64 {
        rand::random_range(self.min_delay_secs..=self.max_delay_secs)
    }
}
