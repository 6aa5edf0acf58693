//! 测试用的注册表、连接和配置

use crate::{
    config::{Config, QueueBackend, RetryConfig, Stage, StorageBackend},
    error::AppResult,
    models::{CheckEntry, Kwargs},
    services::{
        api_client::ApiClient, connection::Connection, executor::CheckExecutor,
        invoker::{RunnerEvent, RunnerInvoker},
        registry::CheckRegistry,
    },
    storage::MemoryStorage,
};
use anyhow::anyhow;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.stage = Stage::Test;
    config.storage.backend = StorageBackend::Memory;
    config.queue.backend = QueueBackend::Memory;
    config.queue.wait_time_secs = 0;
    config.runner.dependency.min_delay_secs = 0;
    config.runner.dependency.max_delay_secs = 0;
    config.runner.dependency.max_attempts = 3;
    config.api_retry = RetryConfig::disabled();
    if let Some(dev) = config.environments.get_mut("dev") {
        dev.api_base_url = "http://127.0.0.1:1".to_string();
    }
    config
}

pub fn test_connection() -> Connection {
    let config = test_config();
    let api = ApiClient::new(&config.environments["dev"], RetryConfig::disabled())
        .expect("test api client");
    Connection::new(
        "dev",
        Stage::Test,
        Arc::new(MemoryStorage::new()),
        Arc::new(MemoryStorage::new()),
        api,
    )
}

fn kwargs(value: Value) -> Kwargs {
    match value {
        Value::Object(map) => map,
        _ => Kwargs::new(),
    }
}

pub fn test_registry() -> CheckRegistry {
    let mut registry = CheckRegistry::new();

    registry
        .register_check("test_checks", "random_nums", Kwargs::new(), |conn, _| async move {
            let mut check = conn.check_result("random_nums");
            let nums: Vec<u32> = (0..5).map(|_| rand::random_range(0..1000)).collect();
            check.status = "PASS".to_string();
            check.description = "A random list of numbers".to_string();
            check.full_output = json!(nums);
            check.action = Some("add_random_test_nums".to_string());
            check.allow_action = true;
            Ok(check)
        })
        .expect("register random_nums");

    registry
        .register_check("test_checks", "always_fails", Kwargs::new(), |_, _| async move {
            Err(anyhow!("division by zero"))
        })
        .expect("register always_fails");

    registry
        .register_check(
            "test_checks",
            "panics",
            kwargs(json!({"divisor": 1})),
            |conn, kwargs| async move {
                let divisor = kwargs.get("divisor").and_then(Value::as_i64).unwrap_or(1);
                let mut check = conn.check_result("panics");
                check.status = "PASS".to_string();
                check.brief_output = json!(10 / divisor);
                Ok(check)
            },
        )
        .expect("register panics");

    registry
        .register_check(
            "test_checks",
            "slow_check",
            kwargs(json!({"sleep_ms": 10})),
            |conn, kwargs| async move {
                let sleep_ms = kwargs.get("sleep_ms").and_then(Value::as_u64).unwrap_or(10);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                let mut check = conn.check_result("slow_check");
                check.status = "PASS".to_string();
                Ok(check)
            },
        )
        .expect("register slow_check");

    registry
        .register_check("test_checks", "returns_action", Kwargs::new(), |conn, _| async move {
            Ok(conn.action_result("returns_action"))
        })
        .expect("register returns_action");

    registry
        .register_check("test_checks", "dependent_check", Kwargs::new(), |conn, _| async move {
            let mut check = conn.check_result("dependent_check");
            check.status = "PASS".to_string();
            check.summary = "Ran after its dependency".to_string();
            Ok(check)
        })
        .expect("register dependent_check");

    registry
        .register_action(
            "test_checks",
            "add_random_test_nums",
            Kwargs::new(),
            |conn, kwargs| async move {
                let mut action = conn.action_result("add_random_test_nums");
                let check = action
                    .get_associated_check_result(&kwargs)
                    .await
                    .ok_or_else(|| anyhow!("associated check result not found"))?;
                let total: u64 = check
                    .full_output
                    .as_array()
                    .map(|nums| nums.iter().filter_map(Value::as_u64).sum())
                    .unwrap_or(0);
                action.status = "DONE".to_string();
                action.output = json!({"total": total});
                Ok(action)
            },
        )
        .expect("register add_random_test_nums");

    registry.register_group(
        "malformed_test_checks",
        vec![
            CheckEntry::new("test_checks/random_nums"),
            CheckEntry::new("not_a_real_check_string"),
            CheckEntry::new("test_checks/dependent_check"),
        ],
    );
    registry.register_group("empty_group", Vec::new());

    registry
}

pub fn test_executor() -> CheckExecutor {
    CheckExecutor::new(Arc::new(test_registry()), Duration::from_secs(5))
}

/// 只记录事件、不启动 worker 的调用器
#[derive(Debug, Default)]
pub struct RecordingInvoker {
    events: Mutex<Vec<RunnerEvent>>,
}

impl RecordingInvoker {
    pub fn events(&self) -> Vec<RunnerEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl RunnerInvoker for RecordingInvoker {
    fn invoke(&self, event: RunnerEvent) -> AppResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
