use crate::{
    error::{AppError, AppResult},
    models::{Kwargs, RunKind, RunRecord, new_uuid},
    repositories::{RunResult, get_action_record, put_action_record},
    services::{
        connection::Connection,
        registry::{CheckRegistry, Registration, ValidationError},
    },
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// 单次检查/动作调用的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// 已执行并存储（包括执行出错后存储的错误结果）
    Completed(RunRecord),
    /// 未执行，例如动作已经针对该检查结果执行过
    Skipped { reason: String },
    /// 检查字符串或参数不合法
    Invalid(ValidationError),
}

impl RunOutcome {
    pub fn record(&self) -> Option<&RunRecord> {
        match self {
            RunOutcome::Completed(record) => Some(record),
            _ => None,
        }
    }
}

/// 在超时限制下调用已注册的检查/动作并存储结果
#[derive(Debug, Clone)]
pub struct CheckExecutor {
    registry: Arc<CheckRegistry>,
    timeout: Duration,
}

impl CheckExecutor {
    pub fn new(registry: Arc<CheckRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<CheckRegistry> {
        &self.registry
    }

    /// 运行检查
    pub async fn run_check(
        &self,
        connection: &Connection,
        check_string: &str,
        kwargs: Value,
    ) -> AppResult<RunOutcome> {
        self.run_kind(connection, check_string, kwargs, RunKind::Check)
            .await
    }

    /// 运行动作
    pub async fn run_action(
        &self,
        connection: &Connection,
        action_string: &str,
        kwargs: Value,
    ) -> AppResult<RunOutcome> {
        self.run_kind(connection, action_string, kwargs, RunKind::Action)
            .await
    }

    /// 按注册类型运行检查或动作
    pub async fn run_check_or_action(
        &self,
        connection: &Connection,
        check_string: &str,
        kwargs: Value,
    ) -> AppResult<RunOutcome> {
        let kind = self
            .registry
            .kind_of(check_string)
            .unwrap_or(RunKind::Check);
        self.run_kind(connection, check_string, kwargs, kind).await
    }

    /// 运行检查组，未显式指定 uuid 的成员共享同一个 uuid
    pub async fn run_check_group(
        &self,
        connection: &Connection,
        name: &str,
    ) -> AppResult<Vec<RunOutcome>> {
        let Some(group) = self.registry.fetch_check_group(name) else {
            warn!("检查组不存在或为空: {}", name);
            return Ok(Vec::new());
        };

        let group_uuid = new_uuid();
        let mut outcomes = Vec::with_capacity(group.len());
        for mut entry in group {
            entry
                .kwargs
                .entry("uuid")
                .or_insert_with(|| Value::String(group_uuid.clone()));
            let outcome = self
                .run_check(connection, &entry.check_string, Value::Object(entry.kwargs))
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_kind(
        &self,
        connection: &Connection,
        check_string: &str,
        kwargs: Value,
        kind: RunKind,
    ) -> AppResult<RunOutcome> {
        let registration = match self.registry.resolve(check_string, &kwargs, kind) {
            Ok(registration) => registration.clone(),
            Err(e) => {
                warn!("{}", e);
                return Ok(RunOutcome::Invalid(e));
            }
        };
        match kwargs {
            Value::Object(kwargs) => self.execute(connection, &registration, kwargs).await,
            other => Ok(RunOutcome::Invalid(ValidationError::KwargsNotMapping {
                check_string: check_string.to_string(),
                kwargs: other.to_string(),
            })),
        }
    }

    async fn execute(
        &self,
        connection: &Connection,
        registration: &Registration,
        call_kwargs: Kwargs,
    ) -> AppResult<RunOutcome> {
        let kind = registration.kind;
        let kwargs = merge_kwargs(&registration.default_kwargs, call_kwargs, kind);

        let mut action_target = None;
        if kind == RunKind::Action {
            let check_name = kwargs
                .get("check_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            let called_by = kwargs
                .get("called_by")
                .and_then(Value::as_str)
                .map(str::to_string);
            let (Some(check_name), Some(called_by)) = (check_name, called_by) else {
                let mut action = connection.action_result(&registration.name);
                action.status = kind.error_status().to_string();
                action.description = kind.failed_to_run_description().to_string();
                action.output =
                    Value::String("Action requires check_name and called_by in its kwargs".into());
                action.kwargs = kwargs;
                return Ok(RunOutcome::Completed(action.store_result().await?));
            };

            if let Some(existing) =
                get_action_record(connection.results().as_ref(), &check_name, &called_by).await
            {
                info!(
                    "检查 {} ({}) 已由 {} 处理，跳过动作 {}",
                    check_name,
                    called_by,
                    existing,
                    registration.check_string()
                );
                return Ok(RunOutcome::Skipped {
                    reason: format!("already actioned: {}", existing),
                });
            }
            action_target = Some((check_name, called_by));
        }

        let started = Instant::now();
        let mut handle = tokio::spawn((registration.func)(connection.clone(), kwargs.clone()));
        let joined = match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(AppError::CheckTimeout {
                    name: registration.check_string(),
                    elapsed_secs: started.elapsed().as_secs(),
                    limit_secs: self.timeout.as_secs(),
                });
            }
        };
        let runtime = started.elapsed();

        let mut result = match joined {
            Ok(Ok(result)) if result.kind == kind => result,
            Ok(Ok(_)) => failed_result(
                connection,
                registration,
                vec![kind.wrong_result_kind_message().to_string()],
            ),
            Ok(Err(e)) => {
                debug!("{} 执行失败: {:#}", registration.check_string(), e);
                failed_result(connection, registration, error_lines(&e))
            }
            Err(join_err) => failed_result(connection, registration, panic_lines(join_err)),
        };

        result.kwargs = kwargs;
        result.kwargs.insert(
            "runtime_seconds".to_string(),
            Value::from((runtime.as_secs_f64() * 100.0).round() / 100.0),
        );

        let record = result.store_result().await?;

        if let Some((check_name, called_by)) = action_target {
            put_action_record(
                connection.results().as_ref(),
                &check_name,
                &called_by,
                &record.storage_key(),
            )
            .await;
        }

        Ok(RunOutcome::Completed(record))
    }
}

/// 注册默认参数在下，调用参数在上；补全 uuid、primary 和 queue_action
fn merge_kwargs(defaults: &Kwargs, call_kwargs: Kwargs, kind: RunKind) -> Kwargs {
    let mut kwargs = defaults.clone();
    kwargs.extend(call_kwargs);
    kwargs
        .entry("uuid")
        .or_insert_with(|| Value::String(new_uuid()));
    kwargs.entry("primary").or_insert(Value::Bool(false));
    if kind == RunKind::Check {
        kwargs.entry("queue_action").or_insert(Value::Bool(false));
    }
    kwargs
}

fn failed_result(
    connection: &Connection,
    registration: &Registration,
    lines: Vec<String>,
) -> RunResult {
    let kind = registration.kind;
    warn!(
        "{} 运行失败: {}",
        registration.check_string(),
        lines.join(" | ")
    );
    let mut result = RunResult::new(connection.results().clone(), &registration.name, kind);
    result.status = kind.error_status().to_string();
    result.description = kind.failed_to_run_description().to_string();
    let lines = Value::from(lines);
    match kind {
        RunKind::Check => result.full_output = lines,
        RunKind::Action => result.output = lines,
    }
    result
}

fn error_lines(e: &anyhow::Error) -> Vec<String> {
    let mut lines = vec![format!("Error: {}", e)];
    lines.extend(e.chain().skip(1).map(|cause| format!("Caused by: {}", cause)));
    lines
}

fn panic_lines(join_err: JoinError) -> Vec<String> {
    if !join_err.is_panic() {
        return vec![format!("Error: {}", join_err)];
    }
    let payload = join_err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    vec![format!("Panic: {}", message)]
}
