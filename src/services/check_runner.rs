use crate::{
    config::Config,
    error::{AppError, AppResult},
    models::{CheckEntry, Kwargs, QueueMessage, RunInfo, RunKind, RunRecord, new_uuid, short_name},
    queue::{ReceivedMessage, SharedQueue},
    repositories::{RunResult, get_action_record},
    services::{
        connection::{Connection, ConnectionFactory},
        executor::{CheckExecutor, RunOutcome},
        invoker::{RunnerEvent, RunnerInvoker},
        registry::ValidationError,
    },
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error, info, warn};

/// 一次 worker 运行对所处理消息的处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerOutcome {
    /// 队列为空，没有处理任何消息
    QueueEmpty,
    /// 消息无法解析或环境不存在，已删除
    Malformed,
    /// 依赖尚未完成，消息稍后重新可见
    DependencyPending { unmet: Vec<String> },
    /// 依赖在最大尝试次数内一直未完成，消息已删除并记录错误结果
    DependencyExpired { unmet: Vec<String> },
    Executed(RunRecord),
    Skipped { reason: String },
    Invalid(ValidationError),
    /// 传播链运行时间已用完，未接收消息
    BudgetExhausted,
}

/// 一次 worker 运行的报告
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerReport {
    pub outcome: RunnerOutcome,
    /// 是否已启动继任 worker
    pub propagated: bool,
}

/// 队列驱动的检查调度器
///
/// 每次运行只处理一条消息；队列中仍有消息时通过 [`RunnerInvoker`] 启动继任 worker，
/// 不需要外部轮询。
#[derive(Debug, Clone)]
pub struct CheckRunner {
    config: Arc<Config>,
    connections: Arc<ConnectionFactory>,
    queue: SharedQueue,
    executor: CheckExecutor,
    invoker: Arc<dyn RunnerInvoker>,
}

impl CheckRunner {
    pub fn new(
        config: Arc<Config>,
        connections: Arc<ConnectionFactory>,
        queue: SharedQueue,
        executor: CheckExecutor,
        invoker: Arc<dyn RunnerInvoker>,
    ) -> Self {
        Self {
            config,
            connections,
            queue,
            executor,
            invoker,
        }
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.queue
    }

    pub fn executor(&self) -> &CheckExecutor {
        &self.executor
    }

    pub fn connections(&self) -> &Arc<ConnectionFactory> {
        &self.connections
    }

    /// 新传播链的第一个事件
    pub fn first_event(&self) -> RunnerEvent {
        RunnerEvent::new(self.queue.name())
    }

    /// 处理一条队列消息，必要时启动继任 worker
    ///
    /// 检查执行超时会以 [`AppError::CheckTimeout`] 返回：消息不会被删除，也不会启动继任者，
    /// 由调用方终止当前 worker。
    pub async fn run_check_runner(
        &self,
        event: RunnerEvent,
        propagate: bool,
    ) -> AppResult<RunnerReport> {
        let budget = self.config.runner.max_chain_runtime();
        if event.chain_elapsed() >= budget {
            info!(
                generation = event.generation,
                "传播链已运行 {:?}，超过预算 {:?}，worker 结束",
                event.chain_elapsed(),
                budget
            );
            return Ok(RunnerReport {
                outcome: RunnerOutcome::BudgetExhausted,
                propagated: false,
            });
        }

        let visibility = Duration::from_secs(self.config.queue.visibility_timeout_secs);
        let wait = Duration::from_secs(self.config.queue.wait_time_secs);
        let Some(message) = self.queue.receive(visibility, wait).await? else {
            info!(generation = event.generation, "队列为空，worker 结束");
            return Ok(RunnerReport {
                outcome: RunnerOutcome::QueueEmpty,
                propagated: false,
            });
        };

        let outcome = self.process_message(&message).await?;
        let propagated = propagate && self.propagate(&event).await?;

        Ok(RunnerReport {
            outcome,
            propagated,
        })
    }

    async fn process_message(&self, received: &ReceivedMessage) -> AppResult<RunnerOutcome> {
        let message: QueueMessage = match serde_json::from_str(&received.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(message_id = %received.message_id, error = %e, "队列消息格式错误，已删除");
                self.queue.delete(&received.receipt).await?;
                return Ok(RunnerOutcome::Malformed);
            }
        };

        let connection = match self.connections.connection(&message.environment).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(
                    message_id = %received.message_id,
                    environment = %message.environment,
                    error = %e,
                    "无法获取环境连接，消息已删除"
                );
                self.queue.delete(&received.receipt).await?;
                return Ok(RunnerOutcome::Malformed);
            }
        };

        let run_info = connection.run_info();
        let unmet = run_info
            .unmet_dependencies(&message.run_id, &message.dependency_ids)
            .await;
        if !unmet.is_empty() {
            return self
                .handle_unmet_dependencies(&connection, received, &message, unmet)
                .await;
        }

        let mut kwargs = message.kwargs.clone();
        kwargs
            .entry("uuid")
            .or_insert_with(|| Value::String(message.run_id.clone()));
        let run_info_value = serde_json::to_value(RunInfo {
            run_id: message.run_id.clone(),
            receipt: received.receipt.clone(),
            queue: self.queue.name().to_string(),
        })?;
        kwargs.insert("_run_info".to_string(), run_info_value);

        info!(
            run_id = %message.run_id,
            uuid = %kwargs.get("uuid").and_then(serde_json::Value::as_str).unwrap_or_default(),
            "开始运行 {}",
            message.check_or_action
        );

        let outcome = self
            .executor
            .run_check_or_action(&connection, &message.check_or_action, Value::Object(kwargs))
            .await?;

        let outcome = match outcome {
            RunOutcome::Completed(record) => {
                run_info
                    .record_completion(&message.run_id, message.entry_id(), &record.storage_key())
                    .await;
                self.chain_action(&connection, &message, &record).await?;
                RunnerOutcome::Executed(record)
            }
            RunOutcome::Skipped { reason } => {
                run_info
                    .record_completion(&message.run_id, message.entry_id(), &reason)
                    .await;
                RunnerOutcome::Skipped { reason }
            }
            RunOutcome::Invalid(e) => RunnerOutcome::Invalid(e),
        };

        self.queue.delete(&received.receipt).await?;
        info!(run_id = %message.run_id, "Finished: {}", message.check_or_action);
        Ok(outcome)
    }

    async fn handle_unmet_dependencies(
        &self,
        connection: &Connection,
        received: &ReceivedMessage,
        message: &QueueMessage,
        unmet: Vec<String>,
    ) -> AppResult<RunnerOutcome> {
        let policy = &self.config.runner.dependency;
        if received.receive_count < policy.max_attempts {
            let delay = policy.next_delay_secs();
            info!(
                run_id = %message.run_id,
                attempt = received.receive_count,
                "{} 的依赖尚未完成: {}，{}秒后重试",
                message.check_or_action,
                unmet.join(", "),
                delay
            );
            self.queue
                .change_visibility(&received.receipt, Duration::from_secs(delay))
                .await?;
            return Ok(RunnerOutcome::DependencyPending { unmet });
        }

        warn!(
            run_id = %message.run_id,
            attempts = received.receive_count,
            "{} 的依赖一直未完成: {}，放弃运行",
            message.check_or_action,
            unmet.join(", ")
        );

        let kind = self
            .executor
            .registry()
            .kind_of(&message.check_or_action)
            .unwrap_or(RunKind::Check);
        let mut result = RunResult::new(
            connection.results().clone(),
            short_name(&message.check_or_action),
            kind,
        );
        result.status = kind.error_status().to_string();
        result.description = format!(
            "Dependencies never completed after {} attempts: {}",
            received.receive_count,
            unmet.join(", ")
        );
        let mut kwargs = message.kwargs.clone();
        kwargs
            .entry("uuid")
            .or_insert_with(|| Value::String(message.run_id.clone()));
        result.kwargs = kwargs;
        result.store_result().await?;

        self.queue.delete(&received.receipt).await?;
        Ok(RunnerOutcome::DependencyExpired { unmet })
    }

    /// 检查以 queue_action 运行且允许动作时，把关联动作放入队列
    async fn chain_action(
        &self,
        connection: &Connection,
        message: &QueueMessage,
        record: &RunRecord,
    ) -> AppResult<()> {
        let queue_action = record
            .kwargs
            .get("queue_action")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if record.kind != RunKind::Check || !queue_action || !record.allow_action {
            return Ok(());
        }
        let Some(action) = record.action.as_deref() else {
            return Ok(());
        };
        let Some(action_string) = self.executor.registry().get_action_string(action) else {
            warn!("{} 关联的动作 {} 未注册", record.name, action);
            return Ok(());
        };

        if let Some(existing) =
            get_action_record(connection.results().as_ref(), &record.name, &record.uuid).await
        {
            info!(
                "{} ({}) 已有动作记录 {}，不再排队 {}",
                record.name, record.uuid, existing, action_string
            );
            return Ok(());
        }

        let mut kwargs = Kwargs::new();
        kwargs.insert("check_name".to_string(), Value::String(record.name.clone()));
        kwargs.insert("called_by".to_string(), Value::String(record.uuid.clone()));
        self.send_single_to_queue(
            &message.environment,
            &action_string,
            kwargs,
            Some(message.run_id.as_str()),
        )
        .await?;
        info!(run_id = %message.run_id, "已排队动作 {}，由 {} 触发", action_string, record.name);
        Ok(())
    }

    async fn propagate(&self, event: &RunnerEvent) -> AppResult<bool> {
        let attributes = self.queue.attributes().await?;
        if attributes.outstanding() == 0 {
            info!(generation = event.generation, "队列已清空，不再启动继任 worker");
            return Ok(false);
        }
        if event.chain_elapsed() >= self.config.runner.max_chain_runtime() {
            info!(generation = event.generation, "传播链运行时间已用完，不再启动继任 worker");
            return Ok(false);
        }

        let next = event.next();
        debug!(
            visible = attributes.visible,
            in_flight = attributes.in_flight,
            generation = next.generation,
            "启动继任 worker"
        );
        self.invoker.invoke(next)?;
        Ok(true)
    }

    /// 把条目放入队列，共享同一个运行ID（未提供时使用当前时间）
    pub async fn send_to_queue(
        &self,
        environment: &str,
        entries: Vec<CheckEntry>,
        run_id: Option<&str>,
    ) -> AppResult<String> {
        let run_id = run_id.map(str::to_string).unwrap_or_else(new_uuid);
        let count = entries.len();
        for entry in entries {
            let message = QueueMessage::from_entry(environment, &run_id, entry);
            self.queue.send(serde_json::to_string(&message)?).await?;
        }
        info!(run_id = %run_id, environment, "已排队 {} 个条目", count);
        Ok(run_id)
    }

    pub async fn send_single_to_queue(
        &self,
        environment: &str,
        check_or_action: &str,
        kwargs: Kwargs,
        run_id: Option<&str>,
    ) -> AppResult<String> {
        self.send_to_queue(
            environment,
            vec![CheckEntry::new(check_or_action).with_kwargs(kwargs)],
            run_id,
        )
        .await
    }

    /// 为一个或全部（"all"）环境排队调度中的检查，并启动第一个 worker
    pub async fn queue_scheduled_checks(
        &self,
        environment: &str,
        schedule: &str,
    ) -> AppResult<Vec<(String, String)>> {
        let environments = if environment == "all" {
            self.connections.environments()
        } else if self.config.environments.contains_key(environment) {
            vec![environment.to_string()]
        } else {
            return Err(AppError::not_found(format!("环境 {}", environment)));
        };

        let by_env = self.executor.registry().get_check_schedule(schedule);
        let mut queued = Vec::new();
        for env in environments {
            let entries: Vec<CheckEntry> = by_env
                .get("all")
                .into_iter()
                .chain(by_env.get(&env))
                .flatten()
                .cloned()
                .collect();
            if entries.is_empty() {
                debug!("调度 {} 在环境 {} 下没有检查", schedule, env);
                continue;
            }
            let run_id = self.send_to_queue(&env, entries, None).await?;
            queued.push((env, run_id));
        }

        if !queued.is_empty() {
            self.invoker.invoke(self.first_event())?;
        }
        Ok(queued)
    }

    /// 排队单个检查并启动 worker，返回运行ID
    pub async fn queue_check(&self, environment: &str, check_name: &str) -> AppResult<String> {
        let check_string = self
            .executor
            .registry()
            .get_check_string(check_name)
            .ok_or_else(|| AppError::not_found(format!("检查 {}", check_name)))?;
        let run_id = self
            .send_single_to_queue(environment, &check_string, Kwargs::new(), None)
            .await?;
        self.invoker.invoke(self.first_event())?;
        Ok(run_id)
    }

    /// 排队单个动作并启动 worker，返回运行ID
    pub async fn queue_action(
        &self,
        environment: &str,
        action_name: &str,
        kwargs: Kwargs,
    ) -> AppResult<String> {
        let action_string = self
            .executor
            .registry()
            .get_action_string(action_name)
            .ok_or_else(|| AppError::not_found(format!("动作 {}", action_name)))?;
        let run_id = self
            .send_single_to_queue(environment, &action_string, kwargs, None)
            .await?;
        self.invoker.invoke(self.first_event())?;
        Ok(run_id)
    }

    /// 某次运行中已完成的条目
    pub async fn collect_run_info(&self, run_id: &str) -> Vec<String> {
        self.connections.run_info().collect_run_info(run_id).await
    }
}

/// serve 模式的 worker 池：每个事件对应一次 worker 运行，最多 `max_workers` 个并发
pub async fn run_worker_pool(
    runner: CheckRunner,
    mut events: mpsc::UnboundedReceiver<RunnerEvent>,
    max_workers: usize,
) {
    let permits = Arc::new(Semaphore::new(max_workers.max(1)));
    info!("worker 池已启动，最大并发 {}", max_workers.max(1));

    while let Some(event) = events.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let runner = runner.clone();
        tokio::spawn(async move {
            let generation = event.generation;
            match runner.run_check_runner(event, true).await {
                Ok(report) => debug!(generation, propagated = report.propagated, "worker 结束"),
                Err(e) if e.is_fatal() => {
                    error!(generation, error = %e, "worker 因检查超时终止，消息将在可见性超时后重新投递")
                }
                Err(e) => error!(generation, error = %e, "worker 运行失败"),
            }
            drop(permit);
        });
    }
    info!("worker 调度通道已关闭，worker 池退出");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{CheckQueue, MemoryQueue};
    use crate::test_support::{RecordingInvoker, test_config, test_registry};
    use serde_json::json;

    struct Harness {
        runner: CheckRunner,
        queue: Arc<MemoryQueue>,
        invoker: Arc<RecordingInvoker>,
    }

    fn harness_with(config: Config) -> Harness {
        let config = Arc::new(config);
        let queue = Arc::new(MemoryQueue::new(config.queue_name()));
        let invoker = Arc::new(RecordingInvoker::default());
        let executor = CheckExecutor::new(
            Arc::new(test_registry()),
            config.runner.check_timeout(),
        );
        let runner = CheckRunner::new(
            config.clone(),
            Arc::new(ConnectionFactory::new(config)),
            queue.clone(),
            executor,
            invoker.clone(),
        );
        Harness {
            runner,
            queue,
            invoker,
        }
    }

    fn harness() -> Harness {
        harness_with(test_config())
    }

    async fn results_for(runner: &CheckRunner, name: &str) -> Vec<RunRecord> {
        let connection = runner.connections().connection("dev").await.unwrap();
        connection.check_result(name).get_all_results().await
    }

    #[tokio::test]
    async fn test_single_message_drains_queue_without_successor() {
        let h = harness();
        h.runner
            .send_to_queue("dev", vec![CheckEntry::new("test_checks/random_nums")], None)
            .await
            .unwrap();

        let report = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();

        assert!(matches!(report.outcome, RunnerOutcome::Executed(_)));
        assert!(!report.propagated);
        assert!(h.invoker.events().is_empty());
        assert_eq!(h.queue.attributes().await.unwrap().outstanding(), 0);

        let results = results_for(&h.runner, "random_nums").await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_run_id_is_shared_uuid_and_marker_is_written() {
        let h = harness();
        let run_id = h
            .runner
            .send_to_queue(
                "dev",
                vec![
                    CheckEntry::new("test_checks/random_nums"),
                    CheckEntry::new("test_checks/dependent_check").with_id("second"),
                ],
                None,
            )
            .await
            .unwrap();

        let first = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert!(first.propagated);
        assert_eq!(h.invoker.events().len(), 1);
        assert_eq!(h.invoker.events()[0].generation, 1);

        let second = h
            .runner
            .run_check_runner(h.invoker.events()[0].clone(), true)
            .await
            .unwrap();
        assert!(!second.propagated);

        let RunnerOutcome::Executed(record) = first.outcome else {
            panic!("expected executed outcome");
        };
        assert_eq!(record.uuid, run_id);
        assert_eq!(record.kwargs["_run_info"]["run_id"], json!(run_id));

        assert_eq!(
            h.runner.collect_run_info(&run_id).await,
            vec!["random_nums".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unmet_dependency_requeues_message() {
        let h = harness();
        h.runner
            .send_to_queue(
                "dev",
                vec![CheckEntry::new("test_checks/dependent_check").with_dependencies(["dep1"])],
                None,
            )
            .await
            .unwrap();

        let report = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            RunnerOutcome::DependencyPending {
                unmet: vec!["dep1".to_string()]
            }
        );
        assert!(results_for(&h.runner, "dependent_check").await.is_empty());
        // 延迟为 0，消息立即重新可见
        assert_eq!(h.queue.attributes().await.unwrap().visible, 1);
        assert!(report.propagated);
    }

    #[tokio::test]
    async fn test_successor_waits_for_requeued_message() {
        let mut config = test_config();
        config.queue.wait_time_secs = 1;
        config.runner.dependency.min_delay_secs = 1;
        config.runner.dependency.max_delay_secs = 1;
        assert!(config.validate().is_ok());
        let h = harness_with(config);
        h.runner
            .send_to_queue(
                "dev",
                vec![CheckEntry::new("test_checks/dependent_check").with_dependencies(["dep1"])],
                None,
            )
            .await
            .unwrap();

        let first = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert!(matches!(first.outcome, RunnerOutcome::DependencyPending { .. }));
        assert!(first.propagated);
        assert_eq!(h.queue.attributes().await.unwrap().in_flight, 1);

        // 继任 worker 的长轮询覆盖重新排队的延迟，不会在消息重新可见前结束
        let second = h
            .runner
            .run_check_runner(h.invoker.events()[0].clone(), true)
            .await
            .unwrap();
        assert!(matches!(second.outcome, RunnerOutcome::DependencyPending { .. }));
        assert!(second.propagated);
    }

    #[tokio::test]
    async fn test_dependency_satisfied_within_same_run() {
        let h = harness();
        let run_id = h
            .runner
            .send_to_queue(
                "dev",
                vec![
                    CheckEntry::new("test_checks/dependent_check").with_dependencies(["random_nums"]),
                    CheckEntry::new("test_checks/random_nums"),
                ],
                None,
            )
            .await
            .unwrap();

        let mut event = h.runner.first_event();
        let mut outcomes = Vec::new();
        for _ in 0..5 {
            let report = h.runner.run_check_runner(event.clone(), true).await.unwrap();
            outcomes.push(report.outcome);
            if !report.propagated {
                break;
            }
            event = event.next();
        }

        assert!(matches!(outcomes[0], RunnerOutcome::DependencyPending { .. }));
        assert!(matches!(outcomes[1], RunnerOutcome::Executed(_)));
        assert!(matches!(outcomes[2], RunnerOutcome::Executed(_)));
        assert_eq!(outcomes.len(), 3);

        let dependent = results_for(&h.runner, "dependent_check").await;
        assert_eq!(dependent.len(), 1);
        assert_eq!(dependent[0].uuid, run_id);
    }

    #[tokio::test]
    async fn test_dependency_expires_after_max_attempts() {
        let h = harness();
        h.runner
            .send_to_queue(
                "dev",
                vec![CheckEntry::new("test_checks/dependent_check").with_dependencies(["never"])],
                None,
            )
            .await
            .unwrap();

        let mut last = None;
        for _ in 0..3 {
            last = Some(
                h.runner
                    .run_check_runner(h.runner.first_event(), false)
                    .await
                    .unwrap()
                    .outcome,
            );
        }

        assert_eq!(
            last,
            Some(RunnerOutcome::DependencyExpired {
                unmet: vec!["never".to_string()]
            })
        );
        assert_eq!(h.queue.attributes().await.unwrap().outstanding(), 0);

        let results = results_for(&h.runner, "dependent_check").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, "ERROR");
        assert!(results[0].description.contains("never"));
    }

    #[tokio::test]
    async fn test_malformed_message_is_deleted() {
        let h = harness();
        h.queue.send("not json".to_string()).await.unwrap();
        h.queue
            .send(
                json!({"environment": "staging", "run_id": "r", "check_or_action": "test_checks/random_nums"})
                    .to_string(),
            )
            .await
            .unwrap();

        let first = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert_eq!(first.outcome, RunnerOutcome::Malformed);
        assert!(first.propagated);

        let second = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert_eq!(second.outcome, RunnerOutcome::Malformed);
        assert!(!second.propagated);
        assert!(h.queue.bodies().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_check_string_is_reported_and_deleted() {
        let h = harness();
        h.runner
            .send_single_to_queue("dev", "test_checks/not_registered", Kwargs::new(), None)
            .await
            .unwrap();
        let report = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert!(matches!(
            report.outcome,
            RunnerOutcome::Invalid(ValidationError::UnknownCheck { .. })
        ));
        assert_eq!(h.queue.attributes().await.unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_error_in_check_does_not_stop_worker() {
        let h = harness();
        h.runner
            .send_single_to_queue("dev", "test_checks/always_fails", Kwargs::new(), None)
            .await
            .unwrap();
        let report = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        let RunnerOutcome::Executed(record) = report.outcome else {
            panic!("expected executed outcome");
        };
        assert_eq!(record.status, "ERROR");
        assert!(record.full_output.to_string().contains("division"));
    }

    #[tokio::test]
    async fn test_timeout_leaves_message_and_does_not_propagate() {
        let mut config = test_config();
        config.runner.check_timeout_secs = 1;
        let h = harness_with(config);

        let mut kwargs = Kwargs::new();
        kwargs.insert("sleep_ms".to_string(), json!(3_000));
        h.runner
            .send_single_to_queue("dev", "test_checks/slow_check", kwargs, None)
            .await
            .unwrap();
        h.runner
            .send_single_to_queue("dev", "test_checks/random_nums", Kwargs::new(), None)
            .await
            .unwrap();

        let err = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(h.invoker.events().is_empty());
        // 超时的消息仍在队列中（不可见），等待重新投递
        assert_eq!(h.queue.attributes().await.unwrap().in_flight, 1);
        assert_eq!(h.queue.bodies().await.len(), 2);
    }

    #[tokio::test]
    async fn test_queue_action_chains_associated_action_once() {
        let h = harness();
        let mut kwargs = Kwargs::new();
        kwargs.insert("queue_action".to_string(), json!(true));
        let run_id = h
            .runner
            .send_single_to_queue("dev", "test_checks/random_nums", kwargs, None)
            .await
            .unwrap();

        let first = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert!(first.propagated);
        let RunnerOutcome::Executed(check) = first.outcome else {
            panic!("expected executed outcome");
        };

        let bodies = h.queue.bodies().await;
        assert_eq!(bodies.len(), 1);
        let queued: QueueMessage = serde_json::from_str(&bodies[0]).unwrap();
        assert_eq!(queued.check_or_action, "test_checks/add_random_test_nums");
        assert_eq!(queued.run_id, run_id);
        assert_eq!(queued.kwargs["called_by"], json!(check.uuid));

        // 模拟消息重复投递：同一个动作再次入队
        h.queue.send(bodies[0].clone()).await.unwrap();

        let second = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        let RunnerOutcome::Executed(action) = second.outcome else {
            panic!("expected executed action");
        };
        assert_eq!(action.status, "DONE");

        let third = h
            .runner
            .run_check_runner(h.runner.first_event(), true)
            .await
            .unwrap();
        assert!(matches!(third.outcome, RunnerOutcome::Skipped { .. }));
        assert!(!third.propagated);
    }

    #[tokio::test]
    async fn test_budget_exhausted_chain_stops() {
        let h = harness();
        h.runner
            .send_single_to_queue("dev", "test_checks/random_nums", Kwargs::new(), None)
            .await
            .unwrap();

        let mut event = h.runner.first_event();
        event.chain_started_at -= chrono::Duration::hours(2);
        let report = h.runner.run_check_runner(event, true).await.unwrap();
        assert_eq!(report.outcome, RunnerOutcome::BudgetExhausted);
        assert_eq!(h.queue.attributes().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn test_queue_scheduled_checks() {
        let mut config = test_config();
        let dev = config.environments["dev"].clone();
        config.environments.insert("prod".to_string(), dev);
        let mut h = harness_with(config);

        let mut registry = test_registry();
        registry
            .load_check_setup(
                json!({
                    "random_nums": {
                        "title": "Random nums",
                        "group": "Test",
                        "schedule": {"ten_min_checks": {"all": {}}}
                    },
                    "dependent_check": {
                        "title": "Dependent",
                        "group": "Test",
                        "schedule": {"ten_min_checks": {"prod": {"dependencies": ["random_nums"]}}}
                    }
                }),
                &["dev".to_string(), "prod".to_string()],
            )
            .unwrap();
        h.runner.executor = CheckExecutor::new(Arc::new(registry), Duration::from_secs(5));

        let queued = h
            .runner
            .queue_scheduled_checks("all", "ten_min_checks")
            .await
            .unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(h.queue.bodies().await.len(), 3);
        assert_eq!(h.invoker.events().len(), 1);
        assert_eq!(h.invoker.events()[0].generation, 0);

        let none = h
            .runner
            .queue_scheduled_checks("dev", "hourly_checks")
            .await
            .unwrap();
        assert!(none.is_empty());
        assert_eq!(h.invoker.events().len(), 1);

        assert!(
            h.runner
                .queue_scheduled_checks("staging", "ten_min_checks")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_worker_pool_drains_queue() {
        let config = Arc::new(test_config());
        let queue = Arc::new(MemoryQueue::new(config.queue_name()));
        let (invoker, rx) = crate::services::invoker::ChannelInvoker::channel();
        let runner = CheckRunner::new(
            config.clone(),
            Arc::new(ConnectionFactory::new(config)),
            queue.clone(),
            CheckExecutor::new(Arc::new(test_registry()), Duration::from_secs(5)),
            Arc::new(invoker),
        );
        let pool = tokio::spawn(run_worker_pool(runner.clone(), rx, 2));

        for i in 0..3 {
            let mut kwargs = Kwargs::new();
            kwargs.insert("uuid".to_string(), json!(format!("2026-01-01T00:00:0{}.000000", i)));
            runner
                .send_single_to_queue("dev", "test_checks/random_nums", kwargs, None)
                .await
                .unwrap();
        }
        runner.invoker.invoke(runner.first_event()).unwrap();

        let mut drained = false;
        for _ in 0..100 {
            if queue.bodies().await.is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(drained);
        assert_eq!(results_for(&runner, "random_nums").await.len(), 3);
        pool.abort();
    }

    #[tokio::test]
    async fn test_queue_check_and_action() {
        let h = harness();
        h.runner.queue_check("dev", "random_nums").await.unwrap();
        assert!(matches!(
            h.runner.queue_check("dev", "add_random_test_nums").await,
            Err(AppError::NotFound { .. })
        ));
        h.runner
            .queue_action("dev", "add_random_test_nums", Kwargs::new())
            .await
            .unwrap();
        assert_eq!(h.queue.bodies().await.len(), 2);
        assert_eq!(h.invoker.events().len(), 2);
    }
}
