use crate::{config::ScheduleConfig, error::AppError, services::check_runner::CheckRunner};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{info, warn};

/// 按配置的间隔定时排队调度中的检查
#[derive(Clone, Debug)]
pub struct ScheduleTrigger {
    runner: CheckRunner,
    schedule: ScheduleConfig,
}

impl ScheduleTrigger {
    pub fn new(runner: CheckRunner, schedule: ScheduleConfig) -> Self {
        Self { runner, schedule }
    }

    pub async fn start(self) {
        let mut ticker = interval(Duration::from_secs(self.schedule.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 第一次 tick 立即返回，启动时不触发
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once().await {
                warn!(schedule = %self.schedule.name, error = %e, "调度触发失败");
            }
        }
    }

    async fn tick_once(&self) -> Result<(), AppError> {
        let queued = self
            .runner
            .queue_scheduled_checks(&self.schedule.environment, &self.schedule.name)
            .await?;
        info!(
            schedule = %self.schedule.name,
            environment = %self.schedule.environment,
            "调度已触发，排队 {} 个运行",
            queued.len()
        );
        Ok(())
    }
}

/// 为每个启用的调度启动一个后台任务
pub fn spawn_schedules(runner: &CheckRunner, schedules: &[ScheduleConfig]) -> Vec<JoinHandle<()>> {
    schedules
        .iter()
        .filter(|schedule| schedule.enabled)
        .map(|schedule| {
            info!(
                "启动调度 {}: 每 {} 秒，环境 {}",
                schedule.name, schedule.interval_secs, schedule.environment
            );
            tokio::spawn(ScheduleTrigger::new(runner.clone(), schedule.clone()).start())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::{CheckQueue, MemoryQueue};
    use crate::services::{
        connection::ConnectionFactory, executor::CheckExecutor, invoker::RunnerInvoker,
    };
    use crate::test_support::{RecordingInvoker, test_config, test_registry};
    use serde_json::json;
    use std::sync::Arc;

    fn runner(config: Config, invoker: Arc<RecordingInvoker>) -> (CheckRunner, Arc<MemoryQueue>) {
        let config = Arc::new(config);
        let queue = Arc::new(MemoryQueue::new(config.queue_name()));
        let mut registry = test_registry();
        registry
            .load_check_setup(
                json!({
                    "random_nums": {
                        "title": "Random nums",
                        "group": "Test",
                        "schedule": {"fast_checks": {"all": {}}}
                    }
                }),
                &["dev".to_string()],
            )
            .unwrap();
        let invoker: Arc<dyn RunnerInvoker> = invoker;
        let runner = CheckRunner::new(
            config.clone(),
            Arc::new(ConnectionFactory::new(config)),
            queue.clone(),
            CheckExecutor::new(Arc::new(registry), Duration::from_secs(5)),
            invoker,
        );
        (runner, queue)
    }

    #[tokio::test]
    async fn test_enabled_schedules_queue_checks_on_each_tick() {
        let invoker = Arc::new(RecordingInvoker::default());
        let (runner, queue) = runner(test_config(), invoker.clone());
        let schedules = vec![
            ScheduleConfig {
                name: "fast_checks".to_string(),
                interval_secs: 1,
                environment: "all".to_string(),
                enabled: true,
            },
            ScheduleConfig {
                name: "fast_checks".to_string(),
                interval_secs: 1,
                environment: "all".to_string(),
                enabled: false,
            },
        ];

        let handles = spawn_schedules(&runner, &schedules);
        assert_eq!(handles.len(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(queue.bodies().await.is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(queue.bodies().await.len(), 1);
        assert_eq!(invoker.events().len(), 1);

        for handle in handles {
            handle.abort();
        }
    }
}
