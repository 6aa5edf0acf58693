// 服务层模块
pub mod api_client;
pub mod check_runner;
pub mod connection;
pub mod executor;
pub mod invoker;
pub mod registry;
pub mod scheduler;

pub use api_client::ApiClient;
pub use check_runner::{CheckRunner, RunnerOutcome, RunnerReport, run_worker_pool};
pub use connection::{Connection, ConnectionFactory};
pub use executor::{CheckExecutor, RunOutcome};
pub use invoker::{ChannelInvoker, ProcessInvoker, RunnerEvent, RunnerInvoker};
pub use registry::{CheckFn, CheckRegistry, Registration, ValidationError, check_fn};
pub use scheduler::{ScheduleTrigger, spawn_schedules};
