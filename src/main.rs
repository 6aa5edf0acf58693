/*
 * check-runner - Scheduled check and action runner
 * Copyright (c) 2024 SampleFarm Project
 *
 * This work is licensed under CC BY-NC-SA 4.0
 * https://creativecommons.org/licenses/by-nc-sa/4.0/
 */

use axum::Router;
use chrono::{DateTime, Utc};
use check_runner::{
    app::App,
    config::Config,
    error::{AppError, AppResult},
    models::{Kwargs, RunKind, parse_uuid},
    repositories::{RunResult, put_check_result},
    routes::create_api_routes,
    services::{
        ChannelInvoker, ProcessInvoker, RunOutcome, RunnerEvent, run_worker_pool, spawn_schedules,
    },
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 定时检查与动作运行器
#[derive(Parser)]
#[command(name = "check-runner", version, about = "定时检查与动作运行器")]
struct Cli {
    /// 配置文件路径，不存在时写入默认配置
    #[arg(long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 启动健康检查接口、定时调度和进程内 worker 池
    Serve,

    /// 运行一代 worker：处理一条队列消息，队列非空时启动继任进程
    Worker {
        /// 在传播链中的代数
        #[arg(long, default_value_t = 0)]
        generation: u64,
        /// 传播链开始时间（RFC 3339），缺省为当前时间
        #[arg(long)]
        chain_started_at: Option<DateTime<Utc>>,
    },

    /// 不经过队列，直接运行检查或动作
    Run {
        #[arg(long)]
        env: String,
        /// `module/name`
        check_or_action: String,
        /// JSON 对象形式的参数
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// 直接运行检查组
    RunGroup {
        #[arg(long)]
        env: String,
        group: String,
    },

    /// 排队某个调度中的全部检查
    QueueSchedule {
        /// 环境名，"all" 表示全部环境
        #[arg(long, default_value = "all")]
        env: String,
        schedule: String,
    },

    /// 排队单个检查或动作
    QueueCheck {
        #[arg(long)]
        env: String,
        name: String,
        /// 按动作排队
        #[arg(long)]
        action: bool,
        /// 动作参数（JSON 对象）
        #[arg(long)]
        kwargs: Option<String>,
    },

    /// 查看检查的历史结果（按时间倒序）
    History {
        #[arg(long)]
        env: String,
        name: String,
        #[arg(long, default_value_t = 0)]
        start: usize,
        #[arg(long, default_value_t = 25)]
        limit: usize,
        /// 只返回该时间戳（结果 uuid 格式）之后的结果
        #[arg(long)]
        after: Option<String>,
    },

    /// 读取结果：默认最新结果
    Get {
        #[arg(long)]
        env: String,
        name: String,
        #[arg(long, conflicts_with_all = ["primary", "closest_hours"])]
        uuid: Option<String>,
        #[arg(long)]
        primary: bool,
        /// 读取距现在指定小时数最近的结果
        #[arg(long)]
        closest_hours: Option<i64>,
        #[arg(long, default_value_t = 0, requires = "closest_hours")]
        closest_minutes: i64,
        /// 读取动作结果
        #[arg(long)]
        action: bool,
    },

    /// 提交外部计算的检查结果，按 uuid 与已有结果合并
    Put {
        #[arg(long)]
        env: String,
        name: String,
        /// JSON 请求体，`@path` 表示从文件读取
        body: String,
    },
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "check_runner=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Worker {
            generation,
            chain_started_at,
        } => {
            let app = App::build(config, Arc::new(ProcessInvoker::current(cli.config)?)).await?;
            let event = RunnerEvent {
                queue: app.queue.name().to_string(),
                generation,
                chain_started_at: chain_started_at.unwrap_or_else(Utc::now),
            };
            match app.runner.run_check_runner(event, true).await {
                Ok(report) => {
                    tracing::info!(
                        generation,
                        propagated = report.propagated,
                        "worker 结束: {:?}",
                        report.outcome
                    );
                    Ok(())
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(generation, error = %e, "worker 因检查超时终止");
                    process::exit(2);
                }
                Err(e) => Err(e),
            }
        }
        command => {
            let app = App::build(config, Arc::new(ProcessInvoker::current(cli.config)?)).await?;
            run_command(&app, command).await
        }
    }
}

fn load_config(path: &Path) -> Config {
    match Config::from_file(path) {
        Ok(config) => {
            tracing::info!("已加载配置文件: {}", path.display());
            config
        }
        Err(e) => {
            tracing::warn!("加载配置文件失败（{}），使用默认配置", e);
            let default_config = Config::default();
            if !path.exists() {
                if let Err(e) = default_config.save_to_file(path) {
                    tracing::warn!("保存默认配置失败: {}", e);
                }
            }
            default_config
        }
    }
}

async fn serve(config: Config) -> AppResult<()> {
    let (invoker, events) = ChannelInvoker::channel();
    let app = App::build(config, Arc::new(invoker)).await?;

    tokio::spawn(run_worker_pool(
        app.runner.clone(),
        events,
        app.config.runner.max_workers,
    ));
    let schedules = spawn_schedules(&app.runner, &app.config.schedules);
    tracing::info!("已启动 {} 个定时调度", schedules.len());

    let router = Router::new()
        .merge(create_api_routes())
        .with_state(app.state())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&app.config.server_addr()).await?;
    tracing::info!("🚀 服务器启动成功，监听地址: {}", app.config.server_addr());

    axum::serve(listener, router).await?;
    Ok(())
}

async fn run_command(app: &App, command: Commands) -> AppResult<()> {
    match command {
        Commands::Run {
            env,
            check_or_action,
            kwargs,
        } => {
            let connection = app.connections.connection(&env).await?;
            let kwargs = match kwargs {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Object(Kwargs::new()),
            };
            let outcome = app
                .runner
                .executor()
                .run_check_or_action(&connection, &check_or_action, kwargs)
                .await?;
            print_outcome(&outcome)
        }
        Commands::RunGroup { env, group } => {
            let connection = app.connections.connection(&env).await?;
            let outcomes = app
                .runner
                .executor()
                .run_check_group(&connection, &group)
                .await?;
            for outcome in &outcomes {
                print_outcome(outcome)?;
            }
            Ok(())
        }
        Commands::QueueSchedule { env, schedule } => {
            let queued = app.runner.queue_scheduled_checks(&env, &schedule).await?;
            print_json(&queued)
        }
        Commands::QueueCheck {
            env,
            name,
            action,
            kwargs,
        } => {
            let run_id = if action {
                app.runner
                    .queue_action(&env, &name, parse_kwargs(kwargs)?)
                    .await?
            } else {
                app.runner.queue_check(&env, &name).await?
            };
            println!("{}", run_id);
            Ok(())
        }
        Commands::History {
            env,
            name,
            start,
            limit,
            after,
        } => {
            let after = match after {
                Some(raw) => Some(
                    parse_uuid(&raw)
                        .ok_or_else(|| AppError::bad_request(format!("无效的时间戳: {}", raw)))?,
                ),
                None => None,
            };
            let connection = app.connections.connection(&env).await?;
            let history = connection
                .check_result(&name)
                .get_result_history(start, limit, after)
                .await;
            print_json(&history)
        }
        Commands::Get {
            env,
            name,
            uuid,
            primary,
            closest_hours,
            closest_minutes,
            action,
        } => {
            let connection = app.connections.connection(&env).await?;
            let kind = if action { RunKind::Action } else { RunKind::Check };
            let result = RunResult::new(connection.results().clone(), &name, kind);
            let record = match (uuid, closest_hours) {
                (Some(uuid), _) => result.get_result_by_uuid(&uuid).await,
                (None, Some(hours)) => Some(
                    result
                        .get_closest_result(hours, closest_minutes, None)
                        .await?,
                ),
                (None, None) if primary => result.get_primary_result().await,
                (None, None) => result.get_latest_result().await,
            };
            let record = record.ok_or_else(|| AppError::not_found(format!("{} 的结果", name)))?;
            print_json(&record)
        }
        Commands::Put { env, name, body } => {
            let raw = match body.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)?,
                None => body,
            };
            let connection = app.connections.connection(&env).await?;
            let record =
                put_check_result(connection.results().clone(), &name, serde_json::from_str(&raw)?)
                    .await?;
            print_json(&record)
        }
        Commands::Serve | Commands::Worker { .. } => Ok(()),
    }
}

fn parse_kwargs(raw: Option<String>) -> AppResult<Kwargs> {
    match raw {
        None => Ok(Kwargs::new()),
        Some(raw) => match serde_json::from_str(&raw)? {
            Value::Object(kwargs) => Ok(kwargs),
            other => Err(AppError::bad_request(format!(
                "kwargs 必须是 JSON 对象: {}",
                other
            ))),
        },
    }
}

fn print_outcome(outcome: &RunOutcome) -> AppResult<()> {
    match outcome {
        RunOutcome::Completed(record) => print_json(record),
        RunOutcome::Skipped { reason } => {
            println!("skipped: {}", reason);
            Ok(())
        }
        RunOutcome::Invalid(e) => {
            eprintln!("{}", e);
            Ok(())
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> AppResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
