use axum::{extract::State, response::Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    config::Config,
    database::Database,
    error::AppError,
    queue::{QueueAttributes, SharedQueue},
    response::{ApiResponse, ResponseCode},
    services::ConnectionFactory,
};

/// HTTP 处理器共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub connections: Arc<ConnectionFactory>,
    pub queue: SharedQueue,
    /// 使用内存队列时为空
    pub database: Option<Database>,
}

/// 系统状态
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub stage: String,
    pub queue: String,
    pub environments: Vec<String>,
    pub database: &'static str,
}

/// 队列状态
#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub name: String,
    #[serde(flatten)]
    pub attributes: QueueAttributes,
}

pub async fn system_status(State(app_state): State<AppState>) -> Json<ApiResponse<SystemStatus>> {
    let database = match &app_state.database {
        Some(db) => match db.health_check().await {
            Ok(true) => "available",
            _ => "unavailable",
        },
        None => "disabled",
    };

    Json(ApiResponse::success(SystemStatus {
        stage: app_state.config.stage.to_string(),
        queue: app_state.queue.name().to_string(),
        environments: app_state.connections.environments(),
        database,
    }))
}

/// 各环境结果存储的可用性
pub async fn storage_health(
    State(app_state): State<AppState>,
) -> Result<ApiResponse<BTreeMap<String, bool>>, AppError> {
    let mut statuses = BTreeMap::new();
    for env in app_state.connections.environments() {
        let connection = app_state.connections.connection(&env).await?;
        let healthy = connection.results().health_check().await;
        if !healthy {
            tracing::warn!("环境 {} 的结果存储不可用", env);
        }
        statuses.insert(env, healthy);
    }

    if statuses.values().all(|healthy| *healthy) {
        Ok(ApiResponse::success(statuses))
    } else {
        Ok(ApiResponse::error_with_data(
            ResponseCode::UNAVAILABLE,
            "部分结果存储不可用".to_string(),
            statuses,
        ))
    }
}

/// 检查队列的近似计数
pub async fn queue_health(
    State(app_state): State<AppState>,
) -> Result<Json<ApiResponse<QueueHealth>>, AppError> {
    let attributes = app_state.queue.attributes().await?;
    Ok(Json(ApiResponse::success(QueueHealth {
        name: app_state.queue.name().to_string(),
        attributes,
    })))
}
