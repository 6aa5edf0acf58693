use crate::handlers::{AppState, queue_health, storage_health, system_status};
use axum::{Router, routing::get};

/// 创建健康检查路由
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(system_status))
        .route("/api/health/storage", get(storage_health)) // 各环境结果存储
        .route("/api/health/queue", get(queue_health)) // 检查队列计数
}
