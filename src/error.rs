use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::response::{ApiResponse, ResponseCode};

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP请求错误: {0}")]
    Http(#[from] reqwest::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("队列错误: {0}")]
    Queue(String),

    #[error("检查配置错误: {0}")]
    BadCheckSetup(String),

    /// 该检查从未产生过任何结果
    #[error("Could not find any results for {name}")]
    NoResults { name: String },

    /// 有历史结果，但都晚于目标时间
    #[error("Could not find any results for {name} at or before {target}")]
    NoResultsBefore { name: String, target: String },

    /// 有历史结果，但全部为错误状态
    #[error("Could not find closest non-{error_status} result for {name}")]
    NoNonErrorResult { name: String, error_status: String },

    /// 单次检查执行超时；由调用方终止整个 worker，不在执行器内部捕获
    #[error("-RUN-> TIMEOUT for execution of {name}. Elapsed time is {elapsed_secs} seconds; keep under {limit_secs}.")]
    CheckTimeout {
        name: String,
        elapsed_secs: u64,
        limit_secs: u64,
    },

    #[error("内部错误: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("资源不存在: {resource}")]
    NotFound { resource: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            AppError::Database(_) => (ResponseCode::DATABASE_ERROR, self.to_string()),
            AppError::Serialization(_) => {
                (ResponseCode::INTERNAL_ERROR, "数据序列化错误".to_string())
            }
            AppError::Io(_) => (ResponseCode::INTERNAL_ERROR, "文件IO错误".to_string()),
            AppError::Http(_) => (ResponseCode::UPSTREAM_ERROR, self.to_string()),
            AppError::Config(_) => (ResponseCode::INTERNAL_ERROR, "配置错误".to_string()),
            AppError::Validation(msg) => (ResponseCode::BAD_REQUEST, msg.clone()),
            AppError::Storage(_) => (ResponseCode::STORAGE_ERROR, self.to_string()),
            AppError::Queue(_) => (ResponseCode::QUEUE_ERROR, self.to_string()),
            AppError::BadCheckSetup(msg) => (ResponseCode::INTERNAL_ERROR, msg.clone()),
            AppError::NoResults { .. }
            | AppError::NoResultsBefore { .. }
            | AppError::NoNonErrorResult { .. } => {
                (ResponseCode::NOT_FOUND, self.to_string())
            }
            AppError::CheckTimeout { .. } => (ResponseCode::INTERNAL_ERROR, self.to_string()),
            AppError::Internal(_) => (ResponseCode::INTERNAL_ERROR, "服务器内部错误".to_string()),
            AppError::BadRequest(msg) => (ResponseCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound { resource } => {
                (ResponseCode::NOT_FOUND, format!("资源不存在: {}", resource))
            }
        };

        // 记录错误日志
        tracing::error!("应用错误: {}", self);

        ApiResponse::<()>::error(code, message).into_response()
    }
}

/// 应用程序Result类型别名
pub type AppResult<T> = Result<T, AppError>;

/// 错误构造辅助函数
impl AppError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Self::Validation(msg.into())
    }

    pub fn bad_request<T: Into<String>>(msg: T) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn service_unavailable<T: Into<String>>(msg: T) -> Self {
        Self::Internal(anyhow::anyhow!(msg.into()))
    }

    pub fn storage<T: Into<String>>(msg: T) -> Self {
        Self::Storage(msg.into())
    }

    pub fn queue<T: Into<String>>(msg: T) -> Self {
        Self::Queue(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }

    pub fn bad_check_setup<T: Into<String>>(msg: T) -> Self {
        Self::BadCheckSetup(msg.into())
    }

    /// 是否为必须终止当前 worker 的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::CheckTimeout { .. })
    }
}
