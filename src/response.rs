use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

/// 接口返回的统一信封：业务码、中文消息和可选数据
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: ResponseCode::SUCCESS,
            msg: "操作成功".to_string(),
            data: Some(data),
        }
    }

    /// 失败但仍携带明细，例如部分环境不可用时的逐项状态
    pub fn error_with_data(code: i32, msg: String, data: T) -> Self {
        Self {
            code,
            msg,
            data: Some(data),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(code: i32, msg: String) -> Self {
        Self {
            code,
            msg,
            data: None,
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (ResponseCode::http_status(self.code), Json(self)).into_response()
    }
}

/// 业务响应码
pub struct ResponseCode;

impl ResponseCode {
    pub const SUCCESS: i32 = 200;
    pub const BAD_REQUEST: i32 = 400;
    pub const NOT_FOUND: i32 = 404;

    pub const INTERNAL_ERROR: i32 = 500;
    pub const DATABASE_ERROR: i32 = 501;
    pub const STORAGE_ERROR: i32 = 502;
    pub const UNAVAILABLE: i32 = 503;
    pub const QUEUE_ERROR: i32 = 504;
    pub const UPSTREAM_ERROR: i32 = 505;

    /// 业务码对应的 HTTP 状态，未列出的一律按 500 处理
    pub fn http_status(code: i32) -> StatusCode {
        match code {
            Self::SUCCESS => StatusCode::OK,
            Self::BAD_REQUEST => StatusCode::BAD_REQUEST,
            Self::NOT_FOUND => StatusCode::NOT_FOUND,
            Self::UPSTREAM_ERROR => StatusCode::BAD_GATEWAY,
            Self::UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shape() {
        let response = ApiResponse::success(json!({"dev": true}));
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body, json!({"code": 200, "msg": "操作成功", "data": {"dev": true}}));

        let response = ApiResponse::error(ResponseCode::NOT_FOUND, "资源不存在: x".to_string());
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["data"], serde_json::Value::Null);
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ResponseCode::http_status(ResponseCode::SUCCESS), StatusCode::OK);
        assert_eq!(
            ResponseCode::http_status(ResponseCode::UPSTREAM_ERROR),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ResponseCode::http_status(ResponseCode::QUEUE_ERROR),
            StatusCode::INTERNAL_SERVER_ERROR
        );

        let partial = ApiResponse::error_with_data(ResponseCode::UNAVAILABLE, "x".into(), vec![1]);
        assert_eq!(partial.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
