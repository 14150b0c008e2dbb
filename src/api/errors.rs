// 统一错误响应：`{"detail": ...}` 负载加对应状态码，不回显内部细节。
use crate::error::GatewayError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}

pub fn gateway_error_response(err: &GatewayError) -> Response {
    error_response(err.status_code(), err.message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(StatusCode::BAD_REQUEST, "参数不合法");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload, serde_json::json!({ "detail": "参数不合法" }));
    }

    #[tokio::test]
    async fn test_gateway_error_maps_status() {
        let err = GatewayError::UpstreamTimeout("上游接口超时".to_string());
        let response = gateway_error_response(&err);
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let err = GatewayError::PathViolation("路径非法".to_string());
        let response = gateway_error_response(&err);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
