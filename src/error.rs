// 网关错误分类：统一映射 HTTP 状态码与用户可见消息。
use axum::http::StatusCode;

#[derive(Debug, Clone)]
pub enum GatewayError {
    Unauthorized(String),
    UnknownInterface(String),
    InvalidParameters(String),
    UpstreamTimeout(String),
    Upstream(String),
    ResultTooLarge(String),
    CacheIo(String),
    PathViolation(String),
    TooLarge(String),
    NotFound(String),
    Parse(String),
    ModelUnreachable(String),
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "UNAUTHORIZED",
            GatewayError::UnknownInterface(_) => "UNKNOWN_INTERFACE",
            GatewayError::InvalidParameters(_) => "INVALID_PARAMS",
            GatewayError::UpstreamTimeout(_) => "UPSTREAM_TIMEOUT",
            GatewayError::Upstream(_) => "UPSTREAM_ERROR",
            GatewayError::ResultTooLarge(_) => "RESULT_TOO_LARGE",
            GatewayError::CacheIo(_) => "CACHE_IO_ERROR",
            GatewayError::PathViolation(_) => "PATH_VIOLATION",
            GatewayError::TooLarge(_) => "PAYLOAD_TOO_LARGE",
            GatewayError::NotFound(_) => "NOT_FOUND",
            GatewayError::Parse(_) => "PARSE_ERROR",
            GatewayError::ModelUnreachable(_) => "MODEL_UNREACHABLE",
            GatewayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UnknownInterface(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ResultTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::CacheIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::PathViolation(_) => StatusCode::BAD_REQUEST,
            GatewayError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Parse(_) => StatusCode::BAD_REQUEST,
            GatewayError::ModelUnreachable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GatewayError::Unauthorized(message)
            | GatewayError::UnknownInterface(message)
            | GatewayError::InvalidParameters(message)
            | GatewayError::UpstreamTimeout(message)
            | GatewayError::Upstream(message)
            | GatewayError::ResultTooLarge(message)
            | GatewayError::CacheIo(message)
            | GatewayError::PathViolation(message)
            | GatewayError::TooLarge(message)
            | GatewayError::NotFound(message)
            | GatewayError::Parse(message)
            | GatewayError::ModelUnreachable(message)
            | GatewayError::Internal(message) => message,
        }
    }

    pub fn cache_io(err: impl std::fmt::Display) -> Self {
        GatewayError::CacheIo(format!("缓存读写失败: {err}"))
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        GatewayError::Internal(format!("内部错误: {err}"))
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for GatewayError {}
