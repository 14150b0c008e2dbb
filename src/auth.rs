// 鉴权辅助：公开路径规则与 Bearer 令牌解析。
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

/// 除签发令牌与健康检查外，/api 下的路径都需要携带令牌。
pub fn is_protected_path(path: &str) -> bool {
    if !path.starts_with("/api") {
        return false;
    }
    if path == "/api/token" {
        return false;
    }
    if path == "/api/health" {
        return false;
    }
    true
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?;
    let text = value.to_str().ok()?.trim();
    if let Some(prefix) = text.get(..7) {
        if prefix.eq_ignore_ascii_case("bearer ") {
            if let Some(raw) = text.get(7..) {
                let cleaned = raw.trim();
                if !cleaned.is_empty() {
                    return Some(cleaned.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_is_protected_path() {
        assert!(!is_protected_path("/"));
        assert!(!is_protected_path("/api/token"));
        assert!(!is_protected_path("/api/health"));
        assert!(is_protected_path("/api/users/me"));
        assert!(is_protected_path("/api/mcp-data"));
        assert!(is_protected_path("/api/data/files"));
        assert!(is_protected_path("/api/llm/analyze"));
    }

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("abc.def"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  xyz "));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("xyz"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(extract_bearer_token(&headers).is_none());
    }
}
