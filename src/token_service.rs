// 令牌服务：进程级密钥签发无状态 HMAC 令牌，服务端不保存会话。
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    BadSignature,
    Expired,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TokenError::Malformed => "令牌格式不正确",
            TokenError::BadSignature => "令牌签名无效",
            TokenError::Expired => "令牌已过期",
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for TokenError {}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

pub struct TokenService {
    secret: Vec<u8>,
    ttl_seconds: i64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_minutes: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            ttl_seconds: (ttl_minutes.max(1) * 60) as i64,
        }
    }

    /// 签发 `payload.signature` 形式的紧凑令牌。
    pub fn issue(&self, username: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: username.to_string(),
            iat: now,
            exp: now + self.ttl_seconds,
        };
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let tag = URL_SAFE_NO_PAD.encode(self.sign(encoded.as_bytes()));
        format!("{encoded}.{tag}")
    }

    /// 校验令牌并返回主体用户名。错误分类用于内部区分，外层统一 401。
    pub fn validate(&self, token: &str) -> Result<String, TokenError> {
        let (encoded, tag) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::BadSignature)?;
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;
        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::Malformed)?;
        let claims =
            serde_json::from_slice::<Claims>(&payload).map_err(|_| TokenError::Malformed)?;
        let now = Utc::now().timestamp();
        if now < claims.iat || now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if claims.sub.trim().is_empty() {
            return Err(TokenError::Malformed);
        }
        Ok(claims.sub)
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_validate_round_trip() {
        let service = TokenService::new("unit-test-secret", 30);
        let token = service.issue("alice");
        assert_eq!(service.validate(&token).unwrap(), "alice");
    }

    #[test]
    fn test_malformed_token_rejected() {
        let service = TokenService::new("unit-test-secret", 30);
        assert_eq!(
            service.validate("not-a-token"),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            service.validate("a.b.c"),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn test_tampered_payload_fails_signature() {
        let service = TokenService::new("unit-test-secret", 30);
        let token = service.issue("alice");
        let (payload, tag) = token.split_once('.').unwrap();
        let mut forged = payload.to_string();
        forged.push('x');
        assert_eq!(
            service.validate(&format!("{forged}.{tag}")),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let issuer = TokenService::new("secret-one", 30);
        let verifier = TokenService::new("secret-two", 30);
        let token = issuer.issue("alice");
        assert_eq!(verifier.validate(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = TokenService::new("unit-test-secret", 30);
        let claims = Claims {
            sub: "alice".to_string(),
            iat: Utc::now().timestamp() - 7200,
            exp: Utc::now().timestamp() - 3600,
        };
        let payload = serde_json::to_vec(&claims).unwrap();
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let tag = URL_SAFE_NO_PAD.encode(service.sign(encoded.as_bytes()));
        assert_eq!(
            service.validate(&format!("{encoded}.{tag}")),
            Err(TokenError::Expired)
        );
    }
}
