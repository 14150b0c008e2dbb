// 用户凭证存储：启动时从 JSON 文件加载，运行期只读。
use anyhow::{anyhow, Context, Result};
use argon2::password_hash::{
    rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const MAX_USERNAME_BYTES: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
}

pub struct UserStore {
    users: HashMap<String, UserRecord>,
    // 用户不存在时也跑一次校验，让失败路径的耗时与错误面一致。
    dummy_hash: String,
}

impl UserStore {
    pub fn load(path: &str) -> Result<Self> {
        let records = read_records(Path::new(path))?;
        let mut users = HashMap::with_capacity(records.len());
        for record in records {
            if normalize_username(&record.username).is_none() {
                warn!("忽略非法用户名记录: {:?}", record.username);
                continue;
            }
            users.insert(record.username.clone(), record);
        }
        let dummy_hash = Self::hash_password("akgate-dummy-credential")?;
        Ok(Self { users, dummy_hash })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn lookup(&self, username: &str) -> Option<&UserRecord> {
        self.users.get(username)
    }

    /// 登录校验。用户名区分大小写；不存在与密码错误不可区分。
    pub fn verify_login(&self, username: &str, password: &str) -> bool {
        match self.users.get(username) {
            Some(record) => Self::verify_password(&record.password_hash, password),
            None => {
                let _ = Self::verify_password(&self.dummy_hash, password);
                false
            }
        }
    }

    pub fn hash_password(password: &str) -> Result<String> {
        let trimmed = password.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("密码不能为空"));
        }
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(trimmed.as_bytes(), &salt)
            .map_err(|err| anyhow!(err.to_string()))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(hash: &str, password: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.trim().as_bytes(), &parsed)
            .is_ok()
    }
}

/// 用户名约束：非空、不含空白、可打印、不超过 64 字节。
pub fn normalize_username(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_USERNAME_BYTES {
        return None;
    }
    if trimmed
        .chars()
        .any(|ch| ch.is_whitespace() || ch.is_control())
    {
        return None;
    }
    Some(trimmed.to_string())
}

fn read_records(path: &Path) -> Result<Vec<UserRecord>> {
    if !path.exists() {
        warn!("用户文件不存在，启动为空用户表: {}", path.display());
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("读取用户文件失败: {}", path.display()))?;
    serde_json::from_str::<Vec<UserRecord>>(&content)
        .with_context(|| format!("解析用户文件失败: {}", path.display()))
}

/// 管理工具入口：新增或替换一条用户记录后整体落盘。
pub fn upsert_record(path: &Path, username: &str, password: &str) -> Result<()> {
    let username =
        normalize_username(username).ok_or_else(|| anyhow!("用户名格式不正确"))?;
    let mut records = read_records(path)?;
    let hash = UserStore::hash_password(password)?;
    match records
        .iter_mut()
        .find(|record| record.username == username)
    {
        Some(existing) => existing.password_hash = hash,
        None => records.push(UserRecord {
            username,
            password_hash: hash,
        }),
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建用户目录失败: {}", parent.display()))?;
    }
    let serialized = serde_json::to_string_pretty(&records)?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, serialized)
        .with_context(|| format!("写入用户文件失败: {}", temp.display()))?;
    fs::rename(&temp, path)
        .with_context(|| format!("替换用户文件失败: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_users_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("akgate_users_{}.json", Uuid::new_v4().simple()))
    }

    #[test]
    fn test_normalize_username_rules() {
        assert_eq!(normalize_username("alice").as_deref(), Some("alice"));
        assert_eq!(normalize_username("Alice").as_deref(), Some("Alice"));
        assert!(normalize_username("").is_none());
        assert!(normalize_username("has space").is_none());
        assert!(normalize_username(&"x".repeat(65)).is_none());
    }

    #[test]
    fn test_upsert_then_verify_login() {
        let path = temp_users_path();
        upsert_record(&path, "alice", "correct-horse").unwrap();
        let store = UserStore::load(path.to_str().unwrap()).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.verify_login("alice", "correct-horse"));
        assert!(!store.verify_login("alice", "wrong"));
        assert!(!store.verify_login("bob", "correct-horse"));
        // 区分大小写
        assert!(!store.verify_login("Alice", "correct-horse"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let path = temp_users_path();
        let store = UserStore::load(path.to_str().unwrap()).unwrap();
        assert!(store.is_empty());
        assert!(!store.verify_login("anyone", "anything"));
    }
}
