// 用户文件存储：按用户隔离目录，临时文件加改名保证上传原子性。
use crate::error::GatewayError;
use crate::paginate::{paginate, PageEnvelope};
use crate::table::{Cell, Table};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

pub const MAX_FILENAME_BYTES: usize = 255;

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    max_upload_bytes: u64,
}

impl FileStore {
    pub fn new(root: &str, max_upload_bytes: u64) -> anyhow::Result<Self> {
        let root = PathBuf::from(root);
        fs::create_dir_all(&root)
            .map_err(|err| anyhow::anyhow!("文件目录不可写: {}, {err}", root.display()))?;
        Ok(Self {
            root,
            max_upload_bytes,
        })
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    fn user_root(&self, owner: &str) -> PathBuf {
        self.root.join(safe_owner_segment(owner))
    }

    /// 解析 owner 下的目标路径。任何越出用户目录的输入都会被拒绝。
    fn resolve(&self, owner: &str, filename: &str) -> Result<PathBuf, GatewayError> {
        let name = safe_filename(filename)?;
        let user_root = self.user_root(owner);
        let target = user_root.join(&name);
        // 改名类竞争下的兜底校验
        if !target.starts_with(&user_root) {
            return Err(GatewayError::PathViolation(
                "文件路径越出用户目录".to_string(),
            ));
        }
        Ok(target)
    }

    pub async fn save(&self, owner: &str, filename: &str, bytes: Vec<u8>) -> Result<String, GatewayError> {
        if bytes.len() as u64 > self.max_upload_bytes {
            return Err(GatewayError::TooLarge(format!(
                "文件超出大小上限 {} 字节",
                self.max_upload_bytes
            )));
        }
        let target = self.resolve(owner, filename)?;
        let owner = owner.to_string();
        let name = filename.to_string();
        tokio::task::spawn_blocking(move || -> Result<String, GatewayError> {
            let Some(parent) = target.parent() else {
                return Err(GatewayError::internal("文件目录缺失"));
            };
            fs::create_dir_all(parent).map_err(GatewayError::internal)?;
            // 写临时文件后改名，列表里永远不会出现半截文件。
            let temp = parent.join(format!(".{}.{}.part", name, Uuid::new_v4().simple()));
            fs::write(&temp, &bytes).map_err(|err| {
                let _ = fs::remove_file(&temp);
                GatewayError::internal(err)
            })?;
            fs::rename(&temp, &target).map_err(|err| {
                let _ = fs::remove_file(&temp);
                GatewayError::internal(err)
            })?;
            info!("用户 {owner} 上传文件 {name} ({} 字节)", bytes.len());
            Ok(name)
        })
        .await
        .map_err(GatewayError::internal)?
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<String>, GatewayError> {
        let user_root = self.user_root(owner);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, GatewayError> {
            if !user_root.exists() {
                return Ok(Vec::new());
            }
            let mut names = Vec::new();
            let entries = fs::read_dir(&user_root).map_err(GatewayError::internal)?;
            for entry in entries.flatten() {
                if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name.ends_with(".part") && name.starts_with('.') {
                    continue;
                }
                names.push(name);
            }
            names.sort();
            Ok(names)
        })
        .await
        .map_err(GatewayError::internal)?
    }

    pub async fn delete(&self, owner: &str, filename: &str) -> Result<(), GatewayError> {
        let target = self.resolve(owner, filename)?;
        let owner = owner.to_string();
        let name = filename.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
            if !target.is_file() {
                return Err(GatewayError::NotFound(format!("文件不存在: {name}")));
            }
            fs::remove_file(&target).map_err(GatewayError::internal)?;
            info!("用户 {owner} 删除文件 {name}");
            Ok(())
        })
        .await
        .map_err(GatewayError::internal)?
    }

    /// 按 CSV 读取并分页浏览，首行作为表头。
    pub async fn browse(
        &self,
        owner: &str,
        filename: &str,
        page: usize,
        page_size: usize,
    ) -> Result<PageEnvelope, GatewayError> {
        let target = self.resolve(owner, filename)?;
        let max_bytes = self.max_upload_bytes;
        let name = filename.to_string();
        let table = tokio::task::spawn_blocking(move || -> Result<Table, GatewayError> {
            if !target.is_file() {
                return Err(GatewayError::NotFound(format!("文件不存在: {name}")));
            }
            let size = fs::metadata(&target).map_err(GatewayError::internal)?.len();
            if size > max_bytes {
                return Err(GatewayError::TooLarge(format!(
                    "文件超出可浏览上限 {max_bytes} 字节"
                )));
            }
            let content = fs::read_to_string(&target)
                .map_err(|err| GatewayError::Parse(format!("文件不是文本: {err}")))?;
            parse_csv(&content)
        })
        .await
        .map_err(GatewayError::internal)??;
        Ok(paginate(&table, page, page_size))
    }
}

fn safe_owner_segment(owner: &str) -> String {
    let cleaned: String = owner
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// 文件名约束：非空、无路径分隔符、无 `..`、不超过 255 字节。
pub fn safe_filename(raw: &str) -> Result<String, GatewayError> {
    let name = raw.trim();
    if name.is_empty() || name.len() > MAX_FILENAME_BYTES {
        return Err(GatewayError::PathViolation("文件名长度非法".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(GatewayError::PathViolation(
            "文件名不能包含路径分隔符".to_string(),
        ));
    }
    if name == "." || name == ".." || name.contains("..") {
        return Err(GatewayError::PathViolation(
            "文件名不能包含 ..".to_string(),
        ));
    }
    if name.chars().any(|ch| ch.is_control()) {
        return Err(GatewayError::PathViolation(
            "文件名包含控制字符".to_string(),
        ));
    }
    if Path::new(name).components().count() != 1 {
        return Err(GatewayError::PathViolation("文件名格式非法".to_string()));
    }
    Ok(name.to_string())
}

/// 轻量 CSV 解析：支持引号字段、转义引号与 CRLF。
pub fn parse_csv(content: &str) -> Result<Table, GatewayError> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut field = String::new();
    let mut record: Vec<String> = Vec::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        return Err(GatewayError::Parse("CSV 引号未闭合".to_string()));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        rows.push(record);
    }
    // 忽略纯空行
    rows.retain(|row| !(row.len() == 1 && row[0].trim().is_empty()));
    let Some(header) = rows.first() else {
        return Err(GatewayError::Parse("CSV 缺少表头行".to_string()));
    };
    let columns: Vec<String> = header.iter().map(|cell| cell.trim().to_string()).collect();
    if columns.iter().all(|column| column.is_empty()) {
        return Err(GatewayError::Parse("CSV 表头为空".to_string()));
    }
    let mut table_rows = Vec::with_capacity(rows.len().saturating_sub(1));
    for row in rows.iter().skip(1) {
        let mut cells = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            match row.get(index) {
                Some(value) => cells.push(Cell::Text(value.clone())),
                None => cells.push(Cell::Null),
            }
        }
        table_rows.push(cells);
    }
    Ok(Table {
        columns,
        rows: table_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> FileStore {
        let root = std::env::temp_dir().join(format!("akgate_files_{}", Uuid::new_v4().simple()));
        FileStore::new(root.to_str().unwrap(), 10 * 1024 * 1024).unwrap()
    }

    #[test]
    fn test_safe_filename_rules() {
        assert!(safe_filename("mini.csv").is_ok());
        assert!(safe_filename("报表 2024.csv").is_ok());
        assert!(safe_filename("").is_err());
        assert!(safe_filename("../secret.csv").is_err());
        assert!(safe_filename("a/b.csv").is_err());
        assert!(safe_filename("a\\b.csv").is_err());
        assert!(safe_filename(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_parse_csv_with_quotes() {
        let table = parse_csv("name,note\nalice,\"hello, \"\"world\"\"\"\r\nbob,plain\n").unwrap();
        assert_eq!(table.columns, vec!["name", "note"]);
        assert_eq!(table.rows[0][1], Cell::Text("hello, \"world\"".to_string()));
        assert_eq!(table.record_count(), 2);
    }

    #[test]
    fn test_parse_csv_requires_header() {
        assert!(parse_csv("").is_err());
        assert!(parse_csv("a,b\n1,2").is_ok());
    }

    #[tokio::test]
    async fn test_upload_list_browse_delete_round_trip() {
        let store = temp_store();
        let csv = "date,price\n2024-01-01,10\n2024-01-02,11\n2024-01-03,12\n";
        store
            .save("alice", "mini.csv", csv.as_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(store.list("alice").await.unwrap(), vec!["mini.csv"]);

        let envelope = store.browse("alice", "mini.csv", 1, 2).await.unwrap();
        assert_eq!(envelope.total_records, 3);
        assert_eq!(envelope.total_pages, 2);
        assert_eq!(envelope.data[0], json!({"date": "2024-01-01", "price": "10"}));

        store.delete("alice", "mini.csv").await.unwrap();
        assert!(store.list("alice").await.unwrap().is_empty());
        assert!(matches!(
            store.delete("alice", "mini.csv").await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_owner_isolation() {
        let store = temp_store();
        store
            .save("bob", "secret.csv", b"a,b\n1,2\n".to_vec())
            .await
            .unwrap();
        // alice 看不到 bob 的文件，也无法借路径穿越删除
        assert!(store.list("alice").await.unwrap().is_empty());
        assert!(matches!(
            store.delete("alice", "../bob/secret.csv").await,
            Err(GatewayError::PathViolation(_))
        ));
        assert_eq!(store.list("bob").await.unwrap(), vec!["secret.csv"]);
    }

    #[tokio::test]
    async fn test_oversized_upload_rejected_without_trace() {
        let root = std::env::temp_dir().join(format!("akgate_files_{}", Uuid::new_v4().simple()));
        let store = FileStore::new(root.to_str().unwrap(), 16).unwrap();
        let err = store
            .save("alice", "big.bin", vec![0u8; 64])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TooLarge(_)));
        assert!(store.list("alice").await.unwrap().is_empty());
    }
}
