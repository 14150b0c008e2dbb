// 磁盘数据缓存：按键单飞，历史区间永不过期，当日数据跨本地午夜失效。
use crate::error::GatewayError;
use crate::table::Table;
use chrono::{Local, NaiveDate, TimeZone};
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct EntryMeta {
    stored_at: f64,
}

pub struct DataCache {
    root: PathBuf,
    ceiling_bytes: u64,
    serve_stale_on_error: bool,
    // 每个键一把异步锁：持锁计算即单飞，等待者醒来直接读新条目。
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    access: Arc<DashMap<String, f64>>,
    sweeping: Arc<AtomicBool>,
}

impl DataCache {
    pub fn new(root: &str, ceiling_bytes: u64, serve_stale_on_error: bool) -> anyhow::Result<Self> {
        let root = PathBuf::from(root);
        fs::create_dir_all(&root)
            .map_err(|err| anyhow::anyhow!("缓存目录不可写: {}, {err}", root.display()))?;
        Ok(Self {
            root,
            ceiling_bytes,
            serve_stale_on_error,
            locks: Arc::new(DashMap::new()),
            access: Arc::new(DashMap::new()),
            sweeping: Arc::new(AtomicBool::new(false)),
        })
    }

    /// 唯一入口：命中且新鲜直接返回，否则调用 compute 并原子落盘。
    /// 同键并发调用被锁串行化，只有第一个调用触发 compute。
    pub async fn get_or_compute<F, Fut>(
        &self,
        interface: &str,
        params: &Map<String, Value>,
        compute: F,
    ) -> Result<Table, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Table, GatewayError>>,
    {
        let key = canonical_key(interface, params);
        let hash = key_hash(&key);
        let lock = self
            .locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let entry = self.read_entry(interface, &hash);
        if let Some((table, stored_at)) = &entry {
            if is_fresh(*stored_at, end_date_param(params), Local::now()) {
                self.touch(&hash);
                debug!("缓存命中: {interface} {hash}");
                return Ok(table.clone());
            }
        }

        match compute().await {
            Ok(table) => {
                if let Err(err) = self.write_entry(interface, &hash, &table) {
                    // 缓存写失败只降级为未缓存，不影响本次结果。
                    warn!("缓存写入失败: {interface} {hash}, {err}");
                }
                self.touch(&hash);
                self.maybe_sweep();
                Ok(table)
            }
            Err(err) => {
                let stale_allowed = matches!(
                    err,
                    GatewayError::Upstream(_) | GatewayError::UpstreamTimeout(_)
                );
                if self.serve_stale_on_error && stale_allowed {
                    if let Some((table, _)) = entry {
                        warn!("上游失败，返回过期缓存: {interface} {hash}, {err}");
                        self.touch(&hash);
                        return Ok(table);
                    }
                }
                Err(err)
            }
        }
    }

    /// 显式失效工具，核心逻辑之外的运维入口。
    pub fn invalidate(&self, interface: &str, params: &Map<String, Value>) -> Result<(), GatewayError> {
        let hash = key_hash(&canonical_key(interface, params));
        let dir = self.interface_dir(interface);
        for suffix in ["bin", "meta"] {
            let path = dir.join(format!("{hash}.{suffix}"));
            if path.exists() {
                fs::remove_file(&path).map_err(GatewayError::cache_io)?;
            }
        }
        self.access.remove(&hash);
        Ok(())
    }

    fn interface_dir(&self, interface: &str) -> PathBuf {
        self.root.join(safe_segment(interface))
    }

    fn read_entry(&self, interface: &str, hash: &str) -> Option<(Table, f64)> {
        let dir = self.interface_dir(interface);
        let bin_path = dir.join(format!("{hash}.bin"));
        let meta_path = dir.join(format!("{hash}.meta"));
        if !bin_path.exists() || !meta_path.exists() {
            return None;
        }
        let bytes = match fs::read(&bin_path) {
            Ok(bytes) => bytes,
            Err(err) => {
                // 读失败按未命中处理，走上游重新拉取。
                warn!("缓存读取失败: {}, {err}", bin_path.display());
                return None;
            }
        };
        let table = match serde_json::from_slice::<Table>(&bytes) {
            Ok(table) => table,
            Err(err) => {
                warn!("缓存条目损坏: {}, {err}", bin_path.display());
                return None;
            }
        };
        let meta = fs::read_to_string(&meta_path)
            .ok()
            .and_then(|text| serde_json::from_str::<EntryMeta>(&text).ok())?;
        Some((table, meta.stored_at))
    }

    fn write_entry(&self, interface: &str, hash: &str, table: &Table) -> std::io::Result<()> {
        let dir = self.interface_dir(interface);
        fs::create_dir_all(&dir)?;
        let payload = serde_json::to_vec(table).unwrap_or_default();
        let meta = serde_json::to_vec(&EntryMeta {
            stored_at: now_ts(),
        })
        .unwrap_or_default();
        atomic_write(&dir.join(format!("{hash}.bin")), &payload)?;
        atomic_write(&dir.join(format!("{hash}.meta")), &meta)?;
        Ok(())
    }

    fn touch(&self, hash: &str) {
        self.access.insert(hash.to_string(), now_ts());
    }

    fn total_size(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn maybe_sweep(&self) {
        if self.ceiling_bytes == 0 || self.total_size() <= self.ceiling_bytes {
            return;
        }
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let root = self.root.clone();
        let ceiling = self.ceiling_bytes;
        let locks = self.locks.clone();
        let access = self.access.clone();
        let sweeping = self.sweeping.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = tokio::task::spawn_blocking(move || {
                    sweep_dir(&root, ceiling, &locks, &access);
                })
                .await;
                sweeping.store(false, Ordering::SeqCst);
            });
        } else {
            sweep_dir(&root, ceiling, &locks, &access);
            sweeping.store(false, Ordering::SeqCst);
        }
    }

}

/// LRU 清理：按最近读取时间从旧到新删除，跳过持锁中的条目。
fn sweep_dir(
    root: &Path,
    ceiling_bytes: u64,
    locks: &DashMap<String, Arc<Mutex<()>>>,
    access: &DashMap<String, f64>,
) {
    let mut total = 0u64;
    let mut candidates: Vec<(PathBuf, String, f64, u64)> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        total += size;
        if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
            continue;
        }
        let hash = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let accessed = access
            .get(&hash)
            .map(|value| *value)
            .or_else(|| file_mtime_ts(path))
            .unwrap_or(0.0);
        candidates.push((path.to_path_buf(), hash, accessed, size));
    }
    candidates.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut removed = 0usize;
    for (bin_path, hash, _, size) in candidates {
        if total <= ceiling_bytes {
            break;
        }
        let lock = locks
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // 正在读取或计算中的条目不清理。
        let Ok(_guard) = lock.try_lock() else {
            continue;
        };
        let meta_path = bin_path.with_extension("meta");
        if fs::remove_file(&bin_path).is_ok() {
            let _ = fs::remove_file(&meta_path);
            access.remove(&hash);
            total = total.saturating_sub(size);
            removed += 1;
        }
    }
    if removed > 0 {
        info!("缓存清理完成，删除 {removed} 个条目");
    }
}

/// 键规范化：参数键字典序排序，值统一为字符串形态。
/// 语义相同的调用得到字节一致的键。
pub fn canonical_key(interface: &str, params: &Map<String, Value>) -> String {
    let mut keys = params.keys().cloned().collect::<Vec<_>>();
    keys.sort();
    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let value = params.get(&key).map(coerce_string).unwrap_or_default();
        parts.push(format!("{key}={value}"));
    }
    format!("{}?{}", interface.trim(), parts.join("&"))
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn key_hash(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn safe_segment(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes)?;
    fs::rename(&temp, path)
}

fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

fn file_mtime_ts(path: &Path) -> Option<f64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    modified
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_secs_f64())
}

/// 读取 end_date 参数（YYYYMMDD 或 YYYY-MM-DD）。
fn end_date_param(params: &Map<String, Value>) -> Option<NaiveDate> {
    let raw = params.get("end_date")?.as_str()?.trim();
    NaiveDate::parse_from_str(raw, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d"))
        .ok()
}

/// 新鲜度判定：历史区间永不过期；当日或未来区间在写入日的
/// 本地午夜后失效。
fn is_fresh(stored_at: f64, end_date: Option<NaiveDate>, now: chrono::DateTime<Local>) -> bool {
    let today = now.date_naive();
    if let Some(end) = end_date {
        if end < today {
            return true;
        }
    }
    let Some(midnight) = today.and_hms_opt(0, 0, 0) else {
        return false;
    };
    match Local.from_local_datetime(&midnight).single() {
        Some(boundary) => stored_at >= boundary.timestamp() as f64,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn temp_cache(ceiling: u64) -> DataCache {
        let root = std::env::temp_dir().join(format!("akgate_cache_{}", Uuid::new_v4().simple()));
        DataCache::new(root.to_str().unwrap(), ceiling, true).unwrap()
    }

    fn sample_params() -> Map<String, Value> {
        let value = json!({
            "symbol": "600519",
            "period": "daily",
            "start_date": "20230101",
            "end_date": "20231231"
        });
        value.as_object().unwrap().clone()
    }

    fn sample_table() -> Table {
        Table::from_records(&[json!({"日期": "2023-01-03", "收盘": 1700.5})]).unwrap()
    }

    #[test]
    fn test_canonical_key_order_independent() {
        let a = json!({"b": 2, "a": "x"});
        let b = json!({"a": "x", "b": 2});
        let key_a = canonical_key("iface", a.as_object().unwrap());
        let key_b = canonical_key("iface", b.as_object().unwrap());
        assert_eq!(key_a, key_b);
        assert_eq!(key_a, "iface?a=x&b=2");
    }

    #[test]
    fn test_freshness_rules() {
        let now = Local::now();
        let today = now.date_naive();
        let yesterday_ts = (now - ChronoDuration::days(1)).timestamp() as f64;
        // 历史区间：昨天写入的条目仍然新鲜
        assert!(is_fresh(
            yesterday_ts,
            Some(today - ChronoDuration::days(30)),
            now
        ));
        // 当日区间：昨天写入的条目已过午夜边界
        assert!(!is_fresh(yesterday_ts, Some(today), now));
        // 当日区间：今天写入的条目新鲜
        assert!(is_fresh(now.timestamp() as f64, Some(today), now));
        // 无法解析的 end_date 按当日处理
        assert!(!is_fresh(yesterday_ts, None, now));
    }

    #[tokio::test]
    async fn test_historical_entry_survives_process_restart() {
        let root = std::env::temp_dir().join(format!("akgate_cache_{}", Uuid::new_v4().simple()));
        let params = sample_params();
        let calls = AtomicUsize::new(0);
        {
            let cache = DataCache::new(root.to_str().unwrap(), 0, true).unwrap();
            let table = cache
                .get_or_compute("stock_zh_a_hist", &params, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_table())
                })
                .await
                .unwrap();
            assert_eq!(table.record_count(), 1);
        }
        // 重新构建缓存对象模拟进程重启
        let cache = DataCache::new(root.to_str().unwrap(), 0, true).unwrap();
        let table = cache
            .get_or_compute("stock_zh_a_hist", &params, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(sample_table())
            })
            .await
            .unwrap();
        assert_eq!(table.record_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_collapse_to_single_call() {
        let cache = Arc::new(temp_cache(0));
        let params = sample_params();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let params = params.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("stock_zh_a_hist", &params, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(sample_table())
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut payloads = Vec::new();
        for handle in handles {
            let table = handle.await.unwrap();
            payloads.push(serde_json::to_vec(&table.to_records()).unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(payloads.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn test_stale_entry_served_on_upstream_error() {
        let cache = temp_cache(0);
        let mut params = sample_params();
        // 当日区间，便于人为制造过期
        params.insert(
            "end_date".to_string(),
            Value::String(Local::now().date_naive().format("%Y%m%d").to_string()),
        );
        cache
            .get_or_compute("stock_zh_a_hist", &params, || async { Ok(sample_table()) })
            .await
            .unwrap();
        // 把 meta 改回昨天，条目变为过期
        let hash = key_hash(&canonical_key("stock_zh_a_hist", &params));
        let meta_path = cache
            .interface_dir("stock_zh_a_hist")
            .join(format!("{hash}.meta"));
        let stale = EntryMeta {
            stored_at: now_ts() - 86_400.0 * 2.0,
        };
        fs::write(&meta_path, serde_json::to_vec(&stale).unwrap()).unwrap();

        let table = cache
            .get_or_compute("stock_zh_a_hist", &params, || async {
                Err(GatewayError::Upstream("连接被拒绝".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(table.record_count(), 1);

        // 参数类失败不回落到过期缓存
        let err = cache
            .get_or_compute("stock_zh_a_hist", &params, || async {
                Err(GatewayError::InvalidParameters("bad".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParameters(_)));
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute() {
        let cache = temp_cache(0);
        let params = sample_params();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            cache
                .get_or_compute("stock_zh_a_hist", &params, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_table())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        cache.invalidate("stock_zh_a_hist", &params).unwrap();
        cache
            .get_or_compute("stock_zh_a_hist", &params, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(sample_table())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sweep_removes_entries_over_ceiling() {
        // 上限 0 视为不设限，先关闭自动清理便于手工触发
        let cache = temp_cache(0);
        let table = sample_table();
        for index in 0..4 {
            let params = json!({"symbol": format!("60051{index}"), "end_date": "20200101"});
            cache
                .get_or_compute("stock_zh_a_hist", params.as_object().unwrap(), || async {
                    Ok(table.clone())
                })
                .await
                .unwrap();
        }
        let before = cache.total_size();
        assert!(before > 0);
        sweep_dir(&cache.root, 1, &cache.locks, &cache.access);
        assert!(cache.total_size() < before);
        assert!(cache.total_size() <= table.serialized_len() as u64 * 2);
    }
}
