use std::sync::Mutex;
use std::{thread, time::Duration};

use async_trait::async_trait;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::GatewayError;

/**
 * \brief 外部键值存储的边界：按不透明字符串键读写，无跨键事务。
 */
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError>;
    async fn delete(&self, key: &str) -> Result<(), GatewayError>;
    /** \brief 按键前缀扫描，结果按键排序。 */
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, GatewayError>;
}

/**
 * \brief 读取并反序列化 JSON 记录；记录损坏时按缺失处理并记日志。
 */
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn RecordStore,
    key: &str,
) -> Result<Option<T>, GatewayError> {
    let Some(raw) = store.get(key).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(target: "murmur.store", key, "ignoring corrupt record: {e}");
            Ok(None)
        }
    }
}

pub async fn put_json<T: Serialize + Sync>(
    store: &dyn RecordStore,
    key: &str,
    value: &T,
) -> Result<(), GatewayError> {
    let raw = serde_json::to_string(value).map_err(|e| GatewayError::Store(e.to_string()))?;
    store.set(key, &raw).await
}

pub fn track_key(track_id: &str) -> String {
    format!("track:{track_id}")
}

pub fn provider_key(name: &str) -> String {
    format!("provider:{name}")
}

/**
 * \brief 基于 SQLite 单表的 RecordStore 实现。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开数据库文件并完成迁移。
     */
    pub fn open(path: &str) -> Result<Self, GatewayError> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(store_err)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, GatewayError> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, GatewayError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        action: impl FnOnce(&Connection) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| GatewayError::Store("connection mutex poisoned".into()))?;
        action(&guard)
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
fn migrate(conn: &Connection) -> Result<(), GatewayError> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS records (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GatewayError> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM records WHERE key=?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(store_err)
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), GatewayError> {
        self.with_conn(|conn| {
            retry_on_locked(|| {
                conn.execute(
                    "INSERT INTO records (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    params![key, value],
                )
            })?;
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        self.with_conn(|conn| {
            retry_on_locked(|| conn.execute("DELETE FROM records WHERE key=?1", params![key]))?;
            Ok(())
        })
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, GatewayError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT key, value FROM records
                     WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
                )
                .map_err(store_err)?;
            let rows = stmt
                .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(store_err)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(store_err)
        })
    }
}

fn store_err(e: rusqlite::Error) -> GatewayError {
    GatewayError::Store(e.to_string())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T, GatewayError>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                tracing::debug!(target: "murmur.store", attempt, "database locked, retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(store_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FeeTier, Track};

    fn mem_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory store")
    }

    #[tokio::test]
    async fn test_set_get_overwrite_delete() {
        let store = mem_store();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.set("a", "1").await.unwrap();
        store.set("a", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("2"));
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.delete("missing").await.expect("delete of missing key is a no-op");
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_exact() {
        let store = mem_store();
        store.set("track:2", "b").await.unwrap();
        store.set("track:1", "a").await.unwrap();
        store.set("tracker", "x").await.unwrap();
        store.set("provider:main", "p").await.unwrap();

        let rows = store.scan_prefix("track:").await.unwrap();
        assert_eq!(
            rows,
            vec![
                ("track:1".to_string(), "a".to_string()),
                ("track:2".to_string(), "b".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_json_helpers_round_trip_and_tolerate_corruption() {
        let store = mem_store();
        let track = Track {
            id: "42".into(),
            title: "Song".into(),
            artist_names: vec!["A".into()],
            fee_tier: FeeTier::Free,
            fee_code: 8,
            has_trial_only: false,
            candidate_url: None,
            url_expires_at: None,
        };
        put_json(&store, &track_key("42"), &track).await.unwrap();
        let loaded: Option<Track> = get_json(&store, &track_key("42")).await.unwrap();
        assert_eq!(loaded, Some(track));

        store.set("track:bad", "{not json").await.unwrap();
        let corrupt: Option<Track> = get_json(&store, "track:bad").await.unwrap();
        assert!(corrupt.is_none());
    }
}
