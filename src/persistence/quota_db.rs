//! 配额状态的 SQLite 存储
//!
//! 与上传历史共用同一个数据库文件，单独持有一个连接。

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};

use crate::quota::{QuotaBudget, QuotaStore};

pub struct SqliteQuotaStore {
    conn: Mutex<Connection>,
}

impl SqliteQuotaStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS quota_budget (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                date TEXT NOT NULL,
                consumed_units INTEGER NOT NULL,
                daily_limit INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl QuotaStore for SqliteQuotaStore {
    fn load(&self) -> Result<Option<QuotaBudget>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        let row: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT date, consumed_units, daily_limit FROM quota_budget WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(date, consumed, limit)| {
            Ok(QuotaBudget {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .with_context(|| format!("配额日期格式错误: {}", date))?,
                consumed_units: consumed.max(0) as u64,
                daily_limit: limit.max(0) as u64,
            })
        })
        .transpose()
    }

    fn save(&self, budget: &QuotaBudget) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))?;

        conn.execute(
            "INSERT INTO quota_budget (id, date, consumed_units, daily_limit) VALUES (1, ?1, ?2, ?3) \
             ON CONFLICT(id) DO UPDATE SET date = excluded.date, \
             consumed_units = excluded.consumed_units, daily_limit = excluded.daily_limit",
            params![
                budget.date.format("%Y-%m-%d").to_string(),
                budget.consumed_units as i64,
                budget.daily_limit as i64
            ],
        )?;
        Ok(())
    }
}
