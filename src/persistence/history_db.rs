//! 上传历史 SQLite 账本
//!
//! 每个内容哈希对应唯一一行（`file_hash` 唯一索引），所有写操作经由同一个
//! 连接锁串行执行。worker 只做状态迁移，删除只来自操作员的显式命令。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::types::{FailedQuery, HistoryRecord, HistoryStats, ImportSummary, UploadStatus};

const RECORD_COLUMNS: &str = "id, file_hash, file_path, file_size, remote_video_id, status, \
     playlist_name, error_message, retry_count, created_at, updated_at";

/// 上传历史账本
pub struct HistoryLedger {
    /// SQLite 连接（单写者）
    conn: Mutex<Connection>,
}

impl HistoryLedger {
    /// 打开（或创建）数据库文件
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // 内存库会返回 "memory"，忽略结果
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("历史数据库已打开: {:?}, journal_mode={}", db_path, mode);

        Self::with_connection(conn)
    }

    /// 内存数据库，用于测试和 dry-run
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_tables()?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    fn init_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS upload_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_hash TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                remote_video_id TEXT,
                status TEXT NOT NULL,
                playlist_name TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_upload_history_hash ON upload_history(file_hash)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_path ON upload_history(file_path)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_video ON upload_history(remote_video_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_status ON upload_history(status, updated_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_upload_history_updated ON upload_history(updated_at)",
            [],
        )?;

        Ok(())
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 按内容哈希精确查找，用于上传前去重
    pub fn find_by_hash(&self, file_hash: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM upload_history WHERE file_hash = ?1", RECORD_COLUMNS),
                params![file_hash],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// 按本地路径查找最近一条记录
    pub fn find_by_path(&self, file_path: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM upload_history WHERE file_path = ?1 \
                     ORDER BY updated_at DESC, id DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                params![file_path],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// 按远端视频 ID 查找
    pub fn find_by_video_id(&self, video_id: &str) -> Result<Option<HistoryRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM upload_history WHERE remote_video_id = ?1 \
                     ORDER BY updated_at DESC, id DESC LIMIT 1",
                    RECORD_COLUMNS
                ),
                params![video_id],
                map_record,
            )
            .optional()?;
        Ok(record)
    }

    /// 失败记录，按更新时间倒序
    ///
    /// 包含上次运行遗留的 uploading，以及 reupload 重置后未被处理的 pending。
    pub fn query_failed(&self, query: &FailedQuery) -> Result<Vec<HistoryRecord>> {
        let mut sql = format!(
            "SELECT {} FROM upload_history \
             WHERE status IN ('failed_retryable', 'failed_permanent', 'uploading', 'pending')",
            RECORD_COLUMNS
        );
        let mut values: Vec<Value> = Vec::new();

        if let Some(since) = query.since {
            values.push(Value::Integer(since.timestamp_millis()));
            sql.push_str(&format!(" AND updated_at >= ?{}", values.len()));
        }
        if let Some(needle) = query.error_substring.as_deref().filter(|s| !s.is_empty()) {
            values.push(Value::Text(needle.to_lowercase()));
            sql.push_str(&format!(
                " AND instr(lower(coalesce(error_message, '')), ?{}) > 0",
                values.len()
            ));
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");
        if let Some(limit) = query.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params_from_iter(values.iter()), map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// 列出记录，可按状态过滤，按更新时间倒序
    pub fn list_records(
        &self,
        status: Option<UploadStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryRecord>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn()?;
        let records = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM upload_history WHERE status = ?1 \
                     ORDER BY updated_at DESC, id DESC LIMIT ?2",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.as_str(), limit], map_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM upload_history ORDER BY updated_at DESC, id DESC LIMIT ?1",
                    RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], map_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    /// 所有已成功且带远端 ID 的记录，供同步比对
    pub fn list_successful(&self) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM upload_history \
             WHERE status = 'success' AND remote_video_id IS NOT NULL ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// 某时刻之后成功上传的数量和总字节数
    pub fn successes_since(&self, since: DateTime<Utc>) -> Result<(usize, u64)> {
        let conn = self.conn()?;
        let (count, bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0) FROM upload_history \
             WHERE status = 'success' AND updated_at >= ?1",
            params![since.timestamp_millis()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((count as usize, bytes as u64))
    }

    pub fn stats(&self) -> Result<HistoryStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*), COALESCE(SUM(file_size), 0) FROM upload_history GROUP BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut stats = HistoryStats::default();
        for row in rows {
            let (status, count, bytes) = row?;
            let count = count as usize;
            match status.parse::<UploadStatus>() {
                Ok(UploadStatus::Pending) => stats.pending = count,
                Ok(UploadStatus::Uploading) => stats.uploading = count,
                Ok(UploadStatus::Success) => {
                    stats.success = count;
                    stats.uploaded_bytes = bytes as u64;
                }
                Ok(UploadStatus::FailedRetryable) => stats.failed_retryable = count,
                Ok(UploadStatus::FailedPermanent) => stats.failed_permanent = count,
                Err(e) => warn!("忽略未知状态的记录: {}", e),
            }
        }
        Ok(stats)
    }

    // =====================================================
    // 状态迁移
    // =====================================================

    /// 获取或创建某哈希的记录
    ///
    /// 已存在时复用原记录并更新路径；并发插入同一哈希时由唯一索引裁决，
    /// 落败方读取胜出方的记录。
    pub fn upsert_attempt(&self, file_hash: &str, file_path: &str, file_size: u64) -> Result<HistoryRecord> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now().timestamp_millis();

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO upload_history \
             (file_hash, file_path, file_size, status, retry_count, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
            params![file_hash, file_path, file_size as i64, now],
        )?;

        if inserted == 0 {
            let moved = tx.execute(
                "UPDATE upload_history SET file_path = ?2, file_size = ?3, updated_at = ?4 \
                 WHERE file_hash = ?1 AND file_path != ?2",
                params![file_hash, file_path, file_size as i64, now],
            )?;
            if moved > 0 {
                debug!("记录路径已更新: hash={}, path={}", file_hash, file_path);
            }
        }

        let record = tx.query_row(
            &format!("SELECT {} FROM upload_history WHERE file_hash = ?1", RECORD_COLUMNS),
            params![file_hash],
            map_record,
        )?;
        tx.commit()?;
        Ok(record)
    }

    /// 认领记录开始上传
    ///
    /// 已成功的记录不能被认领，返回 false。
    pub fn mark_uploading(&self, record: &HistoryRecord) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE upload_history SET status = 'uploading', updated_at = ?2 \
             WHERE id = ?1 AND status != 'success'",
            params![record.id, Utc::now().timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_success(
        &self,
        record: &HistoryRecord,
        video_id: &str,
        playlist_name: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE upload_history SET status = 'success', remote_video_id = ?2, \
             playlist_name = ?3, error_message = NULL, updated_at = ?4 WHERE id = ?1",
            params![record.id, video_id, playlist_name, Utc::now().timestamp_millis()],
        )?;
        if changed == 0 {
            bail!("记录不存在，无法标记成功: id={}", record.id);
        }
        Ok(())
    }

    /// 标记失败并累加重试计数，已成功的记录保持不变
    pub fn mark_failed(&self, record: &HistoryRecord, retryable: bool, error: &str) -> Result<bool> {
        let status = if retryable {
            UploadStatus::FailedRetryable
        } else {
            UploadStatus::FailedPermanent
        };
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE upload_history SET status = ?2, error_message = ?3, \
             retry_count = retry_count + 1, updated_at = ?4 \
             WHERE id = ?1 AND status != 'success'",
            params![record.id, status.as_str(), error, Utc::now().timestamp_millis()],
        )?;
        Ok(changed == 1)
    }

    /// 重置为 pending 以便重新上传，保留 retry_count
    pub fn clear_for_reupload(&self, record: &HistoryRecord) -> Result<HistoryRecord> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE upload_history SET status = 'pending', remote_video_id = NULL, \
             error_message = NULL, updated_at = ?2 WHERE id = ?1",
            params![record.id, Utc::now().timestamp_millis()],
        )?;
        let cleared = conn
            .query_row(
                &format!("SELECT {} FROM upload_history WHERE id = ?1", RECORD_COLUMNS),
                params![record.id],
                map_record,
            )
            .optional()?
            .ok_or_else(|| anyhow!("记录不存在: id={}", record.id))?;
        info!("已重置记录: {} ({})", cleared.file_path, cleared.file_hash);
        Ok(cleared)
    }

    // =====================================================
    // 删除（仅限操作员）
    // =====================================================

    pub fn delete_by_hash(&self, file_hash: &str) -> Result<usize> {
        self.delete_where("file_hash", file_hash)
    }

    pub fn delete_by_path(&self, file_path: &str) -> Result<usize> {
        self.delete_where("file_path", file_path)
    }

    pub fn delete_by_video_id(&self, video_id: &str) -> Result<usize> {
        self.delete_where("remote_video_id", video_id)
    }

    fn delete_where(&self, column: &'static str, value: &str) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            &format!("DELETE FROM upload_history WHERE {} = ?1", column),
            params![value],
        )?;
        if removed > 0 {
            info!("已删除 {} 条历史记录: {}={}", removed, column, value);
        }
        Ok(removed)
    }

    // =====================================================
    // 导入导出
    // =====================================================

    pub fn export(&self) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM upload_history ORDER BY id",
            RECORD_COLUMNS
        ))?;
        let records = stmt
            .query_map([], map_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// 在一个事务中合并导入记录
    ///
    /// 新哈希直接插入；已有的未成功记录可被导入的成功记录覆盖；其余跳过。
    /// 已成功的记录永远不会被覆盖。
    pub fn import(&self, records: &[HistoryRecord]) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        if records.is_empty() {
            return Ok(summary);
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut find = tx.prepare("SELECT id, status FROM upload_history WHERE file_hash = ?1")?;
            let mut insert = tx.prepare(
                "INSERT INTO upload_history \
                 (file_hash, file_path, file_size, remote_video_id, status, playlist_name, \
                  error_message, retry_count, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            let mut upgrade = tx.prepare(
                "UPDATE upload_history SET file_path = ?2, file_size = ?3, remote_video_id = ?4, \
                 status = 'success', playlist_name = ?5, error_message = NULL, \
                 retry_count = MAX(retry_count, ?6), updated_at = ?7 WHERE id = ?1",
            )?;

            for record in records {
                if record.status == UploadStatus::Success && record.remote_video_id.is_none() {
                    warn!("跳过缺少视频 ID 的成功记录: {}", record.file_hash);
                    summary.skipped += 1;
                    continue;
                }

                let existing: Option<(i64, String)> = find
                    .query_row(params![record.file_hash], |row| Ok((row.get(0)?, row.get(1)?)))
                    .optional()?;

                match existing {
                    None => {
                        insert.execute(params![
                            record.file_hash,
                            record.file_path,
                            record.file_size as i64,
                            record.remote_video_id,
                            record.status.as_str(),
                            record.playlist_name,
                            record.error_message,
                            record.retry_count,
                            record.created_at.timestamp_millis(),
                            record.updated_at.timestamp_millis(),
                        ])?;
                        summary.imported += 1;
                    }
                    Some((id, status))
                        if status != UploadStatus::Success.as_str()
                            && record.status == UploadStatus::Success =>
                    {
                        upgrade.execute(params![
                            id,
                            record.file_path,
                            record.file_size as i64,
                            record.remote_video_id,
                            record.playlist_name,
                            record.retry_count,
                            record.updated_at.timestamp_millis(),
                        ])?;
                        summary.upgraded += 1;
                    }
                    Some(_) => summary.skipped += 1,
                }
            }
        }
        tx.commit()?;

        info!(
            "导入完成: 新增 {}, 升级 {}, 跳过 {}",
            summary.imported, summary.upgraded, summary.skipped
        );
        Ok(summary)
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn map_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let status: String = row.get(5)?;
    let status = status
        .parse::<UploadStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, e.into()))?;

    Ok(HistoryRecord {
        id: row.get(0)?,
        file_hash: row.get(1)?,
        file_path: row.get(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        remote_video_id: row.get(4)?,
        status,
        playlist_name: row.get(6)?,
        error_message: row.get(7)?,
        retry_count: row.get(8)?,
        created_at: millis_to_datetime(row.get(9)?),
        updated_at: millis_to_datetime(row.get(10)?),
    })
}
