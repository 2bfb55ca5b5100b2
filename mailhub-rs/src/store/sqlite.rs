//! SQLite mail store
//!
//! Timestamps are stored as integer milliseconds since the epoch and flags
//! as their bit representation. UID allocation and queue claims are single
//! `UPDATE ... RETURNING` statements, which SQLite executes atomically.

use crate::error::{MailError, Result};
use crate::model::mailbox::{is_descendant, parent_names, validate_mailbox_name};
use crate::model::{
    FlagUpdate, Flags, Mailbox, MessageMeta, NewQueueEntry, QueueEntry, QueueStatus, Uid, User,
    INBOX,
};
use crate::store::MailStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        address TEXT PRIMARY KEY,
        password_hash TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mailboxes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner TEXT NOT NULL,
        name TEXT NOT NULL,
        uid_validity INTEGER NOT NULL,
        uid_next INTEGER NOT NULL DEFAULT 1,
        highest_modseq INTEGER NOT NULL DEFAULT 0,
        UNIQUE (owner, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        mailbox_id INTEGER NOT NULL REFERENCES mailboxes(id) ON DELETE CASCADE,
        uid INTEGER NOT NULL,
        id TEXT NOT NULL,
        flags INTEGER NOT NULL,
        size INTEGER NOT NULL,
        internal_date INTEGER NOT NULL,
        modseq INTEGER NOT NULL,
        body BLOB NOT NULL,
        PRIMARY KEY (mailbox_id, uid)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbound_messages (
        id TEXT PRIMARY KEY,
        body BLOB NOT NULL,
        created_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS queue (
        id TEXT PRIMARY KEY,
        message_id TEXT NOT NULL,
        from_addr TEXT NOT NULL,
        to_addr TEXT NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        status TEXT NOT NULL,
        next_attempt INTEGER NOT NULL,
        last_attempt INTEGER,
        last_error TEXT,
        created_at INTEGER NOT NULL,
        sent_at INTEGER
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_due ON queue (status, next_attempt)",
    r#"
    CREATE TABLE IF NOT EXISTS counters (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    )
    "#,
    "INSERT OR IGNORE INTO counters (name, value) VALUES ('uid_validity', 0)",
];

const QUEUE_COLUMNS: &str = "id, message_id, from_addr, to_addr, priority, attempts, \
     max_attempts, status, next_attempt, last_attempt, last_error, created_at, sent_at";

const MAILBOX_SUMMARY: &str = r#"
    SELECT b.name, b.uid_validity, b.uid_next, b.highest_modseq,
           COUNT(m.uid) AS total,
           COALESCE(SUM((m.flags & 32) != 0), 0) AS recent,
           COALESCE(SUM((m.flags & 1) = 0), 0) AS unseen
    FROM mailboxes b
    LEFT JOIN messages m ON m.mailbox_id = b.id
"#;

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| MailError::Storage(format!("invalid timestamp: {}", ms)))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| MailError::Storage(format!("invalid id {}: {}", s, e)))
}

fn flags_from_db(bits: i64) -> Flags {
    Flags::from_bits_truncate(bits as u8)
}

fn mailbox_from_row(owner: &str, row: &SqliteRow) -> Result<Mailbox> {
    Ok(Mailbox {
        owner: owner.to_string(),
        name: row.try_get("name")?,
        selectable: true,
        uid_validity: row.try_get::<i64, _>("uid_validity")? as u32,
        uid_next: row.try_get::<i64, _>("uid_next")? as u32,
        highest_modseq: row.try_get::<i64, _>("highest_modseq")? as u64,
        message_count: row.try_get::<i64, _>("total")? as u32,
        recent_count: row.try_get::<i64, _>("recent")? as u32,
        unseen_count: row.try_get::<i64, _>("unseen")? as u32,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<MessageMeta> {
    Ok(MessageMeta {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        uid: row.try_get::<i64, _>("uid")? as Uid,
        flags: flags_from_db(row.try_get("flags")?),
        size: row.try_get::<i64, _>("size")? as u64,
        internal_date: from_millis(row.try_get("internal_date")?)?,
        modseq: row.try_get::<i64, _>("modseq")? as u64,
    })
}

fn queue_entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let status: String = row.try_get("status")?;
    Ok(QueueEntry {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        message_id: parse_uuid(&row.try_get::<String, _>("message_id")?)?,
        from_addr: row.try_get("from_addr")?,
        to_addr: row.try_get("to_addr")?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        status: status.parse().map_err(MailError::Storage)?,
        next_attempt: from_millis(row.try_get("next_attempt")?)?,
        last_attempt: row
            .try_get::<Option<i64>, _>("last_attempt")?
            .map(from_millis)
            .transpose()?,
        last_error: row.try_get("last_error")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        sent_at: row
            .try_get::<Option<i64>, _>("sent_at")?
            .map(from_millis)
            .transpose()?,
    })
}

/// Store backed by an SQLite database
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Connect to `database_url`, creating the file and schema if needed
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // Each connection to an in-memory database sees its own database
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let pool = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(options)
                .await?
        } else {
            SqlitePoolOptions::new()
                .max_connections(8)
                .connect_with(options.journal_mode(SqliteJournalMode::Wal))
                .await?
        };

        Self::from_pool(pool).await
    }

    pub async fn from_pool(db: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&db).await?;
        }
        debug!("SQLite schema ready");
        Ok(Self { db })
    }

    async fn insert_mailbox(conn: &mut SqliteConnection, owner: &str, name: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        let (uid_validity,): (i64,) = sqlx::query_as(
            "UPDATE counters SET value = MAX(value + 1, ?) WHERE name = 'uid_validity' RETURNING value",
        )
        .bind(now)
        .fetch_one(&mut *conn)
        .await?;

        sqlx::query("INSERT INTO mailboxes (owner, name, uid_validity) VALUES (?, ?, ?)")
            .bind(owner)
            .bind(name)
            .bind(uid_validity)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn mailbox_id(conn: &mut SqliteConnection, owner: &str, name: &str) -> Result<i64> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM mailboxes WHERE owner = ? AND name = ?")
                .bind(owner)
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        row.map(|(id,)| id)
            .ok_or_else(|| MailError::NotFound(format!("mailbox {}", name)))
    }

    async fn mailbox_exists(conn: &mut SqliteConnection, owner: &str, name: &str) -> Result<bool> {
        match Self::mailbox_id(conn, owner, name).await {
            Ok(_) => Ok(true),
            Err(MailError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Transaction holding the database write lock from its first statement
    ///
    /// A deferred transaction that reads before writing cannot wait for the
    /// lock when it upgrades: SQLite fails it with `SQLITE_BUSY` without
    /// consulting the busy timeout. Writing first behaves like
    /// `BEGIN IMMEDIATE`, so concurrent writers queue on the timeout instead.
    async fn begin(&self) -> Result<Transaction<'_, Sqlite>> {
        let mut tx = self.db.begin().await?;
        sqlx::query("UPDATE counters SET value = value WHERE name = 'uid_validity'")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn set_status(
        &self,
        id: Uuid,
        status: QueueStatus,
        error: Option<&str>,
        sent_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue
            SET status = ?, last_error = COALESCE(?, last_error), sent_at = COALESCE(?, sent_at)
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(error)
        .bind(sent_at.map(to_millis))
        .bind(id.to_string())
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("queue entry {}", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MailStore for SqliteStore {
    async fn create_user(&self, address: &str, password_hash: &str) -> Result<User> {
        let mut tx = self.begin().await?;
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT address FROM users WHERE address = ?")
                .bind(address)
                .fetch_optional(&mut *tx)
                .await?;
        if existing.is_some() {
            return Err(MailError::AlreadyExists(format!("user {}", address)));
        }

        let created_at = Utc::now();
        sqlx::query("INSERT INTO users (address, password_hash, created_at) VALUES (?, ?, ?)")
            .bind(address)
            .bind(password_hash)
            .bind(to_millis(created_at))
            .execute(&mut *tx)
            .await?;
        Self::insert_mailbox(&mut tx, address, INBOX).await?;
        tx.commit().await?;

        Ok(User {
            address: address.to_string(),
            password_hash: password_hash.to_string(),
            created_at: from_millis(to_millis(created_at))?,
        })
    }

    async fn find_user(&self, address: &str) -> Result<Option<User>> {
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT address, password_hash, created_at FROM users WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.db)
        .await?;

        row.map(|(address, password_hash, created_at)| {
            Ok(User {
                address,
                password_hash,
                created_at: from_millis(created_at)?,
            })
        })
        .transpose()
    }

    async fn list_mailboxes(&self, owner: &str) -> Result<Vec<Mailbox>> {
        let sql = format!("{} WHERE b.owner = ? GROUP BY b.id ORDER BY b.name", MAILBOX_SUMMARY);
        let rows = sqlx::query(&sql).bind(owner).fetch_all(&self.db).await?;
        rows.iter().map(|row| mailbox_from_row(owner, row)).collect()
    }

    async fn get_mailbox(&self, owner: &str, name: &str) -> Result<Option<Mailbox>> {
        let sql = format!(
            "{} WHERE b.owner = ? AND b.name = ? GROUP BY b.id",
            MAILBOX_SUMMARY
        );
        let row = sqlx::query(&sql)
            .bind(owner)
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        row.map(|row| mailbox_from_row(owner, &row)).transpose()
    }

    async fn create_mailbox(&self, owner: &str, name: &str) -> Result<Mailbox> {
        validate_mailbox_name(name)?;
        let mut tx = self.begin().await?;
        if Self::mailbox_exists(&mut tx, owner, name).await? {
            return Err(MailError::AlreadyExists(format!("mailbox {}", name)));
        }
        for parent in parent_names(name) {
            if !Self::mailbox_exists(&mut tx, owner, &parent).await? {
                Self::insert_mailbox(&mut tx, owner, &parent).await?;
            }
        }
        Self::insert_mailbox(&mut tx, owner, name).await?;
        tx.commit().await?;

        self.get_mailbox(owner, name)
            .await?
            .ok_or_else(|| MailError::NotFound(format!("mailbox {}", name)))
    }

    async fn delete_mailbox(&self, owner: &str, name: &str) -> Result<()> {
        if name == INBOX {
            return Err(MailError::Storage("INBOX cannot be deleted".to_string()));
        }
        let mut tx = self.begin().await?;
        let id = Self::mailbox_id(&mut tx, owner, name).await?;

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE mailbox_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            return Err(MailError::MailboxNotEmpty(name.to_string()));
        }

        let names: Vec<(String,)> = sqlx::query_as("SELECT name FROM mailboxes WHERE owner = ?")
            .bind(owner)
            .fetch_all(&mut *tx)
            .await?;
        if names.iter().any(|(n,)| is_descendant(n, name)) {
            return Err(MailError::Storage(format!(
                "mailbox {} has inferior mailboxes",
                name
            )));
        }

        sqlx::query("DELETE FROM mailboxes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rename_mailbox(&self, owner: &str, from: &str, to: &str) -> Result<()> {
        if from == INBOX {
            return Err(MailError::Storage("INBOX cannot be renamed".to_string()));
        }
        validate_mailbox_name(to)?;
        let mut tx = self.begin().await?;
        Self::mailbox_id(&mut tx, owner, from).await?;
        if Self::mailbox_exists(&mut tx, owner, to).await? {
            return Err(MailError::AlreadyExists(format!("mailbox {}", to)));
        }

        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM mailboxes WHERE owner = ?")
                .bind(owner)
                .fetch_all(&mut *tx)
                .await?;
        for (id, old_name) in rows {
            if old_name != from && !is_descendant(&old_name, from) {
                continue;
            }
            let new_name = format!("{}{}", to, &old_name[from.len()..]);
            sqlx::query("UPDATE mailboxes SET name = ? WHERE id = ?")
                .bind(new_name)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for parent in parent_names(to) {
            if !Self::mailbox_exists(&mut tx, owner, &parent).await? {
                Self::insert_mailbox(&mut tx, owner, &parent).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_message(
        &self,
        owner: &str,
        mailbox: &str,
        raw: &[u8],
        flags: Flags,
        internal_date: DateTime<Utc>,
    ) -> Result<MessageMeta> {
        let mut tx = self.begin().await?;
        let row: Option<(i64, i64, i64)> = sqlx::query_as(
            r#"
            UPDATE mailboxes
            SET uid_next = uid_next + 1, highest_modseq = highest_modseq + 1
            WHERE owner = ? AND name = ?
            RETURNING id, uid_next - 1, highest_modseq
            "#,
        )
        .bind(owner)
        .bind(mailbox)
        .fetch_optional(&mut *tx)
        .await?;
        let (mailbox_id, uid, modseq) =
            row.ok_or_else(|| MailError::NotFound(format!("mailbox {}", mailbox)))?;

        let internal_date = from_millis(to_millis(internal_date))?;
        let meta = MessageMeta {
            id: Uuid::new_v4(),
            uid: uid as Uid,
            flags,
            size: raw.len() as u64,
            internal_date,
            modseq: modseq as u64,
        };
        sqlx::query(
            r#"
            INSERT INTO messages (mailbox_id, uid, id, flags, size, internal_date, modseq, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(mailbox_id)
        .bind(uid)
        .bind(meta.id.to_string())
        .bind(flags.bits() as i64)
        .bind(raw.len() as i64)
        .bind(to_millis(internal_date))
        .bind(modseq)
        .bind(raw)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(meta)
    }

    async fn list_messages(&self, owner: &str, mailbox: &str) -> Result<Vec<MessageMeta>> {
        let mut conn = self.db.acquire().await?;
        let mailbox_id = Self::mailbox_id(&mut conn, owner, mailbox).await?;
        let rows = sqlx::query(
            r#"
            SELECT id, uid, flags, size, internal_date, modseq
            FROM messages WHERE mailbox_id = ? ORDER BY uid
            "#,
        )
        .bind(mailbox_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn message_body(&self, owner: &str, mailbox: &str, uid: Uid) -> Result<Option<Vec<u8>>> {
        let mut conn = self.db.acquire().await?;
        let mailbox_id = Self::mailbox_id(&mut conn, owner, mailbox).await?;
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT body FROM messages WHERE mailbox_id = ? AND uid = ?")
                .bind(mailbox_id)
                .bind(uid as i64)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(row.map(|(body,)| body))
    }

    async fn store_flags(
        &self,
        owner: &str,
        mailbox: &str,
        uids: &[Uid],
        update: FlagUpdate,
        flags: Flags,
    ) -> Result<Vec<(Uid, Flags)>> {
        let mut sorted = uids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut tx = self.begin().await?;
        let mailbox_id = Self::mailbox_id(&mut tx, owner, mailbox).await?;
        let mut updated = Vec::new();
        for uid in sorted {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT flags FROM messages WHERE mailbox_id = ? AND uid = ?")
                    .bind(mailbox_id)
                    .bind(uid as i64)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((bits,)) = current else {
                continue;
            };
            let current = flags_from_db(bits);
            let new_flags = update.apply(current, flags);
            if new_flags != current {
                let (modseq,): (i64,) = sqlx::query_as(
                    "UPDATE mailboxes SET highest_modseq = highest_modseq + 1 WHERE id = ? RETURNING highest_modseq",
                )
                .bind(mailbox_id)
                .fetch_one(&mut *tx)
                .await?;
                sqlx::query(
                    "UPDATE messages SET flags = ?, modseq = ? WHERE mailbox_id = ? AND uid = ?",
                )
                .bind(new_flags.bits() as i64)
                .bind(modseq)
                .bind(mailbox_id)
                .bind(uid as i64)
                .execute(&mut *tx)
                .await?;
            }
            updated.push((uid, new_flags));
        }
        tx.commit().await?;
        Ok(updated)
    }

    async fn expunge(&self, owner: &str, mailbox: &str) -> Result<Vec<Uid>> {
        let mut tx = self.begin().await?;
        let mailbox_id = Self::mailbox_id(&mut tx, owner, mailbox).await?;
        let rows: Vec<(i64,)> = sqlx::query_as(
            "DELETE FROM messages WHERE mailbox_id = ? AND (flags & ?) != 0 RETURNING uid",
        )
        .bind(mailbox_id)
        .bind(Flags::DELETED.bits() as i64)
        .fetch_all(&mut *tx)
        .await?;
        if !rows.is_empty() {
            sqlx::query("UPDATE mailboxes SET highest_modseq = highest_modseq + 1 WHERE id = ?")
                .bind(mailbox_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        // RETURNING order is unspecified
        let mut removed: Vec<Uid> = rows.into_iter().map(|(uid,)| uid as Uid).collect();
        removed.sort_unstable();
        Ok(removed)
    }

    async fn clear_recent(&self, owner: &str, mailbox: &str) -> Result<()> {
        let mut tx = self.begin().await?;
        let mailbox_id = Self::mailbox_id(&mut tx, owner, mailbox).await?;
        sqlx::query("UPDATE messages SET flags = flags & ? WHERE mailbox_id = ?")
            .bind((!Flags::RECENT).bits() as i64)
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_outbound_message(&self, raw: &[u8]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO outbound_messages (id, body, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(raw)
            .bind(to_millis(Utc::now()))
            .execute(&self.db)
            .await?;
        Ok(id)
    }

    async fn outbound_message(&self, id: Uuid) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as("SELECT body FROM outbound_messages WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(body,)| body))
    }

    async fn enqueue(&self, entry: NewQueueEntry) -> Result<QueueEntry> {
        let now = from_millis(to_millis(Utc::now()))?;
        let entry = QueueEntry::new(entry, now);
        sqlx::query(&format!(
            "INSERT INTO queue ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, NULL)",
            QUEUE_COLUMNS
        ))
        .bind(entry.id.to_string())
        .bind(entry.message_id.to_string())
        .bind(&entry.from_addr)
        .bind(&entry.to_addr)
        .bind(entry.priority as i64)
        .bind(entry.attempts as i64)
        .bind(entry.max_attempts as i64)
        .bind(entry.status.as_str())
        .bind(to_millis(entry.next_attempt))
        .bind(to_millis(entry.created_at))
        .execute(&self.db)
        .await?;
        Ok(entry)
    }

    async fn get_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM queue WHERE id = ?", QUEUE_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    async fn list_queue(&self, status: Option<QueueStatus>) -> Result<Vec<QueueEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM queue WHERE status = ? ORDER BY created_at, rowid",
                    QUEUE_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM queue ORDER BY created_at, rowid",
                    QUEUE_COLUMNS
                ))
                .fetch_all(&self.db)
                .await?
            }
        };
        rows.iter().map(queue_entry_from_row).collect()
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE queue
            SET status = 'processing', attempts = attempts + 1, last_attempt = ?
            WHERE id IN (
                SELECT id FROM queue
                WHERE status IN ('pending', 'queued', 'deferred') AND next_attempt <= ?
                ORDER BY priority DESC, next_attempt ASC
                LIMIT ?
            )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(to_millis(now))
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        let mut claimed = rows
            .iter()
            .map(queue_entry_from_row)
            .collect::<Result<Vec<_>>>()?;
        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_attempt.cmp(&b.next_attempt))
        });
        Ok(claimed)
    }

    async fn claim_entry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE queue
            SET status = 'processing', attempts = attempts + 1, last_attempt = ?
            WHERE id = ? AND status IN ('pending', 'queued', 'deferred')
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        ))
        .bind(to_millis(now))
        .bind(id.to_string())
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(queue_entry_from_row).transpose()
    }

    async fn mark_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.set_status(id, QueueStatus::Sent, None, Some(at)).await
    }

    async fn mark_deferred(
        &self,
        id: Uuid,
        error: &str,
        next_attempt: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'deferred', last_error = ?, next_attempt = ? WHERE id = ?",
        )
        .bind(error)
        .bind(to_millis(next_attempt))
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MailError::NotFound(format!("queue entry {}", id)));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.set_status(id, QueueStatus::Failed, Some(error), None).await
    }

    async fn mark_bounced(&self, id: Uuid, error: &str) -> Result<()> {
        self.set_status(id, QueueStatus::Bounced, Some(error), None).await
    }

    async fn requeue(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'queued', next_attempt = ? WHERE id = ? AND status = 'deferred'",
        )
        .bind(to_millis(now))
        .bind(id.to_string())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_queue_entry(id).await? {
            Some(_) => Ok(false),
            None => Err(MailError::NotFound(format!("queue entry {}", id))),
        }
    }

    async fn release_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE queue SET status = 'deferred', next_attempt = ? WHERE status = 'processing'",
        )
        .bind(to_millis(now))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract_tests;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_user_gets_inbox() {
        contract_tests::user_gets_inbox(&store().await).await;
    }

    #[tokio::test]
    async fn test_uids_strictly_increase() {
        contract_tests::uids_strictly_increase(&store().await).await;
    }

    #[tokio::test]
    async fn test_flags_and_expunge() {
        contract_tests::flags_and_expunge(&store().await).await;
    }

    #[tokio::test]
    async fn test_mailbox_lifecycle() {
        contract_tests::mailbox_lifecycle(&store().await).await;
    }

    #[tokio::test]
    async fn test_queue_claims_are_exclusive() {
        contract_tests::queue_claims_are_exclusive(&store().await).await;
    }

    #[tokio::test]
    async fn test_stale_claims_are_released() {
        contract_tests::stale_claims_are_released(&store().await).await;
    }

    #[tokio::test]
    async fn test_claims_respect_priority() {
        contract_tests::claims_respect_priority(&store().await).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("mail.db").display());
        let store = SqliteStore::connect(&url).await.unwrap();
        contract_tests::concurrent_claims_never_overlap(std::sync::Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_data_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("mail.db").display());

        let store = SqliteStore::connect(&url).await.unwrap();
        store.create_user("p@local.test", "h").await.unwrap();
        store
            .append_message("p@local.test", "INBOX", b"persisted", Flags::SEEN, Utc::now())
            .await
            .unwrap();
        drop(store);

        let store = SqliteStore::connect(&url).await.unwrap();
        let messages = store.list_messages("p@local.test", "INBOX").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].flags, Flags::SEEN);
        assert_eq!(
            store.message_body("p@local.test", "INBOX", 1).await.unwrap(),
            Some(b"persisted".to_vec())
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_flag_updates_and_expunges_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("mail.db").display());
        let store = std::sync::Arc::new(SqliteStore::connect(&url).await.unwrap());
        store.create_user("p@local.test", "h").await.unwrap();
        for n in 0..20 {
            let body = format!("Subject: {}\r\n\r\nbody", n);
            store
                .append_message("p@local.test", "INBOX", body.as_bytes(), Flags::empty(), Utc::now())
                .await
                .unwrap();
        }

        let mut tasks = Vec::new();
        for worker in 0..16u32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let mut errors = Vec::new();
                for round in 0..20u32 {
                    let result = if (worker + round) % 2 == 0 {
                        let uid = (worker + round) % 20 + 1;
                        store
                            .store_flags("p@local.test", "INBOX", &[uid], FlagUpdate::Add, Flags::SEEN)
                            .await
                            .map(|_| ())
                    } else {
                        store.expunge("p@local.test", "INBOX").await.map(|_| ())
                    };
                    if let Err(e) = result {
                        errors.push(e.to_string());
                    }
                }
                errors
            }));
        }

        let mut errors = Vec::new();
        for task in tasks {
            errors.extend(task.await.unwrap());
        }
        assert!(errors.is_empty(), "{} errors, first: {:?}", errors.len(), errors.first());

        let messages = store.list_messages("p@local.test", "INBOX").await.unwrap();
        assert_eq!(messages.len(), 20);
        let mailbox = store.get_mailbox("p@local.test", "INBOX").await.unwrap().unwrap();
        assert!(messages.iter().all(|m| m.modseq <= mailbox.highest_modseq));
    }
}
