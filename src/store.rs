//! SQLite store shared by every worker
//!
//! Holds the phone roster and message history. Each process opens its own
//! connection; SQLite's file locking arbitrates between them.

use crate::adapter::{DeliveryStatus, SmsEnvelope};
use crate::error::{Error, Result};
use crate::number::is_valid_number;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS phone (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    number TEXT NOT NULL UNIQUE,
    adapter TEXT NOT NULL,
    adapter_datas TEXT NOT NULL DEFAULT '{}'
);
CREATE TABLE IF NOT EXISTS scheduled (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    id_phone INTEGER NOT NULL,
    destination TEXT NOT NULL,
    text TEXT NOT NULL,
    flash INTEGER NOT NULL DEFAULT 0,
    at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sended (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    id_phone INTEGER NOT NULL,
    uid TEXT,
    text TEXT NOT NULL,
    destination TEXT NOT NULL,
    flash INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'unknown',
    at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS sended_uid ON sended (uid);
CREATE TABLE IF NOT EXISTS received (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    id_phone INTEGER NOT NULL,
    uid TEXT NOT NULL,
    text TEXT NOT NULL,
    origin TEXT NOT NULL,
    destination TEXT NOT NULL,
    flash INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'unknown',
    at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS webhook (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    type TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS webhook_query (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Webhook type fired for every received SMS
pub const WEBHOOK_RECEIVE_SMS: &str = "receive_sms";

/// A configured phone line
#[derive(Debug, Clone, PartialEq)]
pub struct Phone {
    pub id: i64,
    pub number: String,
    pub adapter: String,
    /// JSON blob validated against the adapter's schema
    pub adapter_datas: String,
}

/// An SMS waiting for its send time
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub id: i64,
    pub id_phone: i64,
    pub destination: String,
    pub text: String,
    pub flash: bool,
    pub at: DateTime<Utc>,
}

/// A sent or received SMS as stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSms {
    pub id: i64,
    pub id_phone: i64,
    pub envelope: SmsEnvelope,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Webhook {
    pub id: i64,
    pub url: String,
    pub kind: String,
}

/// A webhook call waiting to be made
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookQuery {
    pub id: i64,
    pub url: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database and its schema
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Phones
    // ------------------------------------------------------------------

    pub fn insert_phone(&self, number: &str, adapter: &str, adapter_datas: &str) -> Result<i64> {
        if !is_valid_number(number) {
            return Err(Error::Config(format!("invalid phone number: {:?}", number)));
        }
        self.conn.execute(
            "INSERT INTO phone (number, adapter, adapter_datas) VALUES (?1, ?2, ?3)",
            params![number, adapter, adapter_datas],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn phones(&self) -> Result<Vec<Phone>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, number, adapter, adapter_datas FROM phone ORDER BY id")?;
        let phones = stmt
            .query_map([], phone_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(phones)
    }

    pub fn phone(&self, id: i64) -> Result<Option<Phone>> {
        let phone = self
            .conn
            .query_row(
                "SELECT id, number, adapter, adapter_datas FROM phone WHERE id = ?1",
                [id],
                phone_from_row,
            )
            .optional()?;
        Ok(phone)
    }

    // ------------------------------------------------------------------
    // Scheduled messages
    // ------------------------------------------------------------------

    pub fn insert_scheduled(
        &self,
        id_phone: i64,
        destination: &str,
        text: &str,
        flash: bool,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO scheduled (id_phone, destination, text, flash, at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id_phone, destination, text, flash, at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Scheduled messages whose time has come, oldest first
    pub fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Scheduled>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, id_phone, destination, text, flash, at FROM scheduled WHERE at <= ?1 ORDER BY at, id",
        )?;
        let rows = stmt
            .query_map([now], |row| {
                Ok(Scheduled {
                    id: row.get(0)?,
                    id_phone: row.get(1)?,
                    destination: row.get(2)?,
                    text: row.get(3)?,
                    flash: row.get(4)?,
                    at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_scheduled(&self, id: i64) -> Result<bool> {
        let count = self.conn.execute("DELETE FROM scheduled WHERE id = ?1", [id])?;
        Ok(count > 0)
    }

    // ------------------------------------------------------------------
    // Sent messages
    // ------------------------------------------------------------------

    pub fn insert_sended(&self, id_phone: i64, envelope: &SmsEnvelope) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sended (id_phone, uid, text, destination, flash, status, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id_phone,
                envelope.uid,
                envelope.text,
                envelope.destination,
                envelope.flash,
                envelope.status.as_str(),
                envelope.at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Sent messages for a phone; origin is filled from the phone's number
    pub fn sendeds(&self, id_phone: i64) -> Result<Vec<StoredSms>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.id, s.id_phone, s.uid, s.text, p.number, s.destination, s.at, s.flash, s.status
             FROM sended s LEFT JOIN phone p ON p.id = s.id_phone
             WHERE s.id_phone = ?1 ORDER BY s.id",
        )?;
        let rows = stmt
            .query_map([id_phone], sms_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Record a delivery report. Returns how many rows matched `uid`.
    pub fn update_sended_status(&self, uid: &str, status: DeliveryStatus) -> Result<usize> {
        let count = self.conn.execute(
            "UPDATE sended SET status = ?1 WHERE uid = ?2",
            params![status.as_str(), uid],
        )?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Received messages
    // ------------------------------------------------------------------

    pub fn insert_received(&self, id_phone: i64, envelope: &SmsEnvelope) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO received (id_phone, uid, text, origin, destination, flash, status, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id_phone,
                envelope.uid,
                envelope.text,
                envelope.origin,
                envelope.destination,
                envelope.flash,
                envelope.status.as_str(),
                envelope.at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn receiveds(&self, id_phone: i64) -> Result<Vec<StoredSms>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, id_phone, uid, text, origin, destination, at, flash, status
             FROM received WHERE id_phone = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([id_phone], sms_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------

    pub fn insert_webhook(&self, url: &str, kind: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO webhook (url, type) VALUES (?1, ?2)",
            params![url, kind],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn webhooks_by_type(&self, kind: &str) -> Result<Vec<Webhook>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, url, type FROM webhook WHERE type = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map([kind], |row| {
                Ok(Webhook {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    kind: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn enqueue_webhook_query(&self, url: &str, body: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO webhook_query (url, body, created_at) VALUES (?1, ?2, ?3)",
            params![url, body, Utc::now()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Oldest queued webhook calls, at most `limit`
    pub fn webhook_queries(&self, limit: usize) -> Result<Vec<WebhookQuery>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, url, body, created_at FROM webhook_query ORDER BY id LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], |row| {
                Ok(WebhookQuery {
                    id: row.get(0)?,
                    url: row.get(1)?,
                    body: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn delete_webhook_query(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM webhook_query WHERE id = ?1", [id])?;
        Ok(count > 0)
    }
}

fn phone_from_row(row: &Row<'_>) -> rusqlite::Result<Phone> {
    Ok(Phone {
        id: row.get(0)?,
        number: row.get(1)?,
        adapter: row.get(2)?,
        adapter_datas: row.get(3)?,
    })
}

/// Columns: id, id_phone, uid, text, origin, destination, at, flash, status
fn sms_from_row(row: &Row<'_>) -> rusqlite::Result<StoredSms> {
    let status: String = row.get(8)?;
    Ok(StoredSms {
        id: row.get(0)?,
        id_phone: row.get(1)?,
        envelope: SmsEnvelope {
            uid: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            text: row.get(3)?,
            origin: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
            destination: row.get(5)?,
            at: row.get(6)?,
            flash: row.get(7)?,
            status: DeliveryStatus::parse(&status),
        },
    })
}
