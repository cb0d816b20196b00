// Agent persistence: connections, queue credentials, message log

use crate::agent::command::MsgStatus;
use crate::crypto::{EncKeyPair, EncryptKey, SignKeyPair, VerifyKey};
use crate::smp::address::SmpServer;
use crate::smp::error::AgentError;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Ordered schema migrations, applied at startup inside one transaction;
/// `PRAGMA user_version` records how many have run.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE connections (
        conn_alias TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE rcv_queues (
        conn_alias TEXT PRIMARY KEY REFERENCES connections(conn_alias) ON DELETE CASCADE,
        server TEXT NOT NULL,
        rcpt_id BLOB NOT NULL,
        rcpt_priv_key BLOB NOT NULL,
        enc_priv_key BLOB NOT NULL,
        sender_id BLOB NOT NULL,
        peer_key BLOB,
        status TEXT NOT NULL,
        last_msg_id INTEGER NOT NULL DEFAULT 0,
        prev_hash BLOB NOT NULL DEFAULT x''
    )",
    "CREATE UNIQUE INDEX idx_rcv_queues_rcpt ON rcv_queues(server, rcpt_id)",
    "CREATE TABLE snd_queues (
        conn_alias TEXT PRIMARY KEY REFERENCES connections(conn_alias) ON DELETE CASCADE,
        server TEXT NOT NULL,
        sender_id BLOB NOT NULL,
        snd_priv_key BLOB NOT NULL,
        enc_key BLOB NOT NULL,
        status TEXT NOT NULL,
        last_msg_id INTEGER NOT NULL DEFAULT 0,
        prev_hash BLOB NOT NULL DEFAULT x''
    )",
    "CREATE TABLE messages (
        conn_alias TEXT NOT NULL,
        direction TEXT NOT NULL,
        agent_msg_id INTEGER NOT NULL,
        ts INTEGER NOT NULL,
        body BLOB NOT NULL,
        status TEXT NOT NULL,
        broker_msg_id INTEGER,
        PRIMARY KEY (conn_alias, direction, agent_msg_id)
    )",
];

#[derive(Debug, Error)]
pub enum AgentStoreError {
    #[error("connection not found")]
    NotFound,
    #[error("connection alias already used")]
    AliasTaken,
    #[error("queue already attached")]
    QueueExists,
    #[error("stored record is malformed")]
    BadRecord,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<AgentStoreError> for AgentError {
    fn from(e: AgentStoreError) -> Self {
        match e {
            AgentStoreError::NotFound => AgentError::Store("not_found".to_string()),
            AgentStoreError::AliasTaken => AgentError::Store("alias_taken".to_string()),
            AgentStoreError::QueueExists => AgentError::Store("queue_exists".to_string()),
            AgentStoreError::BadRecord => AgentError::Store("bad_record".to_string()),
            AgentStoreError::Sqlite(_) => AgentError::Store("database".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    New,
    Joined,
    Confirmed,
    Active,
    Disabled,
}

impl ConnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnStatus::New => "new",
            ConnStatus::Joined => "joined",
            ConnStatus::Confirmed => "confirmed",
            ConnStatus::Active => "active",
            ConnStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "new" => ConnStatus::New,
            "joined" => ConnStatus::Joined,
            "confirmed" => ConnStatus::Confirmed,
            "active" => ConnStatus::Active,
            _ => ConnStatus::Disabled,
        }
    }
}

/// The receive side of a connection: our queue on some server.
#[derive(Debug, Clone)]
pub struct RcvQueueRec {
    pub conn_alias: String,
    pub server: SmpServer,
    pub recipient_id: Vec<u8>,
    pub recipient_key: SignKeyPair,
    pub enc_key: EncKeyPair,
    pub sender_id: Vec<u8>,
    pub peer_key: Option<VerifyKey>,
    pub secured: bool,
    pub last_msg_id: u64,
    pub prev_hash: Vec<u8>,
}

/// The send side of a connection: the peer's queue we write into.
#[derive(Debug, Clone)]
pub struct SndQueueRec {
    pub conn_alias: String,
    pub server: SmpServer,
    pub sender_id: Vec<u8>,
    pub sender_key: SignKeyPair,
    pub enc_key: EncryptKey,
    pub status: ConnStatus,
    pub last_msg_id: u64,
    pub prev_hash: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ConnRec {
    pub alias: String,
    pub status: ConnStatus,
    pub rcv: Option<RcvQueueRec>,
    pub snd: Option<SndQueueRec>,
}

/// What a received message did to the connection's chain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcvOutcome {
    /// Already seen; drop silently (chain untouched).
    pub duplicate: bool,
    pub status: MsgStatus,
}

/// All writes go through one serialized connection handle; reads share it.
pub struct AgentStore {
    inner: Mutex<Connection>,
}

impl AgentStore {
    pub fn new(path: &Path) -> Result<Self, AgentStoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let store = Self {
            inner: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, AgentStoreError> {
        let store = Self {
            inner: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let applied: i64 = guard.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let applied = applied as usize;
        if applied >= MIGRATIONS.len() {
            return Ok(());
        }
        let tx = guard.transaction()?;
        for migration in &MIGRATIONS[applied..] {
            tx.execute(migration, [])?;
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", MIGRATIONS.len()))?;
        tx.commit()?;
        Ok(())
    }

    fn now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    /// Creates a connection together with its receive queue.
    pub fn create_rcv_conn(&self, rcv: &RcvQueueRec) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO connections (conn_alias, status, created_at) VALUES (?1, 'new', ?2)",
            params![rcv.conn_alias, Self::now()],
        )?;
        if inserted == 0 {
            return Err(AgentStoreError::AliasTaken);
        }
        insert_rcv_queue(&tx, rcv)?;
        tx.commit()?;
        Ok(())
    }

    /// Creates a connection together with its send queue (the joiner path).
    pub fn create_snd_conn(&self, snd: &SndQueueRec) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO connections (conn_alias, status, created_at) VALUES (?1, 'joined', ?2)",
            params![snd.conn_alias, Self::now()],
        )?;
        if inserted == 0 {
            return Err(AgentStoreError::AliasTaken);
        }
        insert_snd_queue(&tx, snd)?;
        tx.commit()?;
        Ok(())
    }

    /// Attaches the reverse-direction send queue to an existing connection.
    pub fn attach_snd_queue(&self, snd: &SndQueueRec) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM connections WHERE conn_alias = ?1",
                params![snd.conn_alias],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(AgentStoreError::NotFound);
        }
        insert_snd_queue(&tx, snd)?;
        tx.commit()?;
        Ok(())
    }

    /// Attaches a receive queue to an existing connection (the joiner's
    /// reply queue).
    pub fn attach_rcv_queue(&self, rcv: &RcvQueueRec) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM connections WHERE conn_alias = ?1",
                params![rcv.conn_alias],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(AgentStoreError::NotFound);
        }
        insert_rcv_queue(&tx, rcv)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_conn(&self, alias: &str) -> Result<ConnRec, AgentStoreError> {
        let guard = self.conn();
        let status: Option<String> = guard
            .query_row(
                "SELECT status FROM connections WHERE conn_alias = ?1",
                params![alias],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or(AgentStoreError::NotFound)?;
        let rcv = query_rcv_queue(&guard, alias)?;
        let snd = query_snd_queue(&guard, alias)?;
        Ok(ConnRec {
            alias: alias.to_string(),
            status: ConnStatus::from_str(&status),
            rcv,
            snd,
        })
    }

    pub fn set_conn_status(&self, alias: &str, status: ConnStatus) -> Result<(), AgentStoreError> {
        let updated = self.conn().execute(
            "UPDATE connections SET status = ?1 WHERE conn_alias = ?2",
            params![status.as_str(), alias],
        )?;
        if updated == 0 {
            return Err(AgentStoreError::NotFound);
        }
        Ok(())
    }

    pub fn set_rcv_secured(&self, alias: &str) -> Result<(), AgentStoreError> {
        self.conn().execute(
            "UPDATE rcv_queues SET status = 'secured' WHERE conn_alias = ?1",
            params![alias],
        )?;
        Ok(())
    }

    pub fn set_peer_key(&self, alias: &str, key: &VerifyKey) -> Result<(), AgentStoreError> {
        self.conn().execute(
            "UPDATE rcv_queues SET peer_key = ?1 WHERE conn_alias = ?2",
            params![key.to_bytes().to_vec(), alias],
        )?;
        Ok(())
    }

    pub fn set_snd_status(&self, alias: &str, status: ConnStatus) -> Result<(), AgentStoreError> {
        self.conn().execute(
            "UPDATE snd_queues SET status = ?1 WHERE conn_alias = ?2",
            params![status.as_str(), alias],
        )?;
        Ok(())
    }

    /// Appends a received message and advances the receive chain in one
    /// transaction. Duplicates (id at or below the chain head) change
    /// nothing. A hash mismatch is recorded but the chain still advances,
    /// so one corrupt message cannot wedge the connection.
    #[allow(clippy::too_many_arguments)]
    pub fn append_rcv_message(
        &self,
        alias: &str,
        agent_msg_id: u64,
        agent_ts: u64,
        claimed_prev: &[u8],
        msg_hash: &[u8],
        body: &[u8],
        broker_msg_id: u64,
    ) -> Result<RcvOutcome, AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;

        let row: Option<(i64, Vec<u8>)> = tx
            .query_row(
                "SELECT last_msg_id, prev_hash FROM rcv_queues WHERE conn_alias = ?1",
                params![alias],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (last_msg_id, prev_hash) = row.ok_or(AgentStoreError::NotFound)?;
        let last_msg_id = last_msg_id as u64;

        if agent_msg_id <= last_msg_id && last_msg_id != 0 {
            return Ok(RcvOutcome {
                duplicate: true,
                status: MsgStatus::Ok,
            });
        }

        let status = if claimed_prev != prev_hash.as_slice() {
            MsgStatus::BadHash
        } else if agent_msg_id > last_msg_id + 1 {
            MsgStatus::Skipped {
                from: last_msg_id + 1,
                to: agent_msg_id - 1,
            }
        } else {
            MsgStatus::Ok
        };

        tx.execute(
            "UPDATE rcv_queues SET last_msg_id = ?1, prev_hash = ?2 WHERE conn_alias = ?3",
            params![agent_msg_id as i64, msg_hash, alias],
        )?;
        tx.execute(
            "INSERT INTO messages (conn_alias, direction, agent_msg_id, ts, body, status, broker_msg_id)
             VALUES (?1, 'rcv', ?2, ?3, ?4, ?5, ?6)",
            params![
                alias,
                agent_msg_id as i64,
                agent_ts as i64,
                body,
                match status {
                    MsgStatus::Ok => "ok",
                    MsgStatus::BadHash => "bad_hash",
                    MsgStatus::Skipped { .. } => "skipped",
                },
                broker_msg_id as i64
            ],
        )?;
        tx.commit()?;
        Ok(RcvOutcome {
            duplicate: false,
            status,
        })
    }

    /// The id and chain link for the next message to send.
    pub fn prepare_snd_message(&self, alias: &str) -> Result<(u64, Vec<u8>), AgentStoreError> {
        let guard = self.conn();
        let row: Option<(i64, Vec<u8>)> = guard
            .query_row(
                "SELECT last_msg_id, prev_hash FROM snd_queues WHERE conn_alias = ?1",
                params![alias],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (last, prev) = row.ok_or(AgentStoreError::NotFound)?;
        Ok(((last as u64) + 1, prev))
    }

    /// Records a sent message and advances the send chain.
    pub fn commit_snd_message(
        &self,
        alias: &str,
        agent_msg_id: u64,
        msg_hash: &[u8],
        agent_ts: u64,
        body: &[u8],
    ) -> Result<(), AgentStoreError> {
        let mut guard = self.conn();
        let tx = guard.transaction()?;
        tx.execute(
            "UPDATE snd_queues SET last_msg_id = ?1, prev_hash = ?2 WHERE conn_alias = ?3",
            params![agent_msg_id as i64, msg_hash, alias],
        )?;
        tx.execute(
            "INSERT INTO messages (conn_alias, direction, agent_msg_id, ts, body, status, broker_msg_id)
             VALUES (?1, 'snd', ?2, ?3, ?4, 'sent', NULL)",
            params![alias, agent_msg_id as i64, agent_ts as i64, body],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Marks a delivered message acknowledged by the local client.
    pub fn mark_acked(&self, alias: &str, agent_msg_id: u64) -> Result<(), AgentStoreError> {
        self.conn().execute(
            "UPDATE messages SET status = 'acked'
             WHERE conn_alias = ?1 AND direction = 'rcv' AND agent_msg_id = ?2",
            params![alias, agent_msg_id as i64],
        )?;
        Ok(())
    }

    /// Every receive queue the agent knows, for resubscription.
    pub fn all_rcv_queues(&self) -> Result<Vec<RcvQueueRec>, AgentStoreError> {
        let guard = self.conn();
        let mut stmt = guard.prepare(
            "SELECT conn_alias, server, rcpt_id, rcpt_priv_key, enc_priv_key, sender_id,
                    peer_key, status, last_msg_id, prev_hash
             FROM rcv_queues",
        )?;
        let rows = stmt.query_map([], rcv_from_row)?;
        let mut queues = Vec::new();
        for row in rows {
            queues.push(row?.ok_or(AgentStoreError::BadRecord)?);
        }
        Ok(queues)
    }

    /// Resolves an inbound broker message to a connection alias.
    pub fn alias_by_recipient(
        &self,
        server: &SmpServer,
        recipient_id: &[u8],
    ) -> Result<Option<String>, AgentStoreError> {
        let guard = self.conn();
        let alias: Option<String> = guard
            .query_row(
                "SELECT conn_alias FROM rcv_queues WHERE server = ?1 AND rcpt_id = ?2",
                params![server.serialize(), recipient_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(alias)
    }
}

fn insert_rcv_queue(tx: &rusqlite::Transaction<'_>, rcv: &RcvQueueRec) -> Result<(), AgentStoreError> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO rcv_queues
           (conn_alias, server, rcpt_id, rcpt_priv_key, enc_priv_key, sender_id, peer_key, status, last_msg_id, prev_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rcv.conn_alias,
            rcv.server.serialize(),
            rcv.recipient_id,
            rcv.recipient_key.to_bytes().to_vec(),
            rcv.enc_key.to_bytes().to_vec(),
            rcv.sender_id,
            rcv.peer_key.as_ref().map(|k| k.to_bytes().to_vec()),
            if rcv.secured { "secured" } else { "new" },
            rcv.last_msg_id as i64,
            rcv.prev_hash,
        ],
    )?;
    if inserted == 0 {
        return Err(AgentStoreError::QueueExists);
    }
    Ok(())
}

fn insert_snd_queue(tx: &rusqlite::Transaction<'_>, snd: &SndQueueRec) -> Result<(), AgentStoreError> {
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO snd_queues
           (conn_alias, server, sender_id, snd_priv_key, enc_key, status, last_msg_id, prev_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            snd.conn_alias,
            snd.server.serialize(),
            snd.sender_id,
            snd.sender_key.to_bytes().to_vec(),
            snd.enc_key.to_bytes().to_vec(),
            snd.status.as_str(),
            snd.last_msg_id as i64,
            snd.prev_hash,
        ],
    )?;
    if inserted == 0 {
        return Err(AgentStoreError::QueueExists);
    }
    Ok(())
}

type RcvRow = (
    String,
    String,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    Vec<u8>,
    Option<Vec<u8>>,
    String,
    i64,
    Vec<u8>,
);

fn rcv_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<RcvQueueRec>> {
    let raw: RcvRow = (
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    );
    Ok(build_rcv(raw))
}

fn build_rcv(raw: RcvRow) -> Option<RcvQueueRec> {
    let (alias, server, rcpt_id, rcpt_key, enc_key, sender_id, peer_key, status, last, prev) = raw;
    Some(RcvQueueRec {
        conn_alias: alias,
        server: SmpServer::parse(&server).ok()?,
        recipient_id: rcpt_id,
        recipient_key: SignKeyPair::from_bytes(&rcpt_key).ok()?,
        enc_key: EncKeyPair::from_bytes(&enc_key).ok()?,
        sender_id,
        peer_key: match peer_key {
            Some(bytes) => Some(VerifyKey::from_bytes(&bytes).ok()?),
            None => None,
        },
        secured: status == "secured",
        last_msg_id: last as u64,
        prev_hash: prev,
    })
}

fn query_rcv_queue(
    conn: &Connection,
    alias: &str,
) -> Result<Option<RcvQueueRec>, AgentStoreError> {
    let raw: Option<RcvRow> = conn
        .query_row(
            "SELECT conn_alias, server, rcpt_id, rcpt_priv_key, enc_priv_key, sender_id,
                    peer_key, status, last_msg_id, prev_hash
             FROM rcv_queues WHERE conn_alias = ?1",
            params![alias],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                    row.get(9)?,
                ))
            },
        )
        .optional()?;
    match raw {
        None => Ok(None),
        Some(raw) => build_rcv(raw)
            .map(Some)
            .ok_or(AgentStoreError::BadRecord),
    }
}

fn query_snd_queue(
    conn: &Connection,
    alias: &str,
) -> Result<Option<SndQueueRec>, AgentStoreError> {
    type SndRow = (String, String, Vec<u8>, Vec<u8>, Vec<u8>, String, i64, Vec<u8>);
    let raw: Option<SndRow> = conn
        .query_row(
            "SELECT conn_alias, server, sender_id, snd_priv_key, enc_key, status, last_msg_id, prev_hash
             FROM snd_queues WHERE conn_alias = ?1",
            params![alias],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                ))
            },
        )
        .optional()?;
    let Some((alias, server, sender_id, snd_key, enc_key, status, last, prev)) = raw else {
        return Ok(None);
    };
    let rec = SndQueueRec {
        conn_alias: alias,
        server: SmpServer::parse(&server).map_err(|_| AgentStoreError::BadRecord)?,
        sender_id,
        sender_key: SignKeyPair::from_bytes(&snd_key).map_err(|_| AgentStoreError::BadRecord)?,
        enc_key: EncryptKey::from_bytes(&enc_key).map_err(|_| AgentStoreError::BadRecord)?,
        status: ConnStatus::from_str(&status),
        last_msg_id: last as u64,
        prev_hash: prev,
    };
    Ok(Some(rec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::envelope::chain_hash;
    use crate::crypto::random_id;

    fn rcv(alias: &str) -> RcvQueueRec {
        RcvQueueRec {
            conn_alias: alias.to_string(),
            server: SmpServer::parse("localhost:5223").unwrap(),
            recipient_id: random_id(24),
            recipient_key: SignKeyPair::generate(),
            enc_key: EncKeyPair::generate(),
            sender_id: random_id(24),
            peer_key: None,
            secured: false,
            last_msg_id: 0,
            prev_hash: Vec::new(),
        }
    }

    fn snd(alias: &str) -> SndQueueRec {
        SndQueueRec {
            conn_alias: alias.to_string(),
            server: SmpServer::parse("localhost:5223").unwrap(),
            sender_id: random_id(24),
            sender_key: SignKeyPair::generate(),
            enc_key: EncKeyPair::generate().public(),
            status: ConnStatus::Joined,
            last_msg_id: 0,
            prev_hash: Vec::new(),
        }
    }

    #[test]
    fn test_create_and_get_conn() {
        let store = AgentStore::in_memory().unwrap();
        let queue = rcv("alice");
        store.create_rcv_conn(&queue).unwrap();

        let conn = store.get_conn("alice").unwrap();
        assert_eq!(conn.status, ConnStatus::New);
        let got = conn.rcv.unwrap();
        assert_eq!(got.recipient_id, queue.recipient_id);
        assert_eq!(
            got.recipient_key.verify_key(),
            queue.recipient_key.verify_key()
        );
        assert!(conn.snd.is_none());
    }

    #[test]
    fn test_alias_collision() {
        let store = AgentStore::in_memory().unwrap();
        store.create_rcv_conn(&rcv("dup")).unwrap();
        assert!(matches!(
            store.create_rcv_conn(&rcv("dup")),
            Err(AgentStoreError::AliasTaken)
        ));
    }

    #[test]
    fn test_attach_snd_queue() {
        let store = AgentStore::in_memory().unwrap();
        store.create_rcv_conn(&rcv("conn")).unwrap();
        store.attach_snd_queue(&snd("conn")).unwrap();

        let conn = store.get_conn("conn").unwrap();
        assert!(conn.rcv.is_some());
        assert!(conn.snd.is_some());

        assert!(matches!(
            store.attach_snd_queue(&snd("missing")),
            Err(AgentStoreError::NotFound)
        ));
    }

    #[test]
    fn test_rcv_chain_advances() {
        let store = AgentStore::in_memory().unwrap();
        store.create_rcv_conn(&rcv("c")).unwrap();

        let first = b"serialized first message";
        let h1 = chain_hash(first);
        let out = store
            .append_rcv_message("c", 1, 10, &[], &h1, b"one", 1)
            .unwrap();
        assert!(!out.duplicate);
        assert_eq!(out.status, MsgStatus::Ok);

        // chain parent must now be h1
        let h2 = chain_hash(b"second");
        let out = store
            .append_rcv_message("c", 2, 11, &h1, &h2, b"two", 2)
            .unwrap();
        assert_eq!(out.status, MsgStatus::Ok);

        let queue = store.get_conn("c").unwrap().rcv.unwrap();
        assert_eq!(queue.last_msg_id, 2);
        assert_eq!(queue.prev_hash, h2);
    }

    #[test]
    fn test_rcv_bad_hash_still_advances() {
        let store = AgentStore::in_memory().unwrap();
        store.create_rcv_conn(&rcv("c")).unwrap();
        let h1 = chain_hash(b"first");
        store
            .append_rcv_message("c", 1, 10, &[], &h1, b"one", 1)
            .unwrap();

        let h2 = chain_hash(b"second");
        let out = store
            .append_rcv_message("c", 2, 11, b"wrong parent", &h2, b"two", 2)
            .unwrap();
        assert_eq!(out.status, MsgStatus::BadHash);
        assert_eq!(store.get_conn("c").unwrap().rcv.unwrap().prev_hash, h2);
    }

    #[test]
    fn test_rcv_duplicate_and_skip() {
        let store = AgentStore::in_memory().unwrap();
        store.create_rcv_conn(&rcv("c")).unwrap();
        let h1 = chain_hash(b"first");
        store
            .append_rcv_message("c", 1, 10, &[], &h1, b"one", 1)
            .unwrap();

        let dup = store
            .append_rcv_message("c", 1, 10, &[], &h1, b"one", 1)
            .unwrap();
        assert!(dup.duplicate);

        let h4 = chain_hash(b"fourth");
        let out = store
            .append_rcv_message("c", 4, 12, &h1, &h4, b"four", 4)
            .unwrap();
        assert_eq!(out.status, MsgStatus::Skipped { from: 2, to: 3 });
    }

    #[test]
    fn test_snd_chain() {
        let store = AgentStore::in_memory().unwrap();
        store.create_snd_conn(&snd("j")).unwrap();

        let (id, prev) = store.prepare_snd_message("j").unwrap();
        assert_eq!(id, 1);
        assert!(prev.is_empty());

        let h = chain_hash(b"first sent");
        store.commit_snd_message("j", 1, &h, 5, b"body").unwrap();

        let (id, prev) = store.prepare_snd_message("j").unwrap();
        assert_eq!(id, 2);
        assert_eq!(prev, h);
    }

    #[test]
    fn test_alias_by_recipient() {
        let store = AgentStore::in_memory().unwrap();
        let queue = rcv("lookup");
        store.create_rcv_conn(&queue).unwrap();

        let found = store
            .alias_by_recipient(&queue.server, &queue.recipient_id)
            .unwrap();
        assert_eq!(found.as_deref(), Some("lookup"));

        let missing = store
            .alias_by_recipient(&queue.server, &random_id(24))
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_migrations_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.db");
        {
            let store = AgentStore::new(&path).unwrap();
            store.create_rcv_conn(&rcv("persisted")).unwrap();
        }
        // reopening applies no further migrations and keeps the data
        let store = AgentStore::new(&path).unwrap();
        assert!(store.get_conn("persisted").is_ok());
    }
}
