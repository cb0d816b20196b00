// Queue records in SQLite, message buffers in memory

use crate::crypto::{random_id, VerifyKey};
use crate::smp::{now_millis, QUEUE_ID_LEN};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::RwLock;

/// Default cap on buffered messages per queue.
pub const MSG_QUEUE_QUOTA: usize = 128;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("queue not found")]
    NotFound,
    #[error("key does not match")]
    Auth,
    #[error("operation not allowed in queue state")]
    Prohibited,
    #[error("message quota exceeded")]
    Quota,
    #[error("no message")]
    NoMsg,
    #[error("active queue limit reached")]
    QueueLimit,
    #[error("could not allocate unique queue ids")]
    IdCollision,
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    New,
    Secured,
    Active,
    Disabled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::New => "new",
            QueueStatus::Secured => "secured",
            QueueStatus::Active => "active",
            QueueStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "new" => QueueStatus::New,
            "secured" => QueueStatus::Secured,
            "active" => QueueStatus::Active,
            _ => QueueStatus::Disabled,
        }
    }
}

/// A server-side queue record.
#[derive(Debug, Clone)]
pub struct QueueRec {
    pub recipient_id: Vec<u8>,
    pub sender_id: Vec<u8>,
    pub recipient_key: VerifyKey,
    pub sender_key: Option<VerifyKey>,
    pub notifier_id: Option<Vec<u8>>,
    pub status: QueueStatus,
    pub created_at: u64,
}

/// A buffered message awaiting delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_id: u64,
    pub timestamp: u64,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct MsgBuffer {
    messages: VecDeque<Message>,
    next_id: u64,
}

/// Persistent queue records plus in-memory FIFO buffers. Record writes go
/// through SQLite; buffered messages are deliberately not durable.
pub struct QueueStore {
    db_path: PathBuf,
    quota: usize,
    max_queues: usize,
    buffers: RwLock<HashMap<Vec<u8>, MsgBuffer>>,
}

impl QueueStore {
    pub fn new(base_dir: &Path, quota: usize, max_queues: usize) -> Result<Self, StoreError> {
        let db_path = if base_dir.extension().is_some() {
            base_dir.to_path_buf()
        } else {
            base_dir.join("queues.db")
        };
        let store = Self {
            db_path,
            quota,
            max_queues,
            buffers: RwLock::new(HashMap::new()),
        };
        store.initialize_db()?;
        Ok(store)
    }

    fn get_connection(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.db_path)?)
    }

    fn initialize_db(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = self.get_connection()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS queues (
                recipient_id BLOB PRIMARY KEY,
                sender_id BLOB UNIQUE NOT NULL,
                recipient_key BLOB NOT NULL,
                sender_key BLOB,
                notifier_id BLOB,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queues_sender ON queues(sender_id)",
            [],
        )?;
        Ok(())
    }

    /// Creates a queue for `recipient_key`, returning fresh recipient and
    /// sender ids. Id uniqueness is enforced by insert-or-fail on the
    /// unique columns.
    pub async fn create(&self, recipient_key: &VerifyKey) -> Result<(Vec<u8>, Vec<u8>), StoreError> {
        let conn = self.get_connection()?;

        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queues WHERE status != 'disabled'",
            [],
            |row| row.get(0),
        )?;
        if active as usize >= self.max_queues {
            return Err(StoreError::QueueLimit);
        }

        let created_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        for _ in 0..3 {
            let recipient_id = random_id(QUEUE_ID_LEN);
            let sender_id = random_id(QUEUE_ID_LEN);
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO queues
                   (recipient_id, sender_id, recipient_key, sender_key, notifier_id, status, created_at)
                 VALUES (?1, ?2, ?3, NULL, NULL, 'new', ?4)",
                params![
                    recipient_id,
                    sender_id,
                    recipient_key.to_bytes().to_vec(),
                    created_at
                ],
            )?;
            if inserted == 1 {
                self.buffers
                    .write()
                    .await
                    .insert(recipient_id.clone(), MsgBuffer {
                        messages: VecDeque::new(),
                        next_id: 1,
                    });
                return Ok((recipient_id, sender_id));
            }
        }
        Err(StoreError::IdCollision)
    }

    /// Sets the sender key, moving the queue from `New` to `Secured`.
    /// Idempotent with the identical key; any other key fails `Auth`.
    pub fn secure(&self, recipient_id: &[u8], sender_key: &VerifyKey) -> Result<(), StoreError> {
        let rec = self.get_by_recipient(recipient_id)?;
        match (&rec.sender_key, rec.status) {
            (Some(existing), _) => {
                if existing == sender_key {
                    Ok(())
                } else {
                    Err(StoreError::Auth)
                }
            }
            (None, QueueStatus::New) => {
                let conn = self.get_connection()?;
                conn.execute(
                    "UPDATE queues SET sender_key = ?1, status = 'secured' WHERE recipient_id = ?2",
                    params![sender_key.to_bytes().to_vec(), recipient_id],
                )?;
                Ok(())
            }
            (None, _) => Err(StoreError::Prohibited),
        }
    }

    pub fn get_by_recipient(&self, recipient_id: &[u8]) -> Result<QueueRec, StoreError> {
        self.get_queue("recipient_id", recipient_id)
    }

    pub fn get_by_sender(&self, sender_id: &[u8]) -> Result<QueueRec, StoreError> {
        self.get_queue("sender_id", sender_id)
    }

    fn get_queue(&self, column: &str, id: &[u8]) -> Result<QueueRec, StoreError> {
        let conn = self.get_connection()?;
        let sql = format!(
            "SELECT recipient_id, sender_id, recipient_key, sender_key, notifier_id, status, created_at
             FROM queues WHERE {column} = ?1"
        );
        let rec = conn
            .query_row(&sql, params![id], |row| {
                let recipient_key: Vec<u8> = row.get(2)?;
                let sender_key: Option<Vec<u8>> = row.get(3)?;
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    recipient_key,
                    sender_key,
                    row.get::<_, Option<Vec<u8>>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .optional()?
            .ok_or(StoreError::NotFound)?;

        let (recipient_id, sender_id, rkey, skey, notifier_id, status, created_at) = rec;
        Ok(QueueRec {
            recipient_id,
            sender_id,
            recipient_key: decode_key(&rkey)?,
            sender_key: skey.as_deref().map(decode_key).transpose()?,
            notifier_id,
            status: QueueStatus::from_str(&status),
            created_at: created_at as u64,
        })
    }

    /// Marks a secured queue active after its first delivered SEND.
    pub fn mark_active(&self, recipient_id: &[u8]) -> Result<(), StoreError> {
        let conn = self.get_connection()?;
        conn.execute(
            "UPDATE queues SET status = 'active' WHERE recipient_id = ?1 AND status = 'secured'",
            params![recipient_id],
        )?;
        Ok(())
    }

    /// Disables the queue: future SENDs are refused, the record remains.
    pub fn disable(&self, recipient_id: &[u8]) -> Result<(), StoreError> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            "UPDATE queues SET status = 'disabled' WHERE recipient_id = ?1",
            params![recipient_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Removes the queue record and its buffer.
    pub async fn delete(&self, recipient_id: &[u8]) -> Result<(), StoreError> {
        let conn = self.get_connection()?;
        let deleted = conn.execute(
            "DELETE FROM queues WHERE recipient_id = ?1",
            params![recipient_id],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound);
        }
        self.buffers.write().await.remove(recipient_id);
        Ok(())
    }

    /// Appends a message, assigning the next internal id. Returns the
    /// stored message and whether the buffer was empty before (the cue to
    /// push to a subscriber). Fails `Quota` at the per-queue cap, keeping
    /// the buffered messages.
    pub async fn enqueue(
        &self,
        recipient_id: &[u8],
        body: Vec<u8>,
    ) -> Result<(Message, bool), StoreError> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.entry(recipient_id.to_vec()).or_insert(MsgBuffer {
            messages: VecDeque::new(),
            next_id: 1,
        });
        if buffer.messages.len() >= self.quota {
            return Err(StoreError::Quota);
        }
        let was_empty = buffer.messages.is_empty();
        let message = Message {
            msg_id: buffer.next_id,
            timestamp: now_millis(),
            body,
        };
        buffer.next_id += 1;
        buffer.messages.push_back(message.clone());
        Ok((message, was_empty))
    }

    /// The message at the head of the buffer, if any.
    pub async fn peek(&self, recipient_id: &[u8]) -> Option<Message> {
        let buffers = self.buffers.read().await;
        buffers
            .get(recipient_id)
            .and_then(|b| b.messages.front().cloned())
    }

    /// Deletes the head message and returns the next one, if any.
    pub async fn ack(&self, recipient_id: &[u8]) -> Result<Option<Message>, StoreError> {
        let mut buffers = self.buffers.write().await;
        let buffer = buffers.get_mut(recipient_id).ok_or(StoreError::NoMsg)?;
        if buffer.messages.pop_front().is_none() {
            return Err(StoreError::NoMsg);
        }
        Ok(buffer.messages.front().cloned())
    }
}

fn decode_key(bytes: &[u8]) -> Result<VerifyKey, StoreError> {
    VerifyKey::from_bytes(bytes).map_err(|_| StoreError::Auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignKeyPair;
    use tempfile::tempdir;

    fn store(dir: &Path) -> QueueStore {
        QueueStore::new(dir, MSG_QUEUE_QUOTA, 1000).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = SignKeyPair::generate().verify_key();

        let (rid, sid) = store.create(&key).await.unwrap();
        assert_eq!(rid.len(), QUEUE_ID_LEN);
        assert_ne!(rid, sid);

        let rec = store.get_by_recipient(&rid).unwrap();
        assert_eq!(rec.sender_id, sid);
        assert_eq!(rec.recipient_key, key);
        assert_eq!(rec.status, QueueStatus::New);
        assert!(rec.sender_key.is_none());

        let by_sender = store.get_by_sender(&sid).unwrap();
        assert_eq!(by_sender.recipient_id, rid);
    }

    #[tokio::test]
    async fn test_ids_unique_across_queues() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = SignKeyPair::generate().verify_key();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let (rid, sid) = store.create(&key).await.unwrap();
            assert!(seen.insert(rid));
            assert!(seen.insert(sid));
        }
    }

    #[tokio::test]
    async fn test_secure_idempotent_same_key_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let rkey = SignKeyPair::generate().verify_key();
        let skey = SignKeyPair::generate().verify_key();

        let (rid, _) = store.create(&rkey).await.unwrap();
        store.secure(&rid, &skey).unwrap();
        assert_eq!(store.get_by_recipient(&rid).unwrap().status, QueueStatus::Secured);

        // same key again is fine
        store.secure(&rid, &skey).unwrap();

        // different key is not
        let other = SignKeyPair::generate().verify_key();
        assert!(matches!(store.secure(&rid, &other), Err(StoreError::Auth)));
    }

    #[tokio::test]
    async fn test_enqueue_fifo_and_quota() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), 2, 1000).unwrap();
        let key = SignKeyPair::generate().verify_key();
        let (rid, _) = store.create(&key).await.unwrap();

        let (m1, was_empty) = store.enqueue(&rid, b"one".to_vec()).await.unwrap();
        assert!(was_empty);
        let (m2, was_empty) = store.enqueue(&rid, b"two".to_vec()).await.unwrap();
        assert!(!was_empty);
        assert_eq!(m2.msg_id, m1.msg_id + 1);

        // quota reached, oldest retained
        assert!(matches!(
            store.enqueue(&rid, b"three".to_vec()).await,
            Err(StoreError::Quota)
        ));
        assert_eq!(store.peek(&rid).await.unwrap().body, b"one");

        // ack frees a slot and reveals the next message
        let next = store.ack(&rid).await.unwrap().unwrap();
        assert_eq!(next.body, b"two");
        store.enqueue(&rid, b"three".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_empty_is_no_msg() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = SignKeyPair::generate().verify_key();
        let (rid, _) = store.create(&key).await.unwrap();
        assert!(matches!(store.ack(&rid).await, Err(StoreError::NoMsg)));
    }

    #[tokio::test]
    async fn test_delete_removes_queue_and_buffer() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = SignKeyPair::generate().verify_key();
        let (rid, _) = store.create(&key).await.unwrap();
        store.enqueue(&rid, b"msg".to_vec()).await.unwrap();

        store.delete(&rid).await.unwrap();
        assert!(matches!(
            store.get_by_recipient(&rid),
            Err(StoreError::NotFound)
        ));
        assert!(store.peek(&rid).await.is_none());
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let dir = tempdir().unwrap();
        let store = QueueStore::new(dir.path(), MSG_QUEUE_QUOTA, 2).unwrap();
        let key = SignKeyPair::generate().verify_key();
        store.create(&key).await.unwrap();
        store.create(&key).await.unwrap();
        assert!(matches!(
            store.create(&key).await,
            Err(StoreError::QueueLimit)
        ));
    }

    #[tokio::test]
    async fn test_disable_is_terminal_record() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = SignKeyPair::generate().verify_key();
        let (rid, _) = store.create(&key).await.unwrap();

        store.disable(&rid).unwrap();
        assert_eq!(
            store.get_by_recipient(&rid).unwrap().status,
            QueueStatus::Disabled
        );
    }
}
