// Message and session rows.
//
// Row families:
//   session/{session_id}        -> Session
//   msg/{session_id}/{id}       -> Message
//   msgidx/{id}                 -> session_id (lookup by message id alone)
//   clockhead/{session_id}      -> pointwise max of every stored clock
//
// Status transitions and local clock appends are read-modify-write sections
// serialized behind an internal mutex; the session actor above this layer
// keeps per-session writers single-threaded, the mutex covers cross-session
// callers (failover, imports).

use super::backend::StorageBackend;
use super::{keys, StoreError};
use crate::clock::VectorClock;
use crate::message::{Message, MessageStatus, Session};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub struct MessageStore {
    backend: Arc<dyn StorageBackend>,
    write_lock: Mutex<()>,
}

fn session_key(session_id: &str) -> Vec<u8> {
    format!("{}{}", keys::SESSION, session_id).into_bytes()
}

fn message_key(session_id: &str, message_id: &str) -> Vec<u8> {
    format!("{}{}/{}", keys::MESSAGE, session_id, message_id).into_bytes()
}

fn index_key(message_id: &str) -> Vec<u8> {
    format!("{}{}", keys::MESSAGE_INDEX, message_id).into_bytes()
}

fn clock_head_key(session_id: &str) -> Vec<u8> {
    format!("{}{}", keys::CLOCK_HEAD, session_id).into_bytes()
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Corruption(e.to_string()))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl MessageStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            write_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn put_session(&self, session: &Session) -> Result<(), StoreError> {
        self.backend
            .put(&session_key(&session.session_id), &encode(session)?)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        match self.backend.get(&session_key(session_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();
        for (_, value) in self.backend.scan_prefix(keys::SESSION.as_bytes())? {
            sessions.push(decode(&value)?);
        }
        Ok(sessions)
    }

    /// Remove a session and every message row under it (explicit end-session)
    pub fn remove_session_rows(&self, session_id: &str) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock();
        let mut removed = 0;

        let prefix = format!("{}{}/", keys::MESSAGE, session_id);
        for (key, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            let msg: Message = decode(&value)?;
            self.backend.remove(&index_key(&msg.id))?;
            self.backend.remove(&key)?;
            removed += 1;
        }

        self.backend.remove(&clock_head_key(session_id))?;
        self.backend.remove(&session_key(session_id))?;
        debug!(session_id, removed, "removed session rows");
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a locally originated message.
    ///
    /// Enforces the local clock invariant: the message's counter for
    /// `local_device` must be strictly greater than the stored clock head,
    /// otherwise the write is rejected with `ClockInversion`.
    pub fn append_local(&self, msg: &Message, local_device: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();

        let head = self.clock_head_locked(&msg.session_id)?;
        let counter = msg.vector_clock.get(local_device);
        let existing = head.get(local_device);
        if counter <= existing {
            return Err(StoreError::ClockInversion {
                device: local_device.to_string(),
                counter,
                existing,
            });
        }

        self.write_message(msg)?;
        let new_head = VectorClock::pointwise_max(&head, &msg.vector_clock);
        self.backend
            .put(&clock_head_key(&msg.session_id), &encode(&new_head)?)
    }

    /// Insert a message observed from the wire or a sync response.
    /// Returns false (and writes nothing) when the id is already stored.
    pub fn insert_remote(&self, msg: &Message) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();

        if self.backend.get(&index_key(&msg.id))?.is_some() {
            return Ok(false);
        }

        self.write_message(msg)?;
        let head = self.clock_head_locked(&msg.session_id)?;
        let new_head = VectorClock::pointwise_max(&head, &msg.vector_clock);
        self.backend
            .put(&clock_head_key(&msg.session_id), &encode(&new_head)?)?;
        Ok(true)
    }

    fn write_message(&self, msg: &Message) -> Result<(), StoreError> {
        self.backend
            .put(&message_key(&msg.session_id, &msg.id), &encode(msg)?)?;
        self.backend
            .put(&index_key(&msg.id), msg.session_id.as_bytes())
    }

    /// Look up a message by id alone (via the index row)
    pub fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let session_id = match self.backend.get(&index_key(message_id))? {
            Some(bytes) => String::from_utf8(bytes)
                .map_err(|e| StoreError::Corruption(e.to_string()))?,
            None => return Ok(None),
        };

        match self.backend.get(&message_key(&session_id, message_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All messages in a session, ordered by wall-clock then id
    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let prefix = format!("{}{}/", keys::MESSAGE, session_id);
        let mut messages: Vec<Message> = Vec::new();
        for (_, value) in self.backend.scan_prefix(prefix.as_bytes())? {
            messages.push(decode(&value)?);
        }
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    pub fn count_messages(&self, session_id: &str) -> Result<usize, StoreError> {
        let prefix = format!("{}{}/", keys::MESSAGE, session_id);
        self.backend.count_prefix(prefix.as_bytes())
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Advance a message's status. Returns true if the row changed, false
    /// for a same-status no-op. Regressions are rejected.
    pub fn update_status(
        &self,
        message_id: &str,
        next: MessageStatus,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();

        let mut msg = self
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        if msg.status == next {
            return Ok(false);
        }
        if !msg.status.can_transition(next) {
            return Err(StoreError::IllegalTransition {
                id: message_id.to_string(),
                from: msg.status,
                to: next,
            });
        }

        debug!(message_id, from = %msg.status, to = %next, "status transition");
        msg.status = next;
        self.write_message(&msg)?;
        Ok(true)
    }

    /// Bump a message's delivery attempt counter
    pub fn record_attempt(&self, message_id: &str) -> Result<u32, StoreError> {
        let _guard = self.write_lock.lock();

        let mut msg = self
            .get_message(message_id)?
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;
        msg.attempts += 1;
        let attempts = msg.attempts;
        self.write_message(&msg)?;
        Ok(attempts)
    }

    // ------------------------------------------------------------------
    // Clock head
    // ------------------------------------------------------------------

    /// Pointwise max of every clock stored for this session
    pub fn clock_head(&self, session_id: &str) -> Result<VectorClock, StoreError> {
        let _guard = self.write_lock.lock();
        self.clock_head_locked(session_id)
    }

    fn clock_head_locked(&self, session_id: &str) -> Result<VectorClock, StoreError> {
        match self.backend.get(&clock_head_key(session_id))? {
            Some(bytes) => decode(&bytes),
            None => Ok(VectorClock::new()),
        }
    }
}
