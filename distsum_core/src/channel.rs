//! The communication channel built over the shared replicated store.
//!
//! Each participant owns a `Channel` handle over its replica of the store.
//! Messages are never sent point-to-point: a send is a write under the
//! recipient's inbox, a receive is a scan of one's own inbox.
//!
//! # Key layout
//!
//! ```text
//! distsum/members/{id}                         registration marker
//! distsum/inbox/{recipient}/{sender}/{seq:020} one encoded message
//! distsum/cursor/{recipient}/{sender}          highest delivered seq
//! ```
//!
//! Each inbox key has exactly one writer (the sender) and each cursor key
//! exactly one writer (the recipient), so no two participants ever race on
//! a key. Sequence numbers are zero-padded so that
//! key order equals send order within one sender.

use crate::config::ProtocolConfig;
use crate::error::ProtocolError;
use crate::message::Message;
use distsum_env::{ParticipantId, ReplicatedStore};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const MEMBERS_PREFIX: &str = "distsum/members/";
const INBOX_PREFIX: &str = "distsum/inbox/";
const CURSOR_PREFIX: &str = "distsum/cursor/";

fn member_key(id: &ParticipantId) -> String {
    format!("{}{}", MEMBERS_PREFIX, id)
}

fn inbox_prefix(recipient: &ParticipantId) -> String {
    format!("{}{}/", INBOX_PREFIX, recipient)
}

fn stream_prefix(recipient: &ParticipantId, sender: &ParticipantId) -> String {
    format!("{}{}/{}/", INBOX_PREFIX, recipient, sender)
}

fn inbox_key(recipient: &ParticipantId, sender: &ParticipantId, seq: u64) -> String {
    format!("{}{:020}", stream_prefix(recipient, sender), seq)
}

fn cursor_key(recipient: &ParticipantId, sender: &ParticipantId) -> String {
    format!("{}{}/{}", CURSOR_PREFIX, recipient, sender)
}

/// Splits the `{sender}/{seq}` tail of an inbox key.
fn parse_stream_tail(tail: &str) -> Option<(ParticipantId, u64)> {
    let (sender, seq) = tail.split_once('/')?;
    let sender = ParticipantId::new(sender).ok()?;
    let seq = seq.parse().ok()?;
    Some((sender, seq))
}

/// A local handle that messages can be pushed to.
///
/// Implemented by [`crate::Master`] and [`crate::Slave`].
pub trait Participant: Send + Sync {
    fn id(&self) -> &ParticipantId;

    /// Handles one message delivered by [`Channel::pump`].
    fn on_message(&self, message: Message) -> Result<(), ProtocolError>;
}

/// Multiplexes slave/master traffic over a shared keyed store.
pub struct Channel<S: ReplicatedStore + ?Sized> {
    store: Arc<S>,

    /// Remove messages from the store once delivered
    prune_delivered: bool,

    /// Participants registered through this handle
    registry: RwLock<HashMap<ParticipantId, Arc<dyn Participant>>>,

    /// Next sequence number per (sender, recipient)
    outgoing: Mutex<HashMap<(ParticipantId, ParticipantId), u64>>,

    /// Highest delivered sequence number per (recipient, sender)
    cursors: Mutex<HashMap<(ParticipantId, ParticipantId), u64>>,
}

impl<S: ReplicatedStore + ?Sized> Channel<S> {
    /// Creates a channel over the given store replica.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            prune_delivered: true,
            registry: RwLock::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a channel honouring the protocol configuration.
    pub fn with_config(store: Arc<S>, config: &ProtocolConfig) -> Self {
        let mut channel = Self::new(store);
        channel.prune_delivered = config.prune_delivered;
        channel
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Associates `id` with a local handle and announces it in the store.
    ///
    /// Fails with `DuplicateRegistration` if `id` is already registered on
    /// this channel; the existing registration is left untouched. The
    /// handle must answer to `id`.
    pub fn register(
        &self,
        id: ParticipantId,
        participant: Arc<dyn Participant>,
    ) -> Result<(), ProtocolError> {
        if id.is_nobody() {
            return Err(ProtocolError::InvalidParticipant(
                "the empty identity cannot register".to_string(),
            ));
        }
        if participant.id() != &id {
            return Err(ProtocolError::InvalidParticipant(format!(
                "handle for {} cannot register as {}",
                participant.id(),
                id
            )));
        }

        let mut registry = self.registry.write();
        if registry.contains_key(&id) {
            return Err(ProtocolError::DuplicateRegistration(id));
        }

        self.store.put(&member_key(&id), Vec::new())?;
        debug!(participant = %id, "registered");
        registry.insert(id, participant);
        Ok(())
    }

    /// Drops a local registration and its membership marker.
    ///
    /// Returns false if `id` was not registered here.
    pub fn unregister(&self, id: &ParticipantId) -> Result<bool, ProtocolError> {
        let mut registry = self.registry.write();
        if registry.remove(id).is_none() {
            return Ok(false);
        }
        self.store.remove(&member_key(id))?;
        debug!(participant = %id, "unregistered");
        Ok(true)
    }

    /// Every identity registered in the store, through any channel handle.
    pub fn members(&self) -> Result<Vec<ParticipantId>, ProtocolError> {
        let entries = self.store.scan_prefix(MEMBERS_PREFIX)?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, _)| {
                let tail = key.strip_prefix(MEMBERS_PREFIX)?;
                ParticipantId::new(tail).ok()
            })
            .collect())
    }

    /// Publishes slave-to-master traffic into the master's inbox.
    pub fn send(&self, message: &Message) -> Result<(), ProtocolError> {
        self.send_to(&ParticipantId::master(), message)
    }

    /// Publishes `message` into `recipient`'s inbox.
    ///
    /// Returns once the write is visible to every replica. This says
    /// nothing about whether the recipient has processed it.
    pub fn send_to(&self, recipient: &ParticipantId, message: &Message) -> Result<(), ProtocolError> {
        if message.is_empty() {
            debug!("refusing to route the empty message");
            return Ok(());
        }

        let sender = message.from().clone();
        let bytes = message.encode()?;

        // Held across the write so sequence numbers hit the store in order
        let mut outgoing = self.outgoing.lock();
        let stream = (sender, recipient.clone());
        let seq = match outgoing.get(&stream) {
            Some(seq) => *seq,
            None => self.resume_sequence(recipient, &stream.0)?,
        };

        self.store.put(&inbox_key(recipient, &stream.0, seq), bytes)?;
        trace!(to = %recipient, seq, "sent {}", message);
        outgoing.insert(stream, seq + 1);
        Ok(())
    }

    /// First free sequence number for a stream.
    ///
    /// Resumes after anything still stored and after anything the recipient
    /// already consumed, so a restarted sender neither overwrites pending
    /// messages nor reuses pruned sequence numbers.
    fn resume_sequence(
        &self,
        recipient: &ParticipantId,
        sender: &ParticipantId,
    ) -> Result<u64, ProtocolError> {
        let prefix = stream_prefix(recipient, sender);
        let stored = self
            .store
            .scan_prefix(&prefix)?
            .iter()
            .filter_map(|(key, _)| key.strip_prefix(&prefix)?.parse::<u64>().ok())
            .max();
        let delivered = self.load_cursor(recipient, sender)?;

        Ok(stored.max(delivered).map_or(0, |last| last + 1))
    }

    /// Reads the persisted delivery cursor of a stream.
    fn load_cursor(
        &self,
        recipient: &ParticipantId,
        sender: &ParticipantId,
    ) -> Result<Option<u64>, ProtocolError> {
        let key = cursor_key(recipient, sender);
        let Some(bytes) = self.store.get(&key)? else {
            return Ok(None);
        };
        match std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()) {
            Some(seq) => Ok(Some(seq)),
            None => {
                warn!(key = %key, "ignoring malformed cursor");
                Ok(None)
            }
        }
    }

    /// Non-blocking read of the next undelivered message for `recipient`.
    ///
    /// Returns [`Message::empty`] when nothing is pending. Messages from one
    /// sender come out in send order; different senders interleave freely.
    pub fn receive(&self, recipient: &ParticipantId) -> Result<Message, ProtocolError> {
        let prefix = inbox_prefix(recipient);
        let entries = self.store.scan_prefix(&prefix)?;

        let mut cursors = self.cursors.lock();
        for (key, bytes) in entries {
            let Some((sender, seq)) = key.strip_prefix(&prefix).and_then(parse_stream_tail) else {
                warn!(key = %key, "skipping malformed inbox key");
                continue;
            };

            let stream = (recipient.clone(), sender);
            let delivered = match cursors.get(&stream) {
                Some(delivered) => Some(*delivered),
                None => {
                    let loaded = self.load_cursor(&stream.0, &stream.1)?;
                    if let Some(delivered) = loaded {
                        cursors.insert(stream.clone(), delivered);
                    }
                    loaded
                }
            };
            if delivered.is_some_and(|delivered| seq <= delivered) {
                continue;
            }

            // Persisted before delivery; a failed write leaves the entry pending
            self.store
                .put(&cursor_key(&stream.0, &stream.1), seq.to_string().into_bytes())?;
            cursors.insert(stream, seq);
            self.prune(&key);

            match Message::decode(&bytes) {
                Ok(message) => {
                    trace!(to = %recipient, seq, "received {}", message);
                    return Ok(message);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "dropping undecodable message");
                }
            }
        }

        Ok(Message::empty())
    }

    fn prune(&self, key: &str) {
        if !self.prune_delivered {
            return;
        }
        // The cursor already guards against redelivery
        if let Err(e) = self.store.remove(key) {
            warn!(key = %key, error = %e, "failed to prune delivered message");
        }
    }

    /// Drains every registered participant's inbox into its handle.
    ///
    /// Returns the number of messages dispatched.
    pub fn pump(&self) -> Result<usize, ProtocolError> {
        let handles: Vec<(ParticipantId, Arc<dyn Participant>)> = self
            .registry
            .read()
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();

        let mut dispatched = 0;
        for (id, handle) in handles {
            loop {
                let message = self.receive(&id)?;
                if message.is_empty() {
                    break;
                }
                handle.on_message(message)?;
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }
}
