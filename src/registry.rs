//! Command registry - deserializers and subscriber dispatch.
//!
//! Maps command ids to a deserializer plus an ordered subscriber list.
//! Registration is typed: [`add_command`](CommandRegistry::add_command)
//! stores a MessagePack deserializer for a concrete type behind a trait
//! object, and typed subscribers downcast the decoded value back out.
//! No reflection; one concrete deserializer per id.
//!
//! Subscribers return a `bool`: `false` asks the registry to drop that
//! subscriber after the pass (one-shot semantics). Iteration is
//! newest-first over a snapshot, and the list is compacted after the
//! pass - never during a handler call.
//!
//! # Example
//!
//! ```
//! use netwire::registry::CommandRegistry;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Greeting { text: String }
//!
//! let registry = CommandRegistry::new();
//! registry.add_command::<Greeting>(&[10]).unwrap();
//! registry
//!     .add_data_received(10, |_msg, greeting: &Greeting| {
//!         println!("{}", greeting.text);
//!         true // stay subscribed
//!     })
//!     .unwrap();
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::error::{NetwireError, Result};
use crate::pool::PooledBuf;
use crate::protocol::{is_reserved_command, MsgPackCodec};

/// Token identifying one registered data-received handler.
///
/// Closures are not comparable, so removal goes by token rather than by
/// handler value.
pub type HandlerId = u64;

/// A completed inbound message as seen by subscribers.
///
/// The payload buffer is owned by the dispatch: it returns to the pool
/// when the message is dropped, strictly after the last subscriber runs.
#[derive(Debug)]
pub struct InboundMessage {
    /// Transport-level identity of the sender.
    pub peer: SocketAddr,
    /// Command id the message arrived under.
    pub command_id: u16,
    /// Correlation id; 0 when the message is not tied to a request.
    pub response_id: u32,
    payload: PooledBuf,
}

impl InboundMessage {
    /// Assemble a message for dispatch.
    pub fn new(peer: SocketAddr, command_id: u16, response_id: u32, payload: PooledBuf) -> Self {
        Self {
            peer,
            command_id,
            response_id,
            payload,
        }
    }

    /// Borrow the raw payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Raw payload length.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Take the payload buffer out of the message.
    pub fn into_payload(self) -> PooledBuf {
        self.payload
    }
}

/// Decodes a raw payload into a typed value for subscribers.
///
/// Returns `None` when the payload does not parse; the frame is then
/// dropped without invoking subscribers.
pub trait CommandDeserializer: Send + Sync {
    /// Decode `payload` into the registered type.
    fn deserialize(&self, payload: &[u8]) -> Option<Box<dyn Any + Send + Sync>>;
}

/// MessagePack deserializer for a concrete type.
struct MsgPackDeserializer<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> MsgPackDeserializer<T> {
    fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Send + Sync + 'static> CommandDeserializer for MsgPackDeserializer<T> {
    fn deserialize(&self, payload: &[u8]) -> Option<Box<dyn Any + Send + Sync>> {
        match MsgPackCodec::decode::<T>(payload) {
            Ok(value) => Some(Box::new(value)),
            Err(err) => {
                trace!(%err, "payload failed to deserialize");
                None
            }
        }
    }
}

/// Pass-through deserializer for commands whose subscribers read the raw
/// bytes from the [`InboundMessage`] instead of a decoded value.
pub struct RawDeserializer;

impl CommandDeserializer for RawDeserializer {
    fn deserialize(&self, _payload: &[u8]) -> Option<Box<dyn Any + Send + Sync>> {
        Some(Box::new(()))
    }
}

/// An untyped subscriber: receives the message and the decoded value,
/// returns `false` to unsubscribe itself.
pub type Subscriber =
    Arc<dyn Fn(&InboundMessage, &(dyn Any + Send + Sync)) -> bool + Send + Sync>;

struct CommandEntry {
    deserializer: Arc<dyn CommandDeserializer>,
    subscribers: Mutex<Vec<(HandlerId, Subscriber)>>,
}

/// Thread-safe command id -> deserializer + subscribers table.
///
/// Shared across every receive path. Two short-critical-section locks:
/// one over the id map, one per entry over its subscriber list. Neither
/// is held while a handler runs.
pub struct CommandRegistry {
    commands: Mutex<HashMap<u16, Arc<CommandEntry>>>,
    next_handler_id: AtomicU64,
}

impl CommandRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            commands: Mutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
        }
    }

    /// Register a MessagePack deserializer for `T` under each id.
    ///
    /// Ids already registered keep their existing entry. Reserved ids
    /// (above [`USER_COMMAND_LIMIT`](crate::protocol::USER_COMMAND_LIMIT))
    /// are a precondition failure.
    pub fn add_command<T>(&self, ids: &[u16]) -> Result<()>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.add_command_with(Arc::new(MsgPackDeserializer::<T>::new()), ids)
    }

    /// Register a custom deserializer under each id.
    pub fn add_command_with(
        &self,
        deserializer: Arc<dyn CommandDeserializer>,
        ids: &[u16],
    ) -> Result<()> {
        if let Some(&id) = ids.iter().find(|&&id| is_reserved_command(id)) {
            return Err(NetwireError::Misuse(format!(
                "command id {id:#06x} is reserved for the engine"
            )));
        }

        let mut commands = self.commands.lock();
        for &id in ids {
            commands.entry(id).or_insert_with(|| {
                Arc::new(CommandEntry {
                    deserializer: deserializer.clone(),
                    subscribers: Mutex::new(Vec::new()),
                })
            });
        }
        Ok(())
    }

    /// Remove the entries for `ids`, subscribers included. Returns
    /// whether any entry was removed.
    pub fn remove_commands(&self, ids: &[u16]) -> bool {
        let mut commands = self.commands.lock();
        let mut removed = false;
        for id in ids {
            removed |= commands.remove(id).is_some();
        }
        removed
    }

    /// Whether a deserializer is registered for `id`.
    pub fn has_command(&self, id: u16) -> bool {
        self.commands.lock().contains_key(&id)
    }

    /// Append a typed handler to the subscriber list for `id`.
    ///
    /// The handler stays subscribed while it returns `true`; returning
    /// `false` unsubscribes it after the current pass. Fails when no
    /// deserializer is registered for `id`.
    pub fn add_data_received<T, F>(&self, id: u16, handler: F) -> Result<HandlerId>
    where
        T: 'static,
        F: Fn(&InboundMessage, &T) -> bool + Send + Sync + 'static,
    {
        self.add_data_received_raw(
            id,
            Arc::new(move |msg: &InboundMessage, decoded: &(dyn Any + Send + Sync)| {
                match decoded.downcast_ref::<T>() {
                    Some(value) => handler(msg, value),
                    None => {
                        trace!(command_id = msg.command_id, "decoded type mismatch");
                        true
                    }
                }
            }),
        )
    }

    /// Append an untyped handler to the subscriber list for `id`.
    pub fn add_data_received_raw(&self, id: u16, handler: Subscriber) -> Result<HandlerId> {
        let entry = self
            .commands
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| NetwireError::Misuse(format!("no deserializer for command {id}")))?;

        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        entry.subscribers.lock().push((handler_id, handler));
        Ok(handler_id)
    }

    /// Remove one handler by its token. Returns whether it was present.
    pub fn remove_data_received(&self, id: u16, handler: HandlerId) -> bool {
        let Some(entry) = self.commands.lock().get(&id).cloned() else {
            return false;
        };
        let mut subscribers = entry.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(h, _)| *h != handler);
        subscribers.len() != before
    }

    /// Deserialize and dispatch one message to its subscribers,
    /// newest-first. Returns whether a deserializer was registered for
    /// the command id.
    pub fn dispatch(&self, msg: &InboundMessage) -> bool {
        let entry = self.commands.lock().get(&msg.command_id).cloned();
        let Some(entry) = entry else {
            trace!(command_id = msg.command_id, "no handler registered, dropping");
            return false;
        };

        let Some(decoded) = entry.deserializer.deserialize(msg.payload()) else {
            return true;
        };

        // Snapshot under the lock, invoke outside it.
        let snapshot: Vec<(HandlerId, Subscriber)> = {
            let subscribers = entry.subscribers.lock();
            subscribers.iter().rev().cloned().collect()
        };

        let mut unsubscribed = Vec::new();
        for (handler_id, subscriber) in &snapshot {
            if !subscriber(msg, decoded.as_ref()) {
                unsubscribed.push(*handler_id);
            }
        }

        if !unsubscribed.is_empty() {
            entry
                .subscribers
                .lock()
                .retain(|(h, _)| !unsubscribed.contains(h));
        }
        true
    }

    /// Number of registered command ids.
    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    /// Whether no commands are registered.
    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BytePool;
    use crate::protocol::commands;
    use std::sync::atomic::AtomicUsize;

    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Note {
        text: String,
    }

    fn message(command_id: u16, value: &Note) -> InboundMessage {
        let pool = BytePool::new();
        let bytes = MsgPackCodec::encode(value).unwrap();
        let mut payload = pool.rent(bytes.len());
        payload.as_mut_slice().copy_from_slice(&bytes);
        InboundMessage::new("127.0.0.1:9000".parse().unwrap(), command_id, 0, payload)
    }

    #[test]
    fn test_add_and_dispatch_typed() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .add_data_received(5, move |_msg, note: &Note| {
                seen_clone.lock().push(note.text.clone());
                true
            })
            .unwrap();

        let handled = registry.dispatch(&message(
            5,
            &Note {
                text: "hello".into(),
            },
        ));
        assert!(handled);
        assert_eq!(seen.lock().as_slice(), ["hello"]);
    }

    #[test]
    fn test_reserved_id_rejected() {
        let registry = CommandRegistry::new();
        let err = registry.add_command::<Note>(&[commands::PING]).unwrap_err();
        assert!(matches!(err, NetwireError::Misuse(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_add_keeps_existing_entry() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();
        let id = registry
            .add_data_received(5, |_msg, _note: &Note| true)
            .unwrap();

        // A second registration must not wipe the subscriber.
        registry.add_command::<Note>(&[5]).unwrap();
        assert!(registry.remove_data_received(5, id));
    }

    #[test]
    fn test_callback_for_unregistered_id_fails() {
        let registry = CommandRegistry::new();
        let err = registry
            .add_data_received(9, |_msg, _note: &Note| true)
            .unwrap_err();
        assert!(matches!(err, NetwireError::Misuse(_)));
    }

    #[test]
    fn test_remove_commands() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[1, 2, 3]).unwrap();

        assert!(registry.remove_commands(&[2, 3]));
        assert!(!registry.remove_commands(&[2, 3]));
        assert!(registry.has_command(1));
        assert!(!registry.has_command(2));
    }

    #[test]
    fn test_one_shot_handler_runs_exactly_once() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry
            .add_data_received(5, move |_msg, _note: &Note| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                false // one-shot
            })
            .unwrap();

        let msg = message(5, &Note { text: "x".into() });
        registry.dispatch(&msg);
        registry.dispatch(&msg);
        registry.dispatch(&msg);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_newest_first_iteration() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = order.clone();
            registry
                .add_data_received(5, move |_msg, _note: &Note| {
                    order.lock().push(tag);
                    true
                })
                .unwrap();
        }

        registry.dispatch(&message(5, &Note { text: "x".into() }));
        assert_eq!(order.lock().as_slice(), ["third", "second", "first"]);
    }

    #[test]
    fn test_remove_data_received_by_token() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let token = registry
            .add_data_received(5, move |_msg, _note: &Note| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        assert!(registry.remove_data_received(5, token));
        assert!(!registry.remove_data_received(5, token));

        registry.dispatch(&message(5, &Note { text: "x".into() }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dispatch_unregistered_returns_false() {
        let registry = CommandRegistry::new();
        assert!(!registry.dispatch(&message(9, &Note { text: "x".into() })));
    }

    #[test]
    fn test_undecodable_payload_skips_subscribers() {
        let registry = CommandRegistry::new();
        registry.add_command::<Note>(&[5]).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        registry
            .add_data_received(5, move |_msg, _note: &Note| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        let pool = BytePool::new();
        let mut payload = pool.rent(3);
        payload.as_mut_slice().copy_from_slice(&[0xC1, 0xC1, 0xC1]);
        let msg = InboundMessage::new("127.0.0.1:9000".parse().unwrap(), 5, 0, payload);

        assert!(registry.dispatch(&msg));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_raw_deserializer_hands_bytes_through_message() {
        let registry = CommandRegistry::new();
        registry
            .add_command_with(Arc::new(RawDeserializer), &[8])
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        registry
            .add_data_received(8, move |msg: &InboundMessage, _unit: &()| {
                seen_clone.lock().push(msg.payload().to_vec());
                true
            })
            .unwrap();

        let pool = BytePool::new();
        let mut payload = pool.rent(4);
        payload.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        let msg = InboundMessage::new("127.0.0.1:9000".parse().unwrap(), 8, 0, payload);

        registry.dispatch(&msg);
        assert_eq!(seen.lock().as_slice(), [vec![1, 2, 3, 4]]);
    }
}
