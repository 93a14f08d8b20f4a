//! Process-local event bus for protocol lifecycle events
//!
//! Handlers are called synchronously with a view of the caller's state,
//! the event and their own id. A handler cannot reach back into the bus
//! while it runs; it answers with a [`Reaction`] instead, which may ask
//! for its own removal and carry a command for the owner to run once the
//! dispatch pass is over.

use std::collections::HashMap;
use std::fmt;

use crate::epoch::Epoch;
use crate::tracker::ProtocolKind;

/// Monotonic id tagging every event of one logical action
pub type ActionId = u64;

/// Id of a subscribed handler
pub type HandlerId = u64;

/// Step or result of a sub-protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Start,
    /// Registration message handed to the transport
    Sent,
    /// Lookup metadata request handed to the transport
    MetadataSent,
    /// Per-shard lookup request handed to the transport
    ShardSent { shard: usize, len: usize },
    Success,
    /// The engine rejected a message
    Fail,
    NetFail,
    /// A reply arrived for a superseded request
    Inactive,
    /// A failure arrived for a superseded request
    InactiveFail,
    /// The registration epoch had already closed
    TooLate,
    /// No database exists yet for the looked-up epoch
    EmptyDb,
}

impl Outcome {
    /// Outcomes that end an operation and release its label
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Outcome::Success | Outcome::Fail | Outcome::NetFail | Outcome::TooLate | Outcome::EmptyDb
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Start => write!(f, "START"),
            Outcome::Sent => write!(f, "SEND"),
            Outcome::MetadataSent => write!(f, "META_SEND"),
            Outcome::ShardSent { shard, len } => write!(f, "SEND{:02}, LEN{:06}", shard, len),
            Outcome::Success => write!(f, "SUCCESS"),
            Outcome::Fail => write!(f, "FAIL"),
            Outcome::NetFail => write!(f, "NETFAIL"),
            Outcome::Inactive => write!(f, "INACTIVE"),
            Outcome::InactiveFail => write!(f, "INACTIVE_FAIL"),
            Outcome::TooLate => write!(f, "TOOLATE"),
            Outcome::EmptyDb => write!(f, "EMPTYDB"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ClientStarted,
    Protocol {
        kind: ProtocolKind,
        epoch: Epoch,
        outcome: Outcome,
    },
}

impl Event {
    pub fn protocol(kind: ProtocolKind, epoch: Epoch, outcome: Outcome) -> Self {
        Event::Protocol {
            kind,
            epoch,
            outcome,
        }
    }

    /// Does this event report `outcome` for `kind` at `epoch`?
    pub fn matches(&self, kind: ProtocolKind, epoch: Epoch, outcome: &Outcome) -> bool {
        match self {
            Event::Protocol {
                kind: k,
                epoch: e,
                outcome: o,
            } => *k == kind && *e == epoch && o == outcome,
            Event::ClientStarted => false,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ClientStarted => write!(f, "CLIENT, START"),
            Event::Protocol {
                kind,
                epoch,
                outcome,
            } => write!(f, "{}, {}, {}", kind, epoch, outcome),
        }
    }
}

/// Handler answer
#[derive(Debug)]
pub struct Reaction<C> {
    pub unsubscribe: bool,
    pub command: Option<C>,
}

impl<C> Reaction<C> {
    pub fn keep() -> Self {
        Self {
            unsubscribe: false,
            command: None,
        }
    }

    pub fn unsubscribe() -> Self {
        Self {
            unsubscribe: true,
            command: None,
        }
    }

    pub fn then(mut self, command: C) -> Self {
        self.command = Some(command);
        self
    }
}

/// Append-only diagnostic log of published events
pub trait EventSink: Send {
    fn record(&self, action: Option<ActionId>, event: &Event);
}

/// Sink that forwards every event to `tracing`
#[derive(Debug, Clone)]
pub struct TracingSink {
    name: String,
}

impl TracingSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl EventSink for TracingSink {
    fn record(&self, action: Option<ActionId>, event: &Event) {
        tracing::debug!(client = %self.name, action = ?action, "{}", event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _action: Option<ActionId>, _event: &Event) {}
}

type Handler<S, C> = Box<dyn FnMut(&S, &Event, HandlerId) -> Reaction<C> + Send>;

/// Publish/subscribe bus over state `S`, collecting handler commands `C`
pub struct EventBus<S, C> {
    handlers: HashMap<HandlerId, Handler<S, C>>,
    next_id: HandlerId,
    sink: Box<dyn EventSink>,
}

impl<S, C> EventBus<S, C> {
    pub fn new(sink: Box<dyn EventSink>) -> Self {
        Self {
            handlers: HashMap::new(),
            next_id: 1,
            sink,
        }
    }

    pub fn subscribe<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&S, &Event, HandlerId) -> Reaction<C> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.handlers.insert(id, Box::new(handler));
        id
    }

    /// Remove a handler; unknown ids are ignored
    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub fn is_subscribed(&self, id: HandlerId) -> bool {
        self.handlers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Log `event` and run every handler subscribed when the call began.
    /// Returns the commands handlers asked for, in dispatch order.
    pub fn publish(&mut self, state: &S, event: &Event, action: Option<ActionId>) -> Vec<C> {
        self.sink.record(action, event);

        let ids: Vec<HandlerId> = self.handlers.keys().copied().collect();
        let mut commands = Vec::new();
        for id in ids {
            let Some(handler) = self.handlers.get_mut(&id) else {
                continue;
            };
            let reaction = handler(state, event, id);
            if reaction.unsubscribe {
                self.handlers.remove(&id);
            }
            if let Some(command) = reaction.command {
                commands.push(command);
            }
        }
        commands
    }
}

impl<S, C> fmt::Debug for EventBus<S, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handlers.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink(Arc<Mutex<Vec<(Option<ActionId>, String)>>>);

    impl EventSink for RecordingSink {
        fn record(&self, action: Option<ActionId>, event: &Event) {
            self.0.lock().unwrap().push((action, event.to_string()));
        }
    }

    fn success(epoch: Epoch) -> Event {
        Event::protocol(ProtocolKind::Lookup, epoch, Outcome::Success)
    }

    #[test]
    fn test_publish_reaches_every_handler() {
        let mut bus: EventBus<u32, u32> = EventBus::new(Box::new(NullSink));
        bus.subscribe(|state, _, _| Reaction::keep().then(*state));
        bus.subscribe(|state, _, _| Reaction::keep().then(*state + 1));

        let mut commands = bus.publish(&10, &Event::ClientStarted, None);
        commands.sort();
        assert_eq!(commands, vec![10, 11]);
        assert_eq!(bus.len(), 2);
    }

    #[test]
    fn test_self_unsubscribe_mid_publish() {
        let mut bus: EventBus<(), &'static str> = EventBus::new(Box::new(NullSink));
        let once = bus.subscribe(|_, _, _| Reaction::unsubscribe().then("once"));
        let always = bus.subscribe(|_, _, _| Reaction::keep().then("always"));

        let first = bus.publish(&(), &success(1), None);
        assert_eq!(first.len(), 2);
        assert!(!bus.is_subscribed(once));
        assert!(bus.is_subscribed(always));

        let second = bus.publish(&(), &success(1), None);
        assert_eq!(second, vec!["always"]);
    }

    #[test]
    fn test_handler_receives_own_id() {
        let mut bus: EventBus<(), HandlerId> = EventBus::new(Box::new(NullSink));
        let id = bus.subscribe(|_, _, hid| Reaction::keep().then(hid));
        assert_eq!(bus.publish(&(), &Event::ClientStarted, None), vec![id]);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut bus: EventBus<(), ()> = EventBus::new(Box::new(NullSink));
        assert!(!bus.unsubscribe(42));
    }

    #[test]
    fn test_sink_records_action_ids() {
        let sink = RecordingSink::default();
        let log = sink.0.clone();
        let mut bus: EventBus<(), ()> = EventBus::new(Box::new(sink));

        bus.publish(&(), &Event::ClientStarted, Some(0));
        bus.publish(&(), &success(4), Some(1));

        let log = log.lock().unwrap();
        assert_eq!(log[0], (Some(0), "CLIENT, START".to_string()));
        assert_eq!(log[1], (Some(1), "LOOKUP, 4, SUCCESS".to_string()));
    }

    #[test]
    fn test_event_matches() {
        let event = success(7);
        assert!(event.matches(ProtocolKind::Lookup, 7, &Outcome::Success));
        assert!(!event.matches(ProtocolKind::Lookup, 8, &Outcome::Success));
        assert!(!event.matches(ProtocolKind::LookupCombined, 7, &Outcome::Success));
        assert!(!Event::ClientStarted.matches(ProtocolKind::Lookup, 7, &Outcome::Success));
    }

    #[test]
    fn test_terminal_outcomes() {
        assert!(Outcome::Success.is_terminal());
        assert!(Outcome::EmptyDb.is_terminal());
        assert!(!Outcome::Inactive.is_terminal());
        assert!(!Outcome::ShardSent { shard: 0, len: 1 }.is_terminal());
    }
}
