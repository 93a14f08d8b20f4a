//! Asynchronous presence client
//!
//! The client is a single-task actor. Public operations start
//! sub-protocols and return once their first message is handed to the
//! transport; replies come back as [`Completion`]s through an internal
//! queue and are applied one at a time by [`PresenceClient::handle_completion`].
//! Every step is published on the client's [`EventBus`].

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;

use dp5_core::constants::MAX_IN_FLIGHT;
use dp5_core::{
    ActionId, ClientEngine, Clock, Epoch, EpochConfig, Event, EventBus, EventSink, HandlerId,
    LookupSession, Outcome, Presence, ProtocolKind, PublicKey, Reaction, RegistrationSession,
    RequestId, RequestLabel, RequestTracker, SystemClock, TracingSink, Track,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::state::{ClientSnapshot, ClientState, Identity};
use crate::transport::{Completion, Continuation, ReplyHandle, Step, Transport};

/// Result of asking the client to start a sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// First message handed to the transport
    Sent,
    /// Same operation already running, or an earlier lookup still is
    Skipped,
    /// The registration epoch closed while the request was being built
    TooLate,
}

/// Work an event handler asks the client to do once dispatch is over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Update {
        epoch: Option<Epoch>,
        epoch_combined: Option<Epoch>,
    },
    /// The standard lookup `update` chained the combined lookup on has ended
    ChainEnded {
        epoch: Epoch,
        epoch_combined: Epoch,
        success: bool,
    },
}

struct LookupOp<L> {
    session: L,
    shards: usize,
    replies: Vec<Option<Vec<u8>>>,
    received: usize,
    /// Combined identifier to friend key, for combined lookups
    combined_ids: HashMap<PublicKey, PublicKey>,
}

enum Operation<E: ClientEngine> {
    Registration(E::Registration),
    Lookup(LookupOp<E::Lookup>),
}

/// Builder for [`PresenceClient`]
pub struct ClientBuilder<E, T> {
    engine: E,
    transport: T,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    snapshot: Option<ClientSnapshot>,
    sink: Option<Box<dyn EventSink>>,
}

impl<E: ClientEngine, T: Transport> ClientBuilder<E, T> {
    pub fn new(engine: E, transport: T) -> Self {
        Self {
            engine,
            transport,
            config: ClientConfig::default(),
            clock: Arc::new(SystemClock),
            snapshot: None,
            sink: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Resume from saved identity and state instead of generating keys
    pub fn snapshot(mut self, snapshot: ClientSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Diagnostic event log; defaults to a [`TracingSink`]
    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn build(self) -> Result<PresenceClient<E, T>> {
        let (identity, saved_state) = match self.snapshot {
            Some(snapshot) => {
                let identity = Identity {
                    standard: self
                        .engine
                        .restore_keypair(Track::Standard, snapshot.identity.standard.secret_bytes())?,
                    combined: self
                        .engine
                        .restore_keypair(Track::Combined, snapshot.identity.combined.secret_bytes())?,
                };
                (identity, Some(snapshot.state))
            }
            None => (
                Identity {
                    standard: self.engine.generate_keypair(Track::Standard)?,
                    combined: self.engine.generate_keypair(Track::Combined)?,
                },
                None,
            ),
        };

        let standard = self
            .config
            .standard_epoch_config(identity.combined.public().len())?;
        let combined = self.config.combined_epoch_config()?;

        let state = match saved_state {
            Some(state) => {
                combined.check_payload(&state.data)?;
                state
            }
            None => ClientState::new(vec![0u8; combined.plaintext_size()]),
        };

        let name = self
            .config
            .name
            .clone()
            .unwrap_or_else(|| identity.standard.public().short());
        let sink = match self.sink {
            Some(sink) => sink,
            None => Box::new(TracingSink::new(name.clone())) as Box<dyn EventSink>,
        };
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let mut client = PresenceClient {
            engine: self.engine,
            transport: self.transport,
            clock: self.clock,
            standard,
            combined,
            num_servers: self.config.standard.num_servers(),
            num_servers_combined: self.config.combined.num_servers(),
            identity,
            state,
            name,
            tracker: RequestTracker::new(),
            bus: EventBus::new(sink),
            operations: HashMap::new(),
            chained: HashMap::new(),
            next_action: 0,
            completions_tx,
            completions_rx,
        };

        let action = client.next_action();
        client.fire(Some(action), Event::ClientStarted);
        tracing::info!(
            client = %client.name,
            key = %client.identity.standard.public().short(),
            friends = client.state.num_friends(),
            "Presence client started"
        );
        Ok(client)
    }
}

/// Presence client over engine `E` and transport `T`
pub struct PresenceClient<E: ClientEngine, T: Transport> {
    engine: E,
    transport: T,
    clock: Arc<dyn Clock>,
    standard: EpochConfig,
    combined: EpochConfig,
    num_servers: usize,
    num_servers_combined: usize,
    identity: Identity,
    state: ClientState,
    name: String,
    tracker: RequestTracker,
    bus: EventBus<ClientState, ClientCommand>,
    operations: HashMap<RequestLabel, Operation<E>>,
    /// Standard epoch to the handler that will chain the combined lookup
    chained: HashMap<Epoch, HandlerId>,
    next_action: ActionId,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
}

impl<E: ClientEngine, T: Transport> PresenceClient<E, T> {
    pub fn builder(engine: E, transport: T) -> ClientBuilder<E, T> {
        ClientBuilder::new(engine, transport)
    }

    pub fn public_key(&self) -> &PublicKey {
        self.identity.standard.public()
    }

    pub fn combined_public_key(&self) -> &PublicKey {
        self.identity.combined.public()
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }

    pub fn epoch_config(&self, track: Track) -> &EpochConfig {
        match track {
            Track::Standard => &self.standard,
            Track::Combined => &self.combined,
        }
    }

    pub fn current_epoch(&self, track: Track) -> Epoch {
        self.epoch_config(track).current_epoch(&*self.clock)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            identity: self.identity.clone(),
            state: self.state.clone(),
        }
    }

    /// Add or rename a friend; `nick == None` removes it.
    ///
    /// Takes effect from the next registration.
    pub fn set_friend(&mut self, key: PublicKey, nick: Option<String>) {
        if self.state.set_friend(key.clone(), nick) {
            tracing::debug!(client = %self.name, friend = %key.short(), "Friend list changed");
        }
    }

    pub fn subscribe<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&ClientState, &Event, HandlerId) -> Reaction<ClientCommand> + Send + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        self.bus.unsubscribe(id)
    }

    /// Register on the standard track for `epoch + 1` (default: current)
    pub fn register_id(&mut self, epoch: Option<Epoch>) -> Result<Dispatch> {
        let payload = self.identity.combined.public().as_bytes().to_vec();
        self.begin_registration(ProtocolKind::Register, epoch, payload)
    }

    /// Register `data` on the combined track for `epoch + 1`
    pub fn register_combined(&mut self, data: &[u8], epoch: Option<Epoch>) -> Result<Dispatch> {
        self.combined.check_payload(data)?;
        self.begin_registration(ProtocolKind::RegisterCombined, epoch, data.to_vec())
    }

    /// Look up friends' combined identifiers for standard `epoch`
    pub fn lookup_id(&mut self, epoch: Option<Epoch>) -> Result<Dispatch> {
        self.begin_lookup(ProtocolKind::Lookup, epoch)
    }

    /// Look up friends' presence for combined `epoch`
    pub fn lookup_combined(&mut self, epoch: Option<Epoch>) -> Result<Dispatch> {
        self.begin_lookup(ProtocolKind::LookupCombined, epoch)
    }

    /// Bring every sub-protocol up to date for the given (or current)
    /// epochs, optionally replacing the published payload first.
    ///
    /// Registrations are started when behind. Then one lookup: the
    /// standard one if behind, with the combined lookup chained to run
    /// after it succeeds; otherwise the combined one if behind. Lookups
    /// are held back while too many sends are outstanding.
    pub fn update(
        &mut self,
        epoch: Option<Epoch>,
        epoch_combined: Option<Epoch>,
        data: Option<Vec<u8>>,
    ) -> Result<()> {
        if let Some(data) = data {
            self.combined.check_payload(&data)?;
            self.state.data = data;
        }
        let epoch = epoch.unwrap_or_else(|| self.current_epoch(Track::Standard));
        let epoch_combined = epoch_combined.unwrap_or_else(|| self.current_epoch(Track::Combined));

        if self.state.last_register_epoch.map_or(true, |last| last < epoch + 1) {
            if let Err(e) = self.register_id(Some(epoch)) {
                tracing::warn!(client = %self.name, epoch, error = %e, "Registration not started");
            }
        }
        if self
            .state
            .last_combined_register_epoch
            .map_or(true, |last| last < epoch_combined + 1)
        {
            let data = self.state.data.clone();
            if let Err(e) = self.register_combined(&data, Some(epoch_combined)) {
                tracing::warn!(client = %self.name, epoch = epoch_combined, error = %e, "Combined registration not started");
            }
        }

        let in_flight = self.transport.in_flight();
        if in_flight > MAX_IN_FLIGHT {
            tracing::debug!(client = %self.name, in_flight, "Too many sends outstanding, deferring lookups");
            return Ok(());
        }

        if self.state.last_lookup_epoch.map_or(true, |last| last < epoch) {
            if !self.chained.contains_key(&epoch) {
                self.chain_lookups(epoch, epoch_combined);
            }
        } else if self
            .state
            .last_combined_lookup_epoch
            .map_or(true, |last| last < epoch_combined)
        {
            if let Err(e) = self.lookup_combined(Some(epoch_combined)) {
                tracing::warn!(client = %self.name, epoch = epoch_combined, error = %e, "Combined lookup not started");
            }
        }
        Ok(())
    }

    /// Apply one transport completion
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            continuation,
            result,
        } = completion;
        let label = continuation.label;

        if !self.tracker.is_active(&label, Some(continuation.request)) {
            let outcome = if result.is_ok() {
                Outcome::Inactive
            } else {
                Outcome::InactiveFail
            };
            tracing::debug!(client = %self.name, label = %label, "Reply for superseded request");
            self.fire(
                Some(continuation.action),
                Event::protocol(label.kind, label.epoch, outcome),
            );
            return;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.abort(&continuation, Outcome::NetFail, &e);
                return;
            }
        };

        match continuation.step {
            Step::Registration => self.on_registration_reply(&continuation, reply),
            Step::Metadata => self.on_metadata_reply(&continuation, reply),
            Step::Shard(shard) => self.on_shard_reply(&continuation, shard, reply),
        }
    }

    /// Apply every completion already queued, including ones queued while
    /// applying. Returns how many were applied.
    pub fn process_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.handle_completion(completion);
            applied += 1;
        }
        applied
    }

    /// Drive the client until `shutdown` resolves: apply completions as
    /// they arrive and call `update` four times per combined epoch.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let period = (self.combined.epoch_length() / 4).max(Duration::from_millis(100));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(client = %self.name, "Presence client stopping");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.update(None, None, None) {
                        tracing::warn!(client = %self.name, error = %e, "Update failed");
                    }
                }
                Some(completion) = self.completions_rx.recv() => {
                    self.handle_completion(completion);
                }
            }
        }
    }

    pub async fn run(&mut self) {
        self.run_until(std::future::pending()).await
    }

    fn next_action(&mut self) -> ActionId {
        let id = self.next_action;
        self.next_action += 1;
        id
    }

    fn num_servers(&self, track: Track) -> usize {
        match track {
            Track::Standard => self.num_servers,
            Track::Combined => self.num_servers_combined,
        }
    }

    fn reply_handle(&self, label: RequestLabel, request: RequestId, action: ActionId, step: Step) -> ReplyHandle {
        ReplyHandle::new(
            Continuation {
                label,
                request,
                action,
                step,
            },
            self.completions_tx.clone(),
        )
    }

    /// Publish `event`, then run whatever handlers asked for
    fn fire(&mut self, action: Option<ActionId>, event: Event) {
        let commands = self.bus.publish(&self.state, &event, action);
        for command in commands {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Update {
                epoch,
                epoch_combined,
            } => {
                if let Err(e) = self.update(epoch, epoch_combined, None) {
                    tracing::warn!(client = %self.name, error = %e, "Update failed");
                }
            }
            ClientCommand::ChainEnded {
                epoch,
                epoch_combined,
                success,
            } => {
                self.chained.remove(&epoch);
                if success {
                    if let Err(e) = self.update(Some(epoch), Some(epoch_combined), None) {
                        tracing::warn!(client = %self.name, error = %e, "Update failed");
                    }
                }
            }
        }
    }

    /// Start the standard lookup for `epoch` with a handler that re-runs
    /// `update` once it succeeds. The handler goes away on any terminal
    /// outcome for that lookup.
    fn chain_lookups(&mut self, epoch: Epoch, epoch_combined: Epoch) {
        let id = self.bus.subscribe(move |_state, event, _id| match event {
            Event::Protocol {
                kind: ProtocolKind::Lookup,
                epoch: e,
                outcome,
            } if *e == epoch && outcome.is_terminal() => {
                Reaction::unsubscribe().then(ClientCommand::ChainEnded {
                    epoch,
                    epoch_combined,
                    success: *outcome == Outcome::Success,
                })
            }
            _ => Reaction::keep(),
        });
        self.chained.insert(epoch, id);

        match self.lookup_id(Some(epoch)) {
            Ok(Dispatch::Sent) => {}
            Ok(_) => {
                self.bus.unsubscribe(id);
                self.chained.remove(&epoch);
            }
            Err(e) => {
                tracing::warn!(client = %self.name, epoch, error = %e, "Lookup not started");
                self.bus.unsubscribe(id);
                self.chained.remove(&epoch);
            }
        }
    }

    fn release(&mut self, label: &RequestLabel, request: RequestId) -> Option<Operation<E>> {
        self.tracker.end(label, request);
        self.operations.remove(label)
    }

    /// End the operation behind `continuation` with `outcome`
    fn abort(&mut self, continuation: &Continuation, outcome: Outcome, reason: &dyn std::fmt::Display) {
        let label = continuation.label;
        self.release(&label, continuation.request);
        tracing::warn!(client = %self.name, label = %label, outcome = %outcome, reason = %reason, "Operation ended");
        self.fire(
            Some(continuation.action),
            Event::protocol(label.kind, label.epoch, outcome),
        );
    }

    fn begin_registration(
        &mut self,
        kind: ProtocolKind,
        epoch: Option<Epoch>,
        payload: Vec<u8>,
    ) -> Result<Dispatch> {
        let track = kind.track();
        let config = *self.epoch_config(track);
        let target = epoch.unwrap_or_else(|| config.current_epoch(&*self.clock)) + 1;
        let label = RequestLabel::new(kind, target);

        let Some(request) = self.tracker.begin(label) else {
            tracing::debug!(client = %self.name, label = %label, "Registration already in flight");
            return Ok(Dispatch::Skipped);
        };
        let action = self.next_action();
        self.fire(Some(action), Event::protocol(kind, target, Outcome::Start));

        let started = match track {
            Track::Standard => {
                let mut friends = Vec::with_capacity(self.state.num_friends() + 1);
                friends.push(self.identity.standard.public().clone());
                friends.extend(self.state.friends().map(|f| f.key.clone()));
                self.engine
                    .start_registration(&config, &self.identity.standard, &friends, &payload, target)
            }
            Track::Combined => self.engine.start_combined_registration(
                &config,
                &self.identity.combined,
                &payload,
                target,
            ),
        };
        let (session, message) = match started {
            Ok(started) => started,
            Err(e) => {
                self.tracker.end(&label, request);
                self.fire(Some(action), Event::protocol(kind, target, Outcome::Fail));
                return Err(ClientError::Engine(e));
            }
        };

        if config.current_epoch(&*self.clock) + 1 != target {
            self.tracker.end(&label, request);
            tracing::warn!(client = %self.name, label = %label, "Registration epoch already closed");
            self.fire(Some(action), Event::protocol(kind, target, Outcome::TooLate));
            return Ok(Dispatch::TooLate);
        }

        self.operations.insert(label, Operation::Registration(session));
        self.fire(Some(action), Event::protocol(kind, target, Outcome::Sent));
        let reply = self.reply_handle(label, request, action, Step::Registration);
        self.transport.send_registration(target, track, message, reply);
        Ok(Dispatch::Sent)
    }

    fn on_registration_reply(&mut self, continuation: &Continuation, reply: Vec<u8>) {
        let label = continuation.label;
        let Some(Operation::Registration(session)) = self.release(&label, continuation.request)
        else {
            tracing::warn!(client = %self.name, label = %label, "No registration context for reply");
            return;
        };

        match session.finish(&reply) {
            Ok(()) => {
                *self.state.last_register_mut(label.kind.track()) = Some(label.epoch);
                tracing::info!(client = %self.name, label = %label, "Registered");
                self.fire(
                    Some(continuation.action),
                    Event::protocol(label.kind, label.epoch, Outcome::Success),
                );
            }
            Err(e) => {
                tracing::warn!(client = %self.name, label = %label, error = %e, "Registration rejected");
                self.fire(
                    Some(continuation.action),
                    Event::protocol(label.kind, label.epoch, Outcome::Fail),
                );
            }
        }
    }

    /// Is a standard lookup for an epoch in `last_lookup_epoch..epoch`
    /// still running?
    fn earlier_lookup_running(&self, epoch: Epoch) -> bool {
        let from = self.state.last_lookup_epoch.unwrap_or(0);
        self.tracker
            .labels()
            .any(|l| l.kind == ProtocolKind::Lookup && l.epoch >= from && l.epoch < epoch)
    }

    fn lookup_targets(&self, track: Track) -> (Vec<PublicKey>, HashMap<PublicKey, PublicKey>) {
        let mut targets = vec![self.identity.key(track).public().clone()];
        let mut combined_ids = HashMap::new();
        match track {
            Track::Standard => targets.extend(self.state.friends().map(|f| f.key.clone())),
            Track::Combined => {
                for friend in self.state.friends() {
                    if let Some(id) = &friend.combined_id {
                        targets.push(id.clone());
                        combined_ids.insert(id.clone(), friend.key.clone());
                    }
                }
            }
        }
        (targets, combined_ids)
    }

    fn begin_lookup(&mut self, kind: ProtocolKind, epoch: Option<Epoch>) -> Result<Dispatch> {
        let track = kind.track();
        let config = *self.epoch_config(track);
        let epoch = epoch.unwrap_or_else(|| config.current_epoch(&*self.clock));
        let label = RequestLabel::new(kind, epoch);

        if kind == ProtocolKind::Lookup && self.earlier_lookup_running(epoch) {
            tracing::debug!(client = %self.name, label = %label, "Earlier lookup still running");
            return Ok(Dispatch::Skipped);
        }
        let Some(request) = self.tracker.begin(label) else {
            tracing::debug!(client = %self.name, label = %label, "Lookup already in flight");
            return Ok(Dispatch::Skipped);
        };
        let action = self.next_action();
        self.fire(Some(action), Event::protocol(kind, epoch, Outcome::Start));

        let (targets, combined_ids) = self.lookup_targets(track);
        let started = self
            .engine
            .start_lookup(&config, self.identity.key(track), &targets, epoch);
        let (session, message) = match started {
            Ok(started) => started,
            Err(e) => {
                self.tracker.end(&label, request);
                self.fire(Some(action), Event::protocol(kind, epoch, Outcome::Fail));
                return Err(ClientError::Engine(e));
            }
        };

        let shards = self.num_servers(track);
        self.operations.insert(
            label,
            Operation::Lookup(LookupOp {
                session,
                shards,
                replies: vec![None; shards],
                received: 0,
                combined_ids,
            }),
        );
        self.fire(Some(action), Event::protocol(kind, epoch, Outcome::MetadataSent));

        let shard = rand::thread_rng().gen_range(0..shards);
        let reply = self.reply_handle(label, request, action, Step::Metadata);
        self.transport.send_lookup(epoch, track, shard, message, reply);
        Ok(Dispatch::Sent)
    }

    fn on_metadata_reply(&mut self, continuation: &Continuation, reply: Vec<u8>) {
        let label = continuation.label;
        let requests = match self.operations.get_mut(&label) {
            Some(Operation::Lookup(op)) => {
                let shards = op.shards;
                op.session
                    .metadata_reply(&reply)
                    .and_then(|()| op.session.lookup_requests(shards))
                    .map(|requests| (requests, shards))
            }
            _ => {
                tracing::warn!(client = %self.name, label = %label, "No lookup context for metadata");
                self.release(&label, continuation.request);
                return;
            }
        };

        let requests = match requests {
            Ok((requests, shards)) if requests.len() == shards => requests,
            Ok((requests, shards)) => {
                let reason = format!("engine built {} requests for {} shards", requests.len(), shards);
                self.abort(continuation, Outcome::Fail, &reason);
                return;
            }
            Err(e) if e.is_no_database() => {
                self.abort(continuation, Outcome::EmptyDb, &e);
                return;
            }
            Err(e) => {
                self.abort(continuation, Outcome::Fail, &e);
                return;
            }
        };

        let track = label.kind.track();
        *self.state.last_metadata_mut(track) = Some(label.epoch);
        for (shard, message) in requests.into_iter().enumerate() {
            self.fire(
                Some(continuation.action),
                Event::protocol(
                    label.kind,
                    label.epoch,
                    Outcome::ShardSent {
                        shard,
                        len: message.len(),
                    },
                ),
            );
            let reply = self.reply_handle(label, continuation.request, continuation.action, Step::Shard(shard));
            self.transport.send_lookup(label.epoch, track, shard, message, reply);
        }
    }

    fn on_shard_reply(&mut self, continuation: &Continuation, shard: usize, reply: Vec<u8>) {
        let label = continuation.label;
        let complete = match self.operations.get_mut(&label) {
            Some(Operation::Lookup(op)) if shard < op.shards => {
                let slot = &mut op.replies[shard];
                if slot.is_some() {
                    tracing::warn!(client = %self.name, label = %label, shard, "Duplicate shard reply");
                } else {
                    *slot = Some(reply);
                    op.received += 1;
                }
                op.received == op.shards
            }
            _ => {
                tracing::warn!(client = %self.name, label = %label, shard, "No lookup context for shard reply");
                self.release(&label, continuation.request);
                return;
            }
        };
        if !complete {
            return;
        }

        let Some(Operation::Lookup(mut op)) = self.release(&label, continuation.request) else {
            return;
        };
        let replies: Vec<Vec<u8>> = op.replies.drain(..).flatten().collect();
        match op.session.decode_replies(&replies) {
            Ok(presence) => {
                self.apply_presence(label, &op.combined_ids, presence);
                *self.state.last_lookup_mut(label.kind.track()) = Some(label.epoch);
                tracing::info!(client = %self.name, label = %label, "Lookup complete");
                self.fire(
                    Some(continuation.action),
                    Event::protocol(label.kind, label.epoch, Outcome::Success),
                );
            }
            Err(e) if e.is_no_database() => {
                tracing::info!(client = %self.name, label = %label, "No database for epoch");
                self.fire(
                    Some(continuation.action),
                    Event::protocol(label.kind, label.epoch, Outcome::EmptyDb),
                );
            }
            Err(e) => {
                tracing::warn!(client = %self.name, label = %label, error = %e, "Lookup decode failed");
                self.fire(
                    Some(continuation.action),
                    Event::protocol(label.kind, label.epoch, Outcome::Fail),
                );
            }
        }
    }

    fn apply_presence(
        &mut self,
        label: RequestLabel,
        combined_ids: &HashMap<PublicKey, PublicKey>,
        presence: Vec<Presence>,
    ) {
        let combined_key_len = self.identity.combined.public().len();
        for result in presence {
            match label.kind.track() {
                Track::Standard => {
                    let Some(friend) = self.state.friend_mut(&result.key) else {
                        continue;
                    };
                    if !result.online {
                        friend.combined_id = None;
                        continue;
                    }
                    match result.payload {
                        Some(id) if id.len() == combined_key_len => {
                            friend.combined_id = Some(PublicKey::from_bytes(id));
                            friend.combined_id_epoch = Some(label.epoch);
                        }
                        payload => {
                            tracing::warn!(
                                client = %self.name,
                                friend = %result.key.short(),
                                len = payload.map_or(0, |p| p.len()),
                                "Skipping malformed combined identifier"
                            );
                        }
                    }
                }
                Track::Combined => {
                    if !result.online {
                        continue;
                    }
                    let Some(friend) = combined_ids
                        .get(&result.key)
                        .and_then(|key| self.state.friend_mut(key))
                    else {
                        continue;
                    };
                    friend.last_online = Some(label.epoch);
                    friend.data = result.payload;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackConfig;
    use crate::transport::NetworkError;
    use dp5_core::{EngineError, EngineResult, KeyPair, ManualClock};
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::sync::Mutex;

    const STANDARD_EPOCH: Epoch = 100;
    const COMBINED_EPOCH: Epoch = 600;

    // Scripted engine: the lookup results are set by the test.

    #[derive(Default)]
    struct Script {
        presence: HashMap<(Track, Epoch), Vec<Presence>>,
        decoded: Vec<Vec<Vec<u8>>>,
        registration_friends: Vec<Vec<PublicKey>>,
        lookup_targets: Vec<(Track, Vec<PublicKey>)>,
        advance_on_registration: Option<(ManualClock, Duration)>,
    }

    #[derive(Clone, Default)]
    struct FakeEngine {
        script: Arc<Mutex<Script>>,
        keys: Arc<AtomicU8>,
    }

    struct FakeRegistration;

    impl RegistrationSession for FakeRegistration {
        fn finish(self, reply: &[u8]) -> EngineResult<()> {
            if reply == b"ok" {
                Ok(())
            } else {
                Err(EngineError::Rejected("bad receipt".into()))
            }
        }
    }

    struct FakeLookup {
        track: Track,
        epoch: Epoch,
        empty: bool,
        script: Arc<Mutex<Script>>,
    }

    impl LookupSession for FakeLookup {
        fn metadata_reply(&mut self, reply: &[u8]) -> EngineResult<()> {
            match reply {
                b"meta" => Ok(()),
                b"empty" => {
                    self.empty = true;
                    Ok(())
                }
                _ => Err(EngineError::Malformed("metadata".into())),
            }
        }

        fn lookup_requests(&mut self, num_servers: usize) -> EngineResult<Vec<Vec<u8>>> {
            Ok((0..num_servers)
                .map(|shard| {
                    if self.empty || shard == 1 {
                        Vec::new()
                    } else {
                        format!("q{}", shard).into_bytes()
                    }
                })
                .collect())
        }

        fn decode_replies(&mut self, replies: &[Vec<u8>]) -> EngineResult<Vec<Presence>> {
            let mut script = self.script.lock().unwrap();
            script.decoded.push(replies.to_vec());
            if self.empty {
                return Err(EngineError::NoDatabase { epoch: self.epoch });
            }
            Ok(script
                .presence
                .get(&(self.track, self.epoch))
                .cloned()
                .unwrap_or_default())
        }
    }

    impl ClientEngine for FakeEngine {
        type Registration = FakeRegistration;
        type Lookup = FakeLookup;

        fn generate_keypair(&self, track: Track) -> EngineResult<KeyPair> {
            let n = self.keys.fetch_add(1, Ordering::SeqCst);
            self.restore_keypair(track, &[n; 4])
        }

        fn restore_keypair(&self, track: Track, secret: &[u8]) -> EngineResult<KeyPair> {
            let tag = if track.is_combined() { 0xc0 } else { 0x50 };
            let mut public = vec![tag; 4];
            public.extend_from_slice(secret);
            Ok(KeyPair::new(secret.to_vec(), PublicKey::from_bytes(public)))
        }

        fn start_registration(
            &self,
            config: &EpochConfig,
            _key: &KeyPair,
            friends: &[PublicKey],
            payload: &[u8],
            epoch: Epoch,
        ) -> EngineResult<(FakeRegistration, Vec<u8>)> {
            assert_eq!(payload.len(), config.plaintext_size());
            let mut script = self.script.lock().unwrap();
            script.registration_friends.push(friends.to_vec());
            if let Some((clock, by)) = &script.advance_on_registration {
                clock.advance(*by);
            }
            Ok((FakeRegistration, format!("reg{}", epoch).into_bytes()))
        }

        fn start_combined_registration(
            &self,
            config: &EpochConfig,
            _key: &KeyPair,
            payload: &[u8],
            epoch: Epoch,
        ) -> EngineResult<(FakeRegistration, Vec<u8>)> {
            assert_eq!(payload.len(), config.plaintext_size());
            Ok((FakeRegistration, format!("cbreg{}", epoch).into_bytes()))
        }

        fn start_lookup(
            &self,
            config: &EpochConfig,
            _key: &KeyPair,
            targets: &[PublicKey],
            epoch: Epoch,
        ) -> EngineResult<(FakeLookup, Vec<u8>)> {
            self.script
                .lock()
                .unwrap()
                .lookup_targets
                .push((config.track(), targets.to_vec()));
            let session = FakeLookup {
                track: config.track(),
                epoch,
                empty: false,
                script: self.script.clone(),
            };
            Ok((session, b"meta-request".to_vec()))
        }
    }

    #[derive(Debug)]
    struct Sent {
        track: Track,
        epoch: Epoch,
        shard: Option<usize>,
        message: Vec<u8>,
        reply: Option<ReplyHandle>,
    }

    /// Records sends; the test answers them
    #[derive(Clone, Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<Sent>>>,
    }

    impl MockTransport {
        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        fn messages(&self) -> Vec<(Track, Epoch, Option<usize>, Vec<u8>)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|s| (s.track, s.epoch, s.shard, s.message.clone()))
                .collect()
        }

        /// Take the pending reply handle of the first send matching
        fn take(&self, pred: impl Fn(&Sent) -> bool) -> ReplyHandle {
            let mut sent = self.sent.lock().unwrap();
            sent.iter_mut()
                .find(|s| s.reply.is_some() && pred(s))
                .and_then(|s| s.reply.take())
                .expect("no matching pending send")
        }

        fn take_registration(&self, track: Track) -> ReplyHandle {
            self.take(|s| s.track == track && s.shard.is_none())
        }

        fn take_metadata(&self, track: Track) -> ReplyHandle {
            self.take(|s| {
                s.track == track
                    && matches!(s.reply.as_ref().map(|r| r.continuation().step), Some(Step::Metadata))
            })
        }

        fn take_shard(&self, track: Track, shard: usize) -> ReplyHandle {
            self.take(|s| {
                s.track == track
                    && matches!(s.reply.as_ref().map(|r| r.continuation().step), Some(Step::Shard(i)) if i == shard)
            })
        }
    }

    impl Transport for MockTransport {
        fn send_registration(&mut self, epoch: Epoch, track: Track, message: Vec<u8>, reply: ReplyHandle) {
            self.sent.lock().unwrap().push(Sent {
                track,
                epoch,
                shard: None,
                message,
                reply: Some(reply),
            });
        }

        fn send_lookup(&mut self, epoch: Epoch, track: Track, shard: usize, message: Vec<u8>, reply: ReplyHandle) {
            if message.is_empty() {
                reply.succeed(Vec::new());
                return;
            }
            self.sent.lock().unwrap().push(Sent {
                track,
                epoch,
                shard: Some(shard),
                message,
                reply: Some(reply),
            });
        }

        fn in_flight(&self) -> usize {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.reply.is_some())
                .count()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl EventSink for RecordingSink {
        fn record(&self, _action: Option<ActionId>, event: &Event) {
            self.0.lock().unwrap().push(event.to_string());
        }
    }

    struct Harness {
        client: PresenceClient<FakeEngine, MockTransport>,
        net: MockTransport,
        engine: FakeEngine,
        clock: ManualClock,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_snapshot(None)
        }

        fn with_snapshot(snapshot: Option<ClientSnapshot>) -> Self {
            let engine = FakeEngine::default();
            let net = MockTransport::default();
            let sink = RecordingSink::default();
            let events = sink.0.clone();
            let config = ClientConfig::new(
                TrackConfig::new("reg", vec!["a".into(), "b".into(), "c".into()]),
                TrackConfig::new("cbreg", vec!["x".into(), "y".into(), "z".into()]),
            )
            .with_name("test");
            let standard = config.standard_epoch_config(8).unwrap();
            let clock = ManualClock::at_epoch(&standard, STANDARD_EPOCH);

            let mut builder = PresenceClient::builder(engine.clone(), net.clone())
                .config(config)
                .clock(clock.clone())
                .sink(sink);
            if let Some(snapshot) = snapshot {
                builder = builder.snapshot(snapshot);
            }
            let client = builder.build().unwrap();
            Self {
                client,
                net,
                engine,
                clock,
                events,
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn saw(&self, event: &str) -> bool {
            self.events().iter().any(|e| e == event)
        }

        fn script(&self) -> std::sync::MutexGuard<'_, Script> {
            self.engine.script.lock().unwrap()
        }

        /// Answer the metadata request and every shard of a lookup
        fn complete_lookup(&mut self, track: Track) {
            self.net.take_metadata(track).succeed(b"meta".to_vec());
            self.client.process_pending();
            for shard in [0, 2] {
                self.net.take_shard(track, shard).succeed(format!("r{}", shard).into_bytes());
            }
            self.client.process_pending();
        }
    }

    fn friend(n: u8) -> PublicKey {
        PublicKey::from_bytes(vec![0xf0, n, 0, 0, 0, 0, 0, 0])
    }

    fn combined_id(n: u8) -> Vec<u8> {
        vec![0xc1, n, 0, 0, 0, 0, 0, 0]
    }

    #[test]
    fn test_start_event() {
        let h = Harness::new();
        assert_eq!(h.events(), vec!["CLIENT, START"]);
        assert_eq!(h.client.state().data.len(), 16);
    }

    #[test]
    fn test_register_is_deduplicated() {
        let mut h = Harness::new();
        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::Sent);
        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::Skipped);
        assert_eq!(h.net.count(), 1);
        assert_eq!(
            h.net.messages()[0],
            (Track::Standard, STANDARD_EPOCH + 1, None, b"reg101".to_vec())
        );
        assert!(h.saw("REG, 101, START"));
        assert!(h.saw("REG, 101, SEND"));
    }

    #[test]
    fn test_registration_includes_self_and_friends() {
        let mut h = Harness::new();
        h.client.set_friend(friend(1), Some("alice".into()));
        h.client.register_id(None).unwrap();

        let friends = h.script().registration_friends[0].clone();
        assert_eq!(friends, vec![h.client.public_key().clone(), friend(1)]);
    }

    #[test]
    fn test_registration_success() {
        let mut h = Harness::new();
        h.client.register_id(None).unwrap();
        h.net.take_registration(Track::Standard).succeed(b"ok".to_vec());
        assert_eq!(h.client.process_pending(), 1);

        assert_eq!(h.client.state().last_register_epoch, Some(STANDARD_EPOCH + 1));
        assert!(h.saw("REG, 101, SUCCESS"));
    }

    #[test]
    fn test_registration_rejected_releases_label() {
        let mut h = Harness::new();
        h.client.register_id(None).unwrap();
        h.net.take_registration(Track::Standard).succeed(b"nope".to_vec());
        h.client.process_pending();

        assert!(h.saw("REG, 101, FAIL"));
        assert_eq!(h.client.state().last_register_epoch, None);
        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::Sent);
    }

    #[test]
    fn test_registration_network_failure() {
        let mut h = Harness::new();
        h.client.register_id(None).unwrap();
        h.net
            .take_registration(Track::Standard)
            .fail(NetworkError::Request("refused".into()));
        h.client.process_pending();

        assert!(h.saw("REG, 101, NETFAIL"));
        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::Sent);
        assert_eq!(h.net.count(), 2);
    }

    #[test]
    fn test_registration_too_late() {
        let mut h = Harness::new();
        h.script().advance_on_registration = Some((h.clock.clone(), Duration::from_secs(60)));

        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::TooLate);
        assert_eq!(h.net.count(), 0);
        assert!(h.saw("REG, 101, TOOLATE"));

        h.script().advance_on_registration = None;
        assert_eq!(h.client.register_id(None).unwrap(), Dispatch::Sent);
        assert_eq!(h.net.messages()[0].1, STANDARD_EPOCH + 2);
    }

    #[test]
    fn test_register_combined_checks_payload_size() {
        let mut h = Harness::new();
        assert!(matches!(
            h.client.register_combined(&[0u8; 15], None),
            Err(ClientError::Core(_))
        ));
        assert_eq!(h.net.count(), 0);
        assert_eq!(
            h.client.register_combined(&[0u8; 16], None).unwrap(),
            Dispatch::Sent
        );
        assert_eq!(h.net.messages()[0].1, COMBINED_EPOCH + 1);
    }

    #[test]
    fn test_lookup_completes_after_all_shards() {
        let mut h = Harness::new();
        h.client.set_friend(friend(1), Some("alice".into()));
        h.script().presence.insert(
            (Track::Standard, STANDARD_EPOCH),
            vec![Presence {
                key: friend(1),
                online: true,
                payload: Some(combined_id(1)),
            }],
        );

        assert_eq!(h.client.lookup_id(None).unwrap(), Dispatch::Sent);
        let meta = h.net.messages();
        assert_eq!(meta.len(), 1);
        assert!(matches!(meta[0].2, Some(shard) if shard < 3));

        h.net.take_metadata(Track::Standard).succeed(b"meta".to_vec());
        h.client.process_pending();
        assert_eq!(h.client.state().last_metadata_epoch, Some(STANDARD_EPOCH));
        assert!(h.saw("LOOKUP, 100, SEND01, LEN000000"));

        // shard 1 was empty and answered locally; answer 2 before 0
        h.net.take_shard(Track::Standard, 2).succeed(b"r2".to_vec());
        h.client.process_pending();
        assert!(!h.saw("LOOKUP, 100, SUCCESS"));

        h.net.take_shard(Track::Standard, 0).succeed(b"r0".to_vec());
        h.client.process_pending();
        assert!(h.saw("LOOKUP, 100, SUCCESS"));

        let decoded = h.script().decoded[0].clone();
        assert_eq!(decoded, vec![b"r0".to_vec(), Vec::new(), b"r2".to_vec()]);

        let record = h.client.state().friend(&friend(1)).unwrap().clone();
        assert_eq!(record.combined_id, Some(PublicKey::from_bytes(combined_id(1))));
        assert_eq!(record.combined_id_epoch, Some(STANDARD_EPOCH));
        assert_eq!(h.client.state().last_lookup_epoch, Some(STANDARD_EPOCH));
    }

    #[test]
    fn test_offline_friend_loses_combined_id() {
        let mut h = Harness::new();
        h.client.set_friend(friend(1), Some("alice".into()));
        h.client.set_friend(friend(2), Some("bob".into()));
        h.client.state.friend_mut(&friend(1)).unwrap().combined_id =
            Some(PublicKey::from_bytes(combined_id(1)));
        h.client.state.friend_mut(&friend(2)).unwrap().combined_id =
            Some(PublicKey::from_bytes(combined_id(2)));
        h.script().presence.insert(
            (Track::Standard, STANDARD_EPOCH),
            vec![
                Presence {
                    key: friend(1),
                    online: false,
                    payload: None,
                },
                Presence {
                    key: friend(9),
                    online: true,
                    payload: Some(combined_id(9)),
                },
            ],
        );

        h.client.lookup_id(None).unwrap();
        h.complete_lookup(Track::Standard);

        let state = h.client.state();
        assert_eq!(state.friend(&friend(1)).unwrap().combined_id, None);
        // absent from the result: unchanged
        assert!(state.friend(&friend(2)).unwrap().combined_id.is_some());
        assert!(state.friend(&friend(9)).is_none());
    }

    #[test]
    fn test_malformed_combined_id_is_skipped() {
        let mut h = Harness::new();
        h.client.set_friend(friend(1), Some("alice".into()));
        h.script().presence.insert(
            (Track::Standard, STANDARD_EPOCH),
            vec![Presence {
                key: friend(1),
                online: true,
                payload: Some(vec![1, 2, 3]),
            }],
        );

        h.client.lookup_id(None).unwrap();
        h.complete_lookup(Track::Standard);

        assert!(h.saw("LOOKUP, 100, SUCCESS"));
        assert_eq!(h.client.state().friend(&friend(1)).unwrap().combined_id, None);
    }

    #[test]
    fn test_combined_lookup_updates_presence() {
        let mut h = Harness::new();
        h.client.set_friend(friend(1), Some("alice".into()));
        h.client.set_friend(friend(2), Some("bob".into()));
        h.client.state.friend_mut(&friend(1)).unwrap().combined_id =
            Some(PublicKey::from_bytes(combined_id(1)));
        h.script().presence.insert(
            (Track::Combined, COMBINED_EPOCH),
            vec![Presence {
                key: PublicKey::from_bytes(combined_id(1)),
                online: true,
                payload: Some(vec![7; 16]),
            }],
        );

        h.client.lookup_combined(None).unwrap();
        let targets = h.script().lookup_targets[0].clone();
        assert_eq!(targets.0, Track::Combined);
        assert_eq!(
            targets.1,
            vec![
                h.client.combined_public_key().clone(),
                PublicKey::from_bytes(combined_id(1))
            ]
        );

        h.complete_lookup(Track::Combined);
        assert!(h.saw("LOOKUP_COMBINED, 600, SUCCESS"));

        let state = h.client.state();
        let alice = state.friend(&friend(1)).unwrap();
        assert_eq!(alice.last_online, Some(COMBINED_EPOCH));
        assert_eq!(alice.data, Some(vec![7; 16]));
        assert_eq!(state.friend(&friend(2)).unwrap().last_online, None);
        assert_eq!(state.online_friends(COMBINED_EPOCH).count(), 1);
        assert_eq!(state.last_combined_lookup_epoch, Some(COMBINED_EPOCH));
    }

    #[test]
    fn test_empty_database() {
        let mut h = Harness::new();
        h.client.lookup_id(None).unwrap();
        h.net.take_metadata(Track::Standard).succeed(b"empty".to_vec());
        h.client.process_pending();

        assert!(h.saw("LOOKUP, 100, EMPTYDB"));
        assert_eq!(h.client.state().last_lookup_epoch, None);
        // every shard request was empty, nothing went on the wire
        assert_eq!(h.net.count(), 1);
        assert_eq!(h.client.lookup_id(None).unwrap(), Dispatch::Sent);
    }

    #[test]
    fn test_bad_metadata_fails_lookup() {
        let mut h = Harness::new();
        h.client.lookup_id(None).unwrap();
        h.net.take_metadata(Track::Standard).succeed(b"garbage".to_vec());
        h.client.process_pending();
        assert!(h.saw("LOOKUP, 100, FAIL"));
        assert_eq!(h.client.state().last_metadata_epoch, None);
    }

    #[test]
    fn test_late_reply_after_failure_is_inactive() {
        let mut h = Harness::new();
        h.client.lookup_id(None).unwrap();
        h.net.take_metadata(Track::Standard).succeed(b"meta".to_vec());
        h.client.process_pending();

        let late = h.net.take_shard(Track::Standard, 2);
        h.net
            .take_shard(Track::Standard, 0)
            .fail(NetworkError::Status {
                status: 500,
                message: "boom".into(),
            });
        h.client.process_pending();
        assert!(h.saw("LOOKUP, 100, NETFAIL"));

        // a new lookup for the same epoch must not accept the old reply
        assert_eq!(h.client.lookup_id(None).unwrap(), Dispatch::Sent);
        late.succeed(b"r2".to_vec());
        h.client.process_pending();
        assert!(h.saw("LOOKUP, 100, INACTIVE"));
        assert!(!h.saw("LOOKUP, 100, SUCCESS"));
    }

    #[test]
    fn test_late_failure_is_inactive_fail() {
        let mut h = Harness::new();
        h.client.lookup_id(None).unwrap();
        h.net.take_metadata(Track::Standard).succeed(b"meta".to_vec());
        h.client.process_pending();

        let late = h.net.take_shard(Track::Standard, 2);
        h.net
            .take_shard(Track::Standard, 0)
            .fail(NetworkError::Request("reset".into()));
        h.client.process_pending();
        late.fail(NetworkError::Request("reset".into()));
        h.client.process_pending();
        assert!(h.saw("LOOKUP, 100, INACTIVE_FAIL"));
    }

    #[test]
    fn test_lookup_waits_for_earlier_epoch() {
        let mut h = Harness::new();
        assert_eq!(h.client.lookup_id(Some(99)).unwrap(), Dispatch::Sent);
        assert_eq!(h.client.lookup_id(Some(100)).unwrap(), Dispatch::Skipped);
        assert_eq!(h.client.lookup_id(Some(99)).unwrap(), Dispatch::Skipped);

        h.complete_lookup(Track::Standard);
        assert_eq!(h.client.lookup_id(Some(100)).unwrap(), Dispatch::Sent);
    }

    #[test]
    fn test_update_starts_registrations_and_standard_lookup() {
        let mut h = Harness::new();
        h.client.update(None, None, None).unwrap();

        let sent = h.net.messages();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], (Track::Standard, 101, None, b"reg101".to_vec()));
        assert_eq!(sent[1], (Track::Combined, 601, None, b"cbreg601".to_vec()));
        assert_eq!(sent[2].0, Track::Standard);
        assert_eq!(sent[2].3, b"meta-request".to_vec());
        assert!(!h.saw("LOOKUP_COMBINED, 600, START"));
    }

    #[test]
    fn test_update_is_idempotent_while_waiting() {
        let mut h = Harness::new();
        h.client.update(None, None, None).unwrap();
        h.client.update(None, None, None).unwrap();
        h.client
            .update(Some(STANDARD_EPOCH), Some(COMBINED_EPOCH), None)
            .unwrap();
        assert_eq!(h.net.count(), 3);
    }

    #[test]
    fn test_update_chains_combined_lookup() {
        let mut h = Harness::new();
        h.client.update(None, None, None).unwrap();
        let handlers = h.client.bus.len();
        assert_eq!(handlers, 1);

        h.complete_lookup(Track::Standard);

        assert!(h.saw("LOOKUP, 100, SUCCESS"));
        assert!(h.saw("LOOKUP_COMBINED, 600, START"));
        assert!(h.client.bus.is_empty());
        assert!(h.client.chained.is_empty());

        h.complete_lookup(Track::Combined);
        assert_eq!(h.client.state().last_combined_lookup_epoch, Some(COMBINED_EPOCH));
    }

    #[test]
    fn test_chain_dropped_on_failure() {
        let mut h = Harness::new();
        h.client.update(None, None, None).unwrap();
        h.net
            .take_metadata(Track::Standard)
            .fail(NetworkError::Request("down".into()));
        h.client.process_pending();

        assert!(h.saw("LOOKUP, 100, NETFAIL"));
        assert!(!h.saw("LOOKUP_COMBINED, 600, START"));
        assert!(h.client.bus.is_empty());

        // the next update retries the standard lookup
        h.client.update(None, None, None).unwrap();
        assert_eq!(h.client.bus.len(), 1);
    }

    #[test]
    fn test_update_uses_combined_lookup_when_standard_current() {
        let mut h = Harness::new();
        h.client.state.last_register_epoch = Some(STANDARD_EPOCH + 1);
        h.client.state.last_combined_register_epoch = Some(COMBINED_EPOCH + 1);
        h.client.state.last_lookup_epoch = Some(STANDARD_EPOCH);

        h.client.update(None, None, None).unwrap();
        let sent = h.net.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Track::Combined);
        assert!(h.client.bus.is_empty());
    }

    #[test]
    fn test_update_defers_lookups_when_busy() {
        let mut h = Harness::new();
        // one outstanding combined registration per combined epoch
        for n in 0..6 {
            h.client.register_combined(&[0u8; 16], None).unwrap();
            assert_eq!(h.net.count(), n + 1);
            h.clock.advance(Duration::from_secs(10));
        }
        assert!(h.client.transport().in_flight() > MAX_IN_FLIGHT);

        h.client.update(None, None, None).unwrap();
        assert!(!h.events().iter().any(|e| e.starts_with("LOOKUP")));
        assert!(h.client.bus.is_empty());
    }

    #[test]
    fn test_update_rejects_bad_payload() {
        let mut h = Harness::new();
        assert!(h.client.update(None, None, Some(vec![1; 3])).is_err());
        assert_eq!(h.net.count(), 0);

        h.client.update(None, None, Some(vec![9; 16])).unwrap();
        assert_eq!(h.client.state().data, vec![9; 16]);
    }

    #[test]
    fn test_handler_command_runs_after_dispatch() {
        let mut h = Harness::new();
        h.client.subscribe(|_, event, _| {
            if event.matches(ProtocolKind::Register, 101, &Outcome::Success) {
                Reaction::unsubscribe().then(ClientCommand::Update {
                    epoch: Some(STANDARD_EPOCH),
                    epoch_combined: Some(COMBINED_EPOCH),
                })
            } else {
                Reaction::keep()
            }
        });
        h.client.register_id(None).unwrap();
        h.net.take_registration(Track::Standard).succeed(b"ok".to_vec());
        h.client.process_pending();

        // update ran: combined registration and standard lookup went out
        assert_eq!(h.net.count(), 3);
        assert!(h.saw("REG_COMBINED, 601, SEND"));
    }

    #[test]
    fn test_restore_from_snapshot() {
        let mut first = Harness::new();
        first.client.set_friend(friend(1), Some("alice".into()));
        first.client.state.last_lookup_epoch = Some(42);
        let snapshot = first.client.snapshot();

        let restored = Harness::with_snapshot(Some(snapshot.clone()));
        assert_eq!(restored.client.public_key(), first.client.public_key());
        assert_eq!(
            restored.client.combined_public_key(),
            first.client.combined_public_key()
        );
        assert_eq!(restored.client.state(), &snapshot.state);
    }
}
