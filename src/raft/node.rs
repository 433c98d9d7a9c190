use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;

use super::{
    Clock, Coordinator, NodeId, NodeRole, NodeState, NodeStatus, RaftConfig, RaftError,
    RaftMessage, Term, TimeoutRange, Timer, VoteTally,
};
use crate::events::{ElectionEvent, EventKind, EventSink, NullEventSink};
use crate::metrics::{ElectionCounters, ElectionRecord, MetricsSink, NullMetricsSink};
use crate::network::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Election,
    Heartbeat,
}

/// Election state machine of one cluster member.
///
/// All mutation happens through the `on_*` handlers, which the node's runner
/// calls one at a time. Outbound traffic goes through the injected
/// [`Coordinator`].
pub struct RaftNode {
    // Node identity
    id: NodeId,

    // Raft state
    state: NodeState,

    // Configuration
    heartbeat_interval: Duration,
    timeout_range: TimeoutRange,

    // Communication
    coordinator: Coordinator,

    // Timing
    clock: Arc<dyn Clock>,
    rng: StdRng,
    election_timer: Timer,
    heartbeat_timer: Timer,
    election_timeout: Duration,
    last_reset_at: Instant,

    // Election state
    tally: VoteTally,
    election_started_at: Option<Instant>,

    // Leader state
    last_ack_at: HashMap<NodeId, Instant>,

    // Observability
    events: Arc<dyn EventSink>,
    metrics: Arc<dyn MetricsSink>,
}

impl RaftNode {
    /// Builds a follower at term 0. Fails if `config` would leave a timer
    /// with a zero period.
    pub fn new(
        config: &RaftConfig,
        coordinator: Coordinator,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RaftError> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            id: coordinator.self_id(),
            state: NodeState::default(),
            heartbeat_interval: config.heartbeat(),
            timeout_range: config.election_timeout(),
            coordinator,
            clock,
            rng: StdRng::from_os_rng(),
            election_timer: Timer::new(),
            heartbeat_timer: Timer::new(),
            election_timeout: Duration::ZERO,
            last_reset_at: now,
            tally: VoteTally::default(),
            election_started_at: None,
            last_ack_at: HashMap::new(),
            events: Arc::new(NullEventSink),
            metrics: Arc::new(NullMetricsSink),
        })
    }

    /// Makes timeout draws reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    pub fn role(&self) -> NodeRole {
        self.state.role
    }

    pub fn current_term(&self) -> Term {
        self.state.current_term
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.state.role, NodeRole::Leader)
    }

    /// Votes collected in the current candidacy, self-vote included.
    pub fn votes_received(&self) -> usize {
        match self.state.role {
            NodeRole::Candidate => self.tally.count(),
            _ => 0,
        }
    }

    /// The most recently drawn election timeout.
    pub fn election_timeout(&self) -> Duration {
        self.election_timeout
    }

    pub fn last_reset_at(&self) -> Instant {
        self.last_reset_at
    }

    pub fn election_deadline(&self) -> Option<Instant> {
        self.election_timer.deadline()
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat_timer.deadline()
    }

    pub fn last_ack_from(&self, peer: NodeId) -> Option<Instant> {
        self.last_ack_at.get(&peer).copied()
    }

    pub fn counters(&self) -> Arc<ElectionCounters> {
        self.coordinator.counters()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.state.role,
            term: self.state.current_term,
            voted_for: self.state.voted_for,
            leader_id: self.state.leader_id,
            votes_received: self.votes_received(),
        }
    }

    /// Arms the first election timer. Nodes start as followers.
    pub fn start(&mut self) {
        self.last_reset_at = self.clock.now();
        self.arm_election_timer();
        self.emit(
            EventKind::StateChange,
            None,
            format!(
                "starting as follower, election timeout {}ms",
                self.election_timeout.as_millis()
            ),
        );
    }

    /// The earliest armed timer, if any.
    pub fn next_deadline(&self) -> Option<(Instant, TimerKind)> {
        let election = self
            .election_timer
            .deadline()
            .map(|d| (d, TimerKind::Election));
        let heartbeat = self
            .heartbeat_timer
            .deadline()
            .map(|d| (d, TimerKind::Heartbeat));
        match (election, heartbeat) {
            (Some(e), Some(h)) => Some(if h.0 < e.0 { h } else { e }),
            (e, h) => e.or(h),
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Election => self.on_election_timeout(),
            TimerKind::Heartbeat => self.on_heartbeat_timer(),
        }
    }

    /// Fires every timer whose deadline has passed. Returns true if any fired.
    pub fn fire_due_timers(&mut self) -> bool {
        let mut fired = false;
        while let Some((deadline, kind)) = self.next_deadline() {
            if deadline > self.clock.now() {
                break;
            }
            self.on_timer(kind);
            fired = true;
        }
        fired
    }

    pub fn on_election_timeout(&mut self) {
        self.election_timer.disarm();

        match self.state.role {
            NodeRole::Leader => {
                debug!("{} ignoring election timeout while leader", self.id);
                return;
            }
            NodeRole::Candidate => {
                self.emit(
                    EventKind::SplitVote,
                    None,
                    format!(
                        "no majority in term {} ({} of {} votes), retrying",
                        self.state.current_term,
                        self.tally.count(),
                        self.coordinator.registry().majority()
                    ),
                );
            }
            NodeRole::Follower => {}
        }

        self.start_election();
    }

    fn start_election(&mut self) {
        let now = self.clock.now();
        self.state.current_term += 1;
        self.state.voted_for = Some(self.id);
        self.state.leader_id = None;
        self.state.role = NodeRole::Candidate;
        self.tally.reset(self.state.current_term, self.id);
        self.election_started_at = Some(now);
        self.heartbeat_timer.disarm();
        self.arm_election_timer();
        self.coordinator.counters().record_election_started();

        self.emit(
            EventKind::ElectionStarted,
            None,
            format!(
                "became candidate for term {}, timeout {}ms",
                self.state.current_term,
                self.election_timeout.as_millis()
            ),
        );

        // A single-member cluster wins on its own vote.
        if self.tally.has_majority(self.coordinator.registry()) {
            self.become_leader();
            return;
        }

        self.emit(
            EventKind::VoteRequested,
            None,
            format!("requesting votes for term {}", self.state.current_term),
        );
        self.coordinator
            .broadcast_vote_request(self.state.current_term, self.id);
    }

    /// Decides a vote and returns the response to send back to the candidate.
    pub fn on_vote_request(&mut self, candidate_id: NodeId, candidate_term: Term) -> RaftMessage {
        if candidate_term < self.state.current_term {
            self.coordinator.counters().record_vote(false);
            self.emit(
                EventKind::VoteDenied,
                Some(candidate_id),
                format!(
                    "denied {candidate_id}: stale term {candidate_term} < {}",
                    self.state.current_term
                ),
            );
            return self.vote_response(false);
        }

        self.observe_term(candidate_term, candidate_id);

        let granted = match self.state.voted_for {
            None => true,
            Some(voted) => voted == candidate_id,
        };

        self.coordinator.counters().record_vote(granted);
        if granted {
            self.state.voted_for = Some(candidate_id);
            self.reset_election_timer();
            self.emit(
                EventKind::VoteGranted,
                Some(candidate_id),
                format!("voted for {candidate_id} in term {}", self.state.current_term),
            );
        } else {
            self.emit(
                EventKind::VoteDenied,
                Some(candidate_id),
                format!(
                    "denied {candidate_id}: already voted for {} in term {}",
                    self.state
                        .voted_for
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    self.state.current_term
                ),
            );
        }

        self.vote_response(granted)
    }

    fn vote_response(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::RequestVoteResponse {
            term: self.state.current_term,
            vote_granted,
        }
    }

    pub fn on_vote_response(&mut self, from: NodeId, responder_term: Term, granted: bool) {
        if responder_term > self.state.current_term {
            self.observe_term(responder_term, from);
            return;
        }

        if self.state.role != NodeRole::Candidate
            || responder_term != self.state.current_term
            || self.tally.term() != self.state.current_term
        {
            debug!(
                "{} ignoring vote response from {from} for term {responder_term}",
                self.id
            );
            return;
        }

        if !granted || !self.tally.record(from) {
            return;
        }

        self.emit(
            EventKind::VoteReceived,
            Some(from),
            format!(
                "received vote from {from} ({} of {} needed)",
                self.tally.count(),
                self.coordinator.registry().majority()
            ),
        );

        if self.tally.has_majority(self.coordinator.registry()) {
            self.become_leader();
        }
    }

    /// Processes a leader heartbeat and returns the ack to send back.
    pub fn on_heartbeat(&mut self, leader_id: NodeId, leader_term: Term) -> RaftMessage {
        if leader_term < self.state.current_term {
            self.emit(
                EventKind::HeartbeatRejected,
                Some(leader_id),
                format!(
                    "rejected heartbeat from stale leader {leader_id} (term {leader_term} < {})",
                    self.state.current_term
                ),
            );
            return RaftMessage::HeartbeatAck {
                term: self.state.current_term,
            };
        }

        if leader_id == self.id {
            return RaftMessage::HeartbeatAck {
                term: self.state.current_term,
            };
        }

        self.observe_term(leader_term, leader_id);

        if self.state.role != NodeRole::Follower {
            let previous = self.state.role;
            self.become_follower();
            self.emit(
                EventKind::SteppedDown,
                Some(leader_id),
                format!(
                    "{previous} stepping down for leader {leader_id} in term {}",
                    self.state.current_term
                ),
            );
        }

        self.state.leader_id = Some(leader_id);
        self.reset_election_timer();
        self.emit(
            EventKind::HeartbeatReceived,
            Some(leader_id),
            format!("heartbeat from {leader_id}"),
        );

        RaftMessage::HeartbeatAck {
            term: self.state.current_term,
        }
    }

    pub fn on_heartbeat_ack(&mut self, from: NodeId, term: Term) {
        if term > self.state.current_term {
            self.observe_term(term, from);
            return;
        }
        if self.is_leader() && term == self.state.current_term {
            self.last_ack_at.insert(from, self.clock.now());
            self.coordinator.counters().record_heartbeat_ack();
        }
    }

    pub fn on_heartbeat_timer(&mut self) {
        if !self.is_leader() {
            self.heartbeat_timer.disarm();
            return;
        }
        self.send_heartbeats();
    }

    fn send_heartbeats(&mut self) {
        self.coordinator
            .broadcast_heartbeat(self.state.current_term, self.id);
        self.emit(
            EventKind::HeartbeatSent,
            None,
            format!("heartbeat for term {}", self.state.current_term),
        );
        let now = self.clock.now();
        self.heartbeat_timer.arm(now, self.heartbeat_interval);
    }

    fn become_leader(&mut self) {
        if self.state.role != NodeRole::Candidate {
            return;
        }

        let now = self.clock.now();
        self.state.role = NodeRole::Leader;
        self.state.leader_id = Some(self.id);
        self.election_timer.disarm();
        self.last_ack_at.clear();
        self.coordinator.counters().record_election_won();

        let started = self.election_started_at.take().unwrap_or(now);
        let record = ElectionRecord {
            node_id: self.id,
            term: self.state.current_term,
            election_start_ms: self.clock.unix_millis(started),
            election_end_ms: self.clock.unix_millis(now),
            duration_ms: now.saturating_duration_since(started).as_millis() as u64,
        };

        self.emit(
            EventKind::BecameLeader,
            None,
            format!(
                "became leader for term {} with {} votes after {}ms",
                self.state.current_term,
                self.tally.count(),
                record.duration_ms
            ),
        );
        self.metrics.record_election(record);

        // Assert leadership right away instead of waiting one interval.
        self.send_heartbeats();
    }

    fn become_follower(&mut self) {
        let previous = self.state.role;
        self.state.role = NodeRole::Follower;
        self.tally.clear();
        self.election_started_at = None;

        if previous != NodeRole::Follower {
            self.heartbeat_timer.disarm();
            self.election_timer.disarm();
            self.arm_election_timer();
        }
    }

    /// Adopts `term` if it is ahead of ours and reverts to follower.
    fn observe_term(&mut self, term: Term, source: NodeId) {
        let previous = self.state.role;
        if !self.state.adopt_term(term) {
            return;
        }

        self.emit(
            EventKind::TermAdopted,
            Some(source),
            format!("adopted term {term} from {source}"),
        );
        if previous != NodeRole::Follower {
            self.become_follower();
            self.emit(
                EventKind::SteppedDown,
                Some(source),
                format!("{previous} stepping down after seeing term {term} from {source}"),
            );
        }
    }

    fn arm_election_timer(&mut self) {
        self.election_timeout = self.timeout_range.draw(&mut self.rng);
        let now = self.clock.now();
        self.election_timer.arm(now, self.election_timeout);
    }

    fn reset_election_timer(&mut self) {
        self.last_reset_at = self.clock.now();
        self.arm_election_timer();
    }

    /// Dispatches one inbound message, returning the reply it calls for.
    pub fn handle_message(&mut self, from: NodeId, message: RaftMessage) -> Option<RaftMessage> {
        match message {
            RaftMessage::RequestVote { term, candidate_id } => {
                Some(self.on_vote_request(candidate_id, term))
            }
            RaftMessage::RequestVoteResponse { term, vote_granted } => {
                self.on_vote_response(from, term, vote_granted);
                None
            }
            RaftMessage::Heartbeat { term, leader_id } => Some(self.on_heartbeat(leader_id, term)),
            RaftMessage::HeartbeatAck { term } => {
                self.on_heartbeat_ack(from, term);
                None
            }
        }
    }

    /// Handles an envelope from the inbox and sends any reply back.
    pub fn handle_envelope(&mut self, envelope: Envelope) {
        if envelope.to != self.id {
            debug!("{} dropping envelope addressed to {}", self.id, envelope.to);
            return;
        }
        let from = envelope.from;
        if let Some(reply) = self.handle_message(from, envelope.message) {
            self.coordinator.send(from, reply);
        }
    }

    fn emit(&self, kind: EventKind, peer: Option<NodeId>, message: String) {
        self.events.record(ElectionEvent {
            timestamp_ms: self.clock.unix_millis(self.clock.now()),
            kind,
            node_id: self.id,
            term: self.state.current_term,
            peer,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEventSink;
    use crate::metrics::MemoryMetricsSink;
    use crate::network::{InMemoryTransport, NetworkConditions};
    use crate::raft::{ManualClock, PeerRegistry};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        clock: ManualClock,
        inboxes: Vec<UnboundedReceiver<Envelope>>,
        events: MemoryEventSink,
        metrics: MemoryMetricsSink,
        transport: Arc<InMemoryTransport>,
    }

    impl Fixture {
        fn new(size: usize) -> Self {
            let transport = Arc::new(InMemoryTransport::new(NetworkConditions::default(), Some(1)));
            let inboxes = (0..size as u64)
                .map(|i| transport.register(NodeId(i)))
                .collect();
            Self {
                clock: ManualClock::new(),
                inboxes,
                events: MemoryEventSink::new(),
                metrics: MemoryMetricsSink::new(),
                transport,
            }
        }

        fn node(&self, id: u64) -> RaftNode {
            let registry = Arc::new(PeerRegistry::with_size(self.inboxes.len()).unwrap());
            let coordinator =
                Coordinator::new(NodeId(id), registry, self.transport.clone()).unwrap();
            let mut node = RaftNode::new(
                &RaftConfig::default(),
                coordinator,
                Arc::new(self.clock.clone()),
            )
            .unwrap()
            .with_seed(id + 100)
            .with_event_sink(Arc::new(self.events.clone()))
            .with_metrics_sink(Arc::new(self.metrics.clone()));
            node.start();
            node
        }

        fn drain(&mut self, id: u64) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(env) = self.inboxes[id as usize].try_recv() {
                out.push(env);
            }
            out
        }
    }

    #[test]
    fn follower_timeout_starts_election_and_broadcasts() {
        let mut fx = Fixture::new(3);
        let mut node = fx.node(0);
        assert_eq!(node.role(), NodeRole::Follower);
        assert!(node.election_deadline().is_some());

        node.on_election_timeout();

        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.current_term(), 1);
        assert_eq!(node.state().voted_for, Some(NodeId(0)));
        assert_eq!(node.votes_received(), 1);
        assert!(node.election_deadline().is_some());

        for peer in [1, 2] {
            let msgs = fx.drain(peer);
            assert_eq!(msgs.len(), 1);
            assert_eq!(
                msgs[0].message,
                RaftMessage::RequestVote {
                    term: 1,
                    candidate_id: NodeId(0)
                }
            );
        }
    }

    #[test]
    fn stale_vote_request_is_denied_with_own_term() {
        let fx = Fixture::new(3);
        let mut node = fx.node(1);
        node.on_election_timeout();
        node.on_election_timeout();
        assert_eq!(node.current_term(), 2);

        let reply = node.on_vote_request(NodeId(0), 1);
        assert_eq!(
            reply,
            RaftMessage::RequestVoteResponse {
                term: 2,
                vote_granted: false
            }
        );
        assert_eq!(node.role(), NodeRole::Candidate);
    }

    #[test]
    fn higher_term_request_demotes_and_grants() {
        let fx = Fixture::new(3);
        let mut node = fx.node(1);
        node.on_election_timeout();
        assert_eq!(node.role(), NodeRole::Candidate);

        fx.clock.advance(Duration::from_millis(10));
        let reply = node.on_vote_request(NodeId(2), 5);

        assert_eq!(
            reply,
            RaftMessage::RequestVoteResponse {
                term: 5,
                vote_granted: true
            }
        );
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.current_term(), 5);
        assert_eq!(node.state().voted_for, Some(NodeId(2)));
        assert_eq!(node.last_reset_at(), fx.clock.now());
        assert!(!fx.events.of_kind(EventKind::TermAdopted).is_empty());
    }

    #[test]
    fn grants_at_most_one_candidate_per_term() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);

        let first = node.on_vote_request(NodeId(1), 1);
        let second = node.on_vote_request(NodeId(2), 1);
        let repeat = node.on_vote_request(NodeId(1), 1);

        assert!(matches!(first, RaftMessage::RequestVoteResponse { vote_granted: true, .. }));
        assert!(matches!(second, RaftMessage::RequestVoteResponse { vote_granted: false, .. }));
        assert!(matches!(repeat, RaftMessage::RequestVoteResponse { vote_granted: true, .. }));

        // A new term frees the vote.
        let next = node.on_vote_request(NodeId(2), 2);
        assert!(matches!(next, RaftMessage::RequestVoteResponse { vote_granted: true, term: 2 }));
    }

    #[test]
    fn majority_of_responses_elects_leader_immediately() {
        let mut fx = Fixture::new(5);
        let mut node = fx.node(0);
        node.on_election_timeout();
        for peer in 1..5 {
            fx.drain(peer);
        }

        node.on_vote_response(NodeId(1), 1, true);
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.votes_received(), 2);

        fx.clock.advance(Duration::from_millis(12));
        node.on_vote_response(NodeId(2), 1, true);

        assert!(node.is_leader());
        assert_eq!(node.state().leader_id, Some(NodeId(0)));
        assert!(node.election_deadline().is_none());
        assert!(node.heartbeat_deadline().is_some());

        for peer in 1..5 {
            let msgs = fx.drain(peer);
            assert!(msgs.iter().any(|e| matches!(
                e.message,
                RaftMessage::Heartbeat { term: 1, leader_id: NodeId(0) }
            )));
        }

        let records = fx.metrics.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_id, NodeId(0));
        assert_eq!(records[0].term, 1);
        assert_eq!(records[0].duration_ms, 12);

        // Late responses change nothing.
        node.on_vote_response(NodeId(3), 1, true);
        assert!(node.is_leader());
        assert_eq!(fx.events.of_kind(EventKind::BecameLeader).len(), 1);
    }

    #[test]
    fn duplicate_grants_are_counted_once() {
        let fx = Fixture::new(5);
        let mut node = fx.node(0);
        node.on_election_timeout();

        node.on_vote_response(NodeId(1), 1, true);
        node.on_vote_response(NodeId(1), 1, true);
        node.on_vote_response(NodeId(1), 1, true);

        assert_eq!(node.votes_received(), 2);
        assert_eq!(node.role(), NodeRole::Candidate);
    }

    #[test]
    fn higher_term_response_discards_candidacy() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();

        node.on_vote_response(NodeId(1), 4, false);

        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.current_term(), 4);
        assert_eq!(node.state().voted_for, None);
        assert_eq!(node.votes_received(), 0);
    }

    #[test]
    fn responses_for_an_old_round_are_ignored() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();
        node.on_election_timeout();
        assert_eq!(node.current_term(), 2);

        node.on_vote_response(NodeId(1), 1, true);
        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.votes_received(), 1);
    }

    #[test]
    fn heartbeat_makes_candidate_follow() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();

        let ack = node.on_heartbeat(NodeId(2), 1);

        assert_eq!(ack, RaftMessage::HeartbeatAck { term: 1 });
        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.state().leader_id, Some(NodeId(2)));
        assert!(node.election_deadline().is_some());
        assert!(!fx.events.of_kind(EventKind::SteppedDown).is_empty());
    }

    #[test]
    fn stale_heartbeat_is_rejected_and_ack_demotes_old_leader() {
        let fx = Fixture::new(3);
        let mut old_leader = fx.node(0);
        old_leader.on_election_timeout();
        old_leader.on_vote_response(NodeId(1), 1, true);
        assert!(old_leader.is_leader());

        let mut follower = fx.node(2);
        follower.on_vote_request(NodeId(1), 3);
        let ack = follower.on_heartbeat(NodeId(0), 1);
        assert_eq!(ack, RaftMessage::HeartbeatAck { term: 3 });
        assert_eq!(follower.state().leader_id, None);
        assert_eq!(fx.events.of_kind(EventKind::HeartbeatRejected).len(), 1);

        old_leader.on_heartbeat_ack(NodeId(2), 3);
        assert_eq!(old_leader.role(), NodeRole::Follower);
        assert_eq!(old_leader.current_term(), 3);
        assert!(old_leader.heartbeat_deadline().is_none());
        assert!(old_leader.election_deadline().is_some());
    }

    #[test]
    fn leader_yields_to_equal_term_heartbeat_from_other_node() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();
        node.on_vote_response(NodeId(1), 1, true);
        assert!(node.is_leader());

        node.on_heartbeat(NodeId(2), 1);

        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.state().leader_id, Some(NodeId(2)));
        assert!(node.heartbeat_deadline().is_none());
    }

    #[test]
    fn leader_records_acks_for_current_term() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();
        node.on_vote_response(NodeId(1), 1, true);

        node.on_heartbeat_ack(NodeId(1), 1);
        node.on_heartbeat_ack(NodeId(2), 0);

        assert_eq!(node.last_ack_from(NodeId(1)), Some(fx.clock.now()));
        assert_eq!(node.last_ack_from(NodeId(2)), None);
        assert_eq!(node.counters().snapshot().heartbeat_acks, 1);
    }

    #[test]
    fn single_node_cluster_elects_itself() {
        let fx = Fixture::new(1);
        let mut node = fx.node(0);
        node.on_election_timeout();

        assert!(node.is_leader());
        assert_eq!(node.current_term(), 1);
        assert_eq!(fx.metrics.records().len(), 1);
    }

    #[test]
    fn repeated_candidate_timeout_is_a_split_vote_retry() {
        let fx = Fixture::new(5);
        let mut node = fx.node(3);
        node.on_election_timeout();
        node.on_vote_response(NodeId(1), 1, true);

        node.on_election_timeout();

        assert_eq!(node.role(), NodeRole::Candidate);
        assert_eq!(node.current_term(), 2);
        assert_eq!(node.votes_received(), 1);
        let splits = fx.events.of_kind(EventKind::SplitVote);
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].term, 1);
    }

    #[test]
    fn leader_ignores_election_timeout_and_repeats_heartbeats() {
        let mut fx = Fixture::new(3);
        let mut node = fx.node(0);
        node.on_election_timeout();
        node.on_vote_response(NodeId(1), 1, true);
        fx.drain(1);

        node.on_election_timeout();
        assert!(node.is_leader());
        assert_eq!(node.current_term(), 1);

        let (deadline, kind) = node.next_deadline().expect("heartbeat armed");
        assert_eq!(kind, TimerKind::Heartbeat);
        fx.clock.advance_to(deadline);
        assert!(node.fire_due_timers());

        let msgs = fx.drain(1);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0].message, RaftMessage::Heartbeat { term: 1, .. }));
        assert_eq!(
            node.heartbeat_deadline(),
            Some(fx.clock.now() + RaftConfig::default().heartbeat())
        );
    }

    #[test]
    fn election_timeout_is_redrawn_on_every_arm() {
        let fx = Fixture::new(3);
        let mut node = fx.node(0);
        let range = RaftConfig::default().election_timeout();

        let mut draws = vec![node.election_timeout()];
        for term in 1..10 {
            node.on_vote_request(NodeId(1), term);
            draws.push(node.election_timeout());
        }

        assert!(draws.iter().all(|d| *d >= range.min() && *d <= range.max()));
        draws.dedup();
        assert!(draws.len() > 1, "timeouts should vary between arms");
    }

    #[test]
    fn steady_heartbeats_suppress_elections() {
        let fx = Fixture::new(3);
        let mut node = fx.node(1);
        let interval = RaftConfig::default().heartbeat();

        for _ in 0..100 {
            fx.clock.advance(interval);
            assert!(!node.fire_due_timers());
            node.on_heartbeat(NodeId(0), 1);
        }

        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.current_term(), 1);
        assert!(fx.events.of_kind(EventKind::ElectionStarted).is_empty());
    }

    #[test]
    fn handle_envelope_replies_through_coordinator() {
        let mut fx = Fixture::new(3);
        let mut node = fx.node(1);

        node.handle_envelope(Envelope::new(
            NodeId(0),
            NodeId(1),
            RaftMessage::RequestVote {
                term: 1,
                candidate_id: NodeId(0),
            },
        ));

        let replies = fx.drain(0);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].from, NodeId(1));
        assert_eq!(
            replies[0].message,
            RaftMessage::RequestVoteResponse {
                term: 1,
                vote_granted: true
            }
        );
    }

    #[test]
    fn zero_period_timers_are_rejected_at_construction() {
        let fx = Fixture::new(1);
        let registry = Arc::new(PeerRegistry::with_size(1).unwrap());

        for config in [RaftConfig::new(150, 300, 0), RaftConfig::new(0, 0, 0)] {
            let coordinator =
                Coordinator::new(NodeId(0), Arc::clone(&registry), fx.transport.clone()).unwrap();
            let result = RaftNode::new(&config, coordinator, Arc::new(fx.clock.clone()));
            assert!(
                matches!(result, Err(RaftError::InvalidConfig(_))),
                "{config:?} was accepted"
            );
        }
    }
}
