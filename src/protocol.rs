use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::quorum::QuorumTable;
use crate::ring::{position, Ring, REPLICATION_FACTOR};
use crate::store::LocalStore;
use crate::types::{
    Address, MessagePayload, OpKind, QuorumError, ReplicaRole, RoutingError, WireMessage,
};

pub use crate::quorum::Resolution as OpOutcome;

/// How long a coordinator waits for replica replies before a transaction
/// expires as a timeout.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of the cluster membership view, polled once per tick. Typically
/// backed by a gossip or heartbeat protocol; only eventual convergence is
/// assumed.
pub trait MembershipProvider: Send {
    fn snapshot(&mut self) -> Vec<Address>;
}

/// Best-effort message transport. `send` may silently drop; delivery on the
/// receiving side goes through `ReplicaNode::deliver`.
pub trait Transport: Send {
    fn send(&mut self, from: &Address, to: &Address, payload: Vec<u8>) -> bool;
}

/// External sink notified of every store operation's outcome, both on the
/// coordinator (at transaction resolution) and on each replica.
pub trait OpLog: Send {
    fn operation(
        &mut self,
        node: &Address,
        coordinator: bool,
        trans_id: u64,
        key: &str,
        value: Option<&str>,
        success: bool,
    );
}

/// Invoked exactly once per client operation, when it resolves.
pub type CompletionFn = Box<dyn FnMut(OpOutcome) + Send>;

/// One node of the replicated store: ring view, local key table, transaction
/// table, and the stabilization state (current replica obligations).
///
/// Runs as a cooperative single-threaded loop: the owner calls `deliver` for
/// every inbound payload and `tick` once per cycle. Handlers run to
/// completion; nothing here blocks or locks.
pub struct ReplicaNode {
    addr: Address,
    ring: Ring,
    store: LocalStore,
    quorum: QuorumTable,
    next_trans_id: u64,
    /// The two downstream nodes currently holding this node's primary data.
    successor_replicas: Vec<Address>,
    /// The two upstream nodes whose primary data this node replicates.
    predecessor_replicas: Vec<Address>,
    inbound: VecDeque<Vec<u8>>,
    /// Time of the most recent tick; transaction deadlines are computed
    /// against this, so the loop and its tests share one clock.
    clock: Instant,
    membership: Box<dyn MembershipProvider>,
    transport: Box<dyn Transport>,
    oplog: Box<dyn OpLog>,
    on_complete: CompletionFn,
}

impl ReplicaNode {
    pub fn new(
        addr: Address,
        membership: Box<dyn MembershipProvider>,
        transport: Box<dyn Transport>,
        oplog: Box<dyn OpLog>,
        on_complete: CompletionFn,
    ) -> Self {
        // Seed the counter from the node's ring position: ids stay
        // monotonic per node while id bands of different coordinators do
        // not overlap, so a repair echo (which carries another node's
        // version as trans_id) can never match a transaction pending here.
        let next_trans_id = (position(addr.as_str()) << 20) | 1;
        ReplicaNode {
            addr,
            ring: Ring::default(),
            store: LocalStore::new(),
            quorum: QuorumTable::new(),
            next_trans_id,
            successor_replicas: Vec::new(),
            predecessor_replicas: Vec::new(),
            inbound: VecDeque::new(),
            clock: Instant::now(),
            membership,
            transport,
            oplog,
            on_complete,
        }
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn pending_transactions(&self) -> usize {
        self.quorum.len()
    }

    /// Entry point for the external transport: queues one raw inbound frame.
    pub fn deliver(&mut self, payload: Vec<u8>) {
        self.inbound.push_back(payload);
    }

    /// One cycle of the node loop: refresh membership (stabilizing before
    /// the ring is replaced, so deltas see both rings), drain the inbound
    /// queue, then expire overdue transactions.
    pub fn tick(&mut self, now: Instant) {
        self.clock = now;
        let members = self.membership.snapshot();
        let new_ring = Ring::from_members(&members);
        if !new_ring.same_membership(&self.ring) {
            if self.store.is_empty() {
                self.refresh_obligations(&new_ring);
            } else {
                self.stabilize(&new_ring);
            }
            self.ring = new_ring;
        }

        let queued = self.inbound.len();
        for _ in 0..queued {
            if let Some(payload) = self.inbound.pop_front() {
                self.dispatch(&payload);
            }
        }

        for resolution in self.quorum.expire(now) {
            self.finish(resolution);
        }
    }

    // ---- client-facing API ----------------------------------------------

    pub fn create(&mut self, key: &str, value: &str) -> u64 {
        self.client_op(OpKind::Create, key, Some(value))
    }

    pub fn read(&mut self, key: &str) -> u64 {
        self.client_op(OpKind::Read, key, None)
    }

    pub fn update(&mut self, key: &str, value: &str) -> u64 {
        self.client_op(OpKind::Update, key, Some(value))
    }

    pub fn delete(&mut self, key: &str) -> u64 {
        self.client_op(OpKind::Delete, key, None)
    }

    /// Fans one client operation out to the key's replica set, tagging each
    /// request with the slot the recipient holds, and registers the
    /// transaction. The coordinator messages itself through the transport
    /// like any other replica.
    fn client_op(&mut self, op: OpKind, key: &str, value: Option<&str>) -> u64 {
        let trans_id = self.alloc_trans_id();
        let replicas = self.ring.replicas_for(key);
        let routing = (replicas.len() < REPLICATION_FACTOR)
            .then(|| RoutingError::DegradedRing(self.ring.len()));

        if replicas.is_empty() {
            self.finish(OpOutcome {
                trans_id,
                op,
                key: key.to_string(),
                result: Err(QuorumError::InsufficientAcks),
                routing,
            });
            return trans_id;
        }

        for (slot, node) in replicas.iter().enumerate() {
            let role = ReplicaRole::of_slot(slot);
            let payload = match op {
                OpKind::Create => MessagePayload::Create {
                    key: key.to_string(),
                    value: value.unwrap_or_default().to_string(),
                    role,
                },
                OpKind::Read => MessagePayload::Read {
                    key: key.to_string(),
                    role,
                },
                OpKind::Update => MessagePayload::Update {
                    key: key.to_string(),
                    value: value.unwrap_or_default().to_string(),
                    role,
                },
                OpKind::Delete => MessagePayload::Delete {
                    key: key.to_string(),
                    role,
                },
            };
            let to = node.addr.clone();
            self.send_to(&to, WireMessage::new(trans_id, self.addr.clone(), payload));
        }

        self.quorum.register(
            trans_id,
            op,
            key.to_string(),
            replicas.len(),
            self.clock + REPLY_TIMEOUT,
            routing,
        );
        trans_id
    }

    // ---- dispatcher ------------------------------------------------------

    /// Routes one inbound frame. Requests execute against the local store
    /// and are answered toward the message source; replies feed the quorum
    /// table. A frame that fails to parse is dropped, never fatal.
    fn dispatch(&mut self, payload: &[u8]) {
        let message = match WireMessage::from_bytes(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("{}: dropping inbound frame: {}", self.addr, e);
                return;
            }
        };
        let WireMessage {
            trans_id,
            source,
            payload,
        } = message;

        match payload {
            MessagePayload::Create { key, value, role } => {
                let success = self
                    .store
                    .create(&key, value.clone(), role, trans_id)
                    .is_ok();
                self.oplog.operation(
                    &self.addr,
                    false,
                    trans_id,
                    &key,
                    Some(&value),
                    success,
                );
                let reply = MessagePayload::Reply { key, success };
                self.send_to(&source, WireMessage::new(trans_id, self.addr.clone(), reply));
            }
            MessagePayload::Read { key, role: _ } => {
                let value = self.store.read(&key).map(|e| e.value.clone()).ok();
                let success = value.is_some();
                self.oplog.operation(
                    &self.addr,
                    false,
                    trans_id,
                    &key,
                    value.as_deref(),
                    success,
                );
                let reply = MessagePayload::ReadReply {
                    key,
                    value,
                    success,
                };
                self.send_to(&source, WireMessage::new(trans_id, self.addr.clone(), reply));
            }
            MessagePayload::Update { key, value, role } => {
                let success = self
                    .store
                    .update(&key, value.clone(), role, trans_id)
                    .is_ok();
                self.oplog.operation(
                    &self.addr,
                    false,
                    trans_id,
                    &key,
                    Some(&value),
                    success,
                );
                let reply = MessagePayload::Reply { key, success };
                self.send_to(&source, WireMessage::new(trans_id, self.addr.clone(), reply));
            }
            MessagePayload::Delete { key, role: _ } => {
                let success = self.store.delete(&key).is_ok();
                self.oplog
                    .operation(&self.addr, false, trans_id, &key, None, success);
                let reply = MessagePayload::Reply { key, success };
                self.send_to(&source, WireMessage::new(trans_id, self.addr.clone(), reply));
            }
            MessagePayload::Reply { key: _, success } => {
                self.route_reply(trans_id, success, None);
            }
            MessagePayload::ReadReply {
                key: _,
                value,
                success,
            } => {
                self.route_reply(trans_id, success, value);
            }
        }
    }

    fn route_reply(&mut self, trans_id: u64, success: bool, value: Option<String>) {
        if !self.quorum.is_pending(trans_id) {
            // Late, duplicate, or a repair echo.
            debug!(
                "{}: dropping unmatched reply for transaction {}",
                self.addr, trans_id
            );
            return;
        }
        if let Some(resolution) = self.quorum.record_reply(trans_id, success, value) {
            self.finish(resolution);
        }
    }

    fn finish(&mut self, resolution: OpOutcome) {
        let success = resolution.result.is_ok();
        let value = match &resolution.result {
            Ok(Some(v)) => Some(v.as_str()),
            _ => None,
        };
        self.oplog.operation(
            &self.addr,
            true,
            resolution.trans_id,
            &resolution.key,
            value,
            success,
        );
        (self.on_complete)(resolution);
    }

    // ---- stabilization ---------------------------------------------------

    /// Reconciles the local store against a changed ring. Runs with
    /// `self.ring` still holding the old ring; the caller replaces it after.
    ///
    /// Repair traffic reuses the CREATE/DELETE shapes, fire-and-forget:
    /// repair creates carry the entry's own version as `trans_id` so holders
    /// of equal-or-newer data reject them, which is what makes a re-run
    /// against an unchanged ring move nothing.
    fn stabilize(&mut self, new_ring: &Ring) {
        let new_successors = new_ring.successors_of(&self.addr);
        let old_successors = self.successor_replicas.clone();

        // Successor slots whose occupant changed: re-push every primary
        // entry under the slot's role, and clear the demoted holder.
        let primaries: Vec<(String, String, u64)> = self
            .store
            .primary_entries()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.last_trans_id))
            .collect();
        for (slot, new_occupant) in new_successors.iter().enumerate() {
            if old_successors.get(slot) == Some(new_occupant) {
                continue;
            }
            let role = ReplicaRole::of_slot(slot + 1);
            debug!(
                "{}: successor slot {} now {}, pushing {} primary keys",
                self.addr,
                slot,
                new_occupant,
                primaries.len()
            );
            for (key, value, version) in &primaries {
                self.send_to(
                    new_occupant,
                    WireMessage::new(
                        *version,
                        self.addr.clone(),
                        MessagePayload::Create {
                            key: key.clone(),
                            value: value.clone(),
                            role,
                        },
                    ),
                );
            }
            if let Some(old_occupant) = old_successors.get(slot).cloned() {
                let demoted = new_ring.contains(&old_occupant)
                    && !new_successors.contains(&old_occupant)
                    && old_occupant != self.addr;
                if demoted {
                    for (key, _, _) in &primaries {
                        self.send_to(
                            &old_occupant,
                            WireMessage::new(
                                0,
                                self.addr.clone(),
                                MessagePayload::Delete {
                                    key: key.clone(),
                                    role,
                                },
                            ),
                        );
                    }
                }
            }
        }

        // Departed predecessors: entries we replicated for them are promoted
        // onto the replica set the new ring assigns, in recorded order.
        let departed: Vec<Address> = self
            .predecessor_replicas
            .iter()
            .filter(|p| !new_ring.contains(p))
            .cloned()
            .collect();
        for lost in &departed {
            let orphaned: Vec<(String, String, u64)> = self
                .store
                .entries()
                .filter(|(_, e)| e.role != ReplicaRole::Primary)
                .filter(|(key, _)| {
                    self.ring
                        .replicas_for(key.as_str())
                        .first()
                        .map(|primary| &primary.addr == lost)
                        .unwrap_or(false)
                })
                .map(|(k, e)| (k.clone(), e.value.clone(), e.last_trans_id))
                .collect();
            debug!(
                "{}: predecessor {} left the ring, re-homing {} keys",
                self.addr,
                lost,
                orphaned.len()
            );
            for (key, value, version) in orphaned {
                let mut held_locally = false;
                for (slot, node) in new_ring.replicas_for(&key).iter().enumerate() {
                    let role = ReplicaRole::of_slot(slot);
                    if node.addr == self.addr {
                        self.store.set_role(&key, role);
                        held_locally = true;
                    } else {
                        self.send_to(
                            &node.addr,
                            WireMessage::new(
                                version,
                                self.addr.clone(),
                                MessagePayload::Create {
                                    key: key.clone(),
                                    value: value.clone(),
                                    role,
                                },
                            ),
                        );
                    }
                }
                if !held_locally {
                    // The new ring routed the key entirely elsewhere.
                    let _ = self.store.delete(&key);
                }
            }
        }

        self.successor_replicas = new_successors;
        self.predecessor_replicas = new_ring.predecessors_of(&self.addr);
    }

    fn refresh_obligations(&mut self, ring: &Ring) {
        self.successor_replicas = ring.successors_of(&self.addr);
        self.predecessor_replicas = ring.predecessors_of(&self.addr);
    }

    // ---- plumbing --------------------------------------------------------

    fn alloc_trans_id(&mut self) -> u64 {
        let id = self.next_trans_id;
        self.next_trans_id += 1;
        id
    }

    fn send_to(&mut self, to: &Address, message: WireMessage) {
        match message.to_bytes() {
            Ok(bytes) => {
                if !self.transport.send(&self.addr, to, bytes) {
                    debug!("{}: send to {} dropped by transport", self.addr, to);
                }
            }
            Err(e) => warn!("{}: {}", self.addr, e),
        }
    }
}
