use std::collections::HashMap;
use std::time::Instant;

use crate::types::{OpKind, QuorumError, RoutingError};

/// Acknowledgments required before a client operation counts as successful,
/// out of up to 3 expected replies.
pub const REQUIRED_QUORUM: usize = 2;

/// An in-flight client operation awaiting replica replies.
#[derive(Debug)]
struct Transaction {
    op: OpKind,
    key: String,
    /// Replies expected, the replica set size at send time (≤ 3).
    expected: usize,
    replies: usize,
    successes: usize,
    /// Values carried by successful READ_REPLYs, in arrival order.
    values: Vec<String>,
    deadline: Instant,
    routing: Option<RoutingError>,
}

/// The client-visible outcome of one transaction. Produced exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub trans_id: u64,
    pub op: OpKind,
    pub key: String,
    pub result: Result<Option<String>, QuorumError>,
    /// Present when the operation ran against a degraded ring.
    pub routing: Option<RoutingError>,
}

/// Tracks in-flight transactions by id and resolves each one exactly once:
/// on quorum, on arithmetic impossibility of quorum, or on deadline expiry.
#[derive(Debug, Default)]
pub struct QuorumTable {
    pending: HashMap<u64, Transaction>,
}

impl QuorumTable {
    pub fn new() -> Self {
        QuorumTable {
            pending: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        trans_id: u64,
        op: OpKind,
        key: String,
        expected: usize,
        deadline: Instant,
        routing: Option<RoutingError>,
    ) {
        self.pending.insert(
            trans_id,
            Transaction {
                op,
                key,
                expected,
                replies: 0,
                successes: 0,
                values: Vec::new(),
                deadline,
                routing,
            },
        );
    }

    pub fn is_pending(&self, trans_id: u64) -> bool {
        self.pending.contains_key(&trans_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Accounts one REPLY/READ_REPLY. Returns the resolution if this reply
    /// settles the transaction. Unknown ids (late, duplicate after
    /// resolution, or repair echoes) return `None` and leave no trace.
    pub fn record_reply(
        &mut self,
        trans_id: u64,
        success: bool,
        value: Option<String>,
    ) -> Option<Resolution> {
        let txn = self.pending.get_mut(&trans_id)?;
        txn.replies += 1;
        if success {
            txn.successes += 1;
            if txn.op == OpKind::Read {
                if let Some(v) = value {
                    txn.values.push(v);
                }
            }
        }
        let result = Self::settle(txn)?;
        let txn = self.pending.remove(&trans_id)?;
        Some(Resolution {
            trans_id,
            op: txn.op,
            key: txn.key,
            result,
            routing: txn.routing,
        })
    }

    /// Resolves every transaction whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<Resolution> {
        let due: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|trans_id| {
                let txn = self.pending.remove(&trans_id)?;
                // Divergent successful reads had already reached quorum
                // count; that is a consistency violation, not a timeout.
                let error = if txn.op == OpKind::Read
                    && txn.successes >= REQUIRED_QUORUM
                    && Self::quorum_value(&txn).is_none()
                {
                    QuorumError::QuorumConflict
                } else {
                    QuorumError::Timeout
                };
                Some(Resolution {
                    trans_id,
                    op: txn.op,
                    key: txn.key,
                    result: Err(error),
                    routing: txn.routing,
                })
            })
            .collect()
    }

    /// Quorum arithmetic. `None` means the transaction stays in flight.
    fn settle(txn: &Transaction) -> Option<Result<Option<String>, QuorumError>> {
        let outstanding = txn.expected.saturating_sub(txn.replies);
        if txn.op == OpKind::Read {
            if let Some(v) = Self::quorum_value(txn) {
                return Some(Ok(Some(v)));
            }
            if txn.successes + outstanding < REQUIRED_QUORUM {
                return Some(Err(QuorumError::InsufficientAcks));
            }
            if outstanding == 0 {
                // All replies in, enough successes, but no two agree.
                return Some(Err(QuorumError::QuorumConflict));
            }
            return None;
        }
        if txn.successes >= REQUIRED_QUORUM {
            Some(Ok(None))
        } else if txn.successes + outstanding < REQUIRED_QUORUM {
            Some(Err(QuorumError::InsufficientAcks))
        } else {
            None
        }
    }

    /// A value reported by a quorum of identical successful replies.
    fn quorum_value(txn: &Transaction) -> Option<String> {
        txn.values
            .iter()
            .find(|v| txn.values.iter().filter(|w| w == v).count() >= REQUIRED_QUORUM)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn table_with(op: OpKind, expected: usize) -> QuorumTable {
        let mut table = QuorumTable::new();
        table.register(
            1,
            op,
            "k".to_string(),
            expected,
            Instant::now() + Duration::from_secs(60),
            None,
        );
        table
    }

    #[test]
    fn test_two_successes_resolve_without_third_reply() {
        let mut table = table_with(OpKind::Create, 3);
        assert!(table.record_reply(1, true, None).is_none());
        let resolution = table.record_reply(1, true, None).unwrap();
        assert_eq!(resolution.result, Ok(None));
        assert!(table.is_empty());
    }

    #[test]
    fn test_one_success_two_failures_resolves_failure() {
        let mut table = table_with(OpKind::Update, 3);
        assert!(table.record_reply(1, true, None).is_none());
        assert!(table.record_reply(1, false, None).is_none());
        let resolution = table.record_reply(1, false, None).unwrap();
        assert_eq!(resolution.result, Err(QuorumError::InsufficientAcks));
    }

    #[test]
    fn test_two_failures_resolve_early() {
        let mut table = table_with(OpKind::Delete, 3);
        assert!(table.record_reply(1, false, None).is_none());
        let resolution = table.record_reply(1, false, None).unwrap();
        assert_eq!(resolution.result, Err(QuorumError::InsufficientAcks));
    }

    #[test]
    fn test_read_quorum_needs_identical_values() {
        let mut table = table_with(OpKind::Read, 3);
        assert!(table
            .record_reply(1, true, Some("v".to_string()))
            .is_none());
        let resolution = table.record_reply(1, true, Some("v".to_string())).unwrap();
        assert_eq!(resolution.result, Ok(Some("v".to_string())));
    }

    #[test]
    fn test_divergent_reads_surface_conflict() {
        let mut table = table_with(OpKind::Read, 3);
        assert!(table
            .record_reply(1, true, Some("a".to_string()))
            .is_none());
        // Two successes but no agreement: the third reply could still match
        // either value, so the transaction stays open.
        assert!(table
            .record_reply(1, true, Some("b".to_string()))
            .is_none());
        let resolution = table.record_reply(1, true, Some("c".to_string())).unwrap();
        assert_eq!(resolution.result, Err(QuorumError::QuorumConflict));
    }

    #[test]
    fn test_divergent_reads_conflict_on_expiry() {
        let mut table = QuorumTable::new();
        let deadline = Instant::now();
        table.register(7, OpKind::Read, "k".to_string(), 3, deadline, None);
        table.record_reply(7, true, Some("a".to_string()));
        table.record_reply(7, true, Some("b".to_string()));
        let expired = table.expire(deadline + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].result, Err(QuorumError::QuorumConflict));
    }

    #[test]
    fn test_deadline_expiry_times_out() {
        let mut table = QuorumTable::new();
        let deadline = Instant::now();
        table.register(3, OpKind::Create, "k".to_string(), 3, deadline, None);
        table.record_reply(3, true, None);
        let expired = table.expire(deadline + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].result, Err(QuorumError::Timeout));
        assert!(table.expire(deadline + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_late_and_duplicate_replies_are_dropped() {
        let mut table = table_with(OpKind::Create, 3);
        table.record_reply(1, true, None);
        table.record_reply(1, true, None).unwrap();
        // Resolved: the straggler no longer matches anything.
        assert!(table.record_reply(1, true, None).is_none());
        assert!(table.record_reply(42, true, None).is_none());
    }

    #[test]
    fn test_single_replica_cannot_reach_quorum() {
        let mut table = table_with(OpKind::Create, 1);
        let resolution = table.record_reply(1, true, None).unwrap();
        assert_eq!(resolution.result, Err(QuorumError::InsufficientAcks));
    }
}
