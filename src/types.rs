use std::fmt;

/// Opaque node identifier, the `host:port` of a cluster member. Nodes are
/// placed on the ring by hashing their address exactly like keys.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct Address(pub String);

impl Address {
    pub fn new(host: &str, port: u16) -> Self {
        Address(format!("{}:{}", host, port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the three replica slots an entry or request occupies. This is a
/// placement tag, not a storage tier: the same key is PRIMARY on one node and
/// SECONDARY/TERTIARY on its two ring-successors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
    rkyv::Archive,
    rkyv::Deserialize,
    rkyv::Serialize,
)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug, PartialEq))]
pub enum ReplicaRole {
    Primary,
    Secondary,
    Tertiary,
}

impl ReplicaRole {
    /// Role for the i-th node of a replica set (0 = primary).
    pub fn of_slot(slot: usize) -> Self {
        match slot {
            0 => ReplicaRole::Primary,
            1 => ReplicaRole::Secondary,
            _ => ReplicaRole::Tertiary,
        }
    }
}

/// The operation a client-facing transaction performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OpKind {
    Create,
    Read,
    Update,
    Delete,
}

/// The six message shapes carried on the wire. Requests carry the replica
/// role the recipient holds for the key; replies carry the outcome.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub enum MessagePayload {
    Create {
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Read {
        key: String,
        role: ReplicaRole,
    },
    Update {
        key: String,
        value: String,
        role: ReplicaRole,
    },
    Delete {
        key: String,
        role: ReplicaRole,
    },
    Reply {
        key: String,
        success: bool,
    },
    ReadReply {
        key: String,
        value: Option<String>,
        success: bool,
    },
}

/// A single wire frame. `trans_id` routes replies back to the coordinator's
/// transaction table; repair traffic reuses the request shapes with the
/// entry's version as `trans_id` (`0` for repair deletes) so its replies
/// never match a registered transaction.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Deserialize, rkyv::Serialize)]
#[archive_attr(derive(bytecheck::CheckBytes, Debug))]
pub struct WireMessage {
    pub trans_id: u64,
    pub source: Address,
    pub payload: MessagePayload,
}

impl WireMessage {
    pub fn new(trans_id: u64, source: Address, payload: MessagePayload) -> Self {
        WireMessage {
            trans_id,
            source,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = rkyv::to_bytes::<_, 512>(self)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// Parses a frame received from the transport. The buffer is untrusted;
    /// every access is validated, so a corrupt or truncated frame fails with
    /// `ProtocolError::Malformed` instead of crashing the dispatcher.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        use rkyv::Deserialize;

        // Re-align: transport buffers carry no alignment guarantee.
        let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);

        let archived = rkyv::check_archived_root::<WireMessage>(&aligned)
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let message: WireMessage = archived
            .deserialize(&mut rkyv::Infallible)
            .map_err(|_| ProtocolError::Malformed("deserialize".to_string()))?;
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("key already exists")]
    KeyExists,
    #[error("key not found")]
    KeyNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuorumError {
    #[error("transaction deadline elapsed before quorum")]
    Timeout,
    #[error("quorum of 2 acknowledgments became unreachable")]
    InsufficientAcks,
    #[error("successful replies carried divergent values")]
    QuorumConflict,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Malformed(String),
    #[error("message encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("ring has only {0} members, key cannot be fully replicated")]
    DegradedRing(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: WireMessage) {
        let bytes = message.to_bytes().unwrap();
        let parsed = WireMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_round_trip_all_shapes() {
        let source = Address::new("127.0.0.1", 9000);
        let shapes = vec![
            MessagePayload::Create {
                key: "k".to_string(),
                value: "v".to_string(),
                role: ReplicaRole::Primary,
            },
            MessagePayload::Read {
                key: "k".to_string(),
                role: ReplicaRole::Secondary,
            },
            MessagePayload::Update {
                key: "k".to_string(),
                value: "v2".to_string(),
                role: ReplicaRole::Tertiary,
            },
            MessagePayload::Delete {
                key: "k".to_string(),
                role: ReplicaRole::Primary,
            },
            MessagePayload::Reply {
                key: "k".to_string(),
                success: true,
            },
            MessagePayload::ReadReply {
                key: "k".to_string(),
                value: Some("v".to_string()),
                success: true,
            },
            MessagePayload::ReadReply {
                key: "k".to_string(),
                value: None,
                success: false,
            },
        ];
        for (i, payload) in shapes.into_iter().enumerate() {
            round_trip(WireMessage::new(i as u64 + 1, source.clone(), payload));
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(matches!(
            WireMessage::from_bytes(&[0x13, 0x37, 0x00]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            WireMessage::from_bytes(&[]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_role_of_slot() {
        assert_eq!(ReplicaRole::of_slot(0), ReplicaRole::Primary);
        assert_eq!(ReplicaRole::of_slot(1), ReplicaRole::Secondary);
        assert_eq!(ReplicaRole::of_slot(2), ReplicaRole::Tertiary);
    }
}
