//! The byte codec for Raft RPC value types.
//!
//! Wire transports built around this crate serialize the RPC request & response types through
//! this interface. Round-trips must be identity on all defined fields. Malformed bytes — random
//! garbage, a different message type, missing fields — must fail decoding with a
//! `SerializerError::Decode`, never a panic and never a partially constructed value.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::raft::VoteRequest;
use crate::AppData;

/// Error variants from encoding or decoding RPC values.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// A value could not be encoded.
    #[error("error encoding message: {0}")]
    Encode(String),
    /// The given bytes do not decode into the requested message type.
    #[error("error decoding message: {0}")]
    Decode(String),
}

/// A byte codec for the Raft RPC value types.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a value into bytes.
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Decode a value from bytes.
    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// The default codec: self-describing JSON via serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|err| SerializerError::Encode(err.to_string()))
    }

    fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        serde_json::from_slice(bytes).map_err(|err| SerializerError::Decode(err.to_string()))
    }
}

impl JsonSerializer {
    /// Decode a vote request, rejecting term 0 as malformed.
    ///
    /// Elections always advance the term before any RequestVote is sent, so term 0 never
    /// legitimately appears on the wire.
    pub fn decode_vote_request(&self, bytes: &[u8]) -> Result<VoteRequest, SerializerError> {
        let req: VoteRequest = self.from_bytes(bytes)?;
        if req.term == 0 {
            return Err(SerializerError::Decode("vote request with term 0".into()));
        }
        Ok(req)
    }

    /// Decode an append-entries request, rejecting term 0 as malformed.
    pub fn decode_append_entries<D: AppData>(&self, bytes: &[u8]) -> Result<AppendEntriesRequest<D>, SerializerError> {
        let req: AppendEntriesRequest<D> = self.from_bytes(bytes)?;
        if req.term == 0 {
            return Err(SerializerError::Decode("append entries request with term 0".into()));
        }
        Ok(req)
    }

    /// Decode an install-snapshot request, rejecting term 0 as malformed.
    pub fn decode_install_snapshot(&self, bytes: &[u8]) -> Result<InstallSnapshotRequest, SerializerError> {
        let req: InstallSnapshotRequest = self.from_bytes(bytes)?;
        if req.term == 0 {
            return Err(SerializerError::Decode("install snapshot request with term 0".into()));
        }
        Ok(req)
    }
}
