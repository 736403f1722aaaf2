use crate::error::{Error, Result};
use crate::member::Member;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Requests exchanged over the request/response transport.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request {
    /// Direct probe, carrying the caller's last known view of the probed
    /// member.
    Probe(Member),
    /// Ask the receiver to probe the carried member on the caller's behalf.
    ProbeRequest(Member),
}

/// Replies to [`Request`]s.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Response {
    /// The responder's own record.
    Probe(Member),
    /// Whether the probe performed on the caller's behalf succeeded.
    ProbeRequest(bool),
}

impl Response {
    pub fn into_probe(self) -> Result<Member> {
        match self {
            Response::Probe(member) => Ok(member),
            _ => Err(Error::new_unexpected_response()),
        }
    }

    pub fn into_probe_request(self) -> Result<bool> {
        match self {
            Response::ProbeRequest(succeeded) => Ok(succeeded),
            _ => Err(Error::new_unexpected_response()),
        }
    }
}

/// Encodes a wire value for a datagram transport.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::new_serialization(Box::new(e)))
}

/// Decodes a wire value received from a datagram transport.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::new_serialization(Box::new(e)))
}
