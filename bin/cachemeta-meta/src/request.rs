//! Request and response model of the metadata RPC surface
//!
//! Every request is a [`RequestBody`] variant tagged with a [`MethodKind`].
//! Write requests are persisted to the event stream as `(tag, bincode
//! payload)` pairs and decoded again during replay.

use cachemeta_common::{
    ContentHash, Error, Fingerprint, MachineId, MachineLocation, MachineState, Result, Selector,
    StrongFingerprint,
};
use cachemeta_store::{CompareExchangeOutcome, ContentLocationEntry, MetadataEntry, PutBlobOutcome};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// RPC method tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MethodKind {
    RegisterContentLocations = 1,
    PutBlob = 2,
    CompareExchange = 3,
    GetContentLocations = 4,
    GetBlob = 5,
    GetContentHashList = 6,
    GetLevelSelectors = 7,
    Heartbeat = 8,
}

impl MethodKind {
    pub const ALL: [Self; 8] = [
        Self::RegisterContentLocations,
        Self::PutBlob,
        Self::CompareExchange,
        Self::GetContentLocations,
        Self::GetBlob,
        Self::GetContentHashList,
        Self::GetLevelSelectors,
        Self::Heartbeat,
    ];

    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MethodKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == value)
            .ok_or(Error::UnknownMethod(value))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterContentLocationsRequest {
    pub machine_id: MachineId,
    /// (hash, size) pairs
    pub hashes: Vec<(ContentHash, u64)>,
    pub timestamp_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutBlobRequest {
    pub hash: ContentHash,
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareExchangeRequest {
    pub strong_fingerprint: StrongFingerprint,
    /// `None` inserts only if no entry exists yet
    pub expected_replacement_token: Option<String>,
    pub replacement: MetadataEntry,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetContentLocationsRequest {
    pub hashes: Vec<ContentHash>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlobRequest {
    pub hash: ContentHash,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetContentHashListRequest {
    pub strong_fingerprint: StrongFingerprint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLevelSelectorsRequest {
    pub weak_fingerprint: Fingerprint,
    /// Page index
    pub level: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub location: MachineLocation,
    pub state: MachineState,
    /// Id handed out when this heartbeat registered the machine. Only set
    /// on the copy written to the event stream.
    pub assigned_id: Option<MachineId>,
}

impl HeartbeatRequest {
    #[must_use]
    pub fn new(location: MachineLocation, state: MachineState) -> Self {
        Self {
            location,
            state,
            assigned_id: None,
        }
    }
}

/// Tagged union over the RPC methods
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    RegisterContentLocations(RegisterContentLocationsRequest),
    PutBlob(PutBlobRequest),
    CompareExchange(CompareExchangeRequest),
    GetContentLocations(GetContentLocationsRequest),
    GetBlob(GetBlobRequest),
    GetContentHashList(GetContentHashListRequest),
    GetLevelSelectors(GetLevelSelectorsRequest),
    Heartbeat(HeartbeatRequest),
}

impl RequestBody {
    #[must_use]
    pub const fn kind(&self) -> MethodKind {
        match self {
            Self::RegisterContentLocations(_) => MethodKind::RegisterContentLocations,
            Self::PutBlob(_) => MethodKind::PutBlob,
            Self::CompareExchange(_) => MethodKind::CompareExchange,
            Self::GetContentLocations(_) => MethodKind::GetContentLocations,
            Self::GetBlob(_) => MethodKind::GetBlob,
            Self::GetContentHashList(_) => MethodKind::GetContentHashList,
            Self::GetLevelSelectors(_) => MethodKind::GetLevelSelectors,
            Self::Heartbeat(_) => MethodKind::Heartbeat,
        }
    }

    /// Routing key for replay: requests touching the same logical key share
    /// a partition and are reapplied in log order.
    #[must_use]
    pub fn partition_key(&self) -> u64 {
        match self {
            Self::PutBlob(r) => xxh64(r.hash.as_bytes(), 0),
            Self::GetBlob(r) => xxh64(r.hash.as_bytes(), 0),
            Self::CompareExchange(r) => xxh64(r.strong_fingerprint.storage_key().as_bytes(), 0),
            Self::GetContentHashList(r) => {
                xxh64(r.strong_fingerprint.storage_key().as_bytes(), 0)
            }
            Self::GetLevelSelectors(r) => xxh64(r.weak_fingerprint.as_bytes(), 0),
            // Location registration is a set union, so per-machine order suffices
            Self::RegisterContentLocations(r) => u64::from(r.machine_id.value()),
            Self::GetContentLocations(r) => r
                .hashes
                .first()
                .map_or(0, |h| xxh64(h.as_bytes(), 0)),
            Self::Heartbeat(r) => xxh64(r.location.as_str().as_bytes(), 0),
        }
    }

    /// Serialize the payload for the event stream
    pub fn encode(&self) -> Result<Vec<u8>> {
        let encoded = match self {
            Self::RegisterContentLocations(r) => bincode::serialize(r),
            Self::PutBlob(r) => bincode::serialize(r),
            Self::CompareExchange(r) => bincode::serialize(r),
            Self::GetContentLocations(r) => bincode::serialize(r),
            Self::GetBlob(r) => bincode::serialize(r),
            Self::GetContentHashList(r) => bincode::serialize(r),
            Self::GetLevelSelectors(r) => bincode::serialize(r),
            Self::Heartbeat(r) => bincode::serialize(r),
        };
        encoded.map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize the copy written to the event stream. A heartbeat that
    /// registered a machine carries the id it was given so replay hands out
    /// the same one.
    pub fn encode_logged(&self, response: Option<&ResponseBody>) -> Result<Vec<u8>> {
        if let (Self::Heartbeat(request), Some(ResponseBody::Heartbeat(assigned))) =
            (self, response)
        {
            let pinned = HeartbeatRequest {
                assigned_id: Some(assigned.machine_id),
                ..request.clone()
            };
            return Self::Heartbeat(pinned).encode();
        }
        self.encode()
    }

    /// Decode a logged payload. An unknown tag is a protocol/version
    /// mismatch and surfaces as [`Error::UnknownMethod`].
    pub fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        fn de<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
            bincode::deserialize(payload).map_err(|e| Error::Deserialization(e.to_string()))
        }

        Ok(match MethodKind::try_from(tag)? {
            MethodKind::RegisterContentLocations => Self::RegisterContentLocations(de(payload)?),
            MethodKind::PutBlob => Self::PutBlob(de(payload)?),
            MethodKind::CompareExchange => Self::CompareExchange(de(payload)?),
            MethodKind::GetContentLocations => Self::GetContentLocations(de(payload)?),
            MethodKind::GetBlob => Self::GetBlob(de(payload)?),
            MethodKind::GetContentHashList => Self::GetContentHashList(de(payload)?),
            MethodKind::GetLevelSelectors => Self::GetLevelSelectors(de(payload)?),
            MethodKind::Heartbeat => Self::Heartbeat(de(payload)?),
        })
    }
}

/// An inbound call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Set only while the request is reapplied from the event stream
    pub replaying: bool,
    pub body: RequestBody,
}

impl ServiceRequest {
    /// A live request from a client
    #[must_use]
    pub const fn new(body: RequestBody) -> Self {
        Self {
            replaying: false,
            body,
        }
    }

    /// A request reapplied from the event stream
    #[must_use]
    pub const fn replay(body: RequestBody) -> Self {
        Self {
            replaying: true,
            body,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MethodKind {
        self.body.kind()
    }
}

/// Page of selectors for a weak fingerprint
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSelectors {
    pub selectors: Vec<Selector>,
    pub has_more: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub machine_id: MachineId,
    pub inactive_machines: Vec<MachineId>,
}

/// Method-specific result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseBody {
    RegisterContentLocations { updated: usize },
    PutBlob(PutBlobOutcome),
    CompareExchange(CompareExchangeOutcome),
    GetContentLocations(Vec<(ContentHash, Option<ContentLocationEntry>)>),
    GetBlob(Option<Vec<u8>>),
    GetContentHashList(Option<MetadataEntry>),
    GetLevelSelectors(LevelSelectors),
    Heartbeat(HeartbeatResponse),
}

/// Structured response; expected failures are reported through
/// `should_retry` rather than as errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResponse {
    pub kind: MethodKind,
    /// The caller must retry (possibly against another node)
    pub should_retry: bool,
    /// Set by the handler: the request changed state and must be logged
    pub persist_request: bool,
    /// `None` when the handler was never invoked
    pub body: Option<ResponseBody>,
}

impl ServiceResponse {
    /// Short-circuit response telling the caller to retry
    #[must_use]
    pub const fn retry(kind: MethodKind) -> Self {
        Self {
            kind,
            should_retry: true,
            persist_request: false,
            body: None,
        }
    }

    #[must_use]
    pub const fn completed(kind: MethodKind, body: ResponseBody, persist_request: bool) -> Self {
        Self {
            kind,
            should_retry: false,
            persist_request,
            body: Some(body),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_blob(data: &[u8]) -> RequestBody {
        RequestBody::PutBlob(PutBlobRequest {
            hash: ContentHash::compute(data),
            blob: data.to_vec(),
        })
    }

    #[test]
    fn test_method_kind_tags() {
        for kind in MethodKind::ALL {
            assert_eq!(MethodKind::try_from(kind.tag()).unwrap(), kind);
        }
        assert!(matches!(
            MethodKind::try_from(0),
            Err(Error::UnknownMethod(0))
        ));
        assert!(matches!(
            MethodKind::try_from(99),
            Err(Error::UnknownMethod(99))
        ));
    }

    #[test]
    fn test_logged_heartbeat_carries_assigned_id() {
        let body = RequestBody::Heartbeat(HeartbeatRequest::new(
            MachineLocation::new("grpc://w1:7089"),
            MachineState::Open,
        ));
        let response = ResponseBody::Heartbeat(HeartbeatResponse {
            machine_id: MachineId::new(9),
            inactive_machines: vec![],
        });
        let payload = body.encode_logged(Some(&response)).unwrap();
        let RequestBody::Heartbeat(logged) =
            RequestBody::decode(MethodKind::Heartbeat.tag(), &payload).unwrap()
        else {
            panic!("unexpected body");
        };
        assert_eq!(logged.assigned_id, Some(MachineId::new(9)));
        assert_eq!(logged.location, MachineLocation::new("grpc://w1:7089"));

        // Other kinds are logged as received
        let blob = put_blob(b"x");
        assert_eq!(blob.encode_logged(None).unwrap(), blob.encode().unwrap());
    }

    #[test]
    fn test_logged_payload_decodes_to_same_request() {
        let body = RequestBody::CompareExchange(CompareExchangeRequest {
            strong_fingerprint: StrongFingerprint::new(
                Fingerprint::new(vec![1, 2]),
                Selector::new(vec![3]),
            ),
            expected_replacement_token: Some("old".to_string()),
            replacement: MetadataEntry {
                content_hash_list: vec![9, 9],
                replacement_token: "new".to_string(),
                last_update_ms: 17,
            },
        });
        let payload = body.encode().unwrap();
        let decoded = RequestBody::decode(body.kind().tag(), &payload).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let payload = put_blob(b"x").encode().unwrap();
        assert!(matches!(
            RequestBody::decode(200, &payload),
            Err(Error::UnknownMethod(200))
        ));
    }

    #[test]
    fn test_partition_key_is_per_logical_key() {
        assert_eq!(put_blob(b"a").partition_key(), put_blob(b"a").partition_key());
        let get = RequestBody::GetBlob(GetBlobRequest {
            hash: ContentHash::compute(b"a"),
        });
        assert_eq!(get.partition_key(), put_blob(b"a").partition_key());
    }

    #[test]
    fn test_retry_response_has_no_body() {
        let response = ServiceResponse::retry(MethodKind::PutBlob);
        assert!(response.should_retry);
        assert!(!response.persist_request);
        assert!(response.body.is_none());
    }
}
