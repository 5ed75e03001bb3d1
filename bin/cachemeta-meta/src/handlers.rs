//! Method dispatch table
//!
//! One handler per [`MethodKind`], shared by live traffic and replay. A
//! handler applies the request to the stores and reports whether the
//! request changed state (and therefore has to be logged).

use crate::request::{
    CompareExchangeRequest, GetBlobRequest, GetContentHashListRequest, GetContentLocationsRequest,
    GetLevelSelectorsRequest, HeartbeatRequest, HeartbeatResponse, LevelSelectors, PutBlobRequest,
    RegisterContentLocationsRequest, RequestBody, ResponseBody, ServiceRequest, ServiceResponse,
};
use cachemeta_common::config::ServiceConfig;
use cachemeta_common::{Result, unix_millis};
use cachemeta_store::{ClusterStateStore, MetadataStore, PutBlobOutcome};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Handlers over the metadata and cluster stores
pub struct MethodHandlers {
    store: Arc<MetadataStore>,
    cluster: Arc<ClusterStateStore>,
    max_blob_size: usize,
    selector_page_size: usize,
    machine_inactive_ms: u64,
}

impl MethodHandlers {
    pub fn new(
        store: Arc<MetadataStore>,
        cluster: Arc<ClusterStateStore>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            store,
            cluster,
            max_blob_size: config.max_blob_size,
            selector_page_size: config.selector_page_size.max(1),
            machine_inactive_ms: u64::try_from(config.machine_inactive().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Run the handler for `request`. Errors are storage failures; expected
    /// outcomes (missing entries, token mismatches) are part of the body.
    pub fn dispatch(&self, request: &ServiceRequest) -> Result<ServiceResponse> {
        let kind = request.kind();
        trace!("Dispatching {:?} (replaying={})", kind, request.replaying);
        let (body, persist) = match &request.body {
            RequestBody::RegisterContentLocations(r) => self.register_content_locations(r)?,
            RequestBody::PutBlob(r) => self.put_blob(r)?,
            RequestBody::CompareExchange(r) => self.compare_exchange(r)?,
            RequestBody::GetContentLocations(r) => (self.get_content_locations(r)?, false),
            RequestBody::GetBlob(r) => (self.get_blob(r)?, false),
            RequestBody::GetContentHashList(r) => (self.get_content_hash_list(r)?, false),
            RequestBody::GetLevelSelectors(r) => (self.get_level_selectors(r)?, false),
            RequestBody::Heartbeat(r) => self.heartbeat(r, request.replaying),
        };
        Ok(ServiceResponse::completed(kind, body, persist))
    }

    fn register_content_locations(
        &self,
        request: &RegisterContentLocationsRequest,
    ) -> Result<(ResponseBody, bool)> {
        let updated =
            self.store
                .register_locations(request.machine_id, &request.hashes, request.timestamp_ms)?;
        debug!(
            "Registered {} hashes for {} ({} changed)",
            request.hashes.len(),
            request.machine_id,
            updated
        );
        Ok((ResponseBody::RegisterContentLocations { updated }, updated > 0))
    }

    fn put_blob(&self, request: &PutBlobRequest) -> Result<(ResponseBody, bool)> {
        let outcome = self
            .store
            .put_blob(&request.hash, &request.blob, self.max_blob_size)?;
        if let PutBlobOutcome::TooLarge { size, max } = outcome {
            warn!("Rejected blob {}: {} bytes exceeds {}", request.hash, size, max);
        }
        let persist = outcome == PutBlobOutcome::Stored;
        Ok((ResponseBody::PutBlob(outcome), persist))
    }

    fn compare_exchange(&self, request: &CompareExchangeRequest) -> Result<(ResponseBody, bool)> {
        let outcome = self.store.compare_exchange(
            &request.strong_fingerprint,
            request.expected_replacement_token.as_deref(),
            request.replacement.clone(),
        )?;
        if !outcome.exchanged {
            debug!(
                "Compare-exchange on {} lost: token mismatch",
                request.strong_fingerprint.storage_key()
            );
        }
        let persist = outcome.exchanged;
        Ok((ResponseBody::CompareExchange(outcome), persist))
    }

    fn get_content_locations(&self, request: &GetContentLocationsRequest) -> Result<ResponseBody> {
        Ok(ResponseBody::GetContentLocations(
            self.store.get_locations(&request.hashes)?,
        ))
    }

    fn get_blob(&self, request: &GetBlobRequest) -> Result<ResponseBody> {
        Ok(ResponseBody::GetBlob(self.store.get_blob(&request.hash)?))
    }

    fn get_content_hash_list(&self, request: &GetContentHashListRequest) -> Result<ResponseBody> {
        Ok(ResponseBody::GetContentHashList(
            self.store.get_metadata(&request.strong_fingerprint)?,
        ))
    }

    fn get_level_selectors(&self, request: &GetLevelSelectorsRequest) -> Result<ResponseBody> {
        let offset = (request.level as usize).saturating_mul(self.selector_page_size);
        let (page, has_more) =
            self.store
                .get_selectors(&request.weak_fingerprint, offset, self.selector_page_size)?;
        Ok(ResponseBody::GetLevelSelectors(LevelSelectors {
            selectors: page.into_iter().map(|(selector, _)| selector).collect(),
            has_more,
        }))
    }

    /// Only a heartbeat that registers a new machine is logged; replay
    /// reuses the id recorded with it.
    fn heartbeat(&self, request: &HeartbeatRequest, replaying: bool) -> (ResponseBody, bool) {
        let now = unix_millis();
        let (machine_id, registered) = match request.assigned_id {
            Some(id) if replaying => {
                self.cluster
                    .register_with_id(id, &request.location, request.state, now);
                (id, false)
            }
            _ => {
                let registration = self.cluster.heartbeat(&request.location, request.state, now);
                (registration.id, registration.is_new)
            }
        };
        let inactive_machines = self
            .cluster
            .inactive_machines(now, self.machine_inactive_ms);
        let body = ResponseBody::Heartbeat(HeartbeatResponse {
            machine_id,
            inactive_machines,
        });
        (body, registered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachemeta_common::{
        ContentHash, Fingerprint, MachineId, MachineLocation, MachineState, Selector,
        StrongFingerprint,
    };
    use cachemeta_store::MetadataEntry;
    use tempfile::tempdir;

    fn handlers(dir: &std::path::Path, config: &ServiceConfig) -> MethodHandlers {
        let store = Arc::new(MetadataStore::open(dir.join("meta.redb")).unwrap());
        let cluster = Arc::new(ClusterStateStore::new(dir.join("cluster.bin")));
        MethodHandlers::new(store, cluster, config)
    }

    fn live(body: RequestBody) -> ServiceRequest {
        ServiceRequest::new(body)
    }

    fn entry(token: &str, updated: u64) -> MetadataEntry {
        MetadataEntry {
            content_hash_list: vec![1, 2, 3],
            replacement_token: token.to_string(),
            last_update_ms: updated,
        }
    }

    #[test]
    fn test_put_blob_persists_only_new_blobs() {
        let dir = tempdir().unwrap();
        let config = ServiceConfig {
            max_blob_size: 8,
            ..ServiceConfig::default()
        };
        let h = handlers(dir.path(), &config);

        let put = |data: &[u8]| {
            live(RequestBody::PutBlob(PutBlobRequest {
                hash: ContentHash::compute(data),
                blob: data.to_vec(),
            }))
        };

        let first = h.dispatch(&put(b"blob")).unwrap();
        assert!(first.persist_request);
        assert_eq!(first.body, Some(ResponseBody::PutBlob(PutBlobOutcome::Stored)));

        let again = h.dispatch(&put(b"blob")).unwrap();
        assert!(!again.persist_request);

        let big = h.dispatch(&put(b"much too large")).unwrap();
        assert!(!big.persist_request);
        assert!(matches!(
            big.body,
            Some(ResponseBody::PutBlob(PutBlobOutcome::TooLarge { .. }))
        ));

        let get = h
            .dispatch(&live(RequestBody::GetBlob(GetBlobRequest {
                hash: ContentHash::compute(b"blob"),
            })))
            .unwrap();
        assert_eq!(get.body, Some(ResponseBody::GetBlob(Some(b"blob".to_vec()))));
        assert!(!get.persist_request);
    }

    #[test]
    fn test_compare_exchange_persists_only_on_success() {
        let dir = tempdir().unwrap();
        let h = handlers(dir.path(), &ServiceConfig::default());
        let sf = StrongFingerprint::new(Fingerprint::new(vec![7]), Selector::new(vec![1]));

        let cas = |expected: Option<&str>, token: &str| {
            live(RequestBody::CompareExchange(CompareExchangeRequest {
                strong_fingerprint: sf.clone(),
                expected_replacement_token: expected.map(str::to_string),
                replacement: entry(token, 1),
            }))
        };

        assert!(h.dispatch(&cas(None, "t1")).unwrap().persist_request);
        assert!(!h.dispatch(&cas(Some("wrong"), "t2")).unwrap().persist_request);
        assert!(h.dispatch(&cas(Some("t1"), "t2")).unwrap().persist_request);

        let get = h
            .dispatch(&live(RequestBody::GetContentHashList(
                GetContentHashListRequest {
                    strong_fingerprint: sf.clone(),
                },
            )))
            .unwrap();
        assert_eq!(
            get.body,
            Some(ResponseBody::GetContentHashList(Some(entry("t2", 1))))
        );
    }

    #[test]
    fn test_level_selectors_paging() {
        let dir = tempdir().unwrap();
        let config = ServiceConfig {
            selector_page_size: 2,
            ..ServiceConfig::default()
        };
        let h = handlers(dir.path(), &config);
        let weak = Fingerprint::new(vec![0xAA]);
        for i in 0..3u8 {
            let sf = StrongFingerprint::new(weak.clone(), Selector::new(vec![i]));
            h.dispatch(&live(RequestBody::CompareExchange(CompareExchangeRequest {
                strong_fingerprint: sf,
                expected_replacement_token: None,
                replacement: entry("t", u64::from(i)),
            })))
            .unwrap();
        }

        let level = |level| {
            match h
                .dispatch(&live(RequestBody::GetLevelSelectors(
                    GetLevelSelectorsRequest {
                        weak_fingerprint: weak.clone(),
                        level,
                    },
                )))
                .unwrap()
                .body
            {
                Some(ResponseBody::GetLevelSelectors(page)) => page,
                other => panic!("unexpected body {other:?}"),
            }
        };

        let first = level(0);
        assert_eq!(first.selectors, vec![Selector::new(vec![2]), Selector::new(vec![1])]);
        assert!(first.has_more);
        let second = level(1);
        assert_eq!(second.selectors, vec![Selector::new(vec![0])]);
        assert!(!second.has_more);
    }

    #[test]
    fn test_register_and_get_locations() {
        let dir = tempdir().unwrap();
        let h = handlers(dir.path(), &ServiceConfig::default());
        let hash = ContentHash::compute(b"content");
        let register = live(RequestBody::RegisterContentLocations(
            RegisterContentLocationsRequest {
                machine_id: MachineId::new(3),
                hashes: vec![(hash, 42)],
                timestamp_ms: 10,
            },
        ));

        assert!(h.dispatch(&register).unwrap().persist_request);
        // Nothing new the second time
        assert!(!h.dispatch(&register).unwrap().persist_request);

        let response = h
            .dispatch(&live(RequestBody::GetContentLocations(
                GetContentLocationsRequest { hashes: vec![hash] },
            )))
            .unwrap();
        let Some(ResponseBody::GetContentLocations(found)) = response.body else {
            panic!("unexpected body");
        };
        let entry = found[0].1.as_ref().unwrap();
        assert_eq!(entry.size, 42);
        assert!(entry.machines.contains(&MachineId::new(3)));
    }

    fn heartbeat_of(response: ServiceResponse) -> HeartbeatResponse {
        let Some(ResponseBody::Heartbeat(hb)) = response.body else {
            panic!("unexpected body");
        };
        hb
    }

    #[test]
    fn test_heartbeat_persisted_only_on_registration() {
        let dir = tempdir().unwrap();
        let h = handlers(dir.path(), &ServiceConfig::default());
        let beat = live(RequestBody::Heartbeat(HeartbeatRequest::new(
            MachineLocation::new("grpc://worker-1:7089"),
            MachineState::Open,
        )));

        let first = h.dispatch(&beat).unwrap();
        assert!(first.persist_request);
        let hb = heartbeat_of(first);
        assert!(hb.machine_id.is_valid());
        assert!(hb.inactive_machines.is_empty());

        let again = h.dispatch(&beat).unwrap();
        assert!(!again.persist_request);
        assert_eq!(heartbeat_of(again).machine_id, hb.machine_id);
    }

    #[test]
    fn test_replayed_heartbeat_keeps_assigned_id() {
        let dir = tempdir().unwrap();
        let h = handlers(dir.path(), &ServiceConfig::default());
        let mut logged = HeartbeatRequest::new(
            MachineLocation::new("grpc://worker-2:7089"),
            MachineState::Open,
        );
        logged.assigned_id = Some(MachineId::new(4));

        let replayed = h
            .dispatch(&ServiceRequest::replay(RequestBody::Heartbeat(logged)))
            .unwrap();
        assert_eq!(heartbeat_of(replayed).machine_id, MachineId::new(4));

        // The next new machine gets a fresh id
        let fresh = h
            .dispatch(&live(RequestBody::Heartbeat(HeartbeatRequest::new(
                MachineLocation::new("grpc://worker-3:7089"),
                MachineState::Open,
            ))))
            .unwrap();
        assert_eq!(heartbeat_of(fresh).machine_id, MachineId::new(5));
    }
}
