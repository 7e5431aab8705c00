//! Request coordination: the bucket table and the per-request sequence.

use dashmap::DashMap;
use http::StatusCode;
use std::sync::{Arc, Mutex};
use url::Url;

use super::bucket::{Admission, Bucket, BucketId, BucketKey, BucketSnapshot, CompletionSignal};
use super::global::GlobalLimiter;
use super::handle::{RequestHandle, RequestStatus};
use crate::types::{ClientId, ErrorKind, Outcome, RestRequest, RestResponse, Result, RouteKey};

/// How many times a throttled (429) exchange is replayed after re-pacing
/// before the throttled response itself is handed to the caller
const MAX_THROTTLE_REPLAYS: u8 = 3;

/// Routes requests to buckets and drives each call through its lifecycle.
///
/// The dispatcher exclusively owns the bucket table. Buckets are created
/// lazily per route, upgraded to their server-assigned identity when a
/// response reveals it, and retired once drained. Structural table changes
/// (merge, retire) take a narrow lock of their own so unrelated buckets never
/// contend; per-bucket pacing is serialized inside each bucket.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    /// Map of bucket key to bucket, created on demand
    buckets: DashMap<BucketKey, Arc<Bucket>>,
    /// Routes whose real bucket identity has been discovered
    route_index: DashMap<RouteKey, BucketId>,
    /// Advisory throttle consulted by every bucket
    global: Arc<GlobalLimiter>,
    /// Guards table merges and retirement; never held during pacing waits
    structural: Mutex<()>,
    http: reqwest::Client,
    base_url: Url,
}

impl Dispatcher {
    pub(crate) fn new(http: reqwest::Client, base_url: Url, global_requests_per_second: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            route_index: DashMap::new(),
            global: Arc::new(GlobalLimiter::new(global_requests_per_second)),
            structural: Mutex::new(()),
            http,
            base_url,
        }
    }

    /// Drive one request to its single resolution: a completed exchange, an
    /// error, or cancellation.
    pub(crate) async fn execute(&self, client: ClientId, request: &RestRequest) -> Result<Outcome> {
        let handle = Arc::new(RequestHandle::new(client, request.route.clone()));
        self.drive(&handle, request).await
    }

    async fn drive(&self, handle: &Arc<RequestHandle>, request: &RestRequest) -> Result<Outcome> {
        let mut replays: u8 = 0;

        loop {
            let bucket = self.resolve_bucket(&request.route);
            Bucket::assign(&bucket, handle);

            // Gate first: it bounds in-flight concurrency to the discovered
            // limit. The pacing wait happens while holding the slot, so a
            // freed slot still has to wait out the window before firing.
            let permit = tokio::select! {
                permit = bucket.gate().acquire() => permit,
                () = handle.aborted() => return Ok(self.settle_cancelled(&bucket, handle)),
            };

            match bucket.wait_until_available(handle).await {
                Ok(Admission::Ready) => {}
                Ok(Admission::Cancelled) => {
                    drop(permit);
                    return Ok(self.settle_cancelled(&bucket, handle));
                }
                Ok(Admission::Superseded) => {
                    drop(permit);
                    continue;
                }
                Err(err) => {
                    drop(permit);
                    self.settle(&bucket, handle, None);
                    return Err(err);
                }
            }

            // A merge may have moved the request mid-wait; start over on the
            // successor bucket
            if let Some(owner) = handle.owner()
                && !Arc::ptr_eq(&owner, &bucket)
            {
                drop(permit);
                continue;
            }

            let _ = handle.start();
            bucket.on_start(handle);

            let result = tokio::select! {
                result = self.perform(request) => result,
                () = handle.aborted() => {
                    drop(permit);
                    return Ok(self.settle_cancelled(&bucket, handle));
                }
            };
            drop(permit);

            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    self.settle(&bucket, handle, None);
                    return Err(err);
                }
            };

            let owner = handle.owner().unwrap_or_else(|| Arc::clone(&bucket));
            if let Some(info) = &response.rate_limit {
                owner.apply_limits(info);
            }

            if response.status == StatusCode::TOO_MANY_REQUESTS && replays < MAX_THROTTLE_REPLAYS {
                // Absorbed into pacing state: the request stays pending and
                // is replayed once the reported window admits it again
                replays += 1;
                match response
                    .rate_limit
                    .as_ref()
                    .and_then(|info| info.throttle.as_ref())
                {
                    Some(notice) => log::warn!(
                        "Request {} throttled on {}: {} (code {:?})",
                        handle.id(),
                        request.route,
                        notice.message,
                        notice.code
                    ),
                    None => log::warn!("Request {} throttled on {}", handle.id(), request.route),
                }
                continue;
            }

            self.settle(&bucket, handle, response.rate_limit.as_ref());
            handle.finish(RequestStatus::Completed);
            return Ok(Outcome::Response(response));
        }
    }

    /// Remove the request from its owning bucket and act on the resulting
    /// promotion/retirement signal
    fn settle(
        &self,
        fallback: &Arc<Bucket>,
        handle: &Arc<RequestHandle>,
        info: Option<&super::headers::RateLimitInfo>,
    ) {
        let owner = handle.owner().unwrap_or_else(|| Arc::clone(fallback));
        match owner.on_complete(handle, info) {
            CompletionSignal::None => {}
            CompletionSignal::Promote(id) => self.promote(&owner, id),
            CompletionSignal::Retire => self.retire(&owner),
        }
    }

    fn settle_cancelled(&self, fallback: &Arc<Bucket>, handle: &Arc<RequestHandle>) -> Outcome {
        self.settle(fallback, handle, None);
        handle.finish(RequestStatus::Aborted);
        log::debug!("Request {} cancelled", handle.id());
        Outcome::Cancelled
    }

    async fn perform(&self, request: &RestRequest) -> Result<RestResponse> {
        let url = self.base_url.join(request.route.path())?;
        let mut builder = self.http.request(request.route.method().clone(), url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(ErrorKind::NetworkRequest)?;
        RestResponse::from_response(response).await
    }

    /// Resolve the bucket for a route: a previously discovered real identity
    /// wins; otherwise the route keys a synthetic bucket
    fn resolve_bucket(&self, route: &RouteKey) -> Arc<Bucket> {
        // Fast path: the bucket already exists, no structural change needed
        if let Some(id) = self.route_index.get(route).map(|entry| entry.value().clone()) {
            if let Some(bucket) = self.buckets.get(&BucketKey::Known(id)) {
                return Arc::clone(bucket.value());
            }
        } else if let Some(bucket) = self.buckets.get(&BucketKey::Route(route.clone())) {
            return Arc::clone(bucket.value());
        }

        // Creation goes through the structural lock, re-checking the route
        // index underneath it: a merge that just promoted this route must
        // win, so no second synthetic bucket can ever appear for it
        let _structural = self.structural.lock().unwrap();
        let key = match self.route_index.get(route).map(|entry| entry.value().clone()) {
            Some(id) => BucketKey::Known(id),
            None => BucketKey::Route(route.clone()),
        };
        if let Some(bucket) = self.buckets.get(&key) {
            return Arc::clone(bucket.value());
        }
        let bucket = Bucket::new(key.clone(), Arc::clone(&self.global));
        self.buckets.insert(key, Arc::clone(&bucket));
        bucket
    }

    /// Upgrade a synthetic bucket to its discovered identity.
    ///
    /// The identity compare-and-set guarantees exactly one merge even when
    /// several completions race to report the same discovery.
    fn promote(&self, bucket: &Arc<Bucket>, id: BucketId) {
        if !bucket.promote(id.clone()) {
            return;
        }
        let _structural = self.structural.lock().unwrap();

        for route in bucket.routes_snapshot() {
            self.route_index.insert(route, id.clone());
        }

        let known_key = BucketKey::Known(id.clone());
        let existing = self
            .buckets
            .get(&known_key)
            .map(|entry| Arc::clone(entry.value()));

        if let Some(target) = existing {
            // The scope already has a live bucket: fold this one into it
            log::debug!("Merging {} into {}", bucket.key(), target.key());
            target.merge_routes(bucket.routes_snapshot());
            for handle in bucket.drain_pending() {
                Bucket::assign(&target, &handle);
            }
            self.buckets.remove(bucket.key());
            bucket.mark_superseded();
        } else {
            // First discovery: the bucket itself becomes the known bucket
            log::debug!("Bucket {} upgraded to known bucket {id}", bucket.key());
            self.buckets.insert(known_key, Arc::clone(bucket));
            self.buckets.remove(bucket.key());
        }
    }

    /// Drop a drained synthetic bucket from the table
    fn retire(&self, bucket: &Arc<Bucket>) {
        let _structural = self.structural.lock().unwrap();
        if bucket.is_known() || bucket.is_superseded() || !bucket.pending_is_empty() {
            return;
        }
        let removed = self
            .buckets
            .remove_if(bucket.key(), |_, candidate| Arc::ptr_eq(candidate, bucket));
        if removed.is_some() {
            log::debug!("Bucket retired: {}", bucket.key());
        }
    }

    /// Cancel in-flight requests of one issuing client across all buckets
    pub(crate) fn abort_requests(&self, client: ClientId) {
        for entry in self.buckets.iter() {
            entry.value().abort_for_client(client);
        }
    }

    /// Number of live buckets
    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Point-in-time view of every live bucket
    pub(crate) fn snapshots(&self) -> Vec<BucketSnapshot> {
        self.buckets
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }
}
