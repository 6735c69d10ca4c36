//! RequestRouter (C7): maintains a live target table per model and forwards
//! inbound requests to one active backend, with failover and passive
//! health-driven deactivation.

mod policy;
mod target;

pub use policy::LoadBalancePolicy;
pub use target::{TargetState, CONSECUTIVE_FAILURE_LIMIT};

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::{CoreResult, TransientTransportError};
use crate::models::{LifecycleState, ModelId, ModelRegistry};
use crate::shutdown::ShutdownCoordinator;

use policy::RoundRobinCounter;

/// Bounded per-target diagnostic history, in addition to the live counters
/// on `TargetState` itself.
const DEFAULT_REQUEST_HISTORY: usize = 1000;

struct ModelTargets {
    targets: Vec<Arc<TargetState>>,
    counter: RoundRobinCounter,
    history: std::collections::VecDeque<RequestRecord>,
}

impl ModelTargets {
    fn new() -> Self {
        Self {
            targets: Vec::new(),
            counter: RoundRobinCounter::new(),
            history: std::collections::VecDeque::new(),
        }
    }

    fn active(&self) -> Vec<Arc<TargetState>> {
        self.targets.iter().filter(|t| t.is_active()).cloned().collect()
    }

    fn record(&mut self, record: RequestRecord) {
        self.history.push_back(record);
        while self.history.len() > DEFAULT_REQUEST_HISTORY {
            self.history.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub id: uuid::Uuid,
    pub endpoint_url: String,
    pub status: Option<u16>,
    pub response_time_ms: u64,
    pub failed: bool,
}

/// Owns the per-model target table and forwards requests to it. Table
/// updates arrive from `ModelRegistry::on_state_change` (add on transition to
/// RUNNING, remove on any transition away from it); health-driven
/// deactivation is applied directly by C6 via `set_unhealthy`.
pub struct RequestRouter {
    table: DashMap<ModelId, ModelTargets>,
    policy: RwLock<LoadBalancePolicy>,
    http: reqwest::Client,
}

impl RequestRouter {
    pub fn new(policy: LoadBalancePolicy) -> Arc<Self> {
        Arc::new(Self {
            table: DashMap::new(),
            policy: RwLock::new(policy),
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client builder with static config never fails"),
        })
    }

    /// Registers a listener on `registry` that keeps the target table in
    /// sync with lifecycle transitions. Must be called once during wiring.
    pub fn attach(self: &Arc<Self>, registry: &ModelRegistry) {
        let router = self.clone();
        registry.on_state_change(Arc::new(move |event| {
            if event.to == LifecycleState::Running {
                if let Some(endpoint_url) = event.endpoint_url.clone() {
                    router.add_target(event.model_id.clone(), endpoint_url);
                }
            } else if event.from == LifecycleState::Running {
                router.remove_targets(&event.model_id);
            }
        }));
    }

    fn add_target(&self, model_id: ModelId, endpoint_url: String) {
        let mut entry = self.table.entry(model_id).or_insert_with(ModelTargets::new);
        entry.targets.retain(|t| t.endpoint_url != endpoint_url);
        entry.targets.push(Arc::new(TargetState::new(endpoint_url, 5, 1)));
    }

    fn remove_targets(&self, model_id: &ModelId) {
        self.table.remove(model_id);
    }

    /// Marks every target for `model_id` inactive. Called by C6 on an
    /// unhealthy verdict; C6 (or the next successful request) restores it.
    pub fn set_unhealthy(&self, model_id: &ModelId) {
        if let Some(entry) = self.table.get(model_id) {
            for target in &entry.targets {
                target.set_active(false);
            }
        }
    }

    pub fn update_policy(&self, policy: LoadBalancePolicy) {
        *self.policy.write() = policy;
    }

    pub fn active_target_count(&self, model_id: &ModelId) -> usize {
        self.table.get(model_id).map(|e| e.active().len()).unwrap_or(0)
    }

    /// Forwards one request body to an active target of `model_id`, failing
    /// over once to a second target on transport error. Returns the response
    /// with its status/headers/body copied through unmodified.
    pub async fn forward(
        &self,
        model_id: &ModelId,
        method: reqwest::Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> CoreResult<Response> {
        let policy = *self.policy.read();
        let mut tried = Vec::new();
        loop {
            let target = self.pick_target(model_id, &policy, &tried)?;
            tried.push(target.endpoint_url.clone());
            target.begin_request();
            let started = Instant::now();

            let url = format!("{}{}", target.endpoint_url, path_and_query);
            let result = self
                .http
                .request(method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            let elapsed_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let failed = status.is_server_error();
                    let deactivated = target.finish_request(elapsed_ms, failed);
                    self.record(model_id, RequestRecord {
                        id: uuid::Uuid::new_v4(),
                        endpoint_url: target.endpoint_url.clone(),
                        status: Some(status.as_u16()),
                        response_time_ms: elapsed_ms,
                        failed,
                    });
                    if deactivated {
                        warn!(model_id = %model_id, endpoint = %target.endpoint_url, "target deactivated after repeated failures");
                    }
                    return Ok(proxy_response(resp).await);
                }
                Err(e) => {
                    let deactivated = target.finish_request(elapsed_ms, true);
                    self.record(model_id, RequestRecord {
                        id: uuid::Uuid::new_v4(),
                        endpoint_url: target.endpoint_url.clone(),
                        status: None,
                        response_time_ms: elapsed_ms,
                        failed: true,
                    });
                    warn!(model_id = %model_id, endpoint = %target.endpoint_url, error = %e, "transport error forwarding request");
                    if deactivated {
                        warn!(model_id = %model_id, endpoint = %target.endpoint_url, "target deactivated after repeated failures");
                    }
                    if tried.len() >= 2 {
                        return Err(TransientTransportError::ConnectionRefused.into());
                    }
                    // fall through and pick a different target, once
                }
            }
        }
    }

    fn pick_target(
        &self,
        model_id: &ModelId,
        policy: &LoadBalancePolicy,
        exclude: &[String],
    ) -> CoreResult<Arc<TargetState>> {
        let entry = self
            .table
            .get(model_id)
            .ok_or_else(|| TransientTransportError::NoTargets(model_id.clone()))?;
        let candidates: Vec<_> = entry
            .active()
            .into_iter()
            .filter(|t| !exclude.contains(&t.endpoint_url))
            .collect();
        if candidates.is_empty() {
            return Err(TransientTransportError::NoTargets(model_id.clone()).into());
        }
        Ok(policy.select(&candidates, &entry.counter).clone())
    }

    fn record(&self, model_id: &ModelId, record: RequestRecord) {
        if let Some(mut entry) = self.table.get_mut(model_id) {
            entry.record(record);
        }
    }
}

async fn proxy_response(resp: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers() {
        builder = builder.header(name, value);
    }
    let stream = resp.bytes_stream();
    builder.body(Body::from_stream(stream)).unwrap_or_else(|_| {
        (StatusCode::BAD_GATEWAY, "failed to build proxied response").into_response()
    })
}

/// axum state for the proxy route: the target table plus the shutdown
/// coordinator, so every request can be tracked as in-flight for as long as
/// it's being forwarded.
#[derive(Clone)]
pub struct RouterState {
    pub router: Arc<RequestRouter>,
    pub shutdown: Arc<ShutdownCoordinator>,
}

/// axum handler: `/v1/models/{model_id}/{*rest}` streaming proxy, used by
/// the bootstrap binary's router. Forwards `rest` (plus the original query
/// string) to the chosen target - `model_id` itself is routing metadata,
/// not part of the upstream path. Rejects new requests once shutdown has
/// begun, and holds a `ShutdownGuard` for the request's duration so the
/// drain loop sees it as in-flight.
pub async fn proxy_handler(
    State(state): State<RouterState>,
    Path((model_id, rest)): Path<(String, String)>,
    headers: HeaderMap,
    method: axum::http::Method,
    uri: axum::http::Uri,
    body: Body,
) -> Response {
    let Some(_guard) = state.shutdown.track() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    };
    let router = state.router;

    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("failed to read request body: {e}")).into_response();
        }
    };
    let path_and_query = match uri.query() {
        Some(q) => format!("/{rest}?{q}"),
        None => format!("/{rest}"),
    };
    let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

    info!(model_id = %model_id, path = %path_and_query, "proxying request");
    match router
        .forward(&ModelId::new(model_id.clone()), method, &path_and_query, headers, body_bytes)
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!(model_id = %model_id, error = %e, "request routing failed");
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_remove_targets() {
        let router = RequestRouter::new(LoadBalancePolicy::RoundRobin);
        let id = ModelId::new("a");
        router.add_target(id.clone(), "http://localhost:9000".into());
        assert_eq!(router.active_target_count(&id), 1);
        router.remove_targets(&id);
        assert_eq!(router.active_target_count(&id), 0);
    }

    #[test]
    fn unhealthy_targets_are_excluded_from_selection() {
        let router = RequestRouter::new(LoadBalancePolicy::RoundRobin);
        let id = ModelId::new("a");
        router.add_target(id.clone(), "http://localhost:9000".into());
        router.set_unhealthy(&id);
        let err = router.pick_target(&id, &LoadBalancePolicy::RoundRobin, &[]);
        assert!(err.is_err());
    }

    #[test]
    fn re_adding_same_endpoint_does_not_duplicate() {
        let router = RequestRouter::new(LoadBalancePolicy::RoundRobin);
        let id = ModelId::new("a");
        router.add_target(id.clone(), "http://localhost:9000".into());
        router.add_target(id.clone(), "http://localhost:9000".into());
        assert_eq!(router.active_target_count(&id), 1);
    }

    async fn spawn_ok_server() -> String {
        let app = axum::Router::new().route("/ping", axum::routing::get(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn forward_fails_over_to_second_target_after_transport_error() {
        let good = spawn_ok_server().await;
        let refused_port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        }; // listener dropped immediately, so the port refuses new connections

        let router = RequestRouter::new(LoadBalancePolicy::RoundRobin);
        let id = ModelId::new("a");
        router.add_target(id.clone(), format!("http://127.0.0.1:{refused_port}"));
        router.add_target(id.clone(), good);

        let resp = router
            .forward(&id, reqwest::Method::GET, "/ping", HeaderMap::new(), vec![])
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
