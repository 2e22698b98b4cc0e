//! The public request submitter: wires resilience policies around each
//! submission.
//!
//! Pipeline, outside-in: idempotency → circuit breaker keyed by endpoint →
//! retry engine → transport. Capture sites call [`ResilienceCoordinator::submit`]
//! and never observe an error: a terminally rejected payload is dropped with
//! a debug log, anything else that cannot be delivered right now is parked
//! in the offline store at its priority for the next sync drain.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use revi::error::{AgentError, AgentResult};
use revi::event::{EventKind, Priority};
use tracing::debug;

use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot};
use crate::health::{HealthMonitor, NetworkQuality};
use crate::idempotency::{default_key, IdempotencyManager};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::runtime::CancelToken;
use crate::store::OfflineStore;
use crate::transport::{CaptureEndpoint, SubmitResponse, Transport};

/// Sampler scale applied while the network is classified poor.
const DEGRADED_RATE_SCALE: f64 = 0.5;

/// Coordinator configuration.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorConfig {
    /// Retry policy applied inside the breaker.
    pub retry: RetryPolicy,
    /// Circuit configuration applied per endpoint.
    pub circuit: CircuitConfig,
}

/// What became of a capture-site submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitReceipt {
    /// The server accepted the batch; ids are the server-assigned record
    /// ids.
    Accepted(Vec<String>),
    /// Not deliverable right now; parked in the offline store.
    Deferred,
    /// Terminally rejected; dropped.
    Dropped,
}

/// Wires idempotency, circuit breaking, retry and offline spill around the
/// transport.
#[derive(Debug)]
pub struct ResilienceCoordinator {
    transport: Arc<Transport>,
    store: Arc<OfflineStore>,
    health: Option<Arc<HealthMonitor>>,
    breakers: Mutex<HashMap<&'static str, Arc<CircuitBreaker>>>,
    idempotency: IdempotencyManager<SubmitResponse>,
    config: CoordinatorConfig,
    cancel: CancelToken,
}

impl ResilienceCoordinator {
    /// A coordinator submitting through `transport` and spilling to `store`.
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<OfflineStore>,
        health: Option<Arc<HealthMonitor>>,
        config: CoordinatorConfig,
        cancel: CancelToken,
    ) -> Self {
        ResilienceCoordinator {
            transport,
            store,
            health,
            breakers: Mutex::new(HashMap::new()),
            idempotency: IdempotencyManager::default(),
            config,
            cancel,
        }
    }

    /// Capture-facing submission of one raw payload (or a pre-batched array
    /// of payloads). Never returns an error.
    pub async fn submit(
        &self,
        kind: EventKind,
        priority: Priority,
        payload: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> SubmitReceipt {
        let endpoint = CaptureEndpoint::for_kind(kind);
        let members = match payload.clone() {
            serde_json::Value::Array(items) => items,
            one => vec![one],
        };
        let body = crate::transport::batch_body(kind, members);
        match self.execute(endpoint, body, None, idempotency_key).await {
            Ok(response) => SubmitReceipt::Accepted(response.ids),
            Err(AgentError::ServerTerminal { status }) => {
                debug!(endpoint = endpoint.feature(), status, "payload rejected, dropping");
                SubmitReceipt::Dropped
            }
            Err(err) => {
                debug!(endpoint = endpoint.feature(), error = %err, "deferring to offline store");
                self.store.enqueue(kind, priority, payload);
                SubmitReceipt::Deferred
            }
        }
    }

    /// The raw pipeline without offline spill: idempotency → breaker →
    /// retry → transport. The sync manager uses this for items already in
    /// the store.
    pub async fn execute(
        &self,
        endpoint: CaptureEndpoint,
        body: serde_json::Value,
        sync_session: Option<String>,
        idempotency_key: Option<String>,
    ) -> AgentResult<SubmitResponse> {
        let key = idempotency_key.unwrap_or_else(|| {
            default_key(endpoint.feature(), body.to_string().as_bytes())
        });

        let breaker = self.breaker(endpoint);
        let transport = Arc::clone(&self.transport);
        let retry = self.config.retry.clone();
        let cancel = self.cancel.clone();
        self.idempotency
            .execute(&key, async move {
                breaker
                    .call(|| {
                        retry_with_backoff(&retry, &cancel, endpoint.feature(), true, || {
                            transport.submit(endpoint, body.clone(), sync_session.as_deref())
                        })
                    })
                    .await
            })
            .await
    }

    /// The breaker guarding `endpoint`, created closed on first use.
    pub fn breaker(&self, endpoint: CaptureEndpoint) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(breakers.entry(endpoint.feature()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                endpoint.feature(),
                self.config.circuit.clone(),
            ))
        }))
    }

    /// Breaker states for observability.
    pub fn circuit_snapshots(&self) -> Vec<(&'static str, CircuitSnapshot)> {
        match self.breakers.lock() {
            Ok(breakers) => breakers
                .iter()
                .map(|(feature, breaker)| (*feature, breaker.snapshot()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Sampler scale recommended by current network health: reduced rates
    /// while quality is poor.
    pub fn recommended_rate_scale(&self) -> f64 {
        match self.health.as_ref().map(|health| health.overall_quality()) {
            Some(NetworkQuality::Poor) => DEGRADED_RATE_SCALE,
            _ => 1.0,
        }
    }

    /// The cancellation token wired through retries.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::store::StoreConfig;
    use crate::testing::MockHttpClient;
    use serde_json::json;
    use std::time::Duration;

    fn coordinator(client: &MockHttpClient) -> ResilienceCoordinator {
        let transport = Arc::new(Transport::new(
            Arc::new(client.clone()),
            "https://api.example.test",
            "pk_test",
        ));
        let store = Arc::new(OfflineStore::open(StoreConfig::default()));
        ResilienceCoordinator::new(
            transport,
            store,
            None,
            CoordinatorConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    base_delay: Duration::from_millis(10),
                    jitter: None,
                    ..RetryPolicy::default()
                },
                circuit: CircuitConfig {
                    consecutive_failure_threshold: 3,
                    ..CircuitConfig::default()
                },
            },
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn acceptance_reports_server_ids() {
        let client = MockHttpClient::new();
        client.enqueue_ok_with_ids(&["id-1", "id-2"]);
        let coordinator = coordinator(&client);

        let receipt = coordinator
            .submit(EventKind::Error, Priority::High, json!({"errors": []}), None)
            .await;
        assert_eq!(
            receipt,
            SubmitReceipt::Accepted(vec!["id-1".into(), "id-2".into()])
        );
        assert!(coordinator.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_defer_to_store() {
        let client = MockHttpClient::new();
        client.enqueue_transport_error("down");
        client.enqueue_transport_error("down");
        let coordinator = coordinator(&client);

        let receipt = coordinator
            .submit(EventKind::Error, Priority::High, json!({"errors": [1]}), None)
            .await;
        assert_eq!(receipt, SubmitReceipt::Deferred);
        assert_eq!(client.request_count(), 2);

        let parked = coordinator.store.all_items();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].kind, EventKind::Error);
        assert_eq!(parked[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn terminal_rejection_drops_the_payload() {
        let client = MockHttpClient::new();
        client.enqueue_status(400, &[]);
        let coordinator = coordinator(&client);

        let receipt = coordinator
            .submit(EventKind::Error, Priority::High, json!({"errors": [1]}), None)
            .await;
        assert_eq!(receipt, SubmitReceipt::Dropped);
        assert!(coordinator.store.is_empty());
        // Terminal statuses are not retried.
        assert_eq!(client.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_defers_without_calling_transport() {
        let client = MockHttpClient::new();
        for _ in 0..6 {
            client.enqueue_transport_error("down");
        }
        let coordinator = coordinator(&client);

        // Three submissions × two attempts trip the breaker.
        for n in 0..3 {
            let _ = coordinator
                .submit(EventKind::Error, Priority::High, json!({"n": n}), None)
                .await;
        }
        let before = client.request_count();

        let receipt = coordinator
            .submit(EventKind::Error, Priority::High, json!({"n": 99}), None)
            .await;
        assert_eq!(receipt, SubmitReceipt::Deferred);
        assert_eq!(client.request_count(), before);
    }

    #[tokio::test]
    async fn identical_payloads_share_one_submission() {
        let client = MockHttpClient::new();
        client.enqueue_ok_with_ids(&["id-1"]);
        let coordinator = Arc::new(coordinator(&client));

        let a = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .submit(EventKind::Error, Priority::High, json!({"n": 1}), None)
                    .await
            })
        };
        let b = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                coordinator
                    .submit(EventKind::Error, Priority::High, json!({"n": 1}), None)
                    .await
            })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert_eq!(a, b);
        assert_eq!(client.request_count(), 1);
    }
}
