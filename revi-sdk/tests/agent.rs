//! Cross-component flows through the public agent surface.

use std::sync::Arc;
use std::time::Duration;

use revi::config::MonitorConfig;
use revi::event::Severity;
use revi_http::HttpClient;
use revi_sdk::capture::{CaptureOptions, HostInfo, Monitor};
use revi_sdk::replay::{
    apply_changes, node_equivalent, AddedSubtree, DomDocument, DomMutation, DomNode, DomSerializer,
    ElementNode, NodeKey, Viewport,
};
use revi_sdk::retry::RetryPolicy;
use revi_sdk::sync::SyncPhase;
use revi_sdk::testing::{MockHttpClient, RecordedRequest};

fn monitor(client: &MockHttpClient) -> Monitor {
    Monitor::builder(MonitorConfig::new("pk_test").with_api_url("https://api.example.test"))
        .with_http_client(Arc::new(client.clone()))
        .with_host_info(HostInfo {
            user_agent: "integration/1.0".into(),
            viewport_width: 1280,
            viewport_height: 720,
        })
        .with_retry_policy(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        })
        .without_health_probes()
        .build()
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition did not settle");
}

fn requests_to(client: &MockHttpClient, path: &str) -> Vec<RecordedRequest> {
    client
        .requests()
        .into_iter()
        .filter(|request| request.uri.ends_with(path))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_loop_guard_end_to_end() {
    let ingest = MockHttpClient::new();
    let agent = monitor(&ingest);

    // The host's own outbound traffic goes through the instrumented client.
    let upstream = MockHttpClient::new();
    let client = agent.instrument_client(upstream.clone());

    for url in [
        "https://api.example.test/api/capture/error",
        "https://third.party/api/analytics/foo",
        "https://third.party/users",
    ] {
        let request = http::Request::builder().uri(url).body(Vec::new()).unwrap();
        client.send(request).await.unwrap();
    }

    // All three reached the upstream; only the last was monitored.
    assert_eq!(upstream.request_count(), 3);
    assert_eq!(upstream.requests()[0].header("traceparent"), None);
    assert_eq!(upstream.requests()[1].header("traceparent"), None);
    assert!(upstream.requests()[2].header("traceparent").is_some());

    agent.flush().await;
    wait_until(|| !requests_to(&ingest, "/api/capture/network-event").is_empty()).await;

    let network_requests = requests_to(&ingest, "/api/capture/network-event");
    let body: serde_json::Value =
        serde_json::from_slice(&network_requests[0].decoded_body()).unwrap();
    let events = body["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["url"], "https://third.party/users");
    agent.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn captures_defer_offline_and_drain_on_reconnect() {
    let ingest = MockHttpClient::new();
    for _ in 0..10 {
        ingest.enqueue_transport_error("offline");
    }
    let agent = monitor(&ingest);

    for n in 0..3 {
        agent.capture_message(
            &format!("deferred {}", n),
            CaptureOptions::level(Severity::Error),
        );
    }
    // Three captures plus the session-start event all defer.
    wait_until(|| agent.offline_backlog() >= 4).await;

    // Connectivity returns and the network recovers with it.
    ingest.clear_script();
    agent.set_online(false);
    agent.set_online(true);
    wait_until(|| agent.offline_backlog() == 0).await;
    assert_eq!(agent.sync_progress().borrow().phase, SyncPhase::Completed);

    let drained: Vec<RecordedRequest> = requests_to(&ingest, "/api/capture/error")
        .into_iter()
        .filter(|request| request.header("x-sync-session").is_some())
        .collect();
    assert!(!drained.is_empty(), "drain requests carry the sync marker");
    agent.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_empties_the_offline_store() {
    let ingest = MockHttpClient::new();
    ingest.enqueue_transport_error("offline");
    ingest.enqueue_transport_error("offline");
    let agent = monitor(&ingest);

    agent.capture_message("parked", CaptureOptions::level(Severity::Error));
    // The capture and the session-start event both defer.
    wait_until(|| agent.offline_backlog() >= 2).await;

    agent.flush().await;
    assert_eq!(agent.offline_backlog(), 0);
    agent.destroy();
}

#[tokio::test]
async fn every_public_method_is_total_on_a_bad_config() {
    let agent = Monitor::builder(MonitorConfig::default()).build();
    assert!(!agent.is_enabled());

    agent.capture_message("x", CaptureOptions::default());
    agent.add_breadcrumb(revi::event::Breadcrumb::new("x"));
    agent.record_navigation("/", "/a");
    agent.record_click("#x");
    agent.record_console(Severity::Debug, "x");
    agent.set_user_context(revi::event::UserContext::default());
    agent.mark("m");
    agent.measure("m", Some("m"), None);
    let _ = agent.web_vitals();
    let _ = agent.session_id();
    agent.end_session();

    let document = DomDocument {
        url: "https://app.test/".into(),
        title: String::new(),
        viewport: Viewport::default(),
        environment: Default::default(),
        stylesheets: Vec::new(),
        root: DomNode::Element(ElementNode::new("html", NodeKey(1))),
    };
    agent.snapshot_document(&document);
    agent.record_mutation(DomMutation::LayoutShift { score: 0.5 });

    agent.set_online(true);
    agent.set_visible(true);
    agent.flush().await;
    agent.destroy();
    agent.destroy();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replay_snapshot_and_stream_reach_the_session_endpoint() {
    let ingest = MockHttpClient::new();
    let agent = monitor(&ingest);

    let document = DomDocument {
        url: "https://app.test/".into(),
        title: "App".into(),
        viewport: Viewport::default(),
        environment: Default::default(),
        stylesheets: Vec::new(),
        root: DomNode::Element(
            ElementNode::new("div", NodeKey(1))
                .with_attr("id", "a")
                .with_text(NodeKey(2), "hi"),
        ),
    };
    agent.snapshot_document(&document);
    agent.record_mutation(DomMutation::ChildList {
        target: NodeKey(1),
        added: vec![AddedSubtree {
            node: DomNode::Element(ElementNode::new("em", NodeKey(3)).with_text(NodeKey(4), "!")),
            index: None,
        }],
        removed: vec![],
        target_rect: None,
    });

    agent.flush().await;
    wait_until(|| {
        requests_to(&ingest, "/api/capture/session-event")
            .iter()
            .any(|request| {
                String::from_utf8_lossy(&request.decoded_body()).contains("dom_snapshot")
            })
    })
    .await;
    wait_until(|| {
        requests_to(&ingest, "/api/capture/session-event")
            .iter()
            .any(|request| {
                String::from_utf8_lossy(&request.decoded_body()).contains("dom_changes")
            })
    })
    .await;
    agent.destroy();
}

// Scenario: a seeded snapshot plus the recorded stream reconstructs the
// mutated document, via the library types a replay consumer would use.
#[test]
fn snapshot_diff_roundtrip_through_public_types() {
    let privacy = revi::config::PrivacyConfig::default();
    let replay = revi::config::ReplayConfig::default();
    let mut serializer = DomSerializer::new();

    let before = DomDocument {
        url: "https://app.test/".into(),
        title: String::new(),
        viewport: Viewport::default(),
        environment: Default::default(),
        stylesheets: Vec::new(),
        root: DomNode::Element(
            ElementNode::new("div", NodeKey(1))
                .with_attr("id", "a")
                .with_attr("class", "x")
                .with_text(NodeKey(2), "hi"),
        ),
    };
    let s0 = serializer.snapshot(&before, &privacy, &replay);

    let changes: Vec<_> = [
        DomMutation::ChildList {
            target: NodeKey(1),
            added: vec![AddedSubtree {
                node: DomNode::Element(
                    ElementNode::new("em", NodeKey(3)).with_text(NodeKey(4), "!"),
                ),
                index: None,
            }],
            removed: vec![],
            target_rect: None,
        },
        DomMutation::Attribute {
            target: NodeKey(1),
            name: "class".into(),
            old: Some("x".into()),
            new: Some("x y".into()),
            target_rect: None,
        },
    ]
    .into_iter()
    .filter_map(|mutation| {
        serializer.record_mutation(mutation, &before.viewport, &privacy, &replay)
    })
    .collect();

    let mut reconstructed = s0.root.clone();
    apply_changes(&mut reconstructed, &changes);

    let after = DomDocument {
        root: DomNode::Element(
            ElementNode::new("div", NodeKey(1))
                .with_attr("id", "a")
                .with_attr("class", "x y")
                .with_text(NodeKey(2), "hi")
                .with_child(ElementNode::new("em", NodeKey(3)).with_text(NodeKey(4), "!")),
        ),
        ..before
    };
    let s1 = serializer.snapshot(&after, &privacy, &replay);

    assert!(node_equivalent(&reconstructed, &s1.root));
}
