// End-to-end routing over the pub/sub cluster backbone
mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use weft_core::{
    Backbone, Broker, BroadcastOptions, ClusterRouter, ClusterRouterOptions, EndpointRef,
    InMemoryBroker, Peer, PeerOptions, PubSubClient, PubSubClientOptions, WeftError,
};

use common::{RelayEndpoint, SlowHandler};

const GUARD: Duration = Duration::from_secs(2);

async fn process(
    broker: &Arc<InMemoryBroker>,
    id: &str,
) -> weft_core::Result<(Arc<ClusterRouter>, Arc<Peer>)> {
    process_with(broker, id, Duration::from_secs(2)).await
}

async fn process_with(
    broker: &Arc<InMemoryBroker>,
    id: &str,
    request_timeout: Duration,
) -> weft_core::Result<(Arc<ClusterRouter>, Arc<Peer>)> {
    let handle: Arc<dyn Broker> = Arc::new(broker.handle());
    let router = ClusterRouter::connect(
        handle,
        ClusterRouterOptions {
            id: Some(id.to_string()),
            ..Default::default()
        },
    )
    .await?;
    let peer = Peer::with_cluster(
        PeerOptions {
            id: Some(id.to_string()),
            timeout: request_timeout,
            debug: false,
        },
        router.clone(),
    );
    Ok((router, peer))
}

#[tokio::test]
async fn request_routes_to_the_answering_process() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, b) = process(&broker, "b").await?;
    b.on_fn("greet", |_| Ok(Some(json!("hi"))));

    let reply = timeout(GUARD, a.request("greet", Some(json!("bob")), Some("b"))).await??;
    assert_eq!(reply, Some(json!("hi")));
    Ok(())
}

#[tokio::test]
async fn request_routes_on_a_custom_channel() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let mut members = Vec::new();
    for id in ["a", "b"] {
        let handle: Arc<dyn Broker> = Arc::new(broker.handle());
        let router = ClusterRouter::connect(
            handle,
            ClusterRouterOptions {
                id: Some(id.to_string()),
                channel: "prod".to_string(),
                ..Default::default()
            },
        )
        .await?;
        let peer = Peer::with_cluster(
            PeerOptions {
                id: Some(id.to_string()),
                timeout: Duration::from_secs(2),
                debug: false,
            },
            router.clone(),
        );
        members.push((router, peer));
    }
    members[1].1.on_fn("greet", |_| Ok(Some(json!("hi"))));

    let reply = timeout(GUARD, members[0].1.request("greet", None, Some("b"))).await??;
    assert_eq!(reply, Some(json!("hi")));
    Ok(())
}

#[tokio::test]
async fn request_reaches_a_peer_behind_a_connection() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (rb, _b) = process(&broker, "b").await?;

    // c is not attached to the cluster itself; it sits behind a
    // connection endpoint registered on b's router
    let c = Peer::new(PeerOptions {
        id: Some("c".to_string()),
        ..Default::default()
    });
    c.on_fn("ping", |_| Ok(Some(json!("pong"))));
    let relay: EndpointRef = RelayEndpoint::new("conn-1", c.clone());
    rb.register(&relay);

    let reply = timeout(GUARD, a.request("ping", None, Some("c"))).await??;
    assert_eq!(reply, Some(json!("pong")));
    Ok(())
}

#[tokio::test]
async fn unknown_destination_concludes_no_destination() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, _b) = process(&broker, "b").await?;
    let (_rc, _c) = process(&broker, "c").await?;

    // concludes from claims well before any deadline
    let err = timeout(GUARD, a.request("greet", None, Some("ghost")))
        .await?
        .unwrap_err();
    assert!(matches!(err, WeftError::NoDestination(ref to) if to == "ghost"));
    Ok(())
}

#[tokio::test]
async fn single_process_cluster_also_concludes() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;

    let err = timeout(GUARD, a.request("greet", None, Some("ghost")))
        .await?
        .unwrap_err();
    assert!(matches!(err, WeftError::NoDestination(_)));
    Ok(())
}

#[tokio::test]
async fn silent_roster_member_is_reclaimed_by_the_deadline(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let handle: Arc<dyn Broker> = Arc::new(broker.handle());
    let router = ClusterRouter::connect(
        handle,
        ClusterRouterOptions {
            id: Some("a".to_string()),
            timeout: Duration::from_millis(300),
            ..Default::default()
        },
    )
    .await?;
    let a = Peer::with_cluster(
        PeerOptions {
            id: Some("a".to_string()),
            timeout: Duration::from_secs(2),
            debug: false,
        },
        router.clone(),
    );

    // a named connection on the same channel that never routes or claims,
    // so the remaining set never empties on its own
    let silent: Arc<dyn Broker> = Arc::new(broker.handle());
    let (_client, _inbound) = PubSubClient::connect(
        silent,
        PubSubClientOptions {
            id: Some("s".to_string()),
            ..Default::default()
        },
    )
    .await?;

    let err = timeout(GUARD, a.request("greet", None, Some("ghost")))
        .await?
        .unwrap_err();
    assert!(matches!(err, WeftError::NoDestination(_)));
    Ok(())
}

#[tokio::test]
async fn conclusive_reply_wins_over_claims() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, _b) = process(&broker, "b").await?;
    let (_rc, c) = process(&broker, "c").await?;
    c.on_fn("greet", |_| Ok(Some(json!("from c"))));

    // a and b both claim non-delivery; c's answer must still land
    let reply = timeout(GUARD, a.request("greet", None, Some("c"))).await??;
    assert_eq!(reply, Some(json!("from c")));
    Ok(())
}

#[tokio::test]
async fn resolved_destination_without_handler_is_no_listener(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, _b) = process(&broker, "b").await?;

    let err = timeout(GUARD, a.request("greet", None, Some("b")))
        .await?
        .unwrap_err();
    assert!(matches!(err, WeftError::NoListener(ref name) if name == "greet"));
    Ok(())
}

#[tokio::test]
async fn handler_failure_travels_back_with_the_reporting_process(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, b) = process(&broker, "b").await?;
    b.on_fn("boom", |_| Err(WeftError::Broker("backend down".to_string())));

    let err = timeout(GUARD, a.request("boom", None, Some("b")))
        .await?
        .unwrap_err();
    match err {
        WeftError::Internal(info) => {
            assert!(info.message.contains("backend down"));
            assert_eq!(info.reporter(), Some("b"));
        }
        other => panic!("expected internal error, got {other}"),
    }
    Ok(())
}

#[tokio::test]
async fn slow_answer_times_out_without_poisoning_the_caller(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process_with(&broker, "a", Duration::from_millis(100)).await?;
    let (_rb, b) = process(&broker, "b").await?;
    b.on(
        "slow",
        Arc::new(SlowHandler {
            delay: Duration::from_millis(500),
            value: json!("late"),
        }),
    );
    b.on_fn("fast", |_| Ok(Some(json!("quick"))));

    let err = timeout(GUARD, a.request("slow", None, Some("b")))
        .await?
        .unwrap_err();
    assert!(matches!(err, WeftError::Timeout));

    // let the stale reply arrive, then confirm a is still fully usable
    tokio::time::sleep(Duration::from_millis(600)).await;
    let reply = timeout(GUARD, a.request("fast", None, Some("b"))).await??;
    assert_eq!(reply, Some(json!("quick")));
    Ok(())
}

#[tokio::test]
async fn broadcast_collects_an_answer_per_process() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let mut peers = Vec::new();
    for id in ["a", "b", "c"] {
        let (router, peer) = process(&broker, id).await?;
        let own = id.to_string();
        peer.on_fn("ident", move |_| Ok(Some(json!(own.clone()))));
        peers.push((router, peer));
    }

    let answers = timeout(
        GUARD,
        peers[0]
            .1
            .broadcast("ident", None, BroadcastOptions::default()),
    )
    .await??;
    let mut seen: Vec<String> = answers
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    seen.sort();
    assert_eq!(seen, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    Ok(())
}

#[tokio::test]
async fn fan_out_is_strict_by_default_and_tolerant_on_request(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, b) = process(&broker, "b").await?;
    b.on_fn("greet", |_| Ok(Some(json!("hi"))));

    let destinations = vec!["b".to_string(), "ghost".to_string()];

    let err = timeout(
        GUARD,
        a.request_many("greet", None, &destinations, BroadcastOptions::default()),
    )
    .await?
    .unwrap_err();
    assert!(matches!(err, WeftError::NoDestination(_)));

    let answers = timeout(
        GUARD,
        a.request_many(
            "greet",
            None,
            &destinations,
            BroadcastOptions {
                continue_on_error: true,
                ..Default::default()
            },
        ),
    )
    .await??;
    assert_eq!(answers, vec![Some(json!("hi")), None]);
    Ok(())
}

#[tokio::test]
async fn notify_crosses_the_cluster_without_a_reply() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (_ra, a) = process(&broker, "a").await?;
    let (_rb, b) = process(&broker, "b").await?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    b.on_fn("ping", move |payload| {
        let _ = tx.send(payload);
        Ok(None)
    });

    a.notify("ping", Some(json!(7)), Some("b")).await?;
    let seen = timeout(GUARD, rx.recv()).await?;
    assert_eq!(seen, Some(Some(json!(7))));
    Ok(())
}
