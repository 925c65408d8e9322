// Pub/sub channel client against the in-memory broker
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use weft_core::{Broker, InMemoryBroker, PubSubClient, PubSubClientOptions, RequestEnvelope};

fn options(id: &str) -> PubSubClientOptions {
    PubSubClientOptions {
        id: Some(id.to_string()),
        ..Default::default()
    }
}

async fn connect(
    broker: &Arc<InMemoryBroker>,
    opts: PubSubClientOptions,
) -> weft_core::Result<(
    Arc<PubSubClient>,
    tokio::sync::mpsc::Receiver<RequestEnvelope>,
)> {
    let handle: Arc<dyn Broker> = Arc::new(broker.handle());
    PubSubClient::connect(handle, opts).await
}

#[tokio::test]
async fn publish_reaches_every_subscriber_including_self(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (p1, mut rx1) = connect(&broker, options("p1")).await?;
    let (_p2, mut rx2) = connect(&broker, options("p2")).await?;

    let envelope = RequestEnvelope::request("greet", Some(json!("hi")), Some("p1".into()), None);
    p1.send(&envelope).await?;

    let seen1 = timeout(Duration::from_secs(2), rx1.recv()).await?;
    let seen2 = timeout(Duration::from_secs(2), rx2.recv()).await?;
    assert_eq!(seen1.as_ref(), Some(&envelope));
    assert_eq!(seen2.as_ref(), Some(&envelope));
    Ok(())
}

#[tokio::test]
async fn foreign_namespace_and_garbage_frames_are_dropped(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (p1, mut rx1) = connect(&broker, options("p1")).await?;

    let raw: Arc<dyn Broker> = Arc::new(broker.handle());
    raw.publish("weft", "not json at all".to_string()).await?;
    raw.publish(
        "weft",
        r#"{"ns":"other","id":"x","nm":"greet","rq":true}"#.to_string(),
    )
    .await?;

    let envelope = RequestEnvelope::request("greet", None, Some("p1".into()), None);
    p1.send(&envelope).await?;

    // only the namespaced envelope survives the filter
    let seen = timeout(Duration::from_secs(2), rx1.recv()).await?;
    assert_eq!(seen.as_ref(), Some(&envelope));
    Ok(())
}

#[tokio::test]
async fn custom_channel_carries_namespaced_envelopes() -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (p1, _rx1) = connect(
        &broker,
        PubSubClientOptions {
            id: Some("p1".to_string()),
            channel: "prod".to_string(),
            ..Default::default()
        },
    )
    .await?;
    let (_p2, mut rx2) = connect(
        &broker,
        PubSubClientOptions {
            id: Some("p2".to_string()),
            channel: "prod".to_string(),
            ..Default::default()
        },
    )
    .await?;

    let envelope = RequestEnvelope::request("greet", None, Some("p1".into()), Some("p2".into()));
    p1.send(&envelope).await?;
    let seen = timeout(Duration::from_secs(2), rx2.recv()).await?;
    assert_eq!(seen.as_ref(), Some(&envelope));
    Ok(())
}

#[tokio::test]
async fn direct_only_drops_traffic_addressed_elsewhere(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (p1, _rx1) = connect(&broker, options("p1")).await?;
    let (_p2, mut rx2) = connect(
        &broker,
        PubSubClientOptions {
            id: Some("p2".to_string()),
            direct_only: true,
            ..Default::default()
        },
    )
    .await?;

    let elsewhere = RequestEnvelope::request("greet", None, Some("p1".into()), Some("p3".into()));
    p1.send(&elsewhere).await?;
    let mine = RequestEnvelope::request("greet", None, Some("p1".into()), Some("p2".into()));
    p1.send(&mine).await?;
    let unaddressed = RequestEnvelope::request("greet", None, Some("p1".into()), None);
    p1.send(&unaddressed).await?;

    let seen = timeout(Duration::from_secs(2), rx2.recv()).await?;
    assert_eq!(seen.as_ref(), Some(&mine));
    let seen = timeout(Duration::from_secs(2), rx2.recv()).await?;
    assert_eq!(seen.as_ref(), Some(&unaddressed));
    Ok(())
}

#[tokio::test]
async fn roster_lists_live_processes_on_the_same_channel(
) -> Result<(), Box<dyn std::error::Error>> {
    let broker = InMemoryBroker::new();
    let (p1, _rx1) = connect(&broker, options("p1")).await?;
    let (p2, _rx2) = connect(&broker, options("p2")).await?;
    let (_p3, _rx3) = connect(
        &broker,
        PubSubClientOptions {
            id: Some("p3".to_string()),
            channel: "elsewhere".to_string(),
            ..Default::default()
        },
    )
    .await?;

    let mut roster = p1.roster().await?;
    roster.sort();
    assert_eq!(roster, vec!["p1".to_string(), "p2".to_string()]);

    p2.close().await?;
    let mut roster = p1.roster().await?;
    roster.sort();
    assert_eq!(roster, vec!["p1".to_string()]);
    Ok(())
}
