// Address resolution against the endpoint directory
use std::sync::Arc;

use weft_core::{EndpointDirectory, EndpointRef, Peer, PeerOptions, Resolution};

fn peer(id: &str) -> Arc<Peer> {
    Peer::new(PeerOptions {
        id: Some(id.to_string()),
        ..Default::default()
    })
}

#[test]
fn resolves_own_id_remote_id_and_nothing() {
    let directory = EndpointDirectory::new();
    let alpha = peer("alpha");
    let conn = peer("conn-1");
    conn.add_remote("gamma");

    let alpha_ref: EndpointRef = alpha.clone();
    let conn_ref: EndpointRef = conn.clone();
    directory.register(&alpha_ref);
    directory.register(&conn_ref);

    match directory.resolve(Some("alpha")) {
        Resolution::HandledHere(ep) => assert_eq!(ep.id(), "alpha"),
        _ => panic!("expected local delivery for alpha"),
    }
    match directory.resolve(Some("gamma")) {
        Resolution::ForwardVia(ep) => assert_eq!(ep.id(), "conn-1"),
        _ => panic!("expected forward via conn-1 for gamma"),
    }
    assert!(matches!(
        directory.resolve(Some("nobody")),
        Resolution::Unresolvable
    ));
    assert!(matches!(directory.resolve(None), Resolution::Unresolvable));
}

#[test]
fn first_registered_endpoint_wins() {
    let directory = EndpointDirectory::new();
    let first = peer("conn-1");
    first.add_remote("gamma");
    let second = peer("conn-2");
    second.add_remote("gamma");

    let first_ref: EndpointRef = first.clone();
    let second_ref: EndpointRef = second.clone();
    directory.register(&first_ref);
    directory.register(&second_ref);

    match directory.resolve(Some("gamma")) {
        Resolution::ForwardVia(ep) => assert_eq!(ep.id(), "conn-1"),
        _ => panic!("expected forward via the earlier registration"),
    }
}

#[test]
fn dropped_endpoints_are_pruned() {
    let directory = EndpointDirectory::new();
    let alpha = peer("alpha");
    let alpha_ref: EndpointRef = alpha.clone();
    directory.register(&alpha_ref);
    assert_eq!(directory.len(), 1);

    drop(alpha_ref);
    drop(alpha);
    assert!(matches!(
        directory.resolve(Some("alpha")),
        Resolution::Unresolvable
    ));
    assert!(directory.is_empty());
}

#[test]
fn unregister_removes_by_id() {
    let directory = EndpointDirectory::new();
    let alpha = peer("alpha");
    let beta = peer("beta");
    let alpha_ref: EndpointRef = alpha.clone();
    let beta_ref: EndpointRef = beta.clone();
    directory.register(&alpha_ref);
    directory.register(&beta_ref);

    directory.unregister("alpha");
    assert!(matches!(
        directory.resolve(Some("alpha")),
        Resolution::Unresolvable
    ));
    match directory.resolve(Some("beta")) {
        Resolution::HandledHere(ep) => assert_eq!(ep.id(), "beta"),
        _ => panic!("expected beta to survive alpha's removal"),
    }
}
