//! Client-request expiry and late-response handling.

mod common;

use common::{request_payload, standard_pair};
use rpc_proxy::fabric::LocalMessage;
use rpc_proxy::proxy::TimerId;

/// Client request timeout: the expiry fires first, the requesting session
/// is closed, the tracking entry disappears, and the late response is
/// consumed without effect.
#[test]
fn client_timeout_closes_session_and_sinks_late_response() {
    let mut pair = standard_pair("P1");
    pair.bring_up();

    let (service, session) = pair.a.handle.connect_client("svc.foo").unwrap();
    pair.a.handle.client_request(
        service,
        session,
        LocalMessage::new(request_payload(100, &[])),
        true,
    );
    pair.pump();

    let (token, _delivered) = pair.b.handle.next_delivered("svc.foo").unwrap();
    let timer = pair.a.client_request_timer().expect("expiry armed");

    // No response within the timeout.
    pair.fire_a(timer);
    assert!(!pair.a.handle.session_is_open(session));
    assert!(pair.a.client_request_timer().is_none());
    assert!(pair.a.handle.next_completion(session).is_none());

    // The response arrives late: B still answers, A discards it quietly.
    pair.b
        .handle
        .complete(token, LocalMessage::new(request_payload(100, &[])));
    pair.pump();
    assert!(pair.a.handle.next_completion(session).is_none());

    // The proxy is healthy: a fresh session round-trips normally.
    let (service, session) = pair.a.handle.connect_client("svc.foo").unwrap();
    pair.a.handle.client_request(
        service,
        session,
        LocalMessage::new(request_payload(101, &[])),
        true,
    );
    pair.pump();
    let (token, _) = pair.b.handle.next_delivered("svc.foo").unwrap();
    pair.b
        .handle
        .complete(token, LocalMessage::new(request_payload(101, &[])));
    pair.pump();
    assert!(pair.a.handle.next_completion(session).is_some());
}

/// A timeout on one request abandons every other request of the same
/// session, so no dangling completion can fire after the session closed.
#[test]
fn timeout_sweeps_sibling_requests_of_the_session() {
    let mut pair = standard_pair("P1");
    pair.bring_up();

    let (service, session) = pair.a.handle.connect_client("svc.foo").unwrap();
    for id in [1u32, 2, 3] {
        pair.a.handle.client_request(
            service,
            session,
            LocalMessage::new(request_payload(id, &[])),
            true,
        );
    }
    pair.pump();
    let timer = pair.a.client_request_timer().expect("expiry armed");
    pair.fire_a(timer);

    // All per-request timers are gone, not just the fired one.
    assert!(pair.a.client_request_timer().is_none());
    assert!(!pair.a.handle.session_is_open(session));

    // All three late completions sink without reaching the closed session.
    while let Some((token, _)) = pair.b.handle.next_delivered("svc.foo") {
        pair.b
            .handle
            .complete(token, LocalMessage::new(request_payload(0, &[])));
    }
    pair.pump();
    assert!(pair.a.handle.next_completion(session).is_none());
}

/// Closing a client session locally releases its pending requests and
/// event contexts without completing anything.
#[test]
fn session_close_releases_pending_requests() {
    let mut pair = standard_pair("P1");
    pair.bring_up();

    let (service, session) = pair.a.handle.connect_client("svc.foo").unwrap();
    pair.a.handle.client_request(
        service,
        session,
        LocalMessage::new(request_payload(55, &[])),
        true,
    );
    pair.pump();
    assert!(pair.a.client_request_timer().is_some());

    pair.a.handle.close_client_session(service, session);
    pair.pump();
    assert!(pair.a.client_request_timer().is_none());
    assert!(!pair.a.has_timer(|t| matches!(t, TimerId::ClientRequest(_))));
}
