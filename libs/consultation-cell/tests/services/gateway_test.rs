use std::time::Duration;

use assert_matches::assert_matches;

use consultation_cell::*;

fn gateway(ttl_ms: u64) -> StreamingGateway {
    StreamingGateway::new(Duration::from_millis(ttl_ms))
}

fn token_event(session_id: &str, content: &str) -> ConsultationEvent {
    ConsultationEvent::Message {
        role: MessageRole::Assistant,
        content: content.to_string(),
        session_id: session_id.to_string(),
    }
}

#[tokio::test]
async fn test_push_without_channel_is_a_noop() {
    let gateway = gateway(60_000);
    // nobody listening; must not fail or panic
    gateway.push("session-1", token_event("session-1", "hi")).await;
    assert!(!gateway.has_channel("session-1").await);
}

#[tokio::test]
async fn test_events_reach_the_open_channel() {
    let gateway = gateway(60_000);
    let mut receiver = gateway.open("session-1").await;

    gateway.push("session-1", token_event("session-1", "hello")).await;

    let event = receiver.recv().await.expect("Event should arrive");
    assert_eq!(event, token_event("session-1", "hello"));
}

#[tokio::test]
async fn test_reopening_replaces_the_channel() {
    let gateway = gateway(60_000);
    let mut first = gateway.open("session-1").await;
    let mut second = gateway.open("session-1").await;

    gateway.push("session-1", token_event("session-1", "hello")).await;

    // the replacement receives; the orphaned channel just ends
    let event = second.recv().await.expect("Replacement should receive");
    assert_eq!(event, token_event("session-1", "hello"));
    assert!(first.recv().await.is_none(), "Orphaned channel should end");
}

#[tokio::test]
async fn test_close_ends_the_stream() {
    let gateway = gateway(60_000);
    let mut receiver = gateway.open("session-1").await;

    gateway.close("session-1").await;

    assert!(!gateway.has_channel("session-1").await);
    assert!(receiver.recv().await.is_none());

    // pushes after close are no-ops
    gateway.push("session-1", token_event("session-1", "late")).await;
}

#[tokio::test]
async fn test_channel_lifetime_bound_emits_terminal_error() {
    let gateway = gateway(80);
    let mut receiver = gateway.open("session-1").await;

    let event = receiver.recv().await.expect("Expiry event should arrive");
    assert_matches!(event, ConsultationEvent::Error { .. });

    assert!(receiver.recv().await.is_none(), "Stream should end after expiry");
    assert!(!gateway.has_channel("session-1").await);
}

#[tokio::test]
async fn test_expiry_of_replaced_channel_spares_the_replacement() {
    let gateway = gateway(300);
    let _first = gateway.open("session-1").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = gateway.open("session-1").await;

    // past the first channel's lifetime, inside the second's
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(gateway.has_channel("session-1").await);

    gateway.push("session-1", token_event("session-1", "still live")).await;
    let event = second.recv().await.expect("Replacement should still receive");
    assert_eq!(event, token_event("session-1", "still live"));
}
