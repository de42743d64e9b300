//! Client sessions against a scripted broker on a loopback port.
//!
//! The broker side is written directly against `hpfeeds_core`'s framing so
//! these tests pin the exact frames a client puts on the wire.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use hpfeeds_client::{ClientSessionService, CloseReason, SessionError, SessionState};
use hpfeeds_core::protocol::{verify_digest, Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE};

const STEP: Duration = Duration::from_secs(5);
const NONCE: [u8; 4] = [1, 2, 3, 4];

type BrokerSide = Framed<TcpStream, FrameCodec>;

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("tcp:127.0.0.1:{}", listener.local_addr().unwrap().port());
    (listener, endpoint)
}

/// Accepts one client, sends INFO and returns the AUTH frame it answers with.
async fn accept_and_greet(listener: &TcpListener) -> (BrokerSide, Frame) {
    let (stream, _) = timeout(STEP, listener.accept()).await.unwrap().unwrap();
    let mut framed = Framed::new(stream, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE));
    framed
        .send(Frame::Info {
            name: "fake".to_string(),
            nonce: Bytes::copy_from_slice(&NONCE),
        })
        .await
        .unwrap();
    let auth = next_frame(&mut framed).await;
    (framed, auth)
}

async fn next_frame(framed: &mut BrokerSide) -> Frame {
    timeout(STEP, framed.next())
        .await
        .expect("frame in time")
        .expect("stream open")
        .expect("valid frame")
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The client answers INFO with its identity and `SHA1(nonce || secret)`.
#[tokio::test]
async fn test_auth_digest_is_computed_from_nonce_and_secret() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();

    // Act
    service.start().await.unwrap();
    let (_broker, auth) = accept_and_greet(&listener).await;

    // Assert
    match auth {
        Frame::Auth { ident, digest } => {
            assert_eq!(ident, "sensor");
            assert!(verify_digest(&NONCE, b"s3cret", &digest));
        }
        other => panic!("expected AUTH, got {other:?}"),
    }
    timeout(STEP, service.when_connected()).await.unwrap().unwrap();
    assert_eq!(service.state(), SessionState::Ready);

    service.stop().await;
}

/// Operations queued before the handshake follow AUTH in submission order.
#[tokio::test]
async fn test_pending_operations_follow_auth_in_order() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();
    service.subscribe("alerts").unwrap();
    service.publish("events", &b"early"[..]).unwrap();
    service.unsubscribe("alerts").unwrap();

    // Act
    service.start().await.unwrap();
    let (mut broker, _auth) = accept_and_greet(&listener).await;

    // Assert
    assert_eq!(
        next_frame(&mut broker).await,
        Frame::Subscribe {
            ident: "sensor".to_string(),
            channel: "alerts".to_string()
        }
    );
    assert_eq!(
        next_frame(&mut broker).await,
        Frame::Publish {
            ident: "sensor".to_string(),
            channel: "events".to_string(),
            payload: Bytes::from_static(b"early"),
        }
    );
    assert_eq!(
        next_frame(&mut broker).await,
        Frame::Unsubscribe {
            ident: "sensor".to_string(),
            channel: "alerts".to_string()
        }
    );

    service.stop().await;
}

/// PUBLISH frames from the broker are handed out by `read()`.
#[tokio::test]
async fn test_read_returns_published_messages() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();
    service.start().await.unwrap();
    let (mut broker, _auth) = accept_and_greet(&listener).await;

    // Act
    for payload in [&b"one"[..], &b"two"[..]] {
        broker
            .send(Frame::Publish {
                ident: "other".to_string(),
                channel: "events".to_string(),
                payload: Bytes::from_static(payload),
            })
            .await
            .unwrap();
    }

    // Assert
    let first = timeout(STEP, service.read()).await.unwrap().unwrap();
    let second = timeout(STEP, service.read()).await.unwrap().unwrap();
    assert_eq!(first.ident, "other");
    assert_eq!(&first.payload[..], b"one");
    assert_eq!(&second.payload[..], b"two");

    service.stop().await;
}

/// Commands still go out while received messages pile up unread.
#[tokio::test]
async fn test_publish_is_sent_while_inbound_queue_is_full() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();
    service.start().await.unwrap();
    let (mut broker, _auth) = accept_and_greet(&listener).await;
    for i in 0..200u32 {
        broker
            .send(Frame::Publish {
                ident: "other".to_string(),
                channel: "events".to_string(),
                payload: Bytes::from(i.to_string()),
            })
            .await
            .unwrap();
    }
    timeout(STEP, service.when_connected()).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Act
    service.publish("mine", &b"still flowing"[..]).unwrap();

    // Assert
    assert_eq!(
        next_frame(&mut broker).await,
        Frame::Publish {
            ident: "sensor".to_string(),
            channel: "mine".to_string(),
            payload: Bytes::from_static(b"still flowing"),
        }
    );
    let first = timeout(STEP, service.read()).await.unwrap().unwrap();
    assert_eq!(&first.payload[..], b"0");

    service.stop().await;
}

/// A publish issued right before `stop()` still reaches the broker.
#[tokio::test]
async fn test_stop_flushes_issued_publish() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();
    service.start().await.unwrap();
    let (mut broker, _auth) = accept_and_greet(&listener).await;
    timeout(STEP, service.when_connected()).await.unwrap().unwrap();

    // Act
    service.publish("events", &b"last words"[..]).unwrap();
    service.stop().await;

    // Assert
    assert_eq!(
        next_frame(&mut broker).await,
        Frame::Publish {
            ident: "sensor".to_string(),
            channel: "events".to_string(),
            payload: Bytes::from_static(b"last words"),
        }
    );
    assert!(timeout(STEP, broker.next()).await.unwrap().is_none());
    assert_eq!(service.state(), SessionState::Closed(CloseReason::Stopped));
}

/// An ERROR followed by a close surfaces the broker's text as the reason.
#[tokio::test]
async fn test_broker_error_then_close_is_reported() {
    // Arrange
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "wrong").unwrap();
    service.start().await.unwrap();
    let (mut broker, _auth) = accept_and_greet(&listener).await;

    // Act
    broker.send(Frame::error("authfail.")).await.unwrap();
    drop(broker);

    // Assert
    let read = timeout(STEP, service.read()).await.unwrap();
    assert_eq!(
        read,
        Err(SessionError::Closed(CloseReason::Remote("authfail.".to_string())))
    );
    assert!(matches!(
        service.subscribe("x"),
        Err(SessionError::Closed(_))
    ));
}

/// Nothing listening: the session closes with a transport reason.
#[tokio::test]
async fn test_connection_refused_closes_session() {
    // Arrange: grab a free port, then release it.
    let (listener, endpoint) = listen().await;
    drop(listener);
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();

    // Act
    service.start().await.unwrap();
    let waited = timeout(STEP, service.when_connected()).await.unwrap();

    // Assert
    assert!(matches!(
        waited,
        Err(SessionError::Closed(CloseReason::Transport(_)))
    ));
}

/// A session can be started only once.
#[tokio::test]
async fn test_second_start_is_rejected() {
    let (listener, endpoint) = listen().await;
    let service = ClientSessionService::new(&endpoint, "sensor", "s3cret").unwrap();

    service.start().await.unwrap();
    let _broker = accept_and_greet(&listener).await;

    assert_eq!(service.start().await, Err(SessionError::AlreadyStarted));
    service.stop().await;
}
