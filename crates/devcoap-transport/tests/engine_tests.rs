//! Message layer tests (devcoap-transport)
//!
//! Drives the engine against a scripted UDP peer:
//! - piggybacked and separate responses
//! - reset and retransmission give-up
//! - unreachable peers

use coap_lite::{MessageClass, MessageType, Packet, RequestType, ResponseType};
use devcoap_core::packet::{self, new_packet};
use devcoap_core::PacketExt;
use devcoap_transport::{
    DatagramChannel, Engine, EngineConfig, EngineEvent, NackReason, UdpChannel,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn fast_config() -> EngineConfig {
    EngineConfig {
        ack_timeout: Duration::from_millis(50),
        ack_random_factor: 1.0,
        max_retransmit: 2,
        exchange_lifetime: Duration::from_millis(500),
        ..Default::default()
    }
}

async fn engine_to(peer: SocketAddr) -> Engine {
    let channel: Arc<dyn DatagramChannel> = Arc::new(UdpChannel::connect(peer).await.unwrap());
    Engine::new(channel, fast_config())
}

async fn recv_message(socket: &UdpSocket) -> (Packet, SocketAddr) {
    let mut buf = [0u8; 1500];
    let (len, from) = socket.recv_from(&mut buf).await.unwrap();
    (packet::decode(&buf[..len]).unwrap(), from)
}

async fn send_packet(socket: &UdpSocket, message: &Packet, to: SocketAddr) {
    socket
        .send_to(&packet::encode(message).unwrap(), to)
        .await
        .unwrap();
}

fn get_request() -> Packet {
    let mut request = new_packet(
        MessageType::Confirmable,
        MessageClass::Request(RequestType::Get),
        0,
    );
    request.set_uri_segments(&["a1r", "dev", "temp"]);
    request
}

const CONTENT: MessageClass = MessageClass::Response(ResponseType::Content);

// ============================================================================
// Responses
// ============================================================================

#[tokio::test]
async fn test_piggybacked_response() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();

    let (request, from) = recv_message(&device).await;
    assert_eq!(request.message_type(), MessageType::Confirmable);
    assert_eq!(request.uri_path_string(), "a1r/dev/temp");
    assert_eq!(request.get_token().len(), 4);

    let response = packet::response_to(&request, ResponseType::Content, 0)
        .with_payload(b"21.500000".to_vec());
    send_packet(&device, &response, from).await;

    match timeout(Duration::from_secs(2), engine.wait(&mut pending)).await {
        Ok(EngineEvent::Response(msg)) => {
            assert_eq!(msg.header.code, CONTENT);
            assert_eq!(msg.payload, b"21.500000");
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_separate_response_is_acknowledged() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();
    let (request, from) = recv_message(&device).await;

    send_packet(&device, &packet::empty_ack(request.header.message_id), from).await;
    let separate = new_packet(MessageType::Confirmable, CONTENT, 4242)
        .with_token(request.get_token().to_vec())
        .with_payload(b"7".to_vec());
    send_packet(&device, &separate, from).await;

    let event = timeout(Duration::from_secs(2), engine.wait(&mut pending))
        .await
        .expect("engine should complete");
    assert!(matches!(event, EngineEvent::Response(ref m) if m.payload == b"7"));
    assert!(pending.is_acked());

    let (ack, _) = timeout(Duration::from_secs(1), recv_message(&device))
        .await
        .expect("separate response should be acknowledged");
    assert_eq!(ack.message_type(), MessageType::Acknowledgement);
    assert_eq!(ack.header.message_id, 4242);
    assert!(ack.is_empty_message());
}

#[tokio::test]
async fn test_foreign_token_ignored() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();
    let (request, from) = recv_message(&device).await;

    let stray = new_packet(MessageType::NonConfirmable, CONTENT, 1)
        .with_token(vec![0xde, 0xad])
        .with_payload(b"stray".to_vec());
    send_packet(&device, &stray, from).await;
    let response = packet::response_to(&request, ResponseType::Content, 0)
        .with_payload(b"real".to_vec());
    send_packet(&device, &response, from).await;

    match timeout(Duration::from_secs(2), engine.wait(&mut pending)).await {
        Ok(EngineEvent::Response(msg)) => assert_eq!(msg.payload, b"real"),
        other => panic!("unexpected event: {:?}", other),
    }
}

// ============================================================================
// Negative acknowledgments
// ============================================================================

#[tokio::test]
async fn test_reset_is_nack() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();
    let (request, from) = recv_message(&device).await;
    send_packet(&device, &packet::reset(request.header.message_id), from).await;

    let event = timeout(Duration::from_secs(2), engine.wait(&mut pending))
        .await
        .unwrap();
    assert!(matches!(event, EngineEvent::Nack(NackReason::Reset)));
}

#[tokio::test]
async fn test_retransmit_then_give_up() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();
    let event = timeout(Duration::from_secs(5), engine.wait(&mut pending))
        .await
        .unwrap();
    assert!(matches!(event, EngineEvent::Nack(NackReason::TooManyRetries)));
    assert_eq!(pending.retransmits(), 2);

    // first send plus two retransmissions, all with the same message id
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (msg, _) = timeout(Duration::from_millis(200), recv_message(&device))
            .await
            .unwrap();
        ids.push(msg.header.message_id);
    }
    assert!(ids.iter().all(|id| *id == pending.message_id));
}

#[tokio::test]
async fn test_acknowledged_without_response_times_out() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let mut pending = engine.submit(get_request()).await.unwrap();
    let (request, from) = recv_message(&device).await;
    send_packet(&device, &packet::empty_ack(request.header.message_id), from).await;

    let event = timeout(Duration::from_secs(3), engine.wait(&mut pending))
        .await
        .unwrap();
    assert!(matches!(event, EngineEvent::Nack(NackReason::TooManyRetries)));
    assert_eq!(pending.retransmits(), 0);
}

#[tokio::test]
async fn test_unreachable_peer_is_nack() {
    let port = {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap().port()
    };
    let engine = engine_to(SocketAddr::from(([127, 0, 0, 1], port))).await;

    let event = match engine.submit(get_request()).await {
        Ok(mut pending) => timeout(Duration::from_secs(5), engine.wait(&mut pending))
            .await
            .unwrap(),
        // some platforms refuse the very first send
        Err(_) => return,
    };
    assert!(matches!(event, EngineEvent::Nack(_)));
}

#[tokio::test]
async fn test_message_ids_increment() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let engine = engine_to(device.local_addr().unwrap()).await;

    let first = engine.submit(get_request()).await.unwrap();
    let second = engine.submit(get_request()).await.unwrap();
    assert_eq!(second.message_id, first.message_id.wrapping_add(1));
    assert_ne!(first.token, second.token);
}
