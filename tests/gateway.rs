use futures_util::{SinkExt, StreamExt};
use gateway_client::gateway::{ClientProperties, ConnectionState, DispatchEvent, HandshakeState, Identity};
use gateway_client::{GatewayClient, GatewayError, Intents};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{WebSocketStream, accept_async};

type ServerSocket = WebSocketStream<TcpStream>;

/// Serves exactly one websocket connection with `script` and returns the
/// endpoint URL the client should use.
async fn spawn_gateway<F, Fut>(script: F) -> String
where
    F: FnOnce(ServerSocket) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let socket = accept_async(stream).await.unwrap();
        script(socket).await;
    });
    format!("ws://{addr}/?v=10&encoding=json")
}

fn identity() -> Identity {
    Identity::new("integration-token", Intents::GUILDS | Intents::GUILD_MESSAGES).with_properties(
        ClientProperties {
            os: "linux".to_string(),
            client_name: "integration".to_string(),
            device_name: "integration".to_string(),
        },
    )
}

async fn send_json(socket: &mut ServerSocket, frame: Value) {
    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
}

/// Next frame with the given opcode, skipping heartbeats and control frames.
async fn expect_op(socket: &mut ServerSocket, op: u64) -> Value {
    while let Some(Ok(message)) = socket.next().await {
        if let Message::Text(text) = message {
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["op"] == op {
                return frame;
            }
        }
    }
    panic!("connection ended before op {op}");
}

async fn wait_for_established(client: &GatewayClient) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.handshake_state().await != Some(HandshakeState::Established) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_session_against_local_gateway() {
    let (identify_tx, identify_rx) = oneshot::channel();
    let url = spawn_gateway(|mut socket| async move {
        send_json(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
        let identify = expect_op(&mut socket, 2).await;
        let _ = identify_tx.send(identify);

        send_json(&mut socket, json!({"op": 0, "s": 1, "t": "READY", "d": {"v": 10}})).await;
        send_json(
            &mut socket,
            json!({"op": 0, "s": 2, "t": "MESSAGE_CREATE", "d": {"id": "1", "content": "ping"}}),
        )
        .await;
        let close = CloseFrame {
            code: CloseCode::from(4000),
            reason: "Unknown error.".to_string().into(),
        };
        socket.send(Message::Close(Some(close))).await.unwrap();
        while let Some(Ok(_)) = socket.next().await {}
    })
    .await;

    let client = GatewayClient::new(url, identity());
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    client
        .register("MESSAGE_CREATE", move |event: Arc<DispatchEvent>| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(event.data.clone())?;
                Ok(())
            }
        })
        .unwrap();

    let err = client.run().await.unwrap_err();
    assert!(matches!(err, GatewayError::SocketClosed { .. }));
    assert_eq!(err.close_code(), Some(4000));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.handshake_state().await, Some(HandshakeState::Closed));

    let identify = identify_rx.await.unwrap();
    assert_eq!(identify["d"]["token"], "integration-token");
    assert_eq!(identify["d"]["intents"], (1 << 0) | (1 << 9));
    assert_eq!(identify["d"]["properties"]["browser"], "integration");

    let data = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(data["content"], "ping");
    assert_eq!(client.session().await.unwrap().last_sequence, Some(2));
}

#[tokio::test]
async fn test_close_from_another_task() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let url = spawn_gateway(|mut socket| async move {
        send_json(&mut socket, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
        let mut saw_close = false;
        while let Some(Ok(message)) = socket.next().await {
            if message.is_close() {
                saw_close = true;
                break;
            }
        }
        let _ = closed_tx.send(saw_close);
    })
    .await;

    let client = Arc::new(GatewayClient::new(url, identity()));
    let running = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });
    wait_for_established(&client).await;

    client.close();
    running.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.heartbeat_running().await);
    assert!(tokio::time::timeout(Duration::from_secs(5), closed_rx).await.unwrap().unwrap());

    client.close();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_unreachable_gateway_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = GatewayClient::new(format!("ws://{addr}/?v=10&encoding=json"), identity());
    let err = client.run().await.unwrap_err();
    assert!(matches!(err, GatewayError::Connection(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.handshake_state().await, None);
}
