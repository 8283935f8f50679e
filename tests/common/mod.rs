//! Shared utilities for integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use ws_hub::{ServerConfig, ServerEvent, WsServer};

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build and start a server on the given port, with an event recorder.
pub async fn start_server(port: u16) -> (Arc<WsServer>, mpsc::UnboundedReceiver<ServerEvent>) {
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port,
        ..ServerConfig::default()
    };
    let server = Arc::new(WsServer::new(config).unwrap());
    let events = record_events(&server);
    server.start().await.unwrap();
    (server, events)
}

/// Subscribe a recorder that forwards every event into a channel.
pub fn record_events(server: &WsServer) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

/// Wait for the next event matching `pred`, skipping others.
pub async fn expect_event<F>(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
    mut pred: F,
) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Connect a websocket client to the server.
pub async fn connect(port: u16) -> ClientStream {
    let (stream, _response) = connect_async(format!("ws://127.0.0.1:{port}/"))
        .await
        .expect("client connect failed");
    stream
}

/// Read the next data (text/binary) message from a client stream.
pub async fn next_data_message(client: &mut ClientStream) -> Message {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return msg,
                Some(Ok(_)) => continue,
                other => panic!("client stream ended unexpectedly: {other:?}"),
            }
        }
    })
    .await
    .expect("no data message arrived")
}

/// Send one raw HTTP/1.1 request and return the full response text.
pub async fn raw_http_get(port: u16, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Close the client side politely.
pub async fn close_client(mut client: ClientStream) {
    let _ = client.close(None).await;
    // Drain until the server's close frame (or EOF) comes back.
    while let Some(Ok(_)) = client.next().await {}
}
