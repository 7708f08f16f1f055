#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{ChatRepository, InMemoryChatRepository};
use config::AppConfig;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use web_api::{router, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    stop: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn connect(&self) -> WsClient {
        let (ws, _) = connect_async(self.ws_url()).await.expect("ws connect");
        ws
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// 使用进程内存储启动服务
pub async fn spawn_server() -> TestServer {
    spawn_server_with(Arc::new(InMemoryChatRepository::new()), AppConfig::default()).await
}

pub async fn spawn_server_with(
    repository: Arc<dyn ChatRepository>,
    config: AppConfig,
) -> TestServer {
    let shutdown = CancellationToken::new();
    let state = AppState::new(repository, &config, shutdown.clone());
    let router = router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async {
                let _ = stop_rx.await;
            })
            .await
            .ok();
    });

    TestServer {
        addr,
        shutdown,
        stop: Some(stop_tx),
    }
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(TungsteniteMessage::Text(value.to_string().into()))
        .await
        .expect("ws send");
}

pub async fn send_raw(ws: &mut WsClient, text: &str) {
    ws.send(TungsteniteMessage::Text(text.to_owned().into()))
        .await
        .expect("ws send");
}

/// 下一条文本帧，解析为 JSON
pub async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let message = timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        match message {
            TungsteniteMessage::Text(payload) => {
                return serde_json::from_str(payload.as_str()).expect("json frame")
            }
            TungsteniteMessage::Ping(_) | TungsteniteMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// 服务端应当关闭连接，期间不应再收到文本帧
pub async fn expect_closed(ws: &mut WsClient) {
    loop {
        match timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Err(_)) | Some(Ok(TungsteniteMessage::Close(_))) => return,
            Some(Ok(TungsteniteMessage::Ping(_))) | Some(Ok(TungsteniteMessage::Pong(_))) => {}
            Some(Ok(other)) => panic!("expected close, got {other:?}"),
        }
    }
}

/// 在给定时间内没有收到任何文本帧
pub async fn expect_silence(ws: &mut WsClient, window: Duration) {
    if let Ok(Some(Ok(TungsteniteMessage::Text(payload)))) = timeout(window, ws.next()).await {
        panic!("unexpected frame: {}", payload.as_str());
    }
}

/// 完成握手并返回确认帧
pub async fn handshake(ws: &mut WsClient, frame: Value) -> Value {
    send_json(ws, frame).await;
    let confirmation = next_json(ws).await;
    assert_eq!(confirmation["sender"], "System");
    assert_eq!(confirmation["message"], "Chat session started.");
    confirmation
}
