use application::{
    ApplicationError, Clock, ConnectionEndpoint, ConnectionHandle, HandshakeError, HandshakeRequest,
    MessageBroadcast,
};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{DomainError, INVALID_PAYLOAD_NOTICE, PERSISTENCE_FAILED_NOTICE};
use std::time::Duration;

use futures_util::{stream::SplitStream, Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

const CONTROL_BUFFER: usize = 8;

/// 客户端发来的帧。第一帧是握手，之后的帧只读取 `message`。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(default)]
    chat_id: Option<String>,
    #[serde(default, alias = "userEmail")]
    sender_identity: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl InboundFrame {
    fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    fn into_handshake(self) -> HandshakeRequest {
        HandshakeRequest {
            chat_id: self.chat_id,
            identity: self.sender_identity,
            role: self.role,
        }
    }
}

/// 绕过出站队列直接写入 socket 的命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

enum Incoming {
    Text(String),
    Closed,
}

/// 单个会话连接
///
/// 读循环在当前任务中运行：握手，然后逐条读取、持久化、广播。
/// 写任务独占 socket 的发送端，依次写出控制命令和出站队列中的帧；
/// 取消信号触发后先写完已入队的帧，再发送 Close。
pub struct WebSocketConnection {
    socket: WebSocket,
    state: AppState,
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, state: AppState) -> Self {
        Self { socket, state }
    }

    pub async fn run(self) {
        let state = self.state;
        let (sink, mut incoming) = self.socket.split();
        let (endpoint, outbound) =
            ConnectionEndpoint::channel(state.relay.outbound_buffer, &state.shutdown);
        let cancel = endpoint.cancel_token();
        let (control, control_rx) = mpsc::channel::<WsCommand>(CONTROL_BUFFER);

        let writer = spawn_writer(
            sink,
            outbound,
            control_rx,
            cancel.clone(),
            state.relay.delivery_timeout(),
        );

        let session = Session {
            state,
            control,
            cancel: cancel.clone(),
        };
        if let Some(handle) = session.handshake(&mut incoming, endpoint).await {
            session.relay(&mut incoming, &handle).await;
            if let Err(err) = session.state.registry.unregister(handle.id).await {
                tracing::warn!(connection_id = %handle.id, error = %err, "注销连接失败");
            }
            tracing::info!(
                connection_id = %handle.id,
                chat_id = ?handle.chat_id.as_ref().map(|id| id.as_str()),
                "会话连接已断开"
            );
        }

        cancel.cancel();
        drop(session);
        if let Err(err) = writer.await {
            tracing::warn!(error = %err, "WebSocket发送任务异常退出");
        }
    }
}

struct Session {
    state: AppState,
    control: mpsc::Sender<WsCommand>,
    cancel: CancellationToken,
}

impl Session {
    async fn handshake(
        &self,
        incoming: &mut SplitStream<WebSocket>,
        endpoint: ConnectionEndpoint,
    ) -> Option<ConnectionHandle> {
        let timeout = self.state.relay.handshake_timeout();
        let text = match tokio::time::timeout(timeout, self.next_text(incoming)).await {
            Ok(Incoming::Text(text)) => text,
            Ok(Incoming::Closed) => return None,
            Err(_) => {
                tracing::info!(timeout_ms = timeout.as_millis() as u64, "握手超时");
                return None;
            }
        };

        let frame = match InboundFrame::parse(&text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "握手帧无法解析");
                return None;
            }
        };

        match self
            .state
            .handshake_service
            .accept(frame.into_handshake(), endpoint)
            .await
        {
            Ok(handle) => Some(handle),
            Err(HandshakeError::ChatEnded(chat_id)) => {
                let notice = self.state.handshake_service.closed_notice(&chat_id);
                self.send_direct(&notice).await;
                None
            }
            Err(HandshakeError::Malformed(err)) => {
                tracing::warn!(error = %err, "握手帧无效");
                None
            }
            Err(err) => {
                tracing::error!(error = %err, "握手失败");
                None
            }
        }
    }

    async fn relay(&self, incoming: &mut SplitStream<WebSocket>, handle: &ConnectionHandle) {
        loop {
            let text = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!(connection_id = %handle.id, "连接被关闭");
                    break;
                }
                next = self.next_text(incoming) => match next {
                    Incoming::Text(text) => text,
                    Incoming::Closed => break,
                },
            };
            self.handle_text(handle, &text).await;
        }
    }

    async fn handle_text(&self, handle: &ConnectionHandle, text: &str) {
        let message = match InboundFrame::parse(text) {
            Ok(InboundFrame {
                message: Some(message),
                ..
            }) if !message.trim().is_empty() => message,
            Ok(_) => {
                self.notify(handle, INVALID_PAYLOAD_NOTICE).await;
                return;
            }
            Err(err) => {
                tracing::debug!(connection_id = %handle.id, error = %err, "消息帧无法解析");
                self.notify(handle, INVALID_PAYLOAD_NOTICE).await;
                return;
            }
        };

        match self.state.message_service.post(handle, &message).await {
            Ok(_) => {}
            Err(err) if err.is_chat_ended() => {
                if let Some(chat_id) = &handle.chat_id {
                    let notice = self.state.handshake_service.closed_notice(chat_id);
                    if let Err(err) = handle.try_deliver(notice) {
                        tracing::debug!(connection_id = %handle.id, error = %err, "关闭通知投递失败");
                    }
                }
                handle.close();
            }
            Err(ApplicationError::Domain(DomainError::InvalidArgument { field, reason })) => {
                tracing::debug!(connection_id = %handle.id, field, reason = %reason, "消息被拒绝");
                self.notify(handle, INVALID_PAYLOAD_NOTICE).await;
            }
            Err(ApplicationError::Repository(err)) => {
                tracing::error!(connection_id = %handle.id, error = %err, "消息持久化失败");
                self.notify(handle, PERSISTENCE_FAILED_NOTICE).await;
            }
            Err(err) => {
                tracing::error!(connection_id = %handle.id, error = %err, "消息中继失败");
            }
        }
    }

    /// 只发给当前连接的系统通知
    async fn notify(&self, handle: &ConnectionHandle, text: &str) {
        let notice = MessageBroadcast::system(handle.chat_id.clone(), text, self.state.clock.now());
        if let Err(err) = handle.deliver(notice, self.state.relay.delivery_timeout()).await {
            tracing::warn!(connection_id = %handle.id, error = %err, "通知投递失败");
            handle.close();
        }
    }

    async fn send_direct(&self, frame: &MessageBroadcast) {
        match serde_json::to_string(frame) {
            Ok(json) => {
                if self.control.send(WsCommand::SendText(json)).await.is_err() {
                    tracing::debug!("发送任务已结束，丢弃通知");
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to serialize websocket payload"),
        }
    }

    /// 读取下一条文本帧；Ping 在这里回应
    async fn next_text(&self, incoming: &mut SplitStream<WebSocket>) -> Incoming {
        while let Some(message) = incoming.next().await {
            match message {
                Ok(WsMessage::Text(text)) => return Incoming::Text(text.as_str().to_owned()),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Incoming::Text(text),
                    Err(_) => return Incoming::Text(String::new()),
                },
                Ok(WsMessage::Ping(data)) => {
                    tracing::debug!("收到ping消息，发送pong回应");
                    if self
                        .control
                        .send(WsCommand::SendPong(data.to_vec()))
                        .await
                        .is_err()
                    {
                        return Incoming::Closed;
                    }
                }
                Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) => {
                    tracing::debug!("WebSocket收到关闭消息");
                    return Incoming::Closed;
                }
                Err(err) => {
                    tracing::debug!(error = %err, "WebSocket读取失败");
                    return Incoming::Closed;
                }
            }
        }
        Incoming::Closed
    }
}

/// 每次写入都受 `send_timeout` 约束：对端停止读取时写任务不会无限挂起
fn spawn_writer<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<MessageBroadcast>,
    mut control: mpsc::Receiver<WsCommand>,
    cancel: CancellationToken,
    send_timeout: Duration,
) -> JoinHandle<()>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: Send,
{
    tokio::spawn(async move {
        let mut healthy = true;
        loop {
            let sent = tokio::select! {
                biased;
                Some(command) = control.recv() => send_command(&mut sink, command, send_timeout).await,
                Some(frame) = outbound.recv() => send_frame(&mut sink, &frame, send_timeout).await,
                _ = cancel.cancelled() => break,
            };
            if !sent {
                healthy = false;
                cancel.cancel();
                break;
            }
        }

        // 关闭前写完已入队的内容（例如会话关闭通知）；写入已失败时直接放弃
        if healthy {
            while let Ok(command) = control.try_recv() {
                if !send_command(&mut sink, command, send_timeout).await {
                    break;
                }
            }
            while let Ok(frame) = outbound.try_recv() {
                if !send_frame(&mut sink, &frame, send_timeout).await {
                    break;
                }
            }
            send_bounded(&mut sink, WsMessage::Close(None), send_timeout).await;
        }
        let _ = tokio::time::timeout(send_timeout, sink.close()).await;
        tracing::debug!("WebSocket发送任务结束");
    })
}

async fn send_bounded<S>(sink: &mut S, message: WsMessage, send_timeout: Duration) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    match tokio::time::timeout(send_timeout, sink.send(message)).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            tracing::debug!(timeout_ms = send_timeout.as_millis() as u64, "WebSocket写入超时");
            false
        }
    }
}

async fn send_command<S>(sink: &mut S, command: WsCommand, send_timeout: Duration) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let message = match command {
        WsCommand::SendText(text) => WsMessage::Text(text.into()),
        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
    };
    send_bounded(sink, message, send_timeout).await
}

async fn send_frame<S>(sink: &mut S, frame: &MessageBroadcast, send_timeout: Duration) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    match serde_json::to_string(frame) {
        Ok(json) => send_bounded(sink, WsMessage::Text(json.into()), send_timeout).await,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize websocket payload");
            true
        }
    }
}
