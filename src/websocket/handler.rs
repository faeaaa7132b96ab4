//! 客户端 WebSocket 会话
//!
//! 握手前完成准入检查；握手后一个读循环处理入站帧，
//! 一个写任务按顺序写出所有出站帧，每次生成在独立任务中运行。

use super::processor::{InboundAction, MessageProcessor};
use crate::error::RelayError;
use crate::models::live_model::setup_complete_message;
use crate::models::{ClientFrame, GenerationRequest};
use crate::server::AppState;
use crate::translator::TurnRelay;
use crate::websocket::ConnectionPermit;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// 单帧硬上限是业务上限的倍数，超出业务上限时仍能以 1009 关闭
const FRAME_HARD_LIMIT_FACTOR: usize = 4;

fn rejection_response(error: &RelayError) -> Response {
    let status = StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
    let reason = match error {
        RelayError::ClientRejected { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    (status, reason).into_response()
}

/// GET {ws_path} - 客户端 Live 会话入口
pub async fn live_socket_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(e) => {
            tracing::warn!("[GATEWAY] 非法握手 {}: {}", addr, e);
            return rejection_response(&RelayError::ClientRejected {
                status: 400,
                reason: "Bad request".to_string(),
            });
        }
    };

    let permit = match state.guard.admit(addr.ip(), &headers, query.as_deref()) {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!("[GATEWAY] 拒绝连接 {}: {}", addr, e);
            return rejection_response(&e);
        }
    };

    let max_payload = state.config.gateway.max_payload_bytes;
    upgrade
        .max_message_size(max_payload.saturating_mul(FRAME_HARD_LIMIT_FACTOR))
        .on_upgrade(move |socket| run_session(socket, state, permit, addr))
}

async fn run_session(socket: WebSocket, state: AppState, permit: ConnectionPermit, addr: SocketAddr) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    tracing::info!("[GATEWAY] 客户端 {} 已连接 ({})", addr, connection_id);

    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<ClientFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let (message, closing) = match frame {
                ClientFrame::Json(value) => (Message::Text(value.to_string()), false),
                ClientFrame::Close { code, reason } => (
                    Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })),
                    true,
                ),
            };
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let production = state.is_production();
    let gateway = &state.config.gateway;
    let mut processor = MessageProcessor::new(
        gateway.max_payload_bytes,
        gateway.messages_per_window(production),
        gateway.rate_window(),
        state.default_model(),
    );
    let mut turn: Option<JoinHandle<()>> = None;

    while let Some(incoming) = stream.next().await {
        let raw = match incoming {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    send_error(&frame_tx, &RelayError::protocol("binary frames are not supported"), production);
                    continue;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("[GATEWAY] 读取客户端消息失败 ({}): {}", connection_id, e);
                break;
            }
        };

        match processor.process(&raw) {
            InboundAction::Close { code, reason } => {
                tracing::warn!("[GATEWAY] 关闭连接 {} ({}): {}", connection_id, code, reason);
                let _ = frame_tx.send(ClientFrame::Close {
                    code,
                    reason: reason.to_string(),
                });
                break;
            }
            InboundAction::Setup { .. } => {
                let _ = frame_tx.send(ClientFrame::Json(setup_complete_message()));
            }
            InboundAction::Generate(request) => {
                if turn.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    tracing::debug!("[GATEWAY] 连接 {} 已有进行中的轮次", connection_id);
                    send_error(&frame_tx, &RelayError::TurnInProgress, production);
                    continue;
                }
                turn = Some(tokio::spawn(run_turn(
                    state.clone(),
                    request,
                    frame_tx.clone(),
                )));
            }
            InboundAction::Invalid(reason) => {
                send_error(
                    &frame_tx,
                    &RelayError::ClientRejected { status: 400, reason },
                    production,
                );
            }
            InboundAction::Ignore => {}
        }
    }

    // 客户端断开：丢弃进行中的轮次，上游连接与桥接关联随之释放
    if let Some(handle) = turn.take() {
        handle.abort();
    }
    drop(frame_tx);
    let _ = writer.await;
    drop(permit);
    tracing::info!("[GATEWAY] 客户端 {} 已断开 ({})", addr, connection_id);
}

fn send_error(frames: &mpsc::UnboundedSender<ClientFrame>, error: &RelayError, production: bool) {
    let _ = frames.send(ClientFrame::Json(error.to_client_envelope(production)));
}

/// 运行一轮生成：要么交付一条聚合消息，要么发送一个错误信封
async fn run_turn(state: AppState, request: GenerationRequest, frames: mpsc::UnboundedSender<ClientFrame>) {
    let mut relay = TurnRelay::new(frames.clone());
    let turn_timeout = state.config.gateway.turn_timeout();

    let result = match tokio::time::timeout(turn_timeout, state.orchestrator.run(&request, &mut relay)).await {
        Ok(result) => result.map(|_| ()),
        Err(_) => {
            let error = RelayError::Timeout(format!(
                "turn exceeded {}ms",
                turn_timeout.as_millis()
            ));
            state.monitor.record_error(&error, Some("turn"));
            Err(error)
        }
    };

    match result {
        Ok(()) => {
            tracing::debug!(
                "[GATEWAY] 请求 {} 完成，共 {} 帧",
                request.id,
                relay.frames_sent()
            );
        }
        Err(error) if !relay.is_delivered() => {
            tracing::warn!("[GATEWAY] 请求 {} 失败: {}", request.id, error);
            send_error(&frames, &error, state.is_production());
        }
        Err(error) => {
            tracing::debug!("[GATEWAY] 请求 {} 已交付，忽略后续错误: {}", request.id, error);
        }
    }
}
