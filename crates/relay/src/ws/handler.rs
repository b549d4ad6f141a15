use std::{future::Future, sync::Arc, time::Duration};

use axum::extract::ws::{Message, WebSocket};
use parley_common::{
    protocol::ws::{ClientEvent, ServerEvent},
    types::ConnectionId,
};
use tokio::{
    sync::mpsc,
    time::{timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, warn};

use super::{
    protocol::{
        close_frame_too_large, decode_frame, is_frame_size_violation, send_event, MAX_FRAME_BYTES,
    },
    session::{ConnectionMeta, OUTBOUND_QUEUE_CAPACITY},
};
use crate::{
    auth::middleware::AuthenticatedUser,
    engine::{BroadcastEngine, ConnectionContext},
    error::current_request_id,
};

/// Ping cadence and the grace period a silent peer gets before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Liveness {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Liveness {
    /// Longest a peer may go without sending a frame, and the longest a
    /// single socket write may stay blocked.
    fn deadline(&self) -> Duration {
        self.interval + self.timeout
    }
}

/// What the socket loop hands to the event worker, in arrival order.
#[derive(Debug)]
enum InboundFrame {
    Event(ClientEvent),
    Undecodable(String),
}

pub(crate) async fn handle_socket(
    engine: Arc<BroadcastEngine>,
    liveness: Liveness,
    user: AuthenticatedUser,
    meta: ConnectionMeta,
    mut socket: WebSocket,
) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let user_id = user.user_id;
    let deadline = liveness.deadline();

    let (outbound_sender, mut outbound_receiver) =
        mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_CAPACITY);
    let ctx = match engine.connect(user, meta, outbound_sender).await {
        Ok(ctx) => ctx,
        Err(error) => {
            error!(request_id = %request_id, user_id, %error, "failed to register connection");
            let _ = timeout(deadline, async {
                let _ = send_event(&mut socket, &error.to_event(None)).await;
                let _ = socket.send(Message::Close(None)).await;
            })
            .await;
            return;
        }
    };
    let connection_id = ctx.connection_id;

    let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel::<InboundFrame>();
    let worker = tokio::spawn(run_event_worker(Arc::clone(&engine), ctx.clone(), inbound_receiver));

    let mut heartbeat = tokio::time::interval(liveness.interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.reset();
    let mut last_inbound = Instant::now();

    loop {
        tokio::select! {
            _ = ctx.cancellation().cancelled() => {
                warn!(
                    request_id = %request_id,
                    %connection_id,
                    user_id,
                    "peer stopped draining events, disconnecting"
                );
                break;
            }
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() > deadline {
                    warn!(
                        request_id = %request_id,
                        %connection_id,
                        user_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                let ping = async {
                    socket.send(Message::Ping(Vec::new().into())).await.map_err(|_| ())
                };
                if !write_within(deadline, connection_id, ping).await {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(event) = maybe_outbound else {
                    break;
                };
                if !write_within(deadline, connection_id, send_event(&mut socket, &event)).await {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };
                last_inbound = Instant::now();

                let frame = match message {
                    Ok(Message::Text(raw_message)) => {
                        if raw_message.len() > MAX_FRAME_BYTES as usize {
                            let _ = timeout(deadline, close_frame_too_large(&mut socket)).await;
                            break;
                        }
                        match decode_frame(&raw_message) {
                            Ok(event) => InboundFrame::Event(event),
                            Err(reason) => {
                                debug!(%connection_id, error = %reason, "discarding undecodable frame");
                                InboundFrame::Undecodable(reason.to_string())
                            }
                        }
                    }
                    Ok(Message::Binary(_)) => {
                        InboundFrame::Undecodable("binary frames are not supported".to_string())
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Err(error) if is_frame_size_violation(&error) => {
                        let _ = timeout(deadline, close_frame_too_large(&mut socket)).await;
                        break;
                    }
                    Err(error) => {
                        debug!(%connection_id, %error, "websocket receive failed");
                        break;
                    }
                };
                if inbound_sender.send(frame).is_err() {
                    break;
                }
            }
        }
    }

    drop(inbound_sender);
    let departure = engine.disconnect(&ctx).await;
    if let Err(error) = worker.await {
        error!(%connection_id, %error, "event worker panicked");
    }
    debug!(
        request_id = %request_id,
        %connection_id,
        user_id,
        torn_down = departure.is_some(),
        "socket task finished"
    );
}

/// Socket writes share the liveness deadline: a peer that stops reading is
/// treated like one that stops answering pings.
async fn write_within<F>(deadline: Duration, connection_id: ConnectionId, write: F) -> bool
where
    F: Future<Output = Result<(), ()>>,
{
    match timeout(deadline, write).await {
        Ok(result) => result.is_ok(),
        Err(_) => {
            warn!(%connection_id, "socket write stalled past liveness deadline, disconnecting");
            false
        }
    }
}

/// Applies one connection's frames strictly in arrival order until the
/// connection is cancelled or its socket loop stops feeding it.
async fn run_event_worker(
    engine: Arc<BroadcastEngine>,
    ctx: ConnectionContext,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => break,
            maybe_frame = inbound.recv() => match maybe_frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match frame {
            InboundFrame::Event(event) => engine.dispatch(&ctx, event).await,
            InboundFrame::Undecodable(reason) => engine.reject_frame(&ctx, &reason),
        }
    }
}
