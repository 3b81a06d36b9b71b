use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, StreamExt};
use tracing::{debug, warn};

use loopflow_core::error::{LoopflowError, Result};
use loopflow_core::event::RunSubscription;

use crate::protocol::StreamFrame;

/// What the upgrade handler learned about the run before the handshake.
pub enum StreamStart {
    /// Subscribed while the run was still going.
    Live(RunSubscription),
    /// The run had already finished; there is nothing left to stream.
    AlreadyFinished,
}

/// Stream one run's log lines to a WebSocket client.
///
/// Sends a `log` frame per line, then a `finished` frame, then closes. An
/// unknown run gets a single `error` frame. The client disconnecting ends the
/// stream early.
pub async fn stream_run(ws: WebSocket, run_id: String, start: Result<StreamStart>) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut sub = match start {
        Ok(StreamStart::Live(sub)) => sub,
        Ok(StreamStart::AlreadyFinished) => {
            let _ = send_frame(&mut ws_tx, StreamFrame::finished(&run_id)).await;
            let _ = ws_tx.close().await;
            return;
        }
        Err(e) => {
            debug!(run_id = %run_id, error = %e, "Rejecting stream for unknown run");
            let frame = StreamFrame::error(&run_id, "run_id not found");
            let _ = send_frame(&mut ws_tx, frame).await;
            let _ = ws_tx.close().await;
            return;
        }
    };

    loop {
        tokio::select! {
            line = sub.next_log() => match line {
                Some(line) => {
                    if let Err(e) = send_frame(&mut ws_tx, StreamFrame::log(&run_id, line)).await {
                        warn!(
                            run_id = %run_id,
                            error = %e,
                            "Log delivery failed, dropping observer"
                        );
                        break;
                    }
                }
                None => {
                    let _ = send_frame(&mut ws_tx, StreamFrame::finished(&run_id)).await;
                    let _ = ws_tx.close().await;
                    break;
                }
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read error");
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(run_id = %run_id, "Stream closed");
}

/// Push one frame. Fails once the client is gone; the run is unaffected.
async fn send_frame<S>(ws_tx: &mut S, frame: StreamFrame) -> Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let Some(msg) = frame.to_message() else {
        return Ok(());
    };
    ws_tx
        .send(msg)
        .await
        .map_err(|e| LoopflowError::Delivery(e.to_string()))
}
