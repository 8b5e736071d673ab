//! Socket pump shared by the listener and the CSMS uplink
//!
//! Reads frames into [`NetworkingNode::receive`], writes the connection's
//! outbound queue to the socket and detaches the connection when either
//! side goes away.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use lc_core::ocpp::WireFormat;
use lc_core::{Connection, NetworkingNode, OutboundFrame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Remote sent Close or the stream ended
    RemoteClosed,
    /// The node closed the connection (eviction or shutdown)
    LocalClosed,
}

/// Pump one WebSocket until it closes, then detach its connection
pub async fn run_session<S>(
    node: Arc<NetworkingNode>,
    connection: Arc<Connection>,
    outbound: mpsc::Receiver<OutboundFrame>,
    ws: WebSocketStream<S>,
) -> Result<SessionEnd, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_tx, mut ws_rx) = ws.split();
    let writer = tokio::spawn(write_frames(connection.clone(), outbound, ws_tx));

    let result = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        trace!("{} <- {}", connection.node_id(), text);
                        node.receive(&connection, text.as_bytes());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if connection.format() != WireFormat::Cbor {
                            debug!("Binary frame on JSON link from {}", connection.node_id());
                        }
                        node.receive(&connection, &data);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("{} closed the connection: {:?}", connection.node_id(), frame);
                        break Ok(SessionEnd::RemoteClosed);
                    }
                    // Pings are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error from {}: {}", connection.node_id(), e);
                        break Err(TransportError::from(e));
                    }
                    None => {
                        info!("Stream from {} ended", connection.node_id());
                        break Ok(SessionEnd::RemoteClosed);
                    }
                }
            }
            _ = connection.closed() => {
                debug!("{} closed locally", connection.id());
                break Ok(SessionEnd::LocalClosed);
            }
        }
    };

    let cancelled = node.detach(&connection);
    if cancelled > 0 {
        info!("{} gone, {} exchange(s) cancelled", connection.node_id(), cancelled);
    }
    let _ = writer.await;
    result
}

async fn write_frames<W>(connection: Arc<Connection>, mut outbound: mpsc::Receiver<OutboundFrame>, mut ws_tx: W)
where
    W: futures_util::Sink<Message> + Unpin,
    W::Error: std::fmt::Display,
{
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_tx.send(to_message(frame)).await {
                    warn!("Failed to write to {}: {}", connection.node_id(), e);
                    break;
                }
            }
            _ = connection.closed() => break,
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

/// Text frames for JSON links, binary for CBOR
pub fn to_message(frame: OutboundFrame) -> Message {
    match frame.format {
        WireFormat::Json => match String::from_utf8(frame.bytes) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        },
        WireFormat::Cbor => Message::Binary(frame.bytes.into()),
    }
}
