//! Line-delimited JSON-RPC server loop.
//!
//! Reads one JSON object per line from the reader, dispatches requests to
//! the session concurrently, and writes responses through a single writer
//! task so output lines never interleave.

use crate::protocol::{methods, RpcMessage};
use crate::session::BrokerSession;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Serve one session over a duplex byte stream until EOF.
pub async fn serve<R, W>(
    session: Arc<BrokerSession>,
    reader: R,
    writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\n").await.is_err() {
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let message: RpcMessage = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "unparseable message");
                // Parse errors respond with a null id per JSON-RPC.
                let _ = tx.send(
                    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#
                        .to_string(),
                );
                continue;
            }
        };

        match message {
            RpcMessage::Request(request) => {
                let session = Arc::clone(&session);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = session.handle_request(request).await;
                    match serde_json::to_string(&response) {
                        Ok(line) => {
                            let _ = tx.send(line);
                        }
                        Err(e) => warn!(error = %e, "failed to serialize response"),
                    }
                });
            }
            RpcMessage::Notification(notification) => {
                debug!(method = %notification.method, "notification");
                if notification.method == methods::INITIALIZED {
                    // Client handshake acknowledgement; nothing to do.
                }
            }
            RpcMessage::Response(_) => {
                warn!("unexpected response message on server channel");
            }
        }
    }

    info!("input closed, shutting session down");
    session.begin_shutdown();
    drop(tx);
    let _ = writer_task.await;
    session.close();
    Ok(())
}
