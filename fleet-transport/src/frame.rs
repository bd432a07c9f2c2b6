// SPDX-License-Identifier: MIT

use crate::RpcError;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Upper bound on a single frame. A frame above this is a corrupt or
/// hostile peer, not a legitimate snapshot chunk.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

pub async fn write_frame(stream: &mut TcpStream, data: &[u8]) -> Result<(), RpcError> {
    let len = data.len() as u32;
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, RpcError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        return Err(RpcError::validation(format!("bad frame length {}", len)));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Accept loop: one task per inbound connection, request/response frames
/// until the peer hangs up or shutdown flips.
pub async fn serve_frames<H, F>(
    listener: TcpListener,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) where
    H: Fn(Vec<u8>) -> F + Send + Sync + 'static,
    F: Future<Output = Vec<u8>> + Send + 'static,
{
    let handler = Arc::new(handler);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (mut stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("[Transport] Accept failed: {}", e);
                        continue;
                    }
                };
                debug!("[Transport] Connection from {}", addr);
                let handler = handler.clone();
                let mut conn_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            frame = read_frame(&mut stream) => {
                                let request = match frame {
                                    Ok(f) => f,
                                    Err(_) => break,
                                };
                                let response = handler(request).await;
                                if write_frame(&mut stream, &response).await.is_err() {
                                    break;
                                }
                            }
                            _ = conn_shutdown.changed() => break,
                        }
                    }
                });
            }
            _ = shutdown.changed() => {
                debug!("[Transport] Frame server stopping");
                return;
            }
        }
    }
}
