// SPDX-License-Identifier: MIT

use crate::frame::{read_frame, write_frame};
use crate::{PeerTransport, RpcError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Framed TCP transport with per-peer connection reuse. A connection
/// carries one request/response exchange at a time; it is returned to
/// the idle pool on success and dropped on any error.
pub struct TcpTransport {
    idle: Arc<Mutex<HashMap<String, Vec<TcpStream>>>>,
    max_idle_per_peer: usize,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            idle: Arc::new(Mutex::new(HashMap::new())),
            max_idle_per_peer: 2,
        }
    }

    async fn checkout(&self, peer: &str) -> Result<TcpStream, RpcError> {
        {
            let mut idle = self.idle.lock().await;
            if let Some(pool) = idle.get_mut(peer) {
                if let Some(stream) = pool.pop() {
                    return Ok(stream);
                }
            }
        }
        let stream = TcpStream::connect(peer).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    async fn checkin(&self, peer: &str, stream: TcpStream) {
        let mut idle = self.idle.lock().await;
        let pool = idle.entry(peer.to_string()).or_default();
        if pool.len() < self.max_idle_per_peer {
            pool.push(stream);
        }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTransport for TcpTransport {
    fn call<'a>(
        &'a self,
        peer: &'a str,
        request: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send + 'a>> {
        Box::pin(async move {
            let mut stream = self.checkout(peer).await?;
            let result: Result<Vec<u8>, RpcError> = async {
                write_frame(&mut stream, request).await?;
                read_frame(&mut stream).await
            }
            .await;
            match result {
                Ok(response) => {
                    self.checkin(peer, stream).await;
                    Ok(response)
                }
                Err(e) => Err(e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::serve_frames;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    #[tokio::test]
    async fn round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (_stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(serve_frames(
            listener,
            |req: Vec<u8>| async move {
                let mut resp = b"echo:".to_vec();
                resp.extend_from_slice(&req);
                resp
            },
            stop_rx,
        ));

        let transport = TcpTransport::new();
        let resp = transport.call(&addr, b"ping").await.unwrap();
        assert_eq!(resp, b"echo:ping");

        // Second call reuses the pooled connection.
        let resp = transport.call(&addr, b"again").await.unwrap();
        assert_eq!(resp, b"echo:again");
    }

    #[tokio::test]
    async fn unreachable_peer_is_network_error() {
        let transport = TcpTransport::new();
        let err = transport.call("127.0.0.1:1", b"ping").await.unwrap_err();
        assert!(matches!(err.class, fleet_model::ErrorClass::Network | fleet_model::ErrorClass::Unknown));
    }
}
