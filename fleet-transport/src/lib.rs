// SPDX-License-Identifier: MIT

mod error;
mod frame;
mod memory;
mod policy;
mod stats;
mod tcp;

pub use error::RpcError;
pub use frame::{read_frame, serve_frames, write_frame, MAX_FRAME_BYTES};
pub use memory::MemoryTransport;
pub use policy::CallPolicy;
pub use stats::{PeerStats, TransportStats};
pub use tcp::TcpTransport;

use std::future::Future;
use std::pin::Pin;

/// Unicast request/response against one peer. Implementations are safe
/// for concurrent use by every sender task; shaping (timeout, retry,
/// backoff) is layered on top by [`CallPolicy`].
pub trait PeerTransport: Send + Sync {
    fn call<'a>(
        &'a self,
        peer: &'a str,
        request: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, RpcError>> + Send + 'a>>;
}
