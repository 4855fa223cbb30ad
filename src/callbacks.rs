//! Callback type aliases shared across the connection/server/client modules,
//! grounded on `original_source/src/net/include/Callbacks.h`.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::tcp_connection::TcpConnection;

/// A unit of work posted to an `EventLoop` from any thread via
/// `run_in_loop`/`queue_in_loop`. Boxed `FnOnce` rather than `FnMut` since
/// each pending functor runs exactly once.
pub type Functor = Box<dyn FnOnce() + Send + 'static>;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, std::time::Instant) + Send + Sync>;

/// Logs the connection's up/down transition; used as the server/client
/// default until the application installs its own.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    log::trace!("{} -> {}", conn.local_addr(), conn.peer_addr());
}

/// Discards whatever was read. Matches the original's
/// `defaultMessageCallback`, which just drains the buffer.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _receive_time: std::time::Instant) {
    buf.retrieve_all();
}
