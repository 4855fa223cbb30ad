//! A reactor-style, non-blocking TCP networking library for Rust, modeled
//! on a `muduo`-style one-loop-per-thread event loop: an epoll/poll
//! multiplexer, timers, and a thread-pooled `TcpServer`/`TcpClient` pair
//! built on top.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reactor-net = "0.1"
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reactor_net::event_loop::EventLoop;
//! use reactor_net::inet_address::InetAddress;
//! use reactor_net::tcp_server::{ReusePort, TcpServer};
//!
//! let event_loop = EventLoop::new();
//! let addr = InetAddress::new(13265, false, false);
//! let server = TcpServer::new(event_loop.clone(), addr, "echo", ReusePort::No).unwrap();
//! server.set_message_callback(std::sync::Arc::new(|conn, buf, _time| {
//!     let data = buf.retrieve_all_as_vec();
//!     conn.send(&data);
//! }));
//! server.start(None::<fn(&Arc<EventLoop>)>);
//! event_loop.run();
//! ```

extern crate libc;
#[macro_use]
extern crate log;

pub mod acceptor;
pub mod affinity;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod config;
pub mod connector;
pub mod event_loop;
pub mod event_loop_thread;
pub mod event_loop_thread_pool;
pub mod inet_address;
pub mod poller;
pub mod sys;
pub mod tcp_client;
pub mod tcp_connection;
pub mod tcp_server;
pub mod timer;
pub mod timer_queue;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
pub use config::Config;
pub use connector::Connector;
pub use event_loop::EventLoop;
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_address::InetAddress;
pub use tcp_client::TcpClient;
pub use tcp_connection::TcpConnection;
pub use tcp_server::{ReusePort, TcpServer};
pub use timer::TimerId;
