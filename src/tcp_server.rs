//! Accepts connections on one loop and hands each to a round-robin pool of
//! I/O loops. Grounded on `original_source/src/net/src/TcpServer.cc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::acceptor::Acceptor;
use crate::affinity::LoopAffine;
use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_address::InetAddress;
use crate::tcp_connection::TcpConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReusePort {
    No,
    Yes,
}

struct TcpServerState {
    connection_callback: ConnectionCallback,
    message_callback: MessageCallback,
    write_complete_callback: Option<WriteCompleteCallback>,
    connections: HashMap<String, Arc<TcpConnection>>,
}

pub struct TcpServer {
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    state: LoopAffine<TcpServerState>,
}

impl TcpServer {
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: InetAddress,
        name: impl Into<String>,
        reuse_port: ReusePort,
    ) -> std::io::Result<Arc<TcpServer>> {
        let name = name.into();
        let ip_port = listen_addr.to_ip_port();
        let acceptor = Acceptor::new(event_loop.clone(), &listen_addr, reuse_port == ReusePort::Yes)?;
        let thread_pool = Arc::new(EventLoopThreadPool::new(event_loop.clone(), format!("{name}-")));

        let server = Arc::new(TcpServer {
            event_loop,
            ip_port,
            name,
            acceptor: acceptor.clone(),
            thread_pool,
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            state: LoopAffine::new(TcpServerState {
                connection_callback: Arc::new(default_connection_callback),
                message_callback: Arc::new(default_message_callback),
                write_complete_callback: None,
                connections: HashMap::new(),
            }),
        });

        let weak = Arc::downgrade(&server);
        acceptor.set_new_connection_callback(Box::new(move |socket, peer_addr| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(socket, peer_addr);
            }
        }));

        Ok(server)
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn thread_pool(&self) -> &Arc<EventLoopThreadPool> {
        &self.thread_pool
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.state.with(|s| s.connection_callback = cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.state.with(|s| s.message_callback = cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.state.with(|s| s.write_complete_callback = Some(cb));
    }

    /// Starts the I/O thread pool and the acceptor. Idempotent: subsequent
    /// calls are no-ops.
    pub fn start(self: &Arc<Self>, thread_init_callback: Option<impl Fn(&Arc<EventLoop>) + Send + Sync + Clone + 'static>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.thread_pool.start(thread_init_callback);

        debug_assert!(!self.acceptor.listening());
        let acceptor = self.acceptor.clone();
        self.event_loop.run_in_loop(Box::new(move || acceptor.listen()));
    }

    fn new_connection(self: &Arc<Self>, socket: crate::sys::sockets::Socket, peer_addr: InetAddress) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.thread_pool.get_next_loop();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        log::info!("TcpServer::new_connection [{}] new connection {conn_name} from {peer_addr}", self.name);

        let local_addr = match socket.local_addr() {
            Ok(addr) => InetAddress::from_socket_addr(addr),
            Err(e) => {
                log::error!("TcpServer::new_connection failed to read local addr: {e}");
                return;
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);

        let (connection_cb, message_cb, write_complete_cb) = self.state.with_ref(|s| {
            (s.connection_callback.clone(), s.message_callback.clone(), s.write_complete_callback.clone())
        });
        conn.set_connection_callback(connection_cb);
        conn.set_message_callback(message_cb);
        if let Some(cb) = write_complete_cb {
            conn.set_write_complete_callback(cb);
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.state.with(|s| {
            s.connections.insert(conn_name, conn.clone());
        });

        io_loop.run_in_loop(Box::new(move || conn.connect_established()));
    }

    fn remove_connection(self: &Arc<Self>, conn: &Arc<TcpConnection>) {
        let this = self.clone();
        let conn = conn.clone();
        self.event_loop.run_in_loop(Box::new(move || this.remove_connection_in_loop(&conn)));
    }

    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();
        log::info!("TcpServer::remove_connection_in_loop [{}] connection {}", self.name, conn.name());
        let removed = self.state.with(|s| s.connections.remove(conn.name())).is_some();
        debug_assert!(removed);

        let io_loop = conn.event_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.event_loop.assert_in_loop_thread();
        log::trace!("TcpServer::drop [{}] destructing", self.name);
        let connections = self.state.with(|s| std::mem::take(&mut s.connections));
        for (_, conn) in connections {
            let io_loop = conn.event_loop().clone();
            io_loop.run_in_loop(Box::new(move || conn.connect_destroyed()));
        }
    }
}
