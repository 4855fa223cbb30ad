//! Single-connection client wrapping a `Connector`. Grounded on
//! `original_source/src/net/src/TcpClient.cc`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::callbacks::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::tcp_connection::TcpConnection;

struct TcpClientCallbacks {
    connection_callback: ConnectionCallback,
    message_callback: MessageCallback,
    write_complete_callback: Option<WriteCompleteCallback>,
}

pub struct TcpClient {
    event_loop: Arc<EventLoop>,
    connector: Arc<Connector>,
    name: String,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    callbacks: Mutex<TcpClientCallbacks>,
    connection: Mutex<Option<Arc<TcpConnection>>>,
}

impl TcpClient {
    pub fn new(event_loop: Arc<EventLoop>, server_addr: InetAddress, name: impl Into<String>) -> Arc<TcpClient> {
        let connector = Connector::new(event_loop.clone(), server_addr);
        let name = name.into();

        let client = Arc::new(TcpClient {
            event_loop,
            connector: connector.clone(),
            name,
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            callbacks: Mutex::new(TcpClientCallbacks {
                connection_callback: Arc::new(default_connection_callback),
                message_callback: Arc::new(default_message_callback),
                write_complete_callback: None,
            }),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        connector.set_new_connection_callback(Box::new(move |socket| {
            if let Some(client) = weak.upgrade() {
                client.new_connection(socket);
            }
        }));

        log::info!("TcpClient::new [{}] connector created", client.name);
        client
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry(&self) -> bool {
        self.retry.load(Ordering::SeqCst)
    }

    /// Once enabled, a dropped connection is automatically redialed
    /// (spec.md §4.9); matches the original's `enableRetry`.
    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::SeqCst);
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.connection.lock().unwrap().clone()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection_callback = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message_callback = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete_callback = Some(cb);
    }

    pub fn connect(self: &Arc<Self>) {
        log::info!(
            "TcpClient::connect [{}] connecting to {}",
            self.name,
            self.connector.server_address()
        );
        self.connect.store(true, Ordering::SeqCst);
        self.connector.start();
    }

    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::SeqCst);
        if let Some(conn) = self.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    pub fn stop(&self) {
        self.connect.store(false, Ordering::SeqCst);
        self.connector.stop();
    }

    fn new_connection(self: &Arc<Self>, socket: crate::sys::sockets::Socket) {
        self.event_loop.assert_in_loop_thread();

        let peer_addr = match socket.peer_addr() {
            Ok(addr) => InetAddress::from_socket_addr(addr),
            Err(e) => {
                log::error!("TcpClient::new_connection [{}] failed to read peer addr: {e}", self.name);
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => InetAddress::from_socket_addr(addr),
            Err(e) => {
                log::error!("TcpClient::new_connection [{}] failed to read local addr: {e}", self.name);
                return;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(self.event_loop.clone(), conn_name, socket, local_addr, peer_addr);

        {
            let cbs = self.callbacks.lock().unwrap();
            conn.set_connection_callback(cbs.connection_callback.clone());
            conn.set_message_callback(cbs.message_callback.clone());
            if let Some(cb) = &cbs.write_complete_callback {
                conn.set_write_complete_callback(cb.clone());
            }
        }

        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop_thread();

        {
            let mut slot = self.connection.lock().unwrap();
            debug_assert!(slot.as_ref().map_or(false, |c| Arc::ptr_eq(c, conn)));
            *slot = None;
        }

        let conn = conn.clone();
        self.event_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));

        if self.retry.load(Ordering::SeqCst) && self.connect.load(Ordering::SeqCst) {
            log::info!(
                "TcpClient::remove_connection [{}] reconnecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        log::info!("TcpClient::drop [{}]", self.name);
        let conn = self.connection.lock().unwrap().clone();
        match conn {
            Some(conn) => {
                let cb: crate::callbacks::CloseCallback = {
                    let event_loop = self.event_loop.clone();
                    Arc::new(move |conn: &Arc<TcpConnection>| {
                        let conn = conn.clone();
                        event_loop.queue_in_loop(Box::new(move || conn.connect_destroyed()));
                    })
                };
                let conn_for_set = conn.clone();
                self.event_loop.run_in_loop(Box::new(move || conn_for_set.set_close_callback(cb)));
                conn.force_close();
            }
            None => {
                self.connector.stop();
            }
        }
    }
}
