//! An established, non-blocking TCP connection. Grounded on
//! `original_source/src/net/src/TcpConnection.cc`.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::affinity::LoopAffine;
use crate::buffer::Buffer;
use crate::callbacks::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::sys::sockets::Socket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

struct TcpConnectionState {
    conn_state: State,
    reading: bool,
    output_buffer: Buffer,
    connection_callback: ConnectionCallback,
    message_callback: MessageCallback,
    write_complete_callback: Option<WriteCompleteCallback>,
    high_water_mark_callback: Option<HighWaterMarkCallback>,
    high_water_mark: usize,
    close_callback: Option<CloseCallback>,
}

pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    state: LoopAffine<TcpConnectionState>,
    // Kept in its own cell, separate from `state`: `handle_read` holds this
    // borrowed for the duration of the user message callback, and that
    // callback routinely re-enters `self.state` (e.g. via `send`). Sharing
    // one cell between the two would hand out two live mutable borrows of
    // the same `UnsafeCell` the moment a callback re-entered.
    input_buffer: LoopAffine<Buffer>,
}

impl TcpConnection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> Arc<TcpConnection> {
        let fd = socket.as_raw_fd();
        let channel = Channel::new(Arc::downgrade(&event_loop), fd);
        let _ = socket.set_keep_alive(true);
        let high_water_mark = event_loop.config().default_high_water_mark;

        let conn = Arc::new(TcpConnection {
            event_loop,
            name,
            socket,
            channel: channel.clone(),
            local_addr,
            peer_addr,
            state: LoopAffine::new(TcpConnectionState {
                conn_state: State::Connecting,
                reading: true,
                output_buffer: Buffer::new(),
                connection_callback: Arc::new(default_connection_callback),
                message_callback: Arc::new(default_message_callback),
                write_complete_callback: None,
                high_water_mark_callback: None,
                high_water_mark,
                close_callback: None,
            }),
            input_buffer: LoopAffine::new(Buffer::new()),
        });

        let w = Arc::downgrade(&conn);
        channel.set_read_callback(Box::new(move |receive_time: Instant| {
            if let Some(conn) = w.upgrade() {
                conn.handle_read(receive_time);
            }
        }));
        let w = Arc::downgrade(&conn);
        channel.set_write_callback(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_write();
            }
        }));
        let w = Arc::downgrade(&conn);
        channel.set_close_callback(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_close();
            }
        }));
        let w = Arc::downgrade(&conn);
        channel.set_error_callback(Box::new(move || {
            if let Some(conn) = w.upgrade() {
                conn.handle_error();
            }
        }));

        log::debug!("TcpConnection::new [{}] fd={fd}", conn.name);
        conn
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> &InetAddress {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &InetAddress {
        &self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state.with_ref(|s| s.conn_state == State::Connected)
    }

    pub fn disconnected(&self) -> bool {
        self.state.with_ref(|s| s.conn_state == State::Disconnected)
    }

    pub fn is_reading(&self) -> bool {
        self.state.with_ref(|s| s.reading)
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

    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.state.with(|s| s.close_callback = Some(cb));
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        self.state.with(|s| {
            s.high_water_mark_callback = Some(cb);
            s.high_water_mark = high_water_mark;
        });
    }

    pub fn set_tcp_nodelay(&self, on: bool) {
        if let Err(e) = self.socket.set_tcp_nodelay(on) {
            log::warn!("TcpConnection::set_tcp_nodelay [{}] failed: {e}", self.name);
        }
    }

    /// Queues `data` for writing, synchronously if called from the owning
    /// loop's thread, else hopping via `run_in_loop`.
    pub fn send(self: &Arc<Self>, data: &[u8]) {
        if !self.state.with_ref(|s| s.conn_state == State::Connected) {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let owned = data.to_vec();
            let this = self.clone();
            self.event_loop.run_in_loop(Box::new(move || this.send_in_loop(&owned)));
        }
    }

    /// Drains `buf` and sends its entire contents, matching `send(Buffer*)`.
    pub fn send_buffer(self: &Arc<Self>, buf: &mut Buffer) {
        self.send(buf.peek());
        buf.retrieve_all();
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();

        if self.state.with_ref(|s| s.conn_state == State::Disconnected) {
            log::warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fatal = false;
        let already_writing = self.channel.is_writing();
        let output_empty = self.state.with_ref(|s| s.output_buffer.is_empty());

        if !already_writing && output_empty {
            match write_fd(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let cb = self.state.with_ref(|s| s.write_complete_callback.clone());
                        if let Some(cb) = cb {
                            let this = self.clone();
                            self.event_loop.queue_in_loop(Box::new(move || cb(&this)));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() != std::io::ErrorKind::WouldBlock {
                        log::error!("TcpConnection::send_in_loop [{}] write failed: {e}", self.name);
                        if e.raw_os_error() == Some(libc::EPIPE) || e.raw_os_error() == Some(libc::ECONNRESET) {
                            fatal = true;
                        }
                    }
                }
            }
        }

        if fatal || remaining == 0 {
            return;
        }

        // The remainder always gets buffered and the channel always starts
        // writing, regardless of whether the high-water mark was crossed;
        // the mark only gates the *notification*, not whether the data is
        // kept at all (spec.md §9's documented fix for the original, which
        // folded both under one `if (size >= highWaterMark_)`).
        let (old_len, new_len, mark) = self.state.with(|s| {
            let old_len = s.output_buffer.readable_bytes();
            s.output_buffer.append(&data[nwrote..]);
            (old_len, s.output_buffer.readable_bytes(), s.high_water_mark)
        });

        if new_len >= mark && old_len < mark {
            let cb = self.state.with_ref(|s| s.high_water_mark_callback.clone());
            if let Some(cb) = cb {
                let this = self.clone();
                self.event_loop.queue_in_loop(Box::new(move || cb(&this, new_len)));
            }
        }

        if !self.channel.is_writing() {
            self.channel.enable_writing();
        }
    }

    pub fn shutdown(self: &Arc<Self>) {
        if self.state.with_ref(|s| s.conn_state == State::Connected) {
            self.state.with(|s| s.conn_state = State::Disconnecting);
            let this = self.clone();
            self.event_loop.run_in_loop(Box::new(move || this.shutdown_in_loop()));
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                log::warn!("TcpConnection::shutdown_in_loop [{}] failed: {e}", self.name);
            }
        }
    }

    pub fn force_close(self: &Arc<Self>) {
        let should = self.state.with_ref(|s| matches!(s.conn_state, State::Connected | State::Disconnecting));
        if should {
            self.state.with(|s| s.conn_state = State::Disconnecting);
            let this = self.clone();
            self.event_loop.queue_in_loop(Box::new(move || this.force_close_in_loop()));
        }
    }

    pub fn force_close_with_delay(self: &Arc<Self>, delay: Duration) {
        self.event_loop.assert_in_loop_thread();
        let should = self.state.with_ref(|s| matches!(s.conn_state, State::Connected | State::Disconnecting));
        if should {
            self.state.with(|s| s.conn_state = State::Disconnecting);
            let weak = Arc::downgrade(self);
            self.event_loop.run_after(delay, Box::new(move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            }));
        }
    }

    fn force_close_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let should = self.state.with_ref(|s| matches!(s.conn_state, State::Connected | State::Disconnecting));
        if should {
            self.handle_close();
        }
    }

    pub fn start_read(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.start_read_in_loop()));
    }

    fn start_read_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let already = self.state.with_ref(|s| s.reading) && self.channel.is_reading();
        if !already {
            self.channel.enable_reading();
            self.state.with(|s| s.reading = true);
        }
    }

    pub fn stop_read(self: &Arc<Self>) {
        let this = self.clone();
        self.event_loop.run_in_loop(Box::new(move || this.stop_read_in_loop()));
    }

    fn stop_read_in_loop(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        let should = self.state.with_ref(|s| s.reading) || self.channel.is_reading();
        if should {
            self.channel.disable_reading();
            self.state.with(|s| s.reading = false);
        }
    }

    /// Flips to `Connected`, ties the channel's lifetime to this
    /// connection, starts reading, and fires the connection callback.
    /// Called by `TcpServer`/`TcpClient` exactly once, on the loop thread,
    /// right after construction.
    pub fn connect_established(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        debug_assert!(self.state.with_ref(|s| s.conn_state == State::Connecting));
        self.state.with(|s| s.conn_state = State::Connected);
        self.channel.tie(Arc::downgrade(self));
        self.channel.enable_reading();

        let cb = self.state.with_ref(|s| s.connection_callback.clone());
        cb(self);
    }

    /// Tears the connection down from the loop's side: fires the connection
    /// callback one last time if it was still up, then deregisters the
    /// channel. Called once, by whichever of `TcpServer`/`TcpClient` owns
    /// this connection's lifetime, after `handle_close` has run.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if self.state.with_ref(|s| s.conn_state == State::Connected) {
            self.state.with(|s| s.conn_state = State::Disconnected);
            self.channel.disable_all();
            let cb = self.state.with_ref(|s| s.connection_callback.clone());
            cb(self);
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let result = self.input_buffer.with(|buf| buf.read_fd(self.channel.fd()));
        match result {
            Ok(n) if n > 0 => {
                let cb = self.state.with_ref(|s| s.message_callback.clone());
                self.input_buffer.with(|buf| cb(self, buf, receive_time));
            }
            Ok(_) => self.handle_close(),
            Err(e) => {
                log::error!("TcpConnection::handle_read [{}] failed: {e}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            log::trace!("TcpConnection::handle_write [{}] down, no more writing", self.name);
            return;
        }

        let to_write = self.state.with_ref(|s| s.output_buffer.peek().to_vec());
        match write_fd(self.channel.fd(), &to_write) {
            Ok(n) => {
                let (now_empty, was_disconnecting) = self.state.with(|s| {
                    s.output_buffer.retrieve(n);
                    (s.output_buffer.is_empty(), s.conn_state == State::Disconnecting)
                });
                if now_empty {
                    self.channel.disable_writing();
                    let cb = self.state.with_ref(|s| s.write_complete_callback.clone());
                    if let Some(cb) = cb {
                        let this = self.clone();
                        self.event_loop.queue_in_loop(Box::new(move || cb(&this)));
                    }
                    if was_disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(e) => log::error!("TcpConnection::handle_write [{}] write failed: {e}", self.name),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        log::trace!("TcpConnection::handle_close [{}] fd={}", self.name, self.channel.fd());
        debug_assert!(self.state.with_ref(|s| matches!(s.conn_state, State::Connected | State::Disconnecting)));
        self.state.with(|s| s.conn_state = State::Disconnected);
        self.channel.disable_all();

        let connection_cb = self.state.with_ref(|s| s.connection_callback.clone());
        connection_cb(self);
        let close_cb = self.state.with_ref(|s| s.close_callback.clone());
        if let Some(close_cb) = close_cb {
            close_cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => log::error!("TcpConnection::handle_error [{}] SO_ERROR = {err}", self.name),
            Ok(None) => log::error!("TcpConnection::handle_error [{}] called with no pending SO_ERROR", self.name),
            Err(e) => log::error!("TcpConnection::handle_error [{}] failed to read SO_ERROR: {e}", self.name),
        }
    }
}

fn write_fd(fd: std::os::unix::io::RawFd, data: &[u8]) -> std::io::Result<usize> {
    loop {
        let ret = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if ret >= 0 {
            return Ok(ret as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(err);
    }
}
