//! Listening socket wrapper, grounded on
//! `original_source/src/net/src/Acceptor.cc`.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::sys::sockets::Socket;

const LISTEN_BACKLOG: i32 = 128;

pub type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send + 'static>;

pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: std::sync::atomic::AtomicBool,
    // Kept open and closed/reopened around an accept() failing with EMFILE,
    // so the listening socket doesn't spin at 100% CPU with no fd left to
    // accept()-and-immediately-close the connection it can't service.
    idle_fd: crate::affinity::LoopAffine<Option<File>>,
    new_connection_callback: crate::affinity::LoopAffine<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(event_loop: Arc<EventLoop>, listen_addr: &InetAddress, reuse_port: bool) -> std::io::Result<Arc<Acceptor>> {
        let accept_socket = Socket::new_stream(listen_addr)?;
        accept_socket.set_reuse_addr(true)?;
        accept_socket.set_reuse_port(reuse_port)?;
        accept_socket.bind(listen_addr)?;

        let idle_fd = File::open("/dev/null")?;
        let fd = accept_socket.as_raw_fd();
        let accept_channel = Channel::new(Arc::downgrade(&event_loop), fd);

        let acceptor = Arc::new(Acceptor {
            event_loop,
            accept_socket,
            accept_channel: accept_channel.clone(),
            listening: std::sync::atomic::AtomicBool::new(false),
            idle_fd: crate::affinity::LoopAffine::new(Some(idle_fd)),
            new_connection_callback: crate::affinity::LoopAffine::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        accept_channel.set_read_callback(Box::new(move |_receive_time: Instant| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        }));

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        self.new_connection_callback.with(|slot| *slot = Some(cb));
    }

    pub fn listen(self: &Arc<Self>) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Err(e) = self.accept_socket.listen(LISTEN_BACKLOG) {
            log::error!("Acceptor::listen failed: {e}");
            return;
        }
        self.accept_channel.enable_reading();
    }

    pub fn listening(&self) -> bool {
        self.listening.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match self.accept_socket.accept() {
            Ok((conn_socket, peer_addr)) => {
                let peer_addr = InetAddress::from_socket_addr(peer_addr);
                self.new_connection_callback.with(|cb| match cb {
                    Some(cb) => cb(conn_socket, peer_addr),
                    None => log::debug!("Acceptor::handle_read no new-connection callback installed, dropping fd"),
                });
            }
            Err(e) => {
                log::error!("Acceptor::handle_read accept failed: {e}");
                if e.raw_os_error() == Some(libc::EMFILE) {
                    self.idle_fd.with(|idle| {
                        // Drop the spare fd first so accept() below has a
                        // slot free to take (and immediately discard) the
                        // connection the listener otherwise can't service.
                        idle.take();
                        unsafe {
                            let raw = libc::accept(self.accept_socket.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut());
                            if raw >= 0 {
                                libc::close(raw);
                            }
                        }
                        match File::open("/dev/null") {
                            Ok(f) => *idle = Some(f),
                            Err(e) => log::error!("Acceptor::handle_read failed to reopen /dev/null: {e}"),
                        }
                    });
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.accept_channel.disable_all();
        self.accept_channel.remove();
    }
}
