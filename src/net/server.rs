use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use super::wire::{read_frame, write_frame, Reply, Request};
use crate::Result;

const LISTENER: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Serves decoded requests.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: Request) -> Reply;
}

type Connections = Arc<Mutex<HashMap<u64, std::net::TcpStream>>>;

/// Listener thread accepting peers; each connection is served by its own thread.
pub struct Server {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    connections: Connections,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Binds `addr` (port 0 picks a free port) and starts accepting.
    pub fn bind(addr: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        let stop = Arc::new(AtomicBool::new(false));
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
        let handle = {
            let stop = stop.clone();
            let connections = connections.clone();
            thread::Builder::new()
                .name(format!("alcommon-listener-{}", local_addr.port()))
                .spawn(move || accept_loop(poll, listener, handler, stop, connections))?
        };
        info!("Listening on {}", local_addr);
        Ok(Self {
            local_addr,
            stop,
            connections,
            listener: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every open connection. Idempotent.
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.listener.lock().take() {
            if handle.join().is_err() {
                error!("Listener thread on {} panicked", self.local_addr);
            }
        }
        for (_, stream) in self.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("Stopped listening on {}", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    stop: Arc<AtomicBool>,
    connections: Connections,
) {
    let mut events = Events::with_capacity(64);
    let next_id = AtomicU64::new(0);
    while !stop.load(Ordering::Acquire) {
        if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Listener poll failed: {}", e);
            break;
        }
        for event in events.iter() {
            if event.token() != LISTENER {
                continue;
            }
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        let id = next_id.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = serve(stream, peer, id, handler.clone(), connections.clone()) {
                            warn!("Cannot serve {}: {}", peer, e);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        break;
                    }
                }
            }
        }
    }
    debug!("Listener loop exited");
}

#[cfg(unix)]
fn into_std(stream: TcpStream) -> std::net::TcpStream {
    std::net::TcpStream::from(std::os::fd::OwnedFd::from(stream))
}

#[cfg(windows)]
fn into_std(stream: TcpStream) -> std::net::TcpStream {
    std::net::TcpStream::from(std::os::windows::io::OwnedSocket::from(stream))
}

fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    handler: Arc<dyn RequestHandler>,
    connections: Connections,
) -> io::Result<()> {
    let mut stream = into_std(stream);
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    connections.lock().insert(id, stream.try_clone()?);
    thread::Builder::new()
        .name(format!("alcommon-conn-{}", id))
        .spawn(move || {
            debug!("Serving {}", peer);
            loop {
                let request: Request = match read_frame(&mut stream) {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Connection {} dropped: {}", peer, e);
                        break;
                    }
                };
                let label = request.label();
                let reply = handler.handle(request);
                if let Err(e) = write_frame(&mut stream, &reply) {
                    debug!("Cannot answer {} to {}: {}", label, peer, e);
                    break;
                }
            }
            connections.lock().remove(&id);
            debug!("Connection with {} closed", peer);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::client::{TcpTransport, Transport};

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, request: Request) -> Reply {
            match request {
                Request::Ping { timestamp, .. } => Reply::Pong { timestamp },
                _ => Reply::Ack,
            }
        }
    }

    #[test]
    fn test_serves_and_stops() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Echo)).unwrap();
        let addr = server.local_addr();
        assert_ne!(addr.port(), 0);

        let transport = TcpTransport::new(Duration::from_secs(1));
        let ping = Request::Ping {
            from: "test".into(),
            timestamp: 42,
        };
        let reply = transport.request(addr, &ping, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(reply, Reply::Pong { timestamp: 42 });

        server.stop();
        transport.forget(addr);
        assert!(transport.request(addr, &ping, Some(Duration::from_millis(200))).is_err());
    }
}
