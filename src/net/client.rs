use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use super::wire::{read_frame, write_frame, Reply, Request};
use crate::{BrokerError, Result};

/// Idle connections kept per endpoint.
const MAX_IDLE_PER_ENDPOINT: usize = 4;

/// Request/reply exchange with a peer broker.
pub trait Transport: Send + Sync {
    /// Sends `request` to `endpoint` and waits for the reply.
    /// `timeout` bounds the wait for the reply; `None` waits as long as the peer works.
    fn request(&self, endpoint: SocketAddr, request: &Request, timeout: Option<Duration>) -> Result<Reply>;
}

/// TCP transport reusing idle connections per endpoint.
pub struct TcpTransport {
    connect_timeout: Duration,
    idle: Mutex<HashMap<SocketAddr, Vec<TcpStream>>>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn connect(&self, endpoint: SocketAddr) -> Result<TcpStream> {
        let stream = TcpStream::connect_timeout(&endpoint, self.connect_timeout)
            .map_err(|e| BrokerError::ConnectionLost(format!("cannot reach {}: {}", endpoint, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connected to {}", endpoint);
        Ok(stream)
    }

    fn checkout(&self, endpoint: SocketAddr) -> Option<TcpStream> {
        self.idle.lock().get_mut(&endpoint).and_then(Vec::pop)
    }

    fn checkin(&self, endpoint: SocketAddr, stream: TcpStream) {
        let mut idle = self.idle.lock();
        let slot = idle.entry(endpoint).or_default();
        if slot.len() < MAX_IDLE_PER_ENDPOINT {
            slot.push(stream);
        }
    }

    /// Drops every idle connection to `endpoint`.
    pub fn forget(&self, endpoint: SocketAddr) {
        self.idle.lock().remove(&endpoint);
    }

    fn exchange(
        stream: &mut TcpStream,
        endpoint: SocketAddr,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        stream.set_read_timeout(timeout)?;
        write_frame(stream, request).map_err(|e| lost(endpoint, e))?;
        match read_frame::<_, Reply>(stream) {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BrokerError::ConnectionLost(format!("{} closed the connection", endpoint))),
            Err(BrokerError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                Err(BrokerError::Timeout(format!("{} to {} got no reply", request.label(), endpoint)))
            }
            Err(e) => Err(lost(endpoint, e)),
        }
    }
}

fn lost(endpoint: SocketAddr, err: BrokerError) -> BrokerError {
    match err {
        BrokerError::Io(e) => BrokerError::ConnectionLost(format!("{}: {}", endpoint, e)),
        other => other,
    }
}

impl Transport for TcpTransport {
    fn request(&self, endpoint: SocketAddr, request: &Request, timeout: Option<Duration>) -> Result<Reply> {
        if let Some(mut stream) = self.checkout(endpoint) {
            match Self::exchange(&mut stream, endpoint, request, timeout) {
                Ok(reply) => {
                    self.checkin(endpoint, stream);
                    return Ok(reply);
                }
                // the peer may have dropped an idle connection; try once on a fresh one
                Err(BrokerError::ConnectionLost(msg)) => {
                    debug!("Reused connection failed ({}), reconnecting", msg);
                    self.forget(endpoint);
                }
                Err(e) => return Err(e),
            }
        }
        let mut stream = self.connect(endpoint)?;
        match Self::exchange(&mut stream, endpoint, request, timeout) {
            Ok(reply) => {
                self.checkin(endpoint, stream);
                Ok(reply)
            }
            Err(e) => {
                warn!("{} to {} failed: {}", request.label(), endpoint, e);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("connect_timeout", &self.connect_timeout)
            .field("endpoints", &self.idle.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_unreachable_endpoint_is_connection_lost() {
        // bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let transport = TcpTransport::new(Duration::from_millis(200));
        let err = transport.request(addr, &Request::GetModuleList, None).unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost(_)));
    }

    #[test]
    fn test_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            // a single accepted connection serves both requests
            let (mut stream, _) = listener.accept().unwrap();
            for _ in 0..2 {
                let request: Request = read_frame(&mut stream).unwrap().unwrap();
                assert_eq!(request, Request::GetBrokerList);
                write_frame(&mut stream, &Reply::Infos(Vec::new())).unwrap();
            }
        });
        let transport = TcpTransport::new(Duration::from_secs(1));
        for _ in 0..2 {
            let reply = transport.request(addr, &Request::GetBrokerList, Some(Duration::from_secs(2))).unwrap();
            assert_eq!(reply, Reply::Infos(Vec::new()));
        }
        server.join().unwrap();
    }

    #[test]
    fn test_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });
        let transport = TcpTransport::new(Duration::from_secs(1));
        let err = transport
            .request(addr, &Request::GetModuleList, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert!(matches!(err, BrokerError::Timeout(_)));
    }
}
