//! TCP socket setup.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

/// Listen backlog for server sockets.
const LISTEN_BACKLOG: u32 = 1024;

/// Options applied to every socket before it carries a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub nodelay: bool,
    /// OS receive buffer size; `None` keeps the system default.
    pub recv_buffer_size: Option<u32>,
    /// OS send buffer size; `None` keeps the system default.
    pub send_buffer_size: Option<u32>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            nodelay: true,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl SocketOptions {
    fn socket_for(&self, addr: &SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(self.keepalive)?;
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(socket)
    }

    /// Binds a listener. Accepted sockets inherit keepalive and buffer sizes.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = self.socket_for(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(LISTEN_BACKLOG)
    }

    /// Dials `addr`, giving up after `timeout`.
    pub async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        let socket = self.socket_for(&addr)?;
        let stream = tokio::time::timeout(timeout, socket.connect(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out after {:?}", addr, timeout),
                )
            })??;
        self.apply(&stream)?;
        Ok(stream)
    }

    /// Applies the per-stream options to an established connection.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_connect() {
        let options = SocketOptions {
            recv_buffer_size: Some(64 * 1024),
            send_buffer_size: Some(64 * 1024),
            ..Default::default()
        };
        let listener = options.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let (client, accepted) = tokio::join!(
            options.connect(addr, Duration::from_secs(2)),
            listener.accept()
        );
        let client = client.unwrap();
        let (server_side, _) = accepted.unwrap();
        options.apply(&server_side).unwrap();

        assert!(client.nodelay().unwrap());
        assert!(server_side.nodelay().unwrap());
        assert_eq!(client.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = SocketOptions::default()
                .bind("127.0.0.1:0".parse().unwrap())
                .unwrap();
            listener.local_addr().unwrap()
        };
        let result = SocketOptions::default()
            .connect(addr, Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
