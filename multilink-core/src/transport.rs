//! UDP transport paths.
//!
//! A [`TransportPath`] is one socket plus the remote address it sends to.
//! On the client every WAN link owns its own socket, bound to the local
//! address of that link's interface. On the server every path shares the one
//! listening socket and differs only by the client address it replies to.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Transport path (UDP socket plus remote peer)
#[derive(Debug, Clone)]
pub struct TransportPath {
    /// UDP socket
    socket: Arc<UdpSocket>,
    /// Remote peer address
    peer_addr: SocketAddr,
}

impl TransportPath {
    /// Bind a dedicated socket for one client link
    pub async fn bind(local_addr: SocketAddr, peer_addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local_addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            peer_addr,
        })
    }

    /// Reply path over an already-bound (usually shared) socket
    pub fn from_socket(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> Self {
        Self { socket, peer_addr }
    }

    /// Send data on this path
    pub async fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.socket.send_to(data, self.peer_addr).await
    }

    /// Receive data on this path's socket
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Get local address
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_paths_exchange_datagrams() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();

        let client = TransportPath::bind("127.0.0.1:0".parse().unwrap(), server_addr)
            .await
            .unwrap();
        client.send(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, client.local_addr().unwrap());

        let reply = TransportPath::from_socket(server.clone(), from);
        reply.send(b"pong").await.unwrap();

        let (n, from) = client.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, server_addr);
        assert_eq!(reply.peer_addr(), client.local_addr().unwrap());
    }
}
