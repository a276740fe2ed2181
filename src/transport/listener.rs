use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// The raw listener a throttle sits in front of.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Connection handle produced by `accept`.
    type Conn: Send + 'static;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> io::Result<(Self::Conn, SocketAddr)>;

    /// Stop listening. Pending and later `accept` calls fail with an error.
    async fn close(&self) -> io::Result<()>;

    /// Address the listener is bound to
    fn local_addr(&self) -> io::Result<SocketAddr>;
}
