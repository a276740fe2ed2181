use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::Listener;

/// `tokio::net::TcpListener` with an explicit close that wakes pending accepts.
#[derive(Debug)]
pub struct TcpAcceptor {
    // Dropped on close; in-flight accepts hold their own clone until they unwind.
    inner: Mutex<Option<Arc<TcpListener>>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl TcpAcceptor {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::from_listener(listener)
    }

    pub fn from_listener(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn listener(&self) -> io::Result<Arc<TcpListener>> {
        self.inner.lock().clone().ok_or_else(closed_error)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed listener")
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let listener = self.listener()?;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            accepted = listener.accept() => accepted,
        }
    }

    async fn close(&self) -> io::Result<()> {
        let listener = self.inner.lock().take();
        if listener.is_none() {
            return Err(closed_error());
        }
        self.closed.cancel();
        debug!("TCP listener on {} closed", self.local_addr);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
