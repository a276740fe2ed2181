use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::listener::{AcceptError, ThrottledListener};
use crate::transport::Listener;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accept loop that hands every admitted connection to its own task.
pub struct Forwarder<L> {
    listener: Arc<ThrottledListener<L>>,
    // Echo mode when unset
    upstream: Option<Arc<str>>,
    shutdown: CancellationToken,
}

impl<L> Forwarder<L>
where
    L: Listener + 'static,
    L::Conn: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        listener: Arc<ThrottledListener<L>>,
        upstream: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            upstream: upstream.map(Arc::from),
            shutdown,
        }
    }

    pub async fn run(self) {
        match &self.upstream {
            Some(upstream) => info!("Forwarder started. Relaying to {}", upstream),
            None => info!("Forwarder started. Echoing connections"),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((inbound, peer)) => {
                    let upstream = self.upstream.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(inbound, peer, upstream).await {
                            debug!("Connection from {} ended with error: {}", peer, e);
                        }
                    });
                }
                Err(AcceptError::Canceled { peer, .. }) => {
                    // Shutting down: the pending connection is dropped, which closes it.
                    debug!("Dropping connection from {} on shutdown", peer);
                    break;
                }
                Err(AcceptError::Listener(e)) if e.kind() == io::ErrorKind::NotConnected => {
                    info!("Listener closed");
                    break;
                }
                Err(AcceptError::Listener(e)) => {
                    warn!("Accept failed: {}. Retrying in {}ms", e, ACCEPT_ERROR_BACKOFF.as_millis());
                    tokio::select! {
                        _ = sleep(ACCEPT_ERROR_BACKOFF) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Forwarder stopped.");
    }
}

async fn handle_connection<C>(mut inbound: C, peer: SocketAddr, upstream: Option<Arc<str>>) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    match upstream {
        Some(upstream) => {
            let mut outbound = TcpStream::connect(&*upstream).await?;
            outbound.set_nodelay(true)?;
            let (sent, received) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await?;
            debug!("Relayed {} -> {}: {} bytes up, {} bytes down", peer, upstream, sent, received);
        }
        None => {
            let (mut reader, mut writer) = tokio::io::split(inbound);
            let echoed = tokio::io::copy(&mut reader, &mut writer).await?;
            debug!("Echoed {} bytes to {}", echoed, peer);
        }
    }
    Ok(())
}
