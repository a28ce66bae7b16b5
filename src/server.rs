//! TCP listener and per-connection assembly.
//!
//! The server owns nothing but the accept loop: it hands every connection a
//! fresh session id, splits the stream, and wires the read loop and writer
//! task together. All routing decisions live in [`crate::session`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{info, warn};

use crate::message::{ClientToServer, read_frame};
use crate::registry::Registry;
use crate::session::{self, Session, SessionId};

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    max_pending: Option<usize>,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(listener: TcpListener, registry: Arc<Registry>, max_pending: Option<usize>) -> Self {
        Self {
            listener,
            registry,
            max_pending,
            next_id: AtomicU64::new(1),
        }
    }

    /// Address the listener is bound to. Useful when binding to port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Sessions spawned before
    /// shutdown keep running until their connections close.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            registry,
            max_pending,
            next_id,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let id = next_id.fetch_add(1, Ordering::Relaxed);
                            spawn_session(stream, peer, id, Arc::clone(&registry), max_pending);
                        }
                        Err(error) => warn!(?error, "failed to accept connection"),
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "failed to listen for ctrl-c");
            }
        })
        .await
    }
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    registry: Arc<Registry>,
    max_pending: Option<usize>,
) {
    tokio::spawn(async move {
        if let Err(error) = handle_connection(stream, id, registry, max_pending).await {
            warn!(%peer, session = id, ?error, "session ended with error");
        }
    });
}

/// Runs one connection to completion: spawns the writer task over the write
/// half and feeds inbound frames to the session until the read side ends,
/// then tears the session down. Teardown runs on every exit path, so a
/// malformed frame still deregisters the session.
async fn handle_connection(
    stream: TcpStream,
    id: SessionId,
    registry: Arc<Registry>,
    max_pending: Option<usize>,
) -> Result<()> {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let session = Session::new(id, registry, max_pending);
    let writer_task = tokio::spawn(session::run_writer(Arc::clone(session.handle()), writer));
    info!(?peer, session = id, "client connected");

    let outcome = read_frames(&mut reader, &session).await;

    session.on_disconnect().await;
    let _ = writer_task.await;
    info!(?peer, session = id, "client disconnected");

    outcome
}

/// The read loop: one outstanding read per connection, re-armed by the loop
/// after each frame is handled. Ends when the stream ends or errors, or as
/// soon as the session has been terminated from the write side.
async fn read_frames<R>(reader: &mut R, session: &Session) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        match read_frame::<_, ClientToServer>(reader).await? {
            Some(frame) => session.on_frame(frame).await,
            None => return Ok(()),
        }
        if session.handle().is_closed().await {
            return Ok(());
        }
    }
}
