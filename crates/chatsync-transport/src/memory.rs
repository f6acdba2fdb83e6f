//! In-process transport backed by Tokio channels.
//!
//! [`memory_pair`] returns a [`MemoryConnector`] (hand it to the session
//! like any other connector) and a [`MemoryServer`] that plays the remote
//! side: it accepts connections, reads what the client sent, pushes frames
//! back, and can be told to refuse or stall connect attempts. Dropping a
//! [`MemoryPeer`] looks like the server hanging up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc, watch};

use crate::{Connection, ConnectionId, Connector, TransportError};

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

struct Shared {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse_next: AtomicU32,
    refuse_all: AtomicBool,
    stalled: AtomicBool,
    attempts: AtomicU32,
}

/// Creates a connected connector/server pair.
pub fn memory_pair() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        accept_tx,
        refuse_next: AtomicU32::new(0),
        refuse_all: AtomicBool::new(false),
        stalled: AtomicBool::new(false),
        attempts: AtomicU32::new(0),
    });
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
        },
        MemoryServer { shared, accept_rx },
    )
}

/// Client half of [`memory_pair`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl Connector for MemoryConnector {
    type Connection = MemoryConnection;
    type Error = TransportError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.stalled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        let refused_once = self
            .shared
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if refused_once || self.shared.refuse_all.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory server refused connection",
            )));
        }

        let id = ConnectionId::new(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed));
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();

        self.shared
            .accept_tx
            .send(MemoryPeer {
                id,
                tx: server_tx,
                rx: server_rx,
            })
            .map_err(|_| {
                TransportError::ConnectFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "memory server dropped",
                ))
            })?;

        Ok(MemoryConnection {
            id,
            tx: Mutex::new(Some(client_tx)),
            rx: Mutex::new(client_rx),
            closed: watch::Sender::new(false),
        })
    }
}

/// Client-side connection produced by [`MemoryConnector`].
pub struct MemoryConnection {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Wakes a reader parked in `recv` when the client closes.
    closed: watch::Sender<bool>,
}

impl Connection for MemoryConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        let tx = self.tx.lock().await;
        let closed = || {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "memory connection closed",
            ))
        };
        tx.as_ref()
            .ok_or_else(closed)?
            .send(data.to_vec())
            .map_err(|_| closed())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, Self::Error> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed.changed() => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.tx.lock().await.take();
        self.closed.send_replace(true);
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Server half of [`memory_pair`].
pub struct MemoryServer {
    shared: Arc<Shared>,
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    /// Waits for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Returns an already-established connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Refuses the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.refuse_next.store(n, Ordering::SeqCst);
    }

    /// Refuses every connect attempt until switched off.
    pub fn refuse_all(&self, refuse: bool) {
        self.shared.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Makes connect attempts hang forever until switched off.
    pub fn stall(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Total connect attempts seen so far (including refused ones).
    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// The server's end of one memory connection.
pub struct MemoryPeer {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryPeer {
    /// The id the client side sees for this connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pushes a frame to the client. Returns `false` if the client closed.
    pub fn send(&self, data: &[u8]) -> bool {
        self.tx.send(data.to_vec()).is_ok()
    }

    /// Waits for the next frame from the client. `None` once the client
    /// closed its side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Returns a frame the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}
