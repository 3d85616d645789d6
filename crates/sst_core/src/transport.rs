//! Transport contract for one-sided replication, plus a process-local
//! implementation for embedding several nodes in one address space.
//!
//! The real RDMA plumbing lives behind these traits. A table is handed a
//! [`Transport`] at construction; the transport opens one [`PeerResources`]
//! adapter per remote peer. Adapters move bytes at equal offsets between the
//! local row and the peer's mirror of it without involving the peer's CPU
//! (or, for the in-process transport, without involving any of its tasks).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Semaphore};

use crate::config::Group;
use crate::error::SstError;
use crate::table::TableBuffer;

/// Per-peer adapter for one-sided operations.
///
/// Offsets are relative to the start of one internal row and are identical on
/// both sides. Posted operations are independent: the transport guarantees no
/// ordering between distinct posts, and each post eventually produces exactly
/// one completion on the same adapter.
#[async_trait]
pub trait PeerResources: Send + Sync {
    /// Queue a one-sided write of `[offset, offset+len)` of the local row
    /// into the peer's mirror of it.
    async fn post_remote_write(&self, offset: usize, len: usize) -> Result<(), SstError>;

    /// Queue a one-sided read of `[offset, offset+len)` of the peer's row
    /// into the local mirror of it.
    async fn post_remote_read(&self, offset: usize, len: usize) -> Result<(), SstError>;

    /// Wait until one previously posted operation has completed.
    async fn poll_completion(&self) -> Result<(), SstError>;
}

/// Factory injected into table construction.
///
/// A transport may be shared by several tables in one process; nothing here
/// is process-global.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open one adapter per remote peer, indexed by rank. The local rank's
    /// entry is `None`.
    async fn open_peers(
        &self,
        table: Arc<TableBuffer>,
        group: &Group,
    ) -> Result<Vec<Option<Box<dyn PeerResources>>>, SstError>;

    /// One-byte barrier exchange with `peer_rank`; returns once the peer has
    /// reached its matching `sync` call. Blocks without timeout.
    async fn sync(&self, peer_rank: usize) -> Result<(), SstError>;
}

/// How long the local transport waits for a peer table to register before
/// declaring the group broken.
const LOCAL_ATTACH_TIMEOUT: Duration = Duration::from_secs(10);

type SyncChannel = (UnboundedSender<u8>, Arc<Mutex<UnboundedReceiver<u8>>>);

/// Shared rendezvous point for all [`LocalTransport`] nodes of one group.
pub struct LocalHub {
    tables: StdMutex<HashMap<usize, Arc<TableBuffer>>>,
    sync_channels: StdMutex<HashMap<(usize, usize), SyncChannel>>,
}

impl LocalHub {
    pub fn new() -> Arc<LocalHub> {
        Arc::new(LocalHub {
            tables: StdMutex::new(HashMap::new()),
            sync_channels: StdMutex::new(HashMap::new()),
        })
    }

    fn register(&self, rank: usize, table: Arc<TableBuffer>) {
        self.tables.lock().unwrap().insert(rank, table);
    }

    async fn table_of(&self, rank: usize) -> Result<Arc<TableBuffer>, SstError> {
        let deadline = tokio::time::Instant::now() + LOCAL_ATTACH_TIMEOUT;
        loop {
            if let Some(table) = self.tables.lock().unwrap().get(&rank) {
                return Ok(table.clone());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SstError::fatal(format!(
                    "peer rank {rank} never attached to the local hub"
                )));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Directed byte channel `from -> to`, created on first use.
    fn sync_channel(&self, from: usize, to: usize) -> SyncChannel {
        let mut channels = self.sync_channels.lock().unwrap();
        let (tx, rx) = channels.entry((from, to)).or_insert_with(|| {
            let (tx, rx) = unbounded_channel();
            (tx, Arc::new(Mutex::new(rx)))
        });
        (tx.clone(), rx.clone())
    }
}

/// In-process transport: one-sided operations become direct copies between
/// the group's table buffers. Useful for tests and for embedding a whole
/// group in a single process.
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    rank: usize,
}

impl LocalTransport {
    pub fn new(hub: Arc<LocalHub>, rank: usize) -> Arc<LocalTransport> {
        Arc::new(LocalTransport { hub, rank })
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open_peers(
        &self,
        table: Arc<TableBuffer>,
        group: &Group,
    ) -> Result<Vec<Option<Box<dyn PeerResources>>>, SstError> {
        if group.my_rank() != self.rank {
            return Err(SstError::Config(format!(
                "transport built for rank {}, table is rank {}",
                self.rank,
                group.my_rank()
            )));
        }
        self.hub.register(self.rank, table.clone());

        let mut peers: Vec<Option<Box<dyn PeerResources>>> = Vec::new();
        for rank in 0..group.num_members() {
            if rank == self.rank {
                peers.push(None);
            } else {
                peers.push(Some(Box::new(LocalPeer {
                    hub: self.hub.clone(),
                    table: table.clone(),
                    me: self.rank,
                    peer: rank,
                    completions: Semaphore::new(0),
                })));
            }
        }
        Ok(peers)
    }

    async fn sync(&self, peer_rank: usize) -> Result<(), SstError> {
        let (tx, _) = self.hub.sync_channel(self.rank, peer_rank);
        let (_, rx) = self.hub.sync_channel(peer_rank, self.rank);
        tx.send(b'Q')
            .map_err(|_| SstError::Bootstrap(format!("peer rank {peer_rank} is gone")))?;
        rx.lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SstError::Bootstrap(format!("peer rank {peer_rank} is gone")))?;
        Ok(())
    }
}

struct LocalPeer {
    hub: Arc<LocalHub>,
    table: Arc<TableBuffer>,
    me: usize,
    peer: usize,
    completions: Semaphore,
}

impl LocalPeer {
    fn check_span(&self, offset: usize, len: usize) {
        let content = self.table.layout().content_len();
        assert!(
            len > 0 && offset + len <= content,
            "remote op [{offset}, {}) outside row content of {content} bytes",
            offset + len
        );
    }
}

#[async_trait]
impl PeerResources for LocalPeer {
    async fn post_remote_write(&self, offset: usize, len: usize) -> Result<(), SstError> {
        self.check_span(offset, len);
        let remote = self.hub.table_of(self.peer).await?;
        let bytes = self
            .table
            .read_range(self.table.row_offset(self.me) + offset, len);
        remote.write_range(remote.row_offset(self.me) + offset, &bytes);
        self.completions.add_permits(1);
        Ok(())
    }

    async fn post_remote_read(&self, offset: usize, len: usize) -> Result<(), SstError> {
        self.check_span(offset, len);
        let remote = self.hub.table_of(self.peer).await?;
        let bytes = remote.read_range(remote.row_offset(self.peer) + offset, len);
        self.table
            .write_range(self.table.row_offset(self.peer) + offset, &bytes);
        self.completions.add_permits(1);
        Ok(())
    }

    async fn poll_completion(&self) -> Result<(), SstError> {
        let permit = self
            .completions
            .acquire()
            .await
            .map_err(|_| SstError::fatal("completion queue closed"))?;
        permit.forget();
        Ok(())
    }
}
