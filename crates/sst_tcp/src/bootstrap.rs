//! Out-of-band bootstrap channel.
//!
//! One reliable byte stream per peer, used for three things: identifying the
//! endpoints (an ASCII decimal node-rank exchange in a fixed 10-byte field),
//! exchanging the packed connection record each side needs to address the
//! other's memory, and the one-byte `sync` barrier.
//!
//! Connections are set up pairwise in descending rank order: a node
//! connects to every peer with a greater rank (the peer with the greater
//! rank accepts), then accepts one connection from every peer with a lesser
//! rank. Ranks, not ids, drive the ordering; ids need not be monotonic
//! across the member list.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use sst_core::Group;

/// Width of the ASCII node-rank field exchanged on every new connection.
pub const RANK_FIELD_LEN: usize = 10;

/// Packed per-peer record exchanged once during setup.
///
/// The field set mirrors what a verbs transport needs to address a remote
/// memory region; the TCP stand-in carries its data-plane port in `qp_num`
/// and leaves the fields it has no use for at zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionData {
    pub addr: u64,
    pub rkey: u32,
    pub qp_num: u32,
    pub lid: u16,
    pub gid: [u8; 16],
}

impl ConnectionData {
    pub const ENCODED_LEN: usize = 34;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u64_le(self.addr);
        buf.put_u32_le(self.rkey);
        buf.put_u32_le(self.qp_num);
        buf.put_u16_le(self.lid);
        buf.put_slice(&self.gid);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> anyhow::Result<ConnectionData> {
        anyhow::ensure!(
            buf.len() == Self::ENCODED_LEN,
            "connection record must be {} bytes, got {}",
            Self::ENCODED_LEN,
            buf.len()
        );
        let addr = buf.get_u64_le();
        let rkey = buf.get_u32_le();
        let qp_num = buf.get_u32_le();
        let lid = buf.get_u16_le();
        let mut gid = [0u8; 16];
        buf.copy_to_slice(&mut gid);
        Ok(ConnectionData {
            addr,
            rkey,
            qp_num,
            lid,
            gid,
        })
    }
}

/// Established bootstrap connections to every peer, indexed by rank.
pub struct Bootstrap {
    group: Group,
    streams: Vec<Option<Mutex<TcpStream>>>,
}

impl Bootstrap {
    /// Connect the full mesh. `addrs[rank]` is the bootstrap address of the
    /// member at that rank; the local node listens on its own entry.
    pub async fn establish(group: &Group, addrs: &[SocketAddr]) -> anyhow::Result<Bootstrap> {
        anyhow::ensure!(
            addrs.len() == group.num_members(),
            "expected {} bootstrap addresses, got {}",
            group.num_members(),
            addrs.len()
        );
        let me = group.my_rank();
        let mut streams: Vec<Option<Mutex<TcpStream>>> =
            (0..group.num_members()).map(|_| None).collect();

        // Peers with a greater rank act as servers; call them highest first.
        for rank in group.peers_by_descending_rank() {
            if rank <= me {
                continue;
            }
            let mut stream = connect_with_retry(addrs[rank]).await;
            let peer_rank = exchange_rank(&mut stream, me)
                .await
                .with_context(|| format!("bootstrap handshake with rank {rank}"))?;
            anyhow::ensure!(
                peer_rank == rank,
                "connected to rank {peer_rank} at {} but expected rank {rank}",
                addrs[rank]
            );
            tracing::debug!(peer = rank, "bootstrap connection established");
            streams[rank] = Some(Mutex::new(stream));
        }

        // Accept one connection from every peer with a lesser rank. The
        // caller is identified by the rank it sends, not by the accept
        // order.
        if me > 0 {
            let listener = TcpListener::bind(addrs[me])
                .await
                .with_context(|| format!("bind bootstrap listener on {}", addrs[me]))?;
            for _ in 0..me {
                let (mut stream, _) = listener
                    .accept()
                    .await
                    .context("accept bootstrap connection")?;
                let peer_rank = exchange_rank(&mut stream, me)
                    .await
                    .context("bootstrap handshake with an inbound peer")?;
                anyhow::ensure!(
                    peer_rank < me,
                    "unexpected bootstrap connection from rank {peer_rank}"
                );
                anyhow::ensure!(
                    streams[peer_rank].is_none(),
                    "duplicate bootstrap connection from rank {peer_rank}"
                );
                tracing::debug!(peer = peer_rank, "bootstrap connection accepted");
                streams[peer_rank] = Some(Mutex::new(stream));
            }
        }

        Ok(Bootstrap {
            group: group.clone(),
            streams,
        })
    }

    /// Send our record, read the peer's. Both sides write first, so the
    /// exchange cannot deadlock.
    pub async fn exchange_connection_data(
        &self,
        peer_rank: usize,
        local: ConnectionData,
    ) -> anyhow::Result<ConnectionData> {
        let mut stream = self.stream(peer_rank)?.lock().await;
        stream
            .write_all(&local.encode())
            .await
            .context("send connection record")?;
        let mut buf = [0u8; ConnectionData::ENCODED_LEN];
        stream
            .read_exact(&mut buf)
            .await
            .context("read connection record")?;
        ConnectionData::decode(&buf)
    }

    /// One-byte barrier: returns only when the peer has reached its matching
    /// `sync` call. Blocks without timeout.
    pub async fn sync(&self, peer_rank: usize) -> anyhow::Result<()> {
        let mut stream = self.stream(peer_rank)?.lock().await;
        stream.write_all(&[b'Q']).await.context("send barrier byte")?;
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .context("read barrier byte")?;
        Ok(())
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    fn stream(&self, rank: usize) -> anyhow::Result<&Mutex<TcpStream>> {
        self.streams
            .get(rank)
            .and_then(|s| s.as_ref())
            .with_context(|| format!("no bootstrap connection to rank {rank}"))
    }
}

/// Peers come up in arbitrary order; keep knocking until the listener is
/// there.
async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return stream;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

/// Exchange ASCII decimal node ranks in a fixed-width, NUL-padded field.
pub(crate) async fn exchange_rank(stream: &mut TcpStream, my_rank: usize) -> anyhow::Result<usize> {
    let text = my_rank.to_string();
    anyhow::ensure!(
        text.len() <= RANK_FIELD_LEN,
        "rank {my_rank} does not fit the {RANK_FIELD_LEN}-byte rank field"
    );
    let mut field = [0u8; RANK_FIELD_LEN];
    field[..text.len()].copy_from_slice(text.as_bytes());
    stream.write_all(&field).await.context("send rank")?;

    let mut incoming = [0u8; RANK_FIELD_LEN];
    stream.read_exact(&mut incoming).await.context("read rank")?;
    let end = incoming
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(RANK_FIELD_LEN);
    std::str::from_utf8(&incoming[..end])
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .context("peer sent a malformed rank")
}
