//! TCP stand-in for the one-sided transport.
//!
//! Each peer pair shares one data connection (the "queue pair" of this
//! transport). A posted write ships the addressed bytes of the local row;
//! the receiving side's service task lands them in its mirror of the
//! sender's row and acknowledges, which surfaces as a completion at the
//! initiator. A posted read asks the peer's service task for a range of the
//! peer's own row and applies the response locally. The table's CPU-side
//! code never runs on behalf of a remote operation; only the service task
//! does, which is as close to "no remote CPU involvement" as a socket
//! transport gets.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use sst_core::{Group, PeerResources, SstError, TableBuffer, Transport};

use crate::bootstrap::{exchange_rank, Bootstrap, ConnectionData};
use crate::frame::Frame;

/// A [`Transport`] backed by plain TCP connections.
///
/// One instance serves one table: the data listener is consumed when the
/// table attaches. The bootstrap mesh must be established before any table
/// construction, so every node is reachable by the time adapters connect.
pub struct TcpTransport {
    bootstrap: Bootstrap,
    addrs: Vec<SocketAddr>,
    data_listener: StdMutex<Option<TcpListener>>,
    data_port: u16,
}

impl TcpTransport {
    pub async fn establish(group: &Group, addrs: &[SocketAddr]) -> anyhow::Result<Arc<TcpTransport>> {
        let bootstrap = Bootstrap::establish(group, addrs).await?;
        let bind_ip = addrs[group.my_rank()].ip();
        let listener = TcpListener::bind((bind_ip, 0))
            .await
            .map_err(|err| anyhow::anyhow!("bind data listener on {bind_ip}: {err}"))?;
        let data_port = listener.local_addr()?.port();
        tracing::debug!(rank = group.my_rank(), data_port, "transport listening");
        Ok(Arc::new(TcpTransport {
            bootstrap,
            addrs: addrs.to_vec(),
            data_listener: StdMutex::new(Some(listener)),
            data_port,
        }))
    }

    /// The record advertised to peers during setup.
    fn local_record(&self, group: &Group) -> ConnectionData {
        ConnectionData {
            addr: 0,
            rkey: 0,
            qp_num: u32::from(self.data_port),
            lid: 0,
            gid: gid_of(self.addrs[group.my_rank()].ip()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open_peers(
        &self,
        table: Arc<TableBuffer>,
        group: &Group,
    ) -> Result<Vec<Option<Box<dyn PeerResources>>>, SstError> {
        let listener = self
            .data_listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SstError::Config("transport is already attached to a table".into()))?;
        let me = group.my_rank();

        // Exchange connection records with every peer, descending by rank.
        let mut records: Vec<Option<ConnectionData>> = vec![None; group.num_members()];
        for rank in group.peers_by_descending_rank() {
            let record = self
                .bootstrap
                .exchange_connection_data(rank, self.local_record(group))
                .await
                .map_err(|err| SstError::Bootstrap(err.to_string()))?;
            records[rank] = Some(record);
        }

        // Data connections follow the bootstrap pattern: dial peers with a
        // greater rank, accept the rest, and identify each by the rank it
        // sends.
        let mut sockets: Vec<Option<TcpStream>> = (0..group.num_members()).map(|_| None).collect();
        for rank in group.peers_by_descending_rank() {
            if rank <= me {
                continue;
            }
            let record = records[rank].expect("record exchanged above");
            let port = u16::try_from(record.qp_num)
                .map_err(|_| SstError::fatal(format!("peer rank {rank} advertised port {}", record.qp_num)))?;
            let addr = SocketAddr::new(self.addrs[rank].ip(), port);
            let mut stream = connect_data(addr).await?;
            let peer_rank = exchange_rank(&mut stream, me)
                .await
                .map_err(SstError::fatal)?;
            if peer_rank != rank {
                return Err(SstError::fatal(format!(
                    "data connection to {addr} answered as rank {peer_rank}"
                )));
            }
            sockets[rank] = Some(stream);
        }
        for _ in 0..me {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|err| SstError::fatal(format!("accept data connection: {err}")))?;
            stream.set_nodelay(true).ok();
            let peer_rank = exchange_rank(&mut stream, me)
                .await
                .map_err(SstError::fatal)?;
            if peer_rank >= me || sockets[peer_rank].is_some() {
                return Err(SstError::fatal(format!(
                    "unexpected data connection from rank {peer_rank}"
                )));
            }
            sockets[peer_rank] = Some(stream);
        }

        let mut peers: Vec<Option<Box<dyn PeerResources>>> = Vec::with_capacity(group.num_members());
        for (rank, socket) in sockets.into_iter().enumerate() {
            if rank == me {
                peers.push(None);
                continue;
            }
            let socket = socket.ok_or_else(|| {
                SstError::fatal(format!("no data connection to rank {rank} after setup"))
            })?;
            let (reader, writer) = socket.into_split();
            let writer = Arc::new(Mutex::new(writer));
            let (completion_tx, completion_rx) = unbounded_channel();
            let service = tokio::spawn(serve(
                reader,
                writer.clone(),
                table.clone(),
                me,
                rank,
                completion_tx,
            ));
            peers.push(Some(Box::new(TcpPeer {
                me,
                table: table.clone(),
                writer,
                completions: Mutex::new(completion_rx),
                next_op: AtomicU64::new(1),
                service,
            })));
        }
        Ok(peers)
    }

    async fn sync(&self, peer_rank: usize) -> Result<(), SstError> {
        self.bootstrap
            .sync(peer_rank)
            .await
            .map_err(|err| SstError::Bootstrap(err.to_string()))
    }
}

async fn connect_data(addr: SocketAddr) -> Result<TcpStream, SstError> {
    // The peer's listener is bound before table construction, but give it a
    // bounded grace period anyway.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                return Ok(stream);
            }
            Err(err) if tokio::time::Instant::now() >= deadline => {
                return Err(SstError::fatal(format!("connect data channel {addr}: {err}")));
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
}

/// The receive loop of one data connection; plays the role of the NIC for
/// inbound one-sided operations.
async fn serve(
    mut reader: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    table: Arc<TableBuffer>,
    me: usize,
    peer: usize,
    completions: UnboundedSender<()>,
) {
    let content = table.layout().content_len();
    loop {
        let frame = match Frame::read_from(&mut reader).await {
            Ok(frame) => frame,
            // Closed connection: the peer is shutting down.
            Err(_) => break,
        };
        match frame {
            Frame::Write { op, offset, payload } => {
                let offset = offset as usize;
                if offset + payload.len() > content {
                    tracing::warn!(peer, "inbound write outside the row; dropping connection");
                    break;
                }
                table.write_range(table.row_offset(peer) + offset, &payload);
                if send(&writer, Frame::WriteAck { op }).await.is_err() {
                    break;
                }
            }
            Frame::ReadReq { op, offset, len } => {
                let offset = offset as usize;
                let len = len as usize;
                if offset + len > content {
                    tracing::warn!(peer, "inbound read outside the row; dropping connection");
                    break;
                }
                let payload = table.read_range(table.row_offset(me) + offset, len);
                let resp = Frame::ReadResp {
                    op,
                    offset: offset as u32,
                    payload: payload.into(),
                };
                if send(&writer, resp).await.is_err() {
                    break;
                }
            }
            Frame::WriteAck { .. } => {
                let _ = completions.send(());
            }
            Frame::ReadResp { offset, payload, .. } => {
                let offset = offset as usize;
                if offset + payload.len() <= content {
                    table.write_range(table.row_offset(peer) + offset, &payload);
                }
                let _ = completions.send(());
            }
        }
    }
    tracing::debug!(peer, "transport service task exiting");
}

async fn send(writer: &Arc<Mutex<OwnedWriteHalf>>, frame: Frame) -> std::io::Result<()> {
    frame.write_to(&mut *writer.lock().await).await
}

/// Per-peer adapter over one data connection.
struct TcpPeer {
    me: usize,
    table: Arc<TableBuffer>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    completions: Mutex<UnboundedReceiver<()>>,
    next_op: AtomicU64,
    service: JoinHandle<()>,
}

impl TcpPeer {
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
impl PeerResources for TcpPeer {
    async fn post_remote_write(&self, offset: usize, len: usize) -> Result<(), SstError> {
        self.check_span(offset, len);
        let payload = self
            .table
            .read_range(self.table.row_offset(self.me) + offset, len);
        let frame = Frame::Write {
            op: self.next_op.fetch_add(1, Ordering::Relaxed),
            offset: offset as u32,
            payload: payload.into(),
        };
        send(&self.writer, frame).await.map_err(SstError::fatal)
    }

    async fn post_remote_read(&self, offset: usize, len: usize) -> Result<(), SstError> {
        self.check_span(offset, len);
        let frame = Frame::ReadReq {
            op: self.next_op.fetch_add(1, Ordering::Relaxed),
            offset: offset as u32,
            len: len as u32,
        };
        send(&self.writer, frame).await.map_err(SstError::fatal)
    }

    async fn poll_completion(&self) -> Result<(), SstError> {
        self.completions
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| SstError::fatal("transport service task is gone"))
    }
}

impl Drop for TcpPeer {
    fn drop(&mut self) {
        self.service.abort();
    }
}

fn gid_of(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => {
            // v4-mapped form, the way a RoCE gid would carry it.
            let mut gid = [0u8; 16];
            gid[10] = 0xff;
            gid[11] = 0xff;
            gid[12..].copy_from_slice(&v4.octets());
            gid
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}
