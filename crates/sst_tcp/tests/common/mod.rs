//! Shared helpers for integration tests: spin up an in-process group of
//! nodes over loopback TCP and wait for conditions with a bounded deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sst_core::{ColumnSet, Group, Mode, NameEnum, Row, Sst, SstConfig, Transport};
use sst_tcp::TcpTransport;

/// Upper bound for every wait in the suite.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Placeholder name enumeration for tables without derived columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoName {}

impl NameEnum for NoName {
    fn index(self) -> usize {
        match self {}
    }
}

/// Pick one free loopback address per node by binding throwaway listeners.
pub fn pick_addrs(n: usize) -> Vec<SocketAddr> {
    (0..n)
        .map(|_| {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
            listener.local_addr().expect("probe listener addr")
        })
        .collect()
}

/// Start `n` nodes (ids `0..n`, rank == id) in this process, each with its
/// own transport, and run the group barrier before returning.
pub async fn spawn_group<R, N, F>(n: usize, mode: Mode, make_columns: F) -> Vec<Arc<Sst<R>>>
where
    R: Row,
    N: NameEnum,
    F: Fn(usize) -> ColumnSet<R, N> + Clone + Send + 'static,
{
    spawn_group_with_ids((0..n as u64).collect(), mode, make_columns).await
}

/// Like [`spawn_group`], but with an explicit member-id list, so tests can
/// use ids that disagree with rank order. The result is indexed by rank.
pub async fn spawn_group_with_ids<R, N, F>(
    members: Vec<u64>,
    mode: Mode,
    make_columns: F,
) -> Vec<Arc<Sst<R>>>
where
    R: Row,
    N: NameEnum,
    F: Fn(usize) -> ColumnSet<R, N> + Clone + Send + 'static,
{
    let n = members.len();
    let addrs = pick_addrs(n);

    let mut startups = Vec::new();
    for rank in 0..n {
        let my_id = members[rank];
        let members = members.clone();
        let addrs = addrs.clone();
        let make_columns = make_columns.clone();
        startups.push(tokio::spawn(async move {
            let group = Group::new(members, my_id).expect("group config");
            let transport: Arc<dyn Transport> = TcpTransport::establish(&group, &addrs)
                .await
                .expect("establish transport");
            let config = SstConfig::new(group).with_mode(mode);
            Sst::new(config, make_columns(rank), transport)
                .await
                .expect("construct table")
        }));
    }
    let mut nodes = Vec::new();
    for startup in startups {
        nodes.push(startup.await.expect("node startup"));
    }

    let mut barriers = Vec::new();
    for sst in &nodes {
        let sst = sst.clone();
        barriers.push(tokio::spawn(async move { sst.sync_with_members().await }));
    }
    for barrier in barriers {
        barrier.await.expect("barrier task").expect("group barrier");
    }
    nodes
}

/// Poll `cond` until it holds or [`SETTLE_TIMEOUT`] passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Drain every node's workers.
pub async fn shutdown_all<R: Row>(nodes: Vec<Arc<Sst<R>>>) {
    for sst in &nodes {
        sst.shutdown().await;
    }
}
