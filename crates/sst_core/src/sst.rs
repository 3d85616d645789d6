//! The shared state table façade.
//!
//! One `Sst` per node: a contiguous array of internal rows, one per group
//! member, where only the local row is writable and every other row is a
//! mirror kept current by one-sided operations. Construction wires the
//! derived-column registry into the layout, opens per-peer transport
//! adapters, and spawns the background workers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::future::try_join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::combinators::{ColumnSet, DerivedColumns, NameEnum, TableView};
use crate::config::{Group, Mode, SstConfig};
use crate::engine::{EngineChannels, Observer};
use crate::error::SstError;
use crate::layout::RowLayout;
use crate::predicates::Predicates;
use crate::row::{Row, Scalar, SlotValue};
use crate::table::TableBuffer;
use crate::transport::{PeerResources, Transport};

/// Table lifetime states, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Phase {
    /// Transport adapters and layout are set up.
    Configured = 0,
    /// `sync_with_members` has returned.
    Connected = 1,
    /// The observer is executing passes.
    Running = 2,
    /// Shutdown flag is set; workers are exiting.
    Draining = 3,
    /// Workers have quiesced.
    Destroyed = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Configured,
            1 => Phase::Connected,
            2 => Phase::Running,
            3 => Phase::Draining,
            _ => Phase::Destroyed,
        }
    }
}

/// A single node's view of one shared state table.
pub struct Sst<R: Row> {
    group: Group,
    mode: Mode,
    table: Arc<TableBuffer>,
    /// Per-peer adapters, indexed by rank; `None` at the local rank.
    peers: Vec<Option<Box<dyn PeerResources>>>,
    transport: Arc<dyn Transport>,
    columns: Arc<DerivedColumns<R>>,
    predicates: Predicates<R>,
    phase: AtomicU8,
    shutdown_tx: watch::Sender<bool>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl<R: Row> Sst<R> {
    /// Build a table, open transport adapters for every peer, and spawn the
    /// background workers.
    pub async fn new<N: NameEnum>(
        config: SstConfig,
        columns: ColumnSet<R, N>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Sst<R>>, SstError> {
        let columns = Arc::new(columns.finish()?);
        let layout = RowLayout::new(std::mem::size_of::<R>(), &columns.slot_types);
        let table = Arc::new(TableBuffer::new(layout, config.group.num_members()));

        let peers = transport.open_peers(table.clone(), &config.group).await?;
        if peers.len() != config.group.num_members()
            || peers[config.group.my_rank()].is_some()
            || peers.iter().filter(|p| p.is_none()).count() != 1
        {
            return Err(SstError::Config(
                "transport returned a malformed adapter set".into(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        #[cfg(feature = "evolving")]
        let (evolving_tx, evolving_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let sst = Arc::new(Sst {
            group: config.group,
            mode: config.mode,
            table,
            peers,
            transport,
            columns,
            predicates: Predicates {
                tx,
                #[cfg(feature = "evolving")]
                evolving_tx,
            },
            phase: AtomicU8::new(Phase::Configured as u8),
            shutdown_tx,
            workers: StdMutex::new(Vec::new()),
        });

        let channels = EngineChannels {
            rx,
            #[cfg(feature = "evolving")]
            evolving_rx,
        };
        let observer = Observer::new(Arc::downgrade(&sst), channels);
        let mut workers = vec![tokio::spawn(observer.run(shutdown_rx.clone()))];
        if sst.mode == Mode::Reads {
            workers.push(tokio::spawn(crate::engine::run_reader(
                Arc::downgrade(&sst),
                shutdown_rx,
            )));
        }
        *sst.workers.lock().unwrap() = workers;

        tracing::info!(
            rank = sst.group.my_rank(),
            members = sst.group.num_members(),
            mode = ?sst.mode,
            "initialized shared state table and started workers"
        );
        Ok(sst)
    }

    pub fn num_rows(&self) -> usize {
        self.group.num_members()
    }

    /// Index of the local row.
    pub fn local_index(&self) -> usize {
        self.group.my_rank()
    }

    pub fn group(&self) -> &Group {
        &self.group
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Byte layout of one internal row.
    ///
    /// Offsets taken from here (or from `offset_of!` on the row type) are
    /// valid on every node, which is what makes `put_range` safe to call
    /// with them.
    pub fn layout(&self) -> &RowLayout {
        self.table.layout()
    }

    /// Copy of the user fields of row `index`.
    ///
    /// Mirror rows are written by the transport while this runs; the copy
    /// may be torn between fields. Use [`Sst::snapshot`] when several rows
    /// must be read consistently.
    pub fn read_row(&self, index: usize) -> R {
        assert!(index < self.num_rows(), "row index {index} out of range");
        self.table.read_user_row(index)
    }

    /// Mutate the user fields of the local row. The change is visible to the
    /// local observer immediately and to peers after the next `put` (Writes
    /// mode) or their next refresh (Reads mode).
    pub fn with_local_row(&self, f: impl FnOnce(&mut R)) {
        let me = self.local_index();
        let mut row = self.table.read_user_row::<R>(me);
        f(&mut row);
        self.table.write_user_row(me, &row);
    }

    /// Registration handle for detection predicates.
    pub fn predicates(&self) -> &Predicates<R> {
        &self.predicates
    }

    /// Write the whole local internal row to every peer and wait for all
    /// transfers to be acknowledged.
    pub async fn put(&self) -> Result<(), SstError> {
        let len = self.table.layout().content_len();
        self.put_range(0, len).await
    }

    /// Write `[offset, offset+len)` of the local internal row to every peer.
    ///
    /// Offsets come from the row layout and are identical on all nodes. In
    /// Reads mode this is a no-op; peers observe the local row through their
    /// reader loops instead.
    pub async fn put_range(&self, offset: usize, len: usize) -> Result<(), SstError> {
        if self.mode == Mode::Reads {
            return Ok(());
        }
        if self.phase() >= Phase::Draining {
            return Err(SstError::ShuttingDown);
        }
        if len == 0 {
            return Ok(());
        }
        let content = self.table.layout().content_len();
        assert!(
            offset + len <= content,
            "put range [{offset}, {}) outside the internal row ({content} bytes)",
            offset + len
        );
        for peer in self.peers.iter().flatten() {
            peer.post_remote_write(offset, len).await?;
        }
        try_join_all(self.peers.iter().flatten().map(|p| p.poll_completion())).await?;
        Ok(())
    }

    /// One-byte barrier with every peer, in descending rank order.
    /// Returns once each peer has reached its matching call.
    pub async fn sync_with_members(&self) -> Result<(), SstError> {
        for rank in self.group.peers_by_descending_rank() {
            self.transport.sync(rank).await?;
        }
        self.advance_phase(Phase::Connected);
        Ok(())
    }

    /// Immutable deep copy of the whole table.
    pub fn snapshot(&self) -> Snapshot<R> {
        Snapshot {
            bytes: self.table.snapshot_bytes(),
            layout: self.table.layout().clone(),
            num_rows: self.num_rows(),
            columns: self.columns.clone(),
        }
    }

    /// Apply the getter registered under `name` to row `index`.
    ///
    /// Panics when `name` was not registered or `V` does not match the
    /// registered value type; see [`ColumnSet`] for the registration rules.
    pub fn call_named<V: Scalar, N: NameEnum>(&self, name: N, index: usize) -> V {
        assert!(index < self.num_rows(), "row index {index} out of range");
        let row = self.read_row(index);
        let slots = self.read_slots(index);
        self.columns.call(name, &row, &slots)
    }

    /// Set the shutdown flag, wait for the workers to quiesce, and release
    /// the table's transport adapters.
    pub async fn shutdown(&self) {
        self.advance_phase(Phase::Draining);
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
        self.advance_phase(Phase::Destroyed);
        tracing::info!(rank = self.group.my_rank(), "shared state table drained");
    }

    fn advance_phase(&self, phase: Phase) {
        self.phase.fetch_max(phase as u8, Ordering::SeqCst);
    }

    /// Called by the observer; the table counts as running once passes
    /// execute after the group barrier.
    pub(crate) fn mark_running(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Connected as u8,
            Phase::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn table(&self) -> &TableBuffer {
        &self.table
    }

    pub(crate) fn columns(&self) -> &DerivedColumns<R> {
        &self.columns
    }

    fn read_slots(&self, index: usize) -> Vec<SlotValue> {
        (0..self.columns.num_slots())
            .map(|slot| self.table.read_slot(index, slot))
            .collect()
    }

    /// Copy of every row (user fields plus decoded slots) for one updater
    /// pass.
    pub(crate) fn materialize_view(&self) -> TableView<R> {
        let n = self.num_rows();
        let rows = (0..n).map(|i| self.table.read_user_row::<R>(i)).collect();
        let slots = (0..n).map(|i| self.read_slots(i)).collect();
        TableView::new(rows, slots, self.local_index())
    }

    /// Push the extension region of the local row to every peer.
    pub(crate) async fn put_extensions(&self) -> Result<(), SstError> {
        let layout = self.table.layout();
        self.put_range(layout.extension_offset(), layout.extension_len())
            .await
    }

    /// Pull every peer row into the local mirrors once (Reads mode).
    pub(crate) async fn refresh_table(&self) -> Result<(), SstError> {
        if self.phase() >= Phase::Draining {
            return Err(SstError::ShuttingDown);
        }
        let len = self.table.layout().content_len();
        if len == 0 {
            return Ok(());
        }
        for peer in self.peers.iter().flatten() {
            peer.post_remote_read(0, len).await?;
        }
        try_join_all(self.peers.iter().flatten().map(|p| p.poll_completion())).await?;
        Ok(())
    }
}

impl<R: Row> std::fmt::Debug for Sst<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sst")
            .field("rank", &self.group.my_rank())
            .field("members", &self.group.num_members())
            .field("mode", &self.mode)
            .field("phase", &self.phase())
            .finish()
    }
}

impl<R: Row> Drop for Sst<R> {
    fn drop(&mut self) {
        self.advance_phase(Phase::Draining);
        let _ = self.shutdown_tx.send(true);
        // Workers hold only weak handles, so this runs as soon as the last
        // user handle goes away; abort anything still parked on the NIC.
        for worker in self.workers.lock().unwrap().drain(..) {
            worker.abort();
        }
    }
}

/// Passed to triggers when their predicate fires.
///
/// Derefs to the table for reads, local-row mutation, snapshots, and further
/// predicate registration. Puts requested here are queued and performed by
/// the engine immediately after the trigger returns; nothing else in the
/// pass runs in between.
pub struct TriggerHandle<'a, R: Row> {
    sst: &'a Sst<R>,
    queued_puts: Vec<(usize, usize)>,
}

impl<'a, R: Row> TriggerHandle<'a, R> {
    pub(crate) fn new(sst: &'a Sst<R>) -> TriggerHandle<'a, R> {
        TriggerHandle {
            sst,
            queued_puts: Vec::new(),
        }
    }

    /// Queue a put of the whole internal row.
    pub fn put(&mut self) {
        let len = self.sst.table.layout().content_len();
        self.queued_puts.push((0, len));
    }

    /// Queue a put of `[offset, offset+len)` of the internal row.
    pub fn put_range(&mut self, offset: usize, len: usize) {
        self.queued_puts.push((offset, len));
    }

    pub(crate) fn take_queued_puts(&mut self) -> Vec<(usize, usize)> {
        std::mem::take(&mut self.queued_puts)
    }
}

impl<'a, R: Row> std::ops::Deref for TriggerHandle<'a, R> {
    type Target = Sst<R>;

    fn deref(&self) -> &Sst<R> {
        self.sst
    }
}

/// An immutable, detached deep copy of the table at one moment in time.
pub struct Snapshot<R: Row> {
    bytes: Box<[u8]>,
    layout: RowLayout,
    num_rows: usize,
    columns: Arc<DerivedColumns<R>>,
}

impl<R: Row> Snapshot<R> {
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn user_row(&self, index: usize) -> R {
        assert!(index < self.num_rows, "row index {index} out of range");
        let offset = self.layout.row_offset(index);
        bytemuck::pod_read_unaligned(&self.bytes[offset..offset + std::mem::size_of::<R>()])
    }

    pub fn slot(&self, index: usize, slot: usize) -> SlotValue {
        assert!(index < self.num_rows, "row index {index} out of range");
        let desc = self.layout.slot(slot);
        let offset = self.layout.row_offset(index) + desc.offset;
        SlotValue::decode(desc.slot_type, &self.bytes[offset..offset + desc.slot_type.size()])
    }

    /// Apply the getter registered under `name` to row `index` of the
    /// snapshot.
    pub fn call_named<V: Scalar, N: NameEnum>(&self, name: N, index: usize) -> V {
        let row = self.user_row(index);
        let slots: Vec<SlotValue> = (0..self.layout.num_slots())
            .map(|slot| self.slot(index, slot))
            .collect();
        self.columns.call(name, &row, &slots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinators::{as_row_pred, e, named};
    use crate::predicates::PredicateKind;
    use crate::transport::{LocalHub, LocalTransport};
    use bytemuck::{Pod, Zeroable};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Counter {
        value: i64,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    enum Name {
        Positive,
    }

    impl NameEnum for Name {
        fn index(self) -> usize {
            self as usize
        }
    }

    async fn single_node(columns: ColumnSet<Counter, Name>) -> Arc<Sst<Counter>> {
        let hub = LocalHub::new();
        let group = Group::new(vec![0], 0).unwrap();
        let transport = LocalTransport::new(hub, 0);
        Sst::new(SstConfig::new(group), columns, transport)
            .await
            .unwrap()
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        false
    }

    /// Count observer passes through a recurrent always-true predicate.
    fn install_pass_counter(sst: &Sst<Counter>) -> Arc<AtomicUsize> {
        let passes = Arc::new(AtomicUsize::new(0));
        let counter = passes.clone();
        sst.predicates().insert(
            |_| true,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::Recurrent,
        );
        passes
    }

    async fn settle_passes(passes: &Arc<AtomicUsize>, n: usize) {
        let target = passes.load(Ordering::SeqCst) + n;
        assert!(wait_for(|| passes.load(Ordering::SeqCst) >= target).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_time_predicates_fire_exactly_once() {
        let sst = single_node(ColumnSet::new()).await;
        let passes = install_pass_counter(&sst);

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        sst.predicates().insert(
            |s| s.read_row(0).value >= 1,
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::OneTime,
        );

        sst.with_local_row(|r| r.value = 1);
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1).await);

        // The predicate stays true; several more passes must not re-fire it.
        settle_passes(&passes, 5).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transition_predicates_fire_once_per_rising_edge() {
        let sst = single_node(ColumnSet::new()).await;
        let passes = install_pass_counter(&sst);

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        sst.predicates().insert(
            |s| s.read_row(0).value % 2 == 1,
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
            PredicateKind::Transition,
        );

        sst.with_local_row(|r| r.value = 1);
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1).await);

        // Hold the predicate true across several passes: no extra firings.
        settle_passes(&passes, 5).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Drop to false and make sure the observer saw it before rising.
        sst.with_local_row(|r| r.value = 2);
        settle_passes(&passes, 3).await;
        sst.with_local_row(|r| r.value = 3);
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 2).await);

        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_panicking_trigger_does_not_kill_the_observer() {
        let sst = single_node(ColumnSet::new()).await;

        sst.predicates().insert(
            |_| true,
            |_| panic!("boom"),
            PredicateKind::OneTime,
        );
        // The panicking one-time entry is consumed; the observer keeps
        // running and serves later registrations.
        let passes = install_pass_counter(&sst);
        settle_passes(&passes, 3).await;

        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn named_columns_are_kept_current_by_the_engine() {
        let columns = ColumnSet::new().column(named(
            Name::Positive,
            e(as_row_pred(|r: &Counter| r.value > 0)),
        ));
        let sst = single_node(columns).await;

        assert!(!sst.call_named::<bool, _>(Name::Positive, 0));
        sst.with_local_row(|r| r.value = 5);
        assert!(wait_for(|| sst.call_named::<bool, _>(Name::Positive, 0)).await);

        // The snapshot carries the derived value along.
        let snap = sst.snapshot();
        assert!(snap.call_named::<bool, Name>(Name::Positive, 0));

        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_trigger_of_a_predicate_fires_in_order() {
        let sst = single_node(ColumnSet::new()).await;

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        sst.predicates().insert_with_triggers(
            Box::new(|s: &Sst<Counter>| s.read_row(0).value == 1),
            vec![
                Box::new(move |_: &mut TriggerHandle<'_, Counter>| {
                    first.lock().unwrap().push("first");
                }),
                Box::new(move |_: &mut TriggerHandle<'_, Counter>| {
                    second.lock().unwrap().push("second");
                }),
            ],
            PredicateKind::OneTime,
        );

        sst.with_local_row(|r| r.value = 1);
        assert!(wait_for(|| order.lock().unwrap().len() == 2).await);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshots_are_detached() {
        let sst = single_node(ColumnSet::new()).await;
        sst.with_local_row(|r| r.value = 7);
        let snap = sst.snapshot();
        sst.with_local_row(|r| r.value = 99);
        assert_eq!(snap.user_row(0).value, 7);
        assert_eq!(sst.read_row(0).value, 99);
        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn lifecycle_runs_in_order() {
        let sst = single_node(ColumnSet::new()).await;
        assert!(sst.phase() <= Phase::Connected);
        sst.sync_with_members().await.unwrap();
        assert!(wait_for(|| sst.phase() == Phase::Running).await);

        sst.shutdown().await;
        assert_eq!(sst.phase(), Phase::Destroyed);
        assert!(matches!(sst.put().await, Err(SstError::ShuttingDown)));
    }

    #[cfg(feature = "evolving")]
    #[tokio::test(flavor = "multi_thread")]
    async fn evolving_predicates_are_rederived_each_pass() {
        let sst = single_node(ColumnSet::new()).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        sst.predicates().insert_evolving(
            Box::new(|_s, generation| {
                // The definition changes with the generation; it only starts
                // holding from the third derivation on.
                Box::new(move |_| generation >= 2)
            }),
            move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert!(wait_for(|| fired.load(Ordering::SeqCst) >= 1).await);
        sst.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn triggers_can_register_predicates() {
        let sst = single_node(ColumnSet::new()).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        sst.predicates().insert(
            |s| s.read_row(0).value == 1,
            move |handle| {
                let count = count.clone();
                handle.predicates().insert(
                    |s| s.read_row(0).value == 2,
                    move |_| {
                        count.fetch_add(1, Ordering::SeqCst);
                    },
                    PredicateKind::OneTime,
                );
            },
            PredicateKind::OneTime,
        );

        sst.with_local_row(|r| r.value = 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        sst.with_local_row(|r| r.value = 2);
        assert!(wait_for(|| fired.load(Ordering::SeqCst) == 1).await);

        sst.shutdown().await;
    }
}
