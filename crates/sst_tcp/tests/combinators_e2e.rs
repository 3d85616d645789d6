//! Derived columns across a real group: the universal quantifier over a
//! heartbeat counter and the minimum reduction.

mod common;

use bytemuck::{Pod, Zeroable};
use sst_core::{as_row_pred, e, min_of, named, ColumnSet, Mode, NameEnum};

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct SeqRow {
    seq: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SeqName {
    AllCaughtUp,
}

impl NameEnum for SeqName {
    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct TsRow {
    ts: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TsName {
    Earliest,
}

impl NameEnum for TsName {
    fn index(self) -> usize {
        self as usize
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn all_caught_up_turns_true_only_after_everyone_reaches_ten() {
    let nodes = common::spawn_group::<SeqRow, SeqName, _>(3, Mode::Writes, |_| {
        ColumnSet::new().column(named(
            SeqName::AllCaughtUp,
            e(as_row_pred(|r: &SeqRow| r.seq >= 10)),
        ))
    })
    .await;

    // First half of the heartbeats. Every node's own row is below ten, so
    // the universal predicate cannot hold anywhere, no matter how mirrors
    // race.
    for sst in &nodes {
        for _ in 0..5 {
            sst.with_local_row(|r| r.seq += 1);
            sst.put().await.unwrap();
        }
    }
    for sst in &nodes {
        assert!(!sst.call_named::<bool, _>(SeqName::AllCaughtUp, sst.local_index()));
    }

    // Second half; now the column must converge to true on every node.
    for sst in &nodes {
        for _ in 0..5 {
            sst.with_local_row(|r| r.seq += 1);
            sst.put().await.unwrap();
        }
    }
    assert!(common::wait_until(|| {
        nodes
            .iter()
            .all(|sst| sst.call_named::<bool, _>(SeqName::AllCaughtUp, sst.local_index()))
    })
    .await);

    common::shutdown_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn every_node_computes_the_same_layout() {
    let nodes = common::spawn_group::<SeqRow, SeqName, _>(3, Mode::Writes, |_| {
        ColumnSet::new().column(named(
            SeqName::AllCaughtUp,
            e(as_row_pred(|r: &SeqRow| r.seq >= 10)),
        ))
    })
    .await;

    let reference = nodes[0].layout().clone();
    for sst in &nodes[1..] {
        assert_eq!(sst.layout(), &reference);
        for slot in 0..reference.num_slots() {
            assert_eq!(sst.layout().slot(slot).offset, reference.slot(slot).offset);
        }
    }

    common::shutdown_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_mode_keeps_derived_columns_flowing() {
    let nodes = common::spawn_group::<SeqRow, SeqName, _>(2, Mode::Reads, |_| {
        ColumnSet::new().column(named(
            SeqName::AllCaughtUp,
            e(as_row_pred(|r: &SeqRow| r.seq >= 1)),
        ))
    })
    .await;

    // No put anywhere: reader loops move both the user fields and the
    // extension slots.
    for sst in &nodes {
        sst.with_local_row(|r| r.seq = 1);
    }
    assert!(common::wait_until(|| {
        nodes
            .iter()
            .all(|sst| sst.call_named::<bool, _>(SeqName::AllCaughtUp, sst.local_index()))
    })
    .await);

    common::shutdown_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn earliest_reduces_to_the_table_minimum() {
    let nodes = common::spawn_group::<TsRow, TsName, _>(3, Mode::Writes, |_| {
        ColumnSet::new().column(named(TsName::Earliest, min_of(as_row_pred(|r: &TsRow| r.ts))))
    })
    .await;

    for (rank, sst) in nodes.iter().enumerate() {
        sst.with_local_row(|r| r.ts = 100 + 10 * rank as i64);
        sst.put().await.unwrap();
    }

    // Once every write has landed everywhere, the reduction settles at the
    // smallest timestamp in the table.
    assert!(common::wait_until(|| {
        nodes
            .iter()
            .all(|sst| sst.call_named::<i64, _>(TsName::Earliest, sst.local_index()) == 100)
    })
    .await);

    // And it agrees with a direct fold over a snapshot.
    let snapshot = nodes[1].snapshot();
    let direct = (0..snapshot.num_rows())
        .map(|row| snapshot.user_row(row).ts)
        .min()
        .unwrap();
    assert_eq!(snapshot.call_named::<i64, TsName>(TsName::Earliest, 1), direct);

    common::shutdown_all(nodes).await;
}
