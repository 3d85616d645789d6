//! Predicate registration for the detection engine.
//!
//! The observer task owns the actual predicate lists; registration from any
//! thread (including from inside a trigger) goes through an unbounded channel
//! that the observer drains at pass boundaries. That keeps registration
//! lock-free from the observer's point of view and makes re-entrant inserts
//! from triggers safe.

use tokio::sync::mpsc::UnboundedSender;

use crate::row::Row;
use crate::sst::{Sst, TriggerHandle};

/// The kinds of predicates the engine can handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PredicateKind {
    /// Evaluated until true once; removed before its triggers run.
    OneTime,
    /// Fires its triggers on every pass where it evaluates to true.
    Recurrent,
    /// Fires only when the evaluation transitions from false to true.
    Transition,
}

/// A boolean condition over the table.
pub type PredFn<R> = Box<dyn Fn(&Sst<R>) -> bool + Send + Sync>;

/// A callback run when its predicate fires.
pub type TriggerFn<R> = Box<dyn Fn(&mut TriggerHandle<'_, R>) + Send + Sync>;

pub(crate) struct PredicateEntry<R: Row> {
    pub(crate) pred: PredFn<R>,
    pub(crate) triggers: Vec<TriggerFn<R>>,
    pub(crate) kind: PredicateKind,
}

/// A predicate whose definition is re-derived from the table every pass.
#[cfg(feature = "evolving")]
pub type EvolverFn<R> = Box<dyn Fn(&Sst<R>, u64) -> PredFn<R> + Send + Sync>;

#[cfg(feature = "evolving")]
pub(crate) struct EvolvingEntry<R: Row> {
    pub(crate) evolve: EvolverFn<R>,
    pub(crate) triggers: Vec<TriggerFn<R>>,
    pub(crate) generation: u64,
}

/// Handle for registering predicates with a running table.
pub struct Predicates<R: Row> {
    pub(crate) tx: UnboundedSender<PredicateEntry<R>>,
    #[cfg(feature = "evolving")]
    pub(crate) evolving_tx: UnboundedSender<EvolvingEntry<R>>,
}

impl<R: Row> Clone for Predicates<R> {
    fn clone(&self) -> Self {
        Predicates {
            tx: self.tx.clone(),
            #[cfg(feature = "evolving")]
            evolving_tx: self.evolving_tx.clone(),
        }
    }
}

impl<R: Row> Predicates<R> {
    /// Register `pred` with a single trigger.
    pub fn insert<P, T>(&self, pred: P, trigger: T, kind: PredicateKind)
    where
        P: Fn(&Sst<R>) -> bool + Send + Sync + 'static,
        T: Fn(&mut TriggerHandle<'_, R>) + Send + Sync + 'static,
    {
        self.insert_with_triggers(Box::new(pred), vec![Box::new(trigger)], kind);
    }

    /// Register `pred` with an explicit trigger list.
    ///
    /// Inserts made after the table started draining are dropped silently;
    /// the observer is already gone.
    pub fn insert_with_triggers(&self, pred: PredFn<R>, triggers: Vec<TriggerFn<R>>, kind: PredicateKind) {
        let _ = self.tx.send(PredicateEntry {
            pred,
            triggers,
            kind,
        });
    }

    /// Register an evolving predicate: `evolve` is called with the current
    /// generation before every evaluation and yields the predicate to run.
    #[cfg(feature = "evolving")]
    pub fn insert_evolving<T>(&self, evolve: EvolverFn<R>, trigger: T)
    where
        T: Fn(&mut TriggerHandle<'_, R>) + Send + Sync + 'static,
    {
        let _ = self.evolving_tx.send(EvolvingEntry {
            evolve,
            triggers: vec![Box::new(trigger)],
            generation: 0,
        });
    }
}
