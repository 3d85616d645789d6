//! Background workers: the predicate detection loop and the Reads-mode
//! reader loop.
//!
//! The observer owns the predicate lists outright; new registrations arrive
//! over a channel and are folded in at pass boundaries. Workers hold only a
//! weak handle to the table so that dropping the last user handle tears the
//! table down; they also watch the explicit shutdown flag and check it at the
//! top of every pass.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Weak;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

use crate::config::Mode;
use crate::error::SstError;
#[cfg(feature = "evolving")]
use crate::predicates::EvolvingEntry;
use crate::predicates::{PredFn, PredicateEntry, PredicateKind, TriggerFn};
use crate::row::{Row, SlotValue};
use crate::sst::{Sst, TriggerHandle};

/// Receivers feeding the observer; the matching senders live in
/// [`crate::predicates::Predicates`].
pub(crate) struct EngineChannels<R: Row> {
    pub(crate) rx: UnboundedReceiver<PredicateEntry<R>>,
    #[cfg(feature = "evolving")]
    pub(crate) evolving_rx: UnboundedReceiver<EvolvingEntry<R>>,
}

enum StepOutcome {
    Continue,
    /// A trigger panicked: abandon the rest of this pass, keep the worker.
    AbortPass,
    /// Shutdown or a fatal transport failure: the worker exits.
    StopWorker,
}

pub(crate) struct Observer<R: Row> {
    sst: Weak<Sst<R>>,
    channels: EngineChannels<R>,
    one_time: Vec<(PredFn<R>, Vec<TriggerFn<R>>)>,
    recurrent: Vec<(PredFn<R>, Vec<TriggerFn<R>>)>,
    transition: Vec<(PredFn<R>, Vec<TriggerFn<R>>)>,
    /// Previous evaluation of each transition predicate, in lock-step.
    transition_states: Vec<bool>,
    #[cfg(feature = "evolving")]
    evolving: Vec<EvolvingEntry<R>>,
    /// Local extension slots as of the previous pass, for change detection.
    last_extensions: Vec<SlotValue>,
}

impl<R: Row> Observer<R> {
    pub(crate) fn new(sst: Weak<Sst<R>>, channels: EngineChannels<R>) -> Observer<R> {
        Observer {
            sst,
            channels,
            one_time: Vec::new(),
            recurrent: Vec::new(),
            transition: Vec::new(),
            transition_states: Vec::new(),
            #[cfg(feature = "evolving")]
            evolving: Vec::new(),
            last_extensions: Vec::new(),
        }
    }

    pub(crate) async fn run(mut self, shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let Some(sst) = self.sst.upgrade() else { break };
            sst.mark_running();
            let stop = self.pass(&sst).await;
            drop(sst);
            if stop {
                break;
            }
            // The observer spins; yielding keeps it from starving the
            // runtime without introducing a delay between passes.
            tokio::task::yield_now().await;
        }
        tracing::debug!("predicate detection worker shutting down");
    }

    /// One full pass. Returns true when the worker should exit.
    async fn pass(&mut self, sst: &Sst<R>) -> bool {
        self.drain_registrations();

        match self.run_updaters(sst).await {
            StepOutcome::Continue => {}
            StepOutcome::AbortPass => return false,
            StepOutcome::StopWorker => return true,
        }
        match self.walk_one_time(sst).await {
            StepOutcome::Continue => {}
            StepOutcome::AbortPass => return false,
            StepOutcome::StopWorker => return true,
        }
        match self.walk_recurrent(sst).await {
            StepOutcome::Continue => {}
            StepOutcome::AbortPass => return false,
            StepOutcome::StopWorker => return true,
        }
        match self.walk_transition(sst).await {
            StepOutcome::Continue => {}
            StepOutcome::AbortPass => return false,
            StepOutcome::StopWorker => return true,
        }
        #[cfg(feature = "evolving")]
        match self.walk_evolving(sst).await {
            StepOutcome::Continue => {}
            StepOutcome::AbortPass => return false,
            StepOutcome::StopWorker => return true,
        }
        false
    }

    fn drain_registrations(&mut self) {
        while let Ok(entry) = self.channels.rx.try_recv() {
            match entry.kind {
                PredicateKind::OneTime => self.one_time.push((entry.pred, entry.triggers)),
                PredicateKind::Recurrent => self.recurrent.push((entry.pred, entry.triggers)),
                PredicateKind::Transition => {
                    self.transition.push((entry.pred, entry.triggers));
                    self.transition_states.push(false);
                }
            }
        }
        #[cfg(feature = "evolving")]
        while let Ok(entry) = self.channels.evolving_rx.try_recv() {
            self.evolving.push(entry);
        }
    }

    /// Run every updater in chain order against a view materialized at the
    /// start of the pass, then push changed slots to the peers.
    async fn run_updaters(&mut self, sst: &Sst<R>) -> StepOutcome {
        let columns = sst.columns();
        if columns.descriptors.is_empty() {
            return StepOutcome::Continue;
        }
        let mut view = sst.materialize_view();
        let me = sst.local_index();
        let mut current = Vec::with_capacity(columns.descriptors.len());
        for (slot, (desc, &base)) in columns.descriptors.iter().zip(&columns.bases).enumerate() {
            let value = (desc.updater)(&view, base);
            sst.table().write_slot(me, slot, value);
            // Later updaters in the same pass must see this write.
            view.set_local_slot(slot, value);
            current.push(value);
        }

        let changed = current != self.last_extensions;
        self.last_extensions = current;
        if changed && sst.mode() == Mode::Writes {
            match sst.put_extensions().await {
                Ok(()) => {}
                Err(SstError::ShuttingDown) => return StepOutcome::StopWorker,
                Err(err) => {
                    tracing::error!(error = %err, "failed to propagate extension slots");
                    return StepOutcome::StopWorker;
                }
            }
        }
        StepOutcome::Continue
    }

    async fn walk_one_time(&mut self, sst: &Sst<R>) -> StepOutcome {
        let mut i = 0;
        while i < self.one_time.len() {
            if (self.one_time[i].0)(sst) {
                // Removed before its triggers run, so it can never fire twice
                // even if a trigger panics.
                let (_pred, triggers) = self.one_time.remove(i);
                match self.fire_triggers(sst, &triggers).await {
                    StepOutcome::Continue => {}
                    other => return other,
                }
            } else {
                i += 1;
            }
        }
        StepOutcome::Continue
    }

    async fn walk_recurrent(&self, sst: &Sst<R>) -> StepOutcome {
        for (pred, triggers) in &self.recurrent {
            if pred(sst) {
                match self.fire_triggers(sst, triggers).await {
                    StepOutcome::Continue => {}
                    other => return other,
                }
            }
        }
        StepOutcome::Continue
    }

    async fn walk_transition(&mut self, sst: &Sst<R>) -> StepOutcome {
        for i in 0..self.transition.len() {
            let now = (self.transition[i].0)(sst);
            let prev = self.transition_states[i];
            self.transition_states[i] = now;
            if now && !prev {
                match self.fire_triggers(sst, &self.transition[i].1).await {
                    StepOutcome::Continue => {}
                    other => return other,
                }
            }
        }
        StepOutcome::Continue
    }

    #[cfg(feature = "evolving")]
    async fn walk_evolving(&mut self, sst: &Sst<R>) -> StepOutcome {
        for i in 0..self.evolving.len() {
            let generation = self.evolving[i].generation;
            let pred = (self.evolving[i].evolve)(sst, generation);
            self.evolving[i].generation = generation + 1;
            if pred(sst) {
                match self.fire_triggers(sst, &self.evolving[i].triggers).await {
                    StepOutcome::Continue => {}
                    other => return other,
                }
            }
        }
        StepOutcome::Continue
    }

    /// Run a fired predicate's triggers, flushing each trigger's queued puts
    /// after it returns. A panicking trigger ends the pass but not the
    /// worker.
    async fn fire_triggers(&self, sst: &Sst<R>, triggers: &[TriggerFn<R>]) -> StepOutcome {
        for trigger in triggers {
            let mut handle = TriggerHandle::new(sst);
            let result = catch_unwind(AssertUnwindSafe(|| trigger(&mut handle)));
            let queued = handle.take_queued_puts();
            for (offset, len) in queued {
                match sst.put_range(offset, len).await {
                    Ok(()) => {}
                    Err(SstError::ShuttingDown) => return StepOutcome::StopWorker,
                    Err(err) => {
                        tracing::error!(error = %err, "put queued by a trigger failed");
                        return StepOutcome::StopWorker;
                    }
                }
            }
            if result.is_err() {
                tracing::warn!("trigger panicked; abandoning the current pass");
                return StepOutcome::AbortPass;
            }
        }
        StepOutcome::Continue
    }
}

/// Reads-mode worker: continuously pull every peer row into the local
/// mirrors.
pub(crate) async fn run_reader<R: Row>(sst: Weak<Sst<R>>, shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let Some(sst) = sst.upgrade() else { break };
        if let Err(err) = sst.refresh_table().await {
            if !matches!(err, SstError::ShuttingDown) {
                tracing::error!(error = %err, "refreshing remote rows failed");
            }
            break;
        }
        drop(sst);
        tokio::task::yield_now().await;
    }
    tracing::debug!("reader worker shutting down");
}
