//! Send completions of one RC session.
//!
//! Every worker posting to a session shares its send CQ. Whoever polls the
//! CQ parks each completion here under its `wr_id`, and every poster only
//! ever collects its own.

use std::{
    collections::{HashMap, HashSet},
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::VerbsError;

const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// `Err` carries the failed work completion's description.
pub(crate) type WcOutcome = Result<(), String>;

#[derive(Default)]
struct Parked {
    done: HashMap<u64, WcOutcome>,
    /// Posters that gave up; their completions are dropped on arrival.
    abandoned: HashSet<u64>,
}

#[derive(Default)]
pub(crate) struct CompletionTable {
    polling: Mutex<()>,
    parked: Mutex<Parked>,
}

impl CompletionTable {
    /// Blocks until the completion of `wr_id` arrives or `deadline` passes.
    /// `poll` drains the CQ; it runs on at most one waiter at a time.
    pub(crate) fn wait<P>(&self, wr_id: u64, deadline: Instant, poll: P) -> Result<(), VerbsError>
    where
        P: Fn() -> Result<Vec<(u64, WcOutcome)>, VerbsError>,
    {
        loop {
            if let Some(outcome) = self.take(wr_id) {
                return outcome.map_err(VerbsError::Verbs);
            }
            if Instant::now() >= deadline {
                return match self.abandon(wr_id) {
                    Some(outcome) => outcome.map_err(VerbsError::Verbs),
                    None => Err(VerbsError::Timeout("work completion")),
                };
            }

            let drained = match self.polling.try_lock() {
                Some(_polling) => {
                    let completions = poll()?;
                    let drained = completions.len();
                    for (id, outcome) in completions {
                        self.deliver(id, outcome);
                    }
                    drained
                }
                None => 0,
            };
            if drained == 0 {
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn deliver(&self, wr_id: u64, outcome: WcOutcome) {
        let mut parked = self.parked.lock();
        if !parked.abandoned.remove(&wr_id) {
            parked.done.insert(wr_id, outcome);
        }
    }

    fn take(&self, wr_id: u64) -> Option<WcOutcome> {
        self.parked.lock().done.remove(&wr_id)
    }

    fn abandon(&self, wr_id: u64) -> Option<WcOutcome> {
        let mut parked = self.parked.lock();
        let outcome = parked.done.remove(&wr_id);
        if outcome.is_none() {
            parked.abandoned.insert(wr_id);
        }
        outcome
    }

    #[cfg(test)]
    fn parked(&self) -> usize {
        let parked = self.parked.lock();
        parked.done.len() + parked.abandoned.len()
    }
}
