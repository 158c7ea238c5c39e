use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use log::{debug, info};

use crate::cycle::ComputationCycle;

use super::View;

#[derive(Default)]
struct Signal {
    triggered: bool,
    terminated: bool,
}

/// Background worker that repeatedly runs the computation cycle of its
/// owning view.
///
/// Triggers are coalesced: any number of [RecalculationJob::trigger] calls
/// between two cycles collapse into a single re-run, and a trigger landing
/// while a cycle is executing buys exactly one more cycle afterwards. A
/// terminated job is never restarted; the view creates a fresh job (and
/// thread) the next time a subscriber goes live.
pub struct RecalculationJob {
    signal: Mutex<Signal>,
    wakeup: Condvar,
    exited: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecalculationJob {
    pub(crate) fn spawn(
        owner: Weak<View>,
        cycle: Arc<dyn ComputationCycle>,
        view_name: String,
    ) -> Arc<Self> {
        let job = Arc::new(Self {
            signal: Mutex::new(Signal::default()),
            wakeup: Condvar::new(),
            exited: AtomicBool::new(false),
            handle: Mutex::new(None),
        });

        let worker = job.clone();
        let handle = thread::Builder::new()
            .name(format!("recalc-{view_name}"))
            .spawn(move || worker.run(owner, cycle))
            .expect("failed to spawn recalculation worker");
        *job.handle.lock().unwrap() = Some(handle);
        job
    }

    /// Signals that something upstream changed. Non-blocking and idempotent.
    pub fn trigger(&self) {
        let mut signal = self.signal.lock().unwrap();
        signal.triggered = true;
        self.wakeup.notify_all();
    }

    /// Requests the worker to stop once any in-progress cycle completes.
    pub fn terminate(&self) {
        let mut signal = self.signal.lock().unwrap();
        signal.terminated = true;
        self.wakeup.notify_all();
    }

    /// True only once the worker has actually exited its loop.
    pub fn is_terminated(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Blocks until the worker thread is gone. Safe to call more than once.
    pub fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn run(&self, owner: Weak<View>, cycle: Arc<dyn ComputationCycle>) {
        // The first cycle runs unprompted so a fresh subscriber sees a
        // result without waiting for an upstream change.
        self.run_one_cycle(&owner, &cycle);

        loop {
            {
                let mut signal = self.signal.lock().unwrap();
                while !signal.triggered && !signal.terminated {
                    signal = self.wakeup.wait(signal).unwrap();
                }
                if signal.terminated {
                    break;
                }
                signal.triggered = false;
            }
            self.run_one_cycle(&owner, &cycle);
        }

        debug!("JOB: recalculation worker exiting");
        self.exited.store(true, Ordering::SeqCst);
    }

    fn run_one_cycle(&self, owner: &Weak<View>, cycle: &Arc<dyn ComputationCycle>) {
        let Some(view) = owner.upgrade() else {
            info!("JOB: owning view is gone, skipping cycle");
            return;
        };
        let cycle_id = view.next_cycle_id();
        match cycle.run(cycle_id) {
            Ok(result) => {
                // Terminated mid-cycle: a replacement job may already own
                // the view, so the result is discarded rather than published.
                if self.signal.lock().unwrap().terminated {
                    return;
                }
                view.recalculation_performed(result);
            }
            Err(e) => {
                // A transient cycle failure must not kill the worker; the
                // loop keeps waiting for the next trigger.
                view.cycle_execution_failed(&e);
            }
        }
    }
}

impl std::fmt::Debug for RecalculationJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecalculationJob")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
