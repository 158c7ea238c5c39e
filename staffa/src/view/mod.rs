//! The live view computation scheduler.
//!
//! A [View] is a shared, named computation context. While at least one
//! attached [ViewClient] is live or paused, the view owns a single
//! [RecalculationJob] whose worker re-runs the computation cycle on every
//! upstream change and fans each result out to every attached client. The
//! [ViewProcessor] registers views by name and cascades shutdown.
//!
//! Locking is deliberately flat: the view's membership and job reference sit
//! behind the view lock, the most recent result behind its own lock, and
//! each client's state behind that client's lock. Result delivery snapshots
//! the client set and then takes client locks one at a time, never while
//! holding the view lock, and workers are only ever joined outside every
//! lock.

mod client;
mod job;
mod processor;

pub use client::{ClientState, DeltaListener, ResultListener, ViewClient};
pub use job::RecalculationJob;
pub use processor::ViewProcessor;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::cycle::ComputationCycle;
use crate::result::{CycleId, OutputKey, ResultModel};

#[derive(Debug)]
pub enum ViewError {
    /// The client is terminated; no further operation is possible.
    ClientTerminated,
    /// The requested transition is not legal from the client's state.
    InvalidTransition(&'static str),
    /// The view has been stopped and accepts no new clients.
    ViewTerminated,
    /// The processor has been stopped.
    ProcessorStopped,
}

impl std::error::Error for ViewError {}

impl core::fmt::Display for ViewError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ViewError::ClientTerminated => write!(f, "ClientTerminated"),
            ViewError::InvalidTransition(op) => write!(f, "InvalidTransition: {op}"),
            ViewError::ViewTerminated => write!(f, "ViewTerminated"),
            ViewError::ProcessorStopped => write!(f, "ProcessorStopped"),
        }
    }
}

struct ViewInner {
    clients: Vec<Arc<ViewClient>>,
    live_clients: HashSet<u64>,
    job: Option<Arc<RecalculationJob>>,
    terminated: bool,
}

/// A named computation context: the most recent result, the set of attached
/// clients, and the current recalculation job, reference-counted by the
/// clients that want live results.
pub struct View {
    name: String,
    cycle: Arc<dyn ComputationCycle>,
    inner: Mutex<ViewInner>,
    latest: Mutex<Option<Arc<ResultModel>>>,
    next_client_id: AtomicU64,
    next_cycle_id: AtomicU64,
}

impl View {
    pub(crate) fn new(name: impl Into<String>, cycle: Arc<dyn ComputationCycle>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            cycle,
            inner: Mutex::new(ViewInner {
                clients: Vec::new(),
                live_clients: HashSet::new(),
                job: None,
                terminated: false,
            }),
            latest: Mutex::new(None),
            next_client_id: AtomicU64::new(0),
            next_cycle_id: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attaches a new client in the stopped state.
    pub fn create_client(
        self: &Arc<Self>,
        user: impl Into<String>,
    ) -> Result<Arc<ViewClient>, ViewError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminated {
            return Err(ViewError::ViewTerminated);
        }
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let client = ViewClient::new(id, user.into(), Arc::downgrade(self));
        inner.clients.push(client.clone());
        Ok(client)
    }

    pub fn latest_result(&self) -> Option<Arc<ResultModel>> {
        self.latest.lock().unwrap().clone()
    }

    pub fn is_result_available(&self) -> bool {
        self.latest.lock().unwrap().is_some()
    }

    pub fn required_outputs(&self) -> Vec<OutputKey> {
        self.cycle.output_keys()
    }

    pub fn is_live_computation_running(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        match &inner.job {
            Some(job) => !job.is_terminated(),
            None => false,
        }
    }

    /// Forwards an upstream data change to the current job, if any.
    pub fn live_data_changed(&self) {
        let job = self.inner.lock().unwrap().job.clone();
        if let Some(job) = job {
            job.trigger();
        }
    }

    pub(crate) fn next_cycle_id(&self) -> CycleId {
        self.next_cycle_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Counts a client into the live-reference set. The first reference
    /// starts a fresh recalculation job. Set semantics: duplicate requests
    /// from the same client have no effect.
    pub(crate) fn request_live(self: &Arc<Self>, client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.terminated {
            return;
        }
        if inner.live_clients.insert(client_id) && inner.live_clients.len() == 1 {
            info!("VIEW: starting live computation for {}", self.name);
            let job = RecalculationJob::spawn(
                Arc::downgrade(self),
                self.cycle.clone(),
                self.name.clone(),
            );
            inner.job = Some(job);
        }
    }

    /// Removes a client from the live-reference set. The last reference
    /// terminates the job under the view lock (so no replacement can start
    /// ahead of the termination signal) and joins the worker outside it.
    pub(crate) fn release_live(&self, client_id: u64) {
        let job = {
            let mut inner = self.inner.lock().unwrap();
            if inner.live_clients.remove(&client_id) && inner.live_clients.is_empty() {
                if let Some(job) = inner.job.take() {
                    info!("VIEW: stopping live computation for {}", self.name);
                    job.terminate();
                    Some(job)
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(job) = job {
            job.join();
        }
    }

    /// Publishes one cycle's result: stores it as the most recent result and
    /// delivers it to every attached client under that client's own lock.
    pub(crate) fn recalculation_performed(&self, result: ResultModel) {
        debug!(
            "VIEW: cycle {} completed for {} with {} outputs",
            result.cycle_id,
            self.name,
            result.len()
        );
        let result = Arc::new(result);
        *self.latest.lock().unwrap() = Some(result.clone());
        let clients = self.inner.lock().unwrap().clients.clone();
        for client in clients {
            client.on_cycle(&result);
        }
    }

    pub(crate) fn cycle_execution_failed(&self, error: &anyhow::Error) {
        error!("VIEW: computation cycle failed for {}: {:#}", self.name, error);
    }

    pub(crate) fn detach_client(&self, client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.clients.retain(|client| client.id() != client_id);
    }

    /// Terminates every attached client, then ensures the job is gone. New
    /// clients are refused afterwards.
    pub fn stop(&self) {
        let clients = {
            let mut inner = self.inner.lock().unwrap();
            inner.terminated = true;
            std::mem::take(&mut inner.clients)
        };
        for client in clients {
            let _ = client.shutdown();
        }
        // Shutting down every client releases every live reference, but a
        // view that never went live still needs its state settled.
        let job = {
            let mut inner = self.inner.lock().unwrap();
            inner.live_clients.clear();
            inner.job.take()
        };
        if let Some(job) = job {
            job.terminate();
            job.join();
        }
    }
}
