use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::debug;

use crate::result::{self, DeltaModel, OutputKey, ResultModel};

use super::{View, ViewError};

pub type ResultListener = Box<dyn Fn(&ResultModel) + Send>;
pub type DeltaListener = Box<dyn Fn(&DeltaModel) + Send>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientState {
    Stopped,
    Live,
    Paused,
    Terminated,
}

/// Accumulated view of everything that happened while the client was paused:
/// the baseline at pause time, the latest full result observed since, and
/// the latest value of every key that moved.
struct MergeBuffer {
    baseline: Option<Arc<ResultModel>>,
    merged: HashMap<OutputKey, f64>,
    latest: Option<Arc<ResultModel>>,
}

struct ClientInner {
    state: ClientState,
    result_listener: Option<ResultListener>,
    delta_listener: Option<DeltaListener>,
    baseline: Option<Arc<ResultModel>>,
    merge: Option<MergeBuffer>,
}

/// A per-subscriber session attached to exactly one view.
///
/// Everything the client owns sits behind its own lock, and each cycle is
/// delivered inside one critical section, so a listener swap can never split
/// a cycle across two listener generations. Control operations release the
/// client lock before touching the view, because the view joins worker
/// threads on the last live release.
pub struct ViewClient {
    id: u64,
    user: String,
    view: Weak<View>,
    inner: Mutex<ClientInner>,
}

impl ViewClient {
    pub(crate) fn new(id: u64, user: String, view: Weak<View>) -> Arc<Self> {
        Arc::new(Self {
            id,
            user,
            view,
            inner: Mutex::new(ClientInner {
                state: ClientState::Stopped,
                result_listener: None,
                delta_listener: None,
                baseline: None,
                merge: None,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    fn view(&self) -> Result<Arc<View>, ViewError> {
        self.view.upgrade().ok_or(ViewError::ViewTerminated)
    }

    /// Starts (or resumes) live delivery.
    ///
    /// From stopped: the view's most recent result, if any, is delivered
    /// immediately as the first callback and becomes the delta baseline, so
    /// a new subscriber on an already-running view is not left empty. From
    /// paused: the merge buffer is flushed as exactly one result callback
    /// and at most one merged delta callback.
    pub fn start_live(&self) -> Result<(), ViewError> {
        let view = self.view()?;
        let needs_reference = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::Stopped => {
                    inner.state = ClientState::Live;
                    if let Some(latest) = view.latest_result() {
                        if let Some(listener) = &inner.result_listener {
                            listener(&latest);
                        }
                        inner.baseline = Some(latest);
                    }
                    true
                }
                ClientState::Paused => {
                    flush_merge(&mut inner);
                    inner.state = ClientState::Live;
                    // The live reference was retained across the pause.
                    false
                }
                ClientState::Live => return Err(ViewError::InvalidTransition("start_live")),
                ClientState::Terminated => return Err(ViewError::ClientTerminated),
            }
        };
        if needs_reference {
            view.request_live(self.id);
            // A racing stop or shutdown between the two sections would
            // strand the reference, so re-check and release if the state
            // already moved on.
            let still_counted = matches!(
                self.inner.lock().unwrap().state,
                ClientState::Live | ClientState::Paused
            );
            if !still_counted {
                view.release_live(self.id);
            }
        }
        Ok(())
    }

    /// Suspends listener delivery; cycles keep running and are merged until
    /// the client resumes.
    pub fn pause_live(&self) -> Result<(), ViewError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ClientState::Live => {
                debug!("CLIENT: {} pausing", self.id);
                inner.merge = Some(MergeBuffer {
                    baseline: inner.baseline.clone(),
                    merged: HashMap::new(),
                    latest: None,
                });
                inner.state = ClientState::Paused;
                Ok(())
            }
            ClientState::Terminated => Err(ViewError::ClientTerminated),
            _ => Err(ViewError::InvalidTransition("pause_live")),
        }
    }

    /// Stops live delivery, discarding any buffered merge state undelivered.
    pub fn stop_live(&self) -> Result<(), ViewError> {
        let view = self.view()?;
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::Live | ClientState::Paused => {
                    inner.merge = None;
                    inner.baseline = None;
                    inner.state = ClientState::Stopped;
                }
                ClientState::Terminated => return Err(ViewError::ClientTerminated),
                ClientState::Stopped => {
                    return Err(ViewError::InvalidTransition("stop_live"))
                }
            }
        }
        view.release_live(self.id);
        Ok(())
    }

    /// Irreversibly terminates the client, releasing its live reference if
    /// held and detaching it from the view. Every later operation fails.
    pub fn shutdown(&self) -> Result<(), ViewError> {
        let had_live_reference = {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ClientState::Terminated => return Err(ViewError::ClientTerminated),
                state => {
                    let live = matches!(state, ClientState::Live | ClientState::Paused);
                    inner.state = ClientState::Terminated;
                    inner.result_listener = None;
                    inner.delta_listener = None;
                    inner.baseline = None;
                    inner.merge = None;
                    live
                }
            }
        };
        if let Some(view) = self.view.upgrade() {
            if had_live_reference {
                view.release_live(self.id);
            }
            view.detach_client(self.id);
        }
        Ok(())
    }

    pub fn set_result_listener(&self, listener: ResultListener) -> Result<(), ViewError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Terminated {
            return Err(ViewError::ClientTerminated);
        }
        inner.result_listener = Some(listener);
        Ok(())
    }

    pub fn clear_result_listener(&self) -> Result<(), ViewError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Terminated {
            return Err(ViewError::ClientTerminated);
        }
        inner.result_listener = None;
        Ok(())
    }

    pub fn set_delta_listener(&self, listener: DeltaListener) -> Result<(), ViewError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Terminated {
            return Err(ViewError::ClientTerminated);
        }
        inner.delta_listener = Some(listener);
        Ok(())
    }

    pub fn clear_delta_listener(&self) -> Result<(), ViewError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Terminated {
            return Err(ViewError::ClientTerminated);
        }
        inner.delta_listener = None;
        Ok(())
    }

    /// Invoked by the owning view once per completed cycle.
    ///
    /// Live: the full result goes to the result listener, the delta against
    /// the stored baseline to the delta listener. No delta is delivered
    /// until a baseline exists, and empty deltas are not delivered. Paused:
    /// changed keys fold into the merge buffer without any listener call.
    pub(crate) fn on_cycle(&self, result: &Arc<ResultModel>) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ClientState::Live => {
                let delta = result::diff(inner.baseline.as_deref(), result);
                if let Some(listener) = &inner.result_listener {
                    listener(result);
                }
                if inner.baseline.is_some() && !delta.is_empty() {
                    if let Some(listener) = &inner.delta_listener {
                        listener(&delta);
                    }
                }
                inner.baseline = Some(result.clone());
            }
            ClientState::Paused => {
                let baseline = inner.baseline.clone();
                let merge = inner.merge.get_or_insert_with(|| MergeBuffer {
                    baseline,
                    merged: HashMap::new(),
                    latest: None,
                });
                let previous = merge.latest.as_deref().or(merge.baseline.as_deref());
                let delta = result::diff(previous, result);
                merge.merged.extend(delta.values);
                merge.latest = Some(result.clone());
            }
            ClientState::Stopped | ClientState::Terminated => {}
        }
    }
}

/// Delivers the outcome of a pause as a single result callback plus at most
/// one merged delta callback. Keys that reverted to their pre-pause value
/// are dropped from the merged delta.
fn flush_merge(inner: &mut ClientInner) {
    let Some(merge) = inner.merge.take() else {
        return;
    };
    let Some(latest) = merge.latest else {
        // Nothing was computed during the pause.
        return;
    };
    if let Some(listener) = &inner.result_listener {
        listener(&latest);
    }
    if merge.baseline.is_some() {
        let mut values = HashMap::new();
        for key in merge.merged.keys() {
            if let Some(current) = latest.get(key) {
                let changed = match merge.baseline.as_ref().and_then(|b| b.get(key)) {
                    Some(previous) => result::value_changed(previous, current),
                    None => true,
                };
                if changed {
                    values.insert(key.clone(), current);
                }
            }
        }
        if !values.is_empty() {
            if let Some(listener) = &inner.delta_listener {
                listener(&DeltaModel::new(latest.cycle_id, values));
            }
        }
    }
    inner.baseline = Some(latest);
}
