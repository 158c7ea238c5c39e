//! Process-boundary proxies presenting the view contract over the control
//! and data planes.
//!
//! A [RemoteViewProcessorClient] resolves view names through the control
//! plane and caches one [RemoteViewClient] per canonical name, so aliased
//! names never produce duplicate proxies. Each remote client multiplexes
//! any number of local listeners onto a single data-plane subscription per
//! topic, opened when the first listener registers and torn down when the
//! last one leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, warn};

use staffa::result::{CycleId, DeltaModel, ResultModel};
use staffa_http::bus::{MessageBus, RequestClient, TopicSubscription};
use staffa_http::http::view_v1::{ListViewsResponse, ViewControl};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);
const FEED_POLL: Duration = Duration::from_millis(50);

pub type ListenerId = u64;
pub type RemoteResultListener = Arc<dyn Fn(&ResultModel) + Send + Sync>;
pub type RemoteDeltaListener = Arc<dyn Fn(&DeltaModel) + Send + Sync>;

/// Everything a remote adapter needs from its environment, passed explicitly
/// at construction. Lifecycle is tied to the adapters built from it; there
/// is no process-wide registry.
pub struct RemoteContext {
    pub control: Arc<dyn ViewControl>,
    pub bus: Arc<dyn MessageBus>,
}

pub struct RemoteViewProcessorClient {
    ctx: Arc<RemoteContext>,
    proxies: Mutex<HashMap<String, Arc<RemoteViewClient>>>,
}

impl RemoteViewProcessorClient {
    pub fn new(ctx: Arc<RemoteContext>) -> Self {
        Self {
            ctx,
            proxies: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the proxy for a named view, creating it on first access. The
    /// server's canonical name is resolved first, outside the map lock, so
    /// aliased names share one proxy.
    pub fn get_view(&self, name: &str) -> Result<Arc<RemoteViewClient>> {
        let canonical = self.ctx.control.resolve_name(name)?.canonical_name;
        let mut proxies = self.proxies.lock().unwrap();
        if let Some(proxy) = proxies.get(&canonical) {
            return Ok(proxy.clone());
        }
        let proxy = Arc::new(RemoteViewClient::new(self.ctx.clone(), canonical.clone()));
        proxies.insert(canonical, proxy.clone());
        Ok(proxy)
    }

    pub fn list_views(&self) -> Result<ListViewsResponse> {
        self.ctx.control.list_views()
    }
}

/// Pump thread feeding one topic subscription to a set of local listeners.
/// Dropping the feed stops and joins the pump.
struct TopicFeed {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for TopicFeed {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct RemoteInner {
    next_listener_id: ListenerId,
    result_listeners: Arc<Mutex<HashMap<ListenerId, RemoteResultListener>>>,
    delta_listeners: Arc<Mutex<HashMap<ListenerId, RemoteDeltaListener>>>,
    result_feed: Option<TopicFeed>,
    delta_feed: Option<TopicFeed>,
}

/// Per-view proxy with the local client's control surface plus multiplexed
/// listeners: one network subscription per topic serves every local
/// listener, however many register.
pub struct RemoteViewClient {
    ctx: Arc<RemoteContext>,
    view_name: String,
    requests: RequestClient,
    inner: Mutex<RemoteInner>,
}

impl RemoteViewClient {
    fn new(ctx: Arc<RemoteContext>, view_name: String) -> Self {
        let requests = RequestClient::new(ctx.bus.clone());
        Self {
            ctx,
            view_name,
            requests,
            inner: Mutex::new(RemoteInner {
                next_listener_id: 0,
                result_listeners: Arc::new(Mutex::new(HashMap::new())),
                delta_listeners: Arc::new(Mutex::new(HashMap::new())),
                result_feed: None,
                delta_feed: None,
            }),
        }
    }

    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    pub fn start_live(&self) -> Result<()> {
        self.ctx.control.start_live(&self.view_name)
    }

    pub fn stop_live(&self) -> Result<()> {
        self.ctx.control.stop_live(&self.view_name)
    }

    pub fn is_live_computation_running(&self) -> Result<bool> {
        Ok(self
            .ctx
            .control
            .status(&self.view_name)?
            .live_computation_running)
    }

    pub fn is_result_available(&self) -> Result<bool> {
        Ok(self.ctx.control.status(&self.view_name)?.result_available)
    }

    pub fn latest_result(&self) -> Result<Option<ResultModel>> {
        Ok(self.ctx.control.latest_result(&self.view_name)?.result)
    }

    pub fn required_outputs(&self) -> Result<Vec<String>> {
        Ok(self.ctx.control.meta(&self.view_name)?.required_outputs)
    }

    /// Registers a local result listener. The first listener opens the one
    /// subscription on the view's result topic: the topic names are resolved
    /// from the control plane, the subscription is opened before the
    /// snapshot request so no cycle published in between is lost, and the
    /// new listener is primed with the server's current snapshot. The pump
    /// skips cycles the snapshot already covered, so no cycle is delivered
    /// twice.
    pub fn add_result_listener(&self, listener: RemoteResultListener) -> Result<ListenerId> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;

        if inner.result_feed.is_none() {
            let topics = self.ctx.control.topics(&self.view_name)?;
            let subscription = self.ctx.bus.subscribe(&topics.result_topic);
            let primed = match self.fetch_snapshot(&topics.snapshot_topic) {
                Ok(Some(result)) => {
                    listener(&result);
                    Some(result.cycle_id)
                }
                Ok(None) => None,
                Err(e) => {
                    // Best effort: the live feed follows regardless.
                    warn!(
                        "REMOTE: snapshot fetch for {} abandoned: {e:#}",
                        self.view_name
                    );
                    None
                }
            };
            inner.result_listeners.lock().unwrap().insert(id, listener);
            inner.result_feed = Some(spawn_result_feed(
                subscription,
                inner.result_listeners.clone(),
                primed,
            ));
        } else {
            inner.result_listeners.lock().unwrap().insert(id, listener);
        }
        Ok(id)
    }

    pub fn remove_result_listener(&self, id: ListenerId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let empty = {
            let mut listeners = inner.result_listeners.lock().unwrap();
            if listeners.remove(&id).is_none() {
                return Err(anyhow!("unknown result listener {id}"));
            }
            listeners.is_empty()
        };
        if empty {
            // Last listener gone: drop the subscription and join the pump.
            inner.result_feed = None;
        }
        Ok(())
    }

    pub fn add_delta_listener(&self, listener: RemoteDeltaListener) -> Result<ListenerId> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;

        if inner.delta_feed.is_none() {
            let topics = self.ctx.control.topics(&self.view_name)?;
            let subscription = self.ctx.bus.subscribe(&topics.delta_topic);
            inner.delta_listeners.lock().unwrap().insert(id, listener);
            inner.delta_feed = Some(spawn_delta_feed(
                subscription,
                inner.delta_listeners.clone(),
            ));
        } else {
            inner.delta_listeners.lock().unwrap().insert(id, listener);
        }
        Ok(id)
    }

    pub fn remove_delta_listener(&self, id: ListenerId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let empty = {
            let mut listeners = inner.delta_listeners.lock().unwrap();
            if listeners.remove(&id).is_none() {
                return Err(anyhow!("unknown delta listener {id}"));
            }
            listeners.is_empty()
        };
        if empty {
            inner.delta_feed = None;
        }
        Ok(())
    }

    fn fetch_snapshot(&self, snapshot_topic: &str) -> Result<Option<ResultModel>> {
        let reply = self
            .requests
            .request(snapshot_topic, Vec::new(), SNAPSHOT_TIMEOUT)?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

fn spawn_result_feed(
    subscription: TopicSubscription,
    listeners: Arc<Mutex<HashMap<ListenerId, RemoteResultListener>>>,
    skip_through: Option<CycleId>,
) -> TopicFeed {
    let stop = Arc::new(AtomicBool::new(false));
    let pump_stop = stop.clone();
    let handle = thread::spawn(move || {
        while !pump_stop.load(Ordering::SeqCst) {
            let Some(raw) = subscription.recv_timeout(FEED_POLL) else {
                continue;
            };
            let Ok(result) = ResultModel::from_bytes(&raw) else {
                debug!("REMOTE: dropping undecodable result");
                continue;
            };
            // The priming snapshot already covered these cycles.
            if skip_through.is_some_and(|id| result.cycle_id <= id) {
                continue;
            }
            let current: Vec<RemoteResultListener> =
                listeners.lock().unwrap().values().cloned().collect();
            for listener in current {
                listener(&result);
            }
        }
    });
    TopicFeed {
        stop,
        handle: Some(handle),
    }
}

fn spawn_delta_feed(
    subscription: TopicSubscription,
    listeners: Arc<Mutex<HashMap<ListenerId, RemoteDeltaListener>>>,
) -> TopicFeed {
    let stop = Arc::new(AtomicBool::new(false));
    let pump_stop = stop.clone();
    let handle = thread::spawn(move || {
        while !pump_stop.load(Ordering::SeqCst) {
            let Some(raw) = subscription.recv_timeout(FEED_POLL) else {
                continue;
            };
            let Ok(delta) = DeltaModel::from_bytes(&raw) else {
                debug!("REMOTE: dropping undecodable delta");
                continue;
            };
            let current: Vec<RemoteDeltaListener> =
                listeners.lock().unwrap().values().cloned().collect();
            for listener in current {
                listener(&delta);
            }
        }
    });
    TopicFeed {
        stop,
        handle: Some(handle),
    }
}
