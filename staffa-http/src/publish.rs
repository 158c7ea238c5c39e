//! Server-side fan-out from a view onto its bus topics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use staffa::view::{ClientState, View, ViewClient, ViewError};

use crate::bus::{BusReply, BusRequest, MessageBus, TopicSubscription};
use crate::http::view_v1::{delta_topic, result_topic, snapshot_topic};

/// Publishes every result and delta of one view to its topics and answers
/// correlated snapshot requests with the most recent result. One publisher
/// per view serves any number of remote subscribers.
pub struct ViewPublisher {
    client: Arc<ViewClient>,
    stop: Arc<AtomicBool>,
    responder: Mutex<Option<JoinHandle<()>>>,
}

impl ViewPublisher {
    pub fn attach(view: &Arc<View>, bus: Arc<dyn MessageBus>) -> Result<Arc<Self>, ViewError> {
        let client = view.create_client("view-publisher")?;

        let result_bus = bus.clone();
        let topic = result_topic(view.name());
        client.set_result_listener(Box::new(move |result| match result.to_bytes() {
            Ok(payload) => result_bus.publish(&topic, payload),
            Err(e) => warn!("PUBLISH: dropping unencodable result: {e}"),
        }))?;

        let delta_bus = bus.clone();
        let topic = delta_topic(view.name());
        client.set_delta_listener(Box::new(move |delta| match delta.to_bytes() {
            Ok(payload) => delta_bus.publish(&topic, payload),
            Err(e) => warn!("PUBLISH: dropping unencodable delta: {e}"),
        }))?;

        let stop = Arc::new(AtomicBool::new(false));
        let requests = bus.subscribe(&snapshot_topic(view.name()));
        let responder =
            spawn_snapshot_responder(Arc::downgrade(view), bus, requests, stop.clone());

        Ok(Arc::new(Self {
            client,
            stop,
            responder: Mutex::new(Some(responder)),
        }))
    }

    /// Starting is idempotent at this boundary: remote callers cannot
    /// observe each other's transitions, so a second start is not an error.
    pub fn start_live(&self) -> Result<(), ViewError> {
        match self.client.state() {
            ClientState::Stopped | ClientState::Paused => self.client.start_live(),
            ClientState::Live => Ok(()),
            ClientState::Terminated => Err(ViewError::ClientTerminated),
        }
    }

    pub fn stop_live(&self) -> Result<(), ViewError> {
        match self.client.state() {
            ClientState::Live | ClientState::Paused => self.client.stop_live(),
            ClientState::Stopped => Ok(()),
            ClientState::Terminated => Err(ViewError::ClientTerminated),
        }
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.responder.lock().unwrap().take() {
            let _ = handle.join();
        }
        let _ = self.client.shutdown();
    }
}

impl Drop for ViewPublisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_snapshot_responder(
    view: Weak<View>,
    bus: Arc<dyn MessageBus>,
    requests: TopicSubscription,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while !stop.load(Ordering::SeqCst) {
            let Some(raw) = requests.recv_timeout(Duration::from_millis(50)) else {
                continue;
            };
            let Ok(request) = serde_json::from_slice::<BusRequest>(&raw) else {
                continue;
            };
            let Some(view) = view.upgrade() else {
                break;
            };
            let latest = view.latest_result();
            match serde_json::to_vec(&latest.as_deref()) {
                Ok(payload) => {
                    let reply = BusReply::to_request(&request, payload);
                    match serde_json::to_vec(&reply) {
                        Ok(bytes) => bus.publish(&request.reply_topic, bytes),
                        Err(e) => warn!("PUBLISH: could not encode snapshot reply: {e}"),
                    }
                }
                Err(e) => warn!("PUBLISH: could not encode snapshot: {e}"),
            }
        }
        debug!("PUBLISH: snapshot responder exiting");
    })
}
