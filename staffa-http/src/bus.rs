//! Topic transport for the data plane.
//!
//! Results and deltas travel as opaque byte payloads over named topics.
//! [LocalBus] is the in-process implementation used by the bundled server
//! and the tests; a networked broker plugs in behind the same
//! [MessageBus] trait. [RequestClient] layers correlated request/response
//! on top of plain topics for one-shot queries such as snapshot fetches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub trait MessageBus: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: Vec<u8>);
    fn subscribe(&self, topic: &str) -> TopicSubscription;
}

/// One subscriber's end of a topic. Messages arrive in publish order;
/// dropping the subscription unsubscribes.
pub struct TopicSubscription {
    receiver: Receiver<Vec<u8>>,
}

impl TopicSubscription {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.receiver.try_recv().ok()
    }
}

/// In-process bus with one FIFO channel per subscriber per topic. Dead
/// subscribers are pruned on the next publish to their topic.
#[derive(Default)]
pub struct LocalBus {
    topics: DashMap<String, Vec<Sender<Vec<u8>>>>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|subs| subs.len()).unwrap_or(0)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|subscriber| subscriber.send(payload.clone()).is_ok());
        }
    }

    fn subscribe(&self, topic: &str) -> TopicSubscription {
        let (sender, receiver) = mpsc::channel();
        self.topics.entry(topic.to_string()).or_default().push(sender);
        TopicSubscription { receiver }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BusRequest {
    pub correlation_id: u64,
    pub reply_topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BusReply {
    pub correlation_id: u64,
    pub payload: Vec<u8>,
}

impl BusReply {
    pub fn to_request(request: &BusRequest, payload: Vec<u8>) -> Self {
        Self {
            correlation_id: request.correlation_id,
            payload,
        }
    }
}

/// Correlated request/response over the bus.
///
/// Each client owns a private reply topic and a dispatcher thread routing
/// inbound replies to the pending waiter by correlation id. A request
/// abandoned on timeout removes its pending entry, so a reply arriving late
/// is discarded instead of waking a stale waiter or leaking the entry.
pub struct RequestClient {
    bus: Arc<dyn MessageBus>,
    reply_topic: String,
    pending: Arc<Mutex<HashMap<u64, Sender<Vec<u8>>>>>,
    next_id: AtomicU64,
    stop: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl RequestClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        let reply_topic = format!("reply.{:016x}", rand::thread_rng().gen::<u64>());
        let pending: Arc<Mutex<HashMap<u64, Sender<Vec<u8>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let subscription = bus.subscribe(&reply_topic);
        let dispatcher_pending = pending.clone();
        let dispatcher_stop = stop.clone();
        let dispatcher = thread::spawn(move || {
            while !dispatcher_stop.load(Ordering::SeqCst) {
                let Some(raw) = subscription.recv_timeout(Duration::from_millis(50)) else {
                    continue;
                };
                let Ok(reply) = serde_json::from_slice::<BusReply>(&raw) else {
                    continue;
                };
                let waiter = dispatcher_pending
                    .lock()
                    .unwrap()
                    .remove(&reply.correlation_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply.payload);
                    }
                    None => debug!("BUS: discarding late reply {}", reply.correlation_id),
                }
            }
        });

        Self {
            bus,
            reply_topic,
            pending,
            next_id: AtomicU64::new(0),
            stop,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn request(&self, topic: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>> {
        let correlation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = mpsc::channel();
        self.pending.lock().unwrap().insert(correlation_id, sender);

        let request = BusRequest {
            correlation_id,
            reply_topic: self.reply_topic.clone(),
            payload,
        };
        self.bus.publish(topic, serde_json::to_vec(&request)?);

        match receiver.recv_timeout(timeout) {
            Ok(reply) => Ok(reply),
            Err(_) => {
                self.pending.lock().unwrap().remove(&correlation_id);
                Err(anyhow!("no reply on {topic} within {timeout:?}"))
            }
        }
    }
}

impl Drop for RequestClient {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
