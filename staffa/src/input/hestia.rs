//! Last-known-value table for live data.
//!
//! Hestia keeps the most recent value for every symbol and notifies its
//! listeners on each update. Views connected through [Hestia::connect_view]
//! get their recalculation worker triggered whenever a value moves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use rand::thread_rng;
use rand_distr::{Distribution, Uniform};

use crate::view::View;

type ChangeListener = Box<dyn Fn() + Send + Sync>;

pub struct Hestia {
    values: Mutex<HashMap<String, f64>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl Hestia {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Seeds a value for every symbol from a uniform price distribution.
    pub fn random(symbols: Vec<&str>) -> Self {
        let price_dist = Uniform::new(90.0, 100.0);
        let mut rng = thread_rng();

        let source = Self::new();
        for symbol in symbols {
            source.set(symbol, price_dist.sample(&mut rng));
        }
        source
    }

    pub fn set(&self, symbol: impl Into<String>, value: f64) {
        {
            let mut values = self.values.lock().unwrap();
            values.insert(symbol.into(), value);
        }
        // Notify outside the value lock so a listener can read back.
        let listeners = self.listeners.lock().unwrap();
        for listener in listeners.iter() {
            listener();
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.values.lock().unwrap().get(symbol).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, f64> {
        self.values.lock().unwrap().clone()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.values.lock().unwrap().keys().cloned().collect()
    }

    pub fn add_listener(&self, listener: ChangeListener) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Wires value changes to the view's recalculation trigger. The view is
    /// held weakly so a stopped view can be dropped while the feed lives on.
    pub fn connect_view(&self, view: &Arc<View>) {
        let weak: Weak<View> = Arc::downgrade(view);
        self.add_listener(Box::new(move || {
            if let Some(view) = weak.upgrade() {
                view.live_data_changed();
            }
        }));
    }
}

impl Default for Hestia {
    fn default() -> Self {
        Self::new()
    }
}
