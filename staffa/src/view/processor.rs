use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::info;

use crate::cycle::ComputationCycle;

use super::{View, ViewError};

type CycleFactory = Box<dyn Fn(&str) -> Arc<dyn ComputationCycle> + Send + Sync>;

struct ProcessorInner {
    views: HashMap<String, Arc<View>>,
    stopped: bool,
}

/// Registry of views by name. Owns process-wide start/stop: stopping the
/// processor terminates every view and every client attached to them.
pub struct ViewProcessor {
    inner: Mutex<ProcessorInner>,
    cycles: CycleFactory,
}

impl ViewProcessor {
    /// The factory maps a canonical view name to the computation cycle that
    /// evaluates it, and runs once per view on first access.
    pub fn new(
        cycles: impl Fn(&str) -> Arc<dyn ComputationCycle> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(ProcessorInner {
                views: HashMap::new(),
                stopped: false,
            }),
            cycles: Box::new(cycles),
        }
    }

    /// View names are case-insensitive; surrounding whitespace is ignored.
    pub fn canonical_name(name: &str) -> String {
        name.trim().to_lowercase()
    }

    /// Returns the view registered under the name, creating it on first
    /// access. Concurrent calls with the same name observe one instance.
    pub fn get_or_create_view(&self, name: &str) -> Result<Arc<View>, ViewError> {
        let canonical = Self::canonical_name(name);
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return Err(ViewError::ProcessorStopped);
        }
        if let Some(view) = inner.views.get(&canonical) {
            return Ok(view.clone());
        }
        info!("PROCESSOR: creating view {canonical}");
        let cycle = (self.cycles)(&canonical);
        let view = View::new(canonical.clone(), cycle);
        inner.views.insert(canonical, view.clone());
        Ok(view)
    }

    pub fn get_view(&self, name: &str) -> Option<Arc<View>> {
        let canonical = Self::canonical_name(name);
        self.inner.lock().unwrap().views.get(&canonical).cloned()
    }

    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().unwrap().views.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn live_view_names(&self) -> Vec<String> {
        let views: Vec<Arc<View>> = self.inner.lock().unwrap().views.values().cloned().collect();
        let mut names: Vec<String> = views
            .into_iter()
            .filter(|view| view.is_live_computation_running())
            .map(|view| view.name().to_string())
            .collect();
        names.sort();
        names
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().unwrap().stopped
    }

    /// Stops every managed view, blocking until every recalculation worker
    /// has exited. The processor accepts no further view creation.
    pub fn stop(&self) {
        let views = {
            let mut inner = self.inner.lock().unwrap();
            inner.stopped = true;
            std::mem::take(&mut inner.views)
        };
        info!("PROCESSOR: stopping {} views", views.len());
        for view in views.into_values() {
            view.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::ViewProcessor;
    use crate::cycle::SnapshotCycle;
    use crate::input::hestia::Hestia;
    use crate::view::{ClientState, ViewError};

    fn processor(source: Arc<Hestia>) -> ViewProcessor {
        ViewProcessor::new(move |_| Arc::new(SnapshotCycle::new(source.clone())))
    }

    #[test]
    fn get_or_create_is_idempotent_and_alias_insensitive() {
        let processor = processor(Arc::new(Hestia::random(vec!["p1"])));
        let a = processor.get_or_create_view("PnL").unwrap();
        let b = processor.get_or_create_view(" pnl ").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(processor.view_names(), vec!["pnl".to_string()]);
    }

    #[test]
    fn live_view_names_track_running_jobs() {
        let processor = processor(Arc::new(Hestia::random(vec!["p1"])));
        let risk = processor.get_or_create_view("risk").unwrap();
        processor.get_or_create_view("pnl").unwrap();

        let client = risk.create_client("alice").unwrap();
        client.start_live().unwrap();
        assert_eq!(processor.live_view_names(), vec!["risk".to_string()]);

        client.stop_live().unwrap();
        assert!(processor.live_view_names().is_empty());
    }

    #[test]
    fn stop_cascades_to_every_view_and_client() {
        let processor = processor(Arc::new(Hestia::random(vec!["p1"])));
        let view = processor.get_or_create_view("risk").unwrap();
        let a = view.create_client("alice").unwrap();
        let b = view.create_client("bob").unwrap();
        a.start_live().unwrap();
        b.start_live().unwrap();

        processor.stop();

        assert!(processor.is_stopped());
        assert_eq!(a.state(), ClientState::Terminated);
        assert_eq!(b.state(), ClientState::Terminated);
        assert!(!view.is_live_computation_running());
        assert!(matches!(
            processor.get_or_create_view("risk"),
            Err(ViewError::ProcessorStopped)
        ));
        assert!(processor.get_view("risk").is_none());
    }
}
