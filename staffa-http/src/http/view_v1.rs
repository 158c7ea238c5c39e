use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use staffa::cycle::{ComputationCycle, SnapshotCycle};
use staffa::input::hestia::Hestia;
use staffa::result::ResultModel;
use staffa::view::{View, ViewError, ViewProcessor};

use crate::bus::MessageBus;
use crate::publish::ViewPublisher;

pub fn result_topic(view: &str) -> String {
    format!("view.{view}.result")
}

pub fn delta_topic(view: &str) -> String {
    format!("view.{view}.delta")
}

pub fn snapshot_topic(view: &str) -> String {
    format!("view.{view}.snapshot")
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusResponse {
    pub view: String,
    pub live_computation_running: bool,
    pub result_available: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LatestResultResponse {
    pub result: Option<ResultModel>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct MetaResponse {
    pub view: String,
    pub required_outputs: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListViewsResponse {
    pub available: Vec<String>,
    pub live: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ResolveResponse {
    pub canonical_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct TopicsResponse {
    pub result_topic: String,
    pub delta_topic: String,
    pub snapshot_topic: String,
}

#[derive(Debug)]
pub enum ViewHttpError {
    UnknownView,
    ProcessorStopped,
}

impl std::error::Error for ViewHttpError {}

impl core::fmt::Display for ViewHttpError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ViewHttpError::UnknownView => write!(f, "UnknownView"),
            ViewHttpError::ProcessorStopped => write!(f, "ProcessorStopped"),
        }
    }
}

impl actix_web::ResponseError for ViewHttpError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            ViewHttpError::UnknownView => actix_web::http::StatusCode::BAD_REQUEST,
            ViewHttpError::ProcessorStopped => actix_web::http::StatusCode::BAD_REQUEST,
        }
    }
}

fn stopped(_: ViewError) -> ViewHttpError {
    ViewHttpError::ProcessorStopped
}

/// The blocking client-side contract over the control plane, implemented by
/// the HTTP and in-process clients in the staffa-client crate.
pub trait ViewControl: Send + Sync {
    fn list_views(&self) -> Result<ListViewsResponse>;
    fn resolve_name(&self, view: &str) -> Result<ResolveResponse>;
    fn status(&self, view: &str) -> Result<StatusResponse>;
    fn latest_result(&self, view: &str) -> Result<LatestResultResponse>;
    fn meta(&self, view: &str) -> Result<MetaResponse>;
    fn topics(&self, view: &str) -> Result<TopicsResponse>;
    fn start_live(&self, view: &str) -> Result<()>;
    fn stop_live(&self, view: &str) -> Result<()>;
}

type ViewWiring = Box<dyn Fn(&Arc<View>) + Send + Sync>;

/// Everything behind the control plane: the processor, the data-plane bus,
/// and one lazily-created publisher per view. Internally synchronized, so
/// handlers share it without an outer lock.
pub struct AppState {
    processor: Arc<ViewProcessor>,
    bus: Arc<dyn MessageBus>,
    publishers: Mutex<HashMap<String, Arc<ViewPublisher>>>,
    wiring: ViewWiring,
}

impl AppState {
    pub fn new(processor: Arc<ViewProcessor>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            processor,
            bus,
            publishers: Mutex::new(HashMap::new()),
            wiring: Box::new(|_| {}),
        }
    }

    /// Single-source state: every view snapshots the same live-data table,
    /// and each view is wired to recompute when the table changes.
    pub fn with_source(source: Arc<Hestia>, bus: Arc<dyn MessageBus>) -> Self {
        let cycle_source = source.clone();
        let processor = Arc::new(ViewProcessor::new(move |_| {
            let cycle: Arc<dyn ComputationCycle> =
                Arc::new(SnapshotCycle::new(cycle_source.clone()));
            cycle
        }));
        let mut state = Self::new(processor, bus);
        state.wiring = Box::new(move |view| source.connect_view(view));
        state
    }

    pub fn processor(&self) -> &Arc<ViewProcessor> {
        &self.processor
    }

    fn view(&self, name: &str) -> Result<Arc<View>, ViewHttpError> {
        self.processor
            .get_view(name)
            .ok_or(ViewHttpError::UnknownView)
    }

    fn publisher_for(&self, view: &Arc<View>) -> Result<Arc<ViewPublisher>, ViewHttpError> {
        let mut publishers = self.publishers.lock().unwrap();
        if let Some(publisher) = publishers.get(view.name()) {
            return Ok(publisher.clone());
        }
        let publisher = ViewPublisher::attach(view, self.bus.clone()).map_err(stopped)?;
        (self.wiring)(view);
        publishers.insert(view.name().to_string(), publisher.clone());
        Ok(publisher)
    }

    pub fn list_views(&self) -> ListViewsResponse {
        ListViewsResponse {
            available: self.processor.view_names(),
            live: self.processor.live_view_names(),
        }
    }

    pub fn resolve_name(&self, name: &str) -> ResolveResponse {
        ResolveResponse {
            canonical_name: ViewProcessor::canonical_name(name),
        }
    }

    pub fn status(&self, name: &str) -> Result<StatusResponse, ViewHttpError> {
        let view = self.view(name)?;
        Ok(StatusResponse {
            view: view.name().to_string(),
            live_computation_running: view.is_live_computation_running(),
            result_available: view.is_result_available(),
        })
    }

    pub fn latest_result(&self, name: &str) -> Result<LatestResultResponse, ViewHttpError> {
        let view = self.view(name)?;
        Ok(LatestResultResponse {
            result: view.latest_result().map(|result| result.as_ref().clone()),
        })
    }

    pub fn meta(&self, name: &str) -> Result<MetaResponse, ViewHttpError> {
        let view = self.view(name)?;
        let mut required_outputs = view.required_outputs();
        required_outputs.sort();
        Ok(MetaResponse {
            view: view.name().to_string(),
            required_outputs,
        })
    }

    /// Also ensures the view's publisher (and with it the snapshot
    /// responder) exists, so a subscriber can fetch a snapshot before the
    /// first start.
    pub fn topics(&self, name: &str) -> Result<TopicsResponse, ViewHttpError> {
        let view = self.processor.get_or_create_view(name).map_err(stopped)?;
        self.publisher_for(&view)?;
        Ok(TopicsResponse {
            result_topic: result_topic(view.name()),
            delta_topic: delta_topic(view.name()),
            snapshot_topic: snapshot_topic(view.name()),
        })
    }

    pub fn start_live(&self, name: &str) -> Result<(), ViewHttpError> {
        let view = self.processor.get_or_create_view(name).map_err(stopped)?;
        let publisher = self.publisher_for(&view)?;
        publisher.start_live().map_err(stopped)
    }

    pub fn stop_live(&self, name: &str) -> Result<(), ViewHttpError> {
        let view = self.view(name)?;
        let publisher = self.publishers.lock().unwrap().get(view.name()).cloned();
        match publisher {
            Some(publisher) => publisher.stop_live().map_err(stopped),
            // Never started through this control plane.
            None => Ok(()),
        }
    }

    /// Shuts the whole state down: every publisher, then the processor and
    /// with it every view and worker. For embedding code; deliberately not
    /// exposed as an endpoint.
    pub fn stop(&self) {
        let publishers = std::mem::take(&mut *self.publishers.lock().unwrap());
        for publisher in publishers.into_values() {
            publisher.shutdown();
        }
        self.processor.stop();
    }
}

pub mod server {
    use actix_web::{get, post, web};

    use super::{
        AppState, LatestResultResponse, ListViewsResponse, MetaResponse, ResolveResponse,
        StatusResponse, TopicsResponse, ViewHttpError,
    };

    #[get("/views")]
    pub async fn list_views(app: web::Data<AppState>) -> web::Json<ListViewsResponse> {
        web::Json(app.list_views())
    }

    #[get("/view/{name}/resolve")]
    pub async fn resolve_name(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> web::Json<ResolveResponse> {
        let (name,) = path.into_inner();
        web::Json(app.resolve_name(&name))
    }

    #[get("/view/{name}/status")]
    pub async fn status(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<StatusResponse>, ViewHttpError> {
        let (name,) = path.into_inner();
        Ok(web::Json(app.status(&name)?))
    }

    #[get("/view/{name}/result")]
    pub async fn latest_result(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<LatestResultResponse>, ViewHttpError> {
        let (name,) = path.into_inner();
        Ok(web::Json(app.latest_result(&name)?))
    }

    #[get("/view/{name}/meta")]
    pub async fn meta(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<MetaResponse>, ViewHttpError> {
        let (name,) = path.into_inner();
        Ok(web::Json(app.meta(&name)?))
    }

    #[get("/view/{name}/topics")]
    pub async fn topics(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<TopicsResponse>, ViewHttpError> {
        let (name,) = path.into_inner();
        Ok(web::Json(app.topics(&name)?))
    }

    #[post("/view/{name}/start")]
    pub async fn start_live(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<()>, ViewHttpError> {
        let (name,) = path.into_inner();
        app.start_live(&name)?;
        Ok(web::Json(()))
    }

    #[post("/view/{name}/stop")]
    pub async fn stop_live(
        app: web::Data<AppState>,
        path: web::Path<(String,)>,
    ) -> Result<web::Json<()>, ViewHttpError> {
        let (name,) = path.into_inner();
        app.stop_live(&name)?;
        Ok(web::Json(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use actix_web::{test, web, App};

    use staffa::input::hestia::Hestia;

    use super::server::*;
    use super::{
        AppState, LatestResultResponse, ListViewsResponse, ResolveResponse, StatusResponse,
    };
    use crate::bus::LocalBus;

    #[actix_web::test]
    async fn test_view_control_loop() {
        let source = Arc::new(Hestia::new());
        source.set("p1", 1.0);
        source.set("p2", 2.0);

        let state = AppState::with_source(source.clone(), LocalBus::new());
        let app_state = web::Data::new(state);

        let app = test::init_service(
            App::new()
                .app_data(app_state.clone())
                .service(list_views)
                .service(resolve_name)
                .service(status)
                .service(latest_result)
                .service(meta)
                .service(topics)
                .service(start_live)
                .service(stop_live),
        )
        .await;

        // Queries against a view nobody has started are client errors.
        let req = test::TestRequest::get().uri("/view/risk/status").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());

        let req = test::TestRequest::get().uri("/view/RISK/resolve").to_request();
        let resp: ResolveResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.canonical_name, "risk");

        let req = test::TestRequest::post().uri("/view/RISK/start").to_request();
        test::call_and_read_body(&app, req).await;

        let req = test::TestRequest::get().uri("/view/risk/status").to_request();
        let resp: StatusResponse = test::call_and_read_body_json(&app, req).await;
        assert!(resp.live_computation_running);

        // The first cycle lands shortly after the start.
        let mut result = None;
        for _ in 0..100 {
            let req = test::TestRequest::get().uri("/view/risk/result").to_request();
            let resp: LatestResultResponse = test::call_and_read_body_json(&app, req).await;
            if resp.result.is_some() {
                result = resp.result;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let result = result.expect("no result after start");
        assert_eq!(result.get("p1"), Some(1.0));
        assert_eq!(result.get("p2"), Some(2.0));

        let req = test::TestRequest::get().uri("/views").to_request();
        let resp: ListViewsResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(resp.available, vec!["risk".to_string()]);
        assert_eq!(resp.live, vec!["risk".to_string()]);

        let req = test::TestRequest::post().uri("/view/risk/stop").to_request();
        test::call_and_read_body(&app, req).await;

        let req = test::TestRequest::get().uri("/view/risk/status").to_request();
        let resp: StatusResponse = test::call_and_read_body_json(&app, req).await;
        assert!(!resp.live_computation_running);
        // The last result survives the stop.
        assert!(resp.result_available);

        app_state.stop();
    }
}
