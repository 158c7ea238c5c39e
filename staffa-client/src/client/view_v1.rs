use std::sync::Arc;

use anyhow::{Error, Result};
use reqwest::blocking;

use staffa_http::http::view_v1::{
    AppState, LatestResultResponse, ListViewsResponse, MetaResponse, ResolveResponse,
    StatusResponse, TopicsResponse, ViewControl,
};

/// Control-plane client for a running view server.
#[derive(Debug)]
pub struct HttpControl {
    pub path: String,
    pub client: blocking::Client,
}

impl HttpControl {
    pub fn new(path: String) -> Self {
        Self {
            path,
            client: blocking::Client::new(),
        }
    }
}

impl ViewControl for HttpControl {
    fn list_views(&self) -> Result<ListViewsResponse> {
        Ok(self
            .client
            .get(self.path.clone() + "/views")
            .send()?
            .json::<ListViewsResponse>()?)
    }

    fn resolve_name(&self, view: &str) -> Result<ResolveResponse> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/view/{view}/resolve").as_str())
            .send()?
            .json::<ResolveResponse>()?)
    }

    fn status(&self, view: &str) -> Result<StatusResponse> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/view/{view}/status").as_str())
            .send()?
            .json::<StatusResponse>()?)
    }

    fn latest_result(&self, view: &str) -> Result<LatestResultResponse> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/view/{view}/result").as_str())
            .send()?
            .json::<LatestResultResponse>()?)
    }

    fn meta(&self, view: &str) -> Result<MetaResponse> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/view/{view}/meta").as_str())
            .send()?
            .json::<MetaResponse>()?)
    }

    fn topics(&self, view: &str) -> Result<TopicsResponse> {
        Ok(self
            .client
            .get(self.path.clone() + format!("/view/{view}/topics").as_str())
            .send()?
            .json::<TopicsResponse>()?)
    }

    fn start_live(&self, view: &str) -> Result<()> {
        Ok(self
            .client
            .post(self.path.clone() + format!("/view/{view}/start").as_str())
            .send()?
            .json::<()>()?)
    }

    fn stop_live(&self, view: &str) -> Result<()> {
        Ok(self
            .client
            .post(self.path.clone() + format!("/view/{view}/stop").as_str())
            .send()?
            .json::<()>()?)
    }
}

/// Control-plane client over in-process server state. Used for testing and
/// for embedding the server and its consumers in one process.
pub struct LocalControl {
    state: Arc<AppState>,
}

impl LocalControl {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl ViewControl for LocalControl {
    fn list_views(&self) -> Result<ListViewsResponse> {
        Ok(self.state.list_views())
    }

    fn resolve_name(&self, view: &str) -> Result<ResolveResponse> {
        Ok(self.state.resolve_name(view))
    }

    fn status(&self, view: &str) -> Result<StatusResponse> {
        self.state.status(view).map_err(Error::new)
    }

    fn latest_result(&self, view: &str) -> Result<LatestResultResponse> {
        self.state.latest_result(view).map_err(Error::new)
    }

    fn meta(&self, view: &str) -> Result<MetaResponse> {
        self.state.meta(view).map_err(Error::new)
    }

    fn topics(&self, view: &str) -> Result<TopicsResponse> {
        self.state.topics(view).map_err(Error::new)
    }

    fn start_live(&self, view: &str) -> Result<()> {
        self.state.start_live(view).map_err(Error::new)
    }

    fn stop_live(&self, view: &str) -> Result<()> {
        self.state.stop_live(view).map_err(Error::new)
    }
}
