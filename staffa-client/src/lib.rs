//! Clients for remote staffa views.
//!
//! [client](crate::client) holds the control-plane implementations of
//! [ViewControl](staffa_http::http::view_v1::ViewControl): an HTTP client
//! for a running view server and an in-process client over the same server
//! state, useful for testing and for embedding. [remote](crate::remote)
//! builds the process-boundary proxies on top: a remote view processor and
//! per-view remote clients that multiplex any number of local listeners
//! onto one data-plane subscription per topic.
pub mod client;
pub mod remote;
