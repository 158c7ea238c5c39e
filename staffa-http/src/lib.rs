//! Wire layer for staffa views.
//!
//! The control plane is a JSON HTTP server over a
//! [ViewProcessor](staffa::view::ViewProcessor): status and result queries,
//! start/stop actions and name resolution, addressed per named view. The
//! data plane is a topic transport carrying serialized results and deltas;
//! [bus](crate::bus) defines the transport contract and ships an in-process
//! implementation, and [publish](crate::publish) feeds a view's results onto
//! its topics so one server-side subscription point serves any number of
//! remote clients.
pub mod bus;
pub mod http;
pub mod publish;
