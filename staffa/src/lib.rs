//! # What is Staffa?
//!
//! Staffa turns a one-shot "compute these outputs" request into a
//! continuously re-evaluated, multi-subscriber live feed. A named
//! [View](crate::view::View) owns the most recent result and a background
//! recalculation worker that re-runs a computation cycle whenever upstream
//! data changes. Subscribers attach through a
//! [ViewClient](crate::view::ViewClient) which can go live, pause (merging
//! intermediate results into a single delta) and stop independently of every
//! other subscriber. The worker exists only while at least one subscriber
//! wants live results.
//!
//! # Implementation
//!
//! A running view is composed of:
//! - An input, [Hestia](crate::input::hestia::Hestia) is the bundled
//!   example. The input holds the last known value for every piece of live
//!   data and notifies the view when something changes.
//! - A computation cycle, the [ComputationCycle](crate::cycle::ComputationCycle)
//!   trait. The cycle evaluates everything the view outputs and returns a
//!   full snapshot. Staffa does not care how the cycle computes its values,
//!   only that it can be re-run on demand and that a single failed run is
//!   survivable.
//! - The scheduler in [view](crate::view): the view itself, the per-view
//!   recalculation worker, the per-subscriber client state machine, and the
//!   processor that registers views by name.
//!
//! The HTTP control plane and the topic-based result feeds live in the
//! staffa-http crate; remote proxies presenting this same contract from
//! another process live in staffa-client.
pub mod cycle;
pub mod input;
pub mod result;
pub mod view;
