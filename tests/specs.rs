//! Behavioral specifications for the routing pipeline.
//!
//! These tests drive the router, processor, and dispatcher loops end-to-end
//! over a temporary data directory, with fake adapters standing in for the
//! container runtime, the dispatch targets, and the bookkeeper.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

#[path = "specs/prelude.rs"]
mod prelude;

// pipeline/
#[path = "specs/pipeline/dispatch.rs"]
mod pipeline_dispatch;
#[path = "specs/pipeline/processing.rs"]
mod pipeline_processing;
#[path = "specs/pipeline/routing.rs"]
mod pipeline_routing;
