// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! radroute-daemon: the polling processes
//!
//! Three independently scheduled loops share nothing but the filesystem and
//! the lock protocol: the router turns completed intake groups into tasks,
//! the processor runs their module chains, and the dispatcher delivers the
//! results. Each loop polls on its own interval and drives a bounded worker
//! pool; lock contention anywhere is an immediate skip, never a wait.

pub mod dispatcher;
pub mod effects;
pub mod lifecycle;
pub mod processor;
pub mod router;

pub use dispatcher::DispatcherLoop;
pub use effects::CycleError;
pub use lifecycle::{startup, Config, Daemon, LifecycleError};
pub use processor::ProcessorLoop;
pub use router::RouterLoop;
