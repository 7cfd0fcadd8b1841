// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Adapters for external I/O: processing-runner backends, target protocol
//! handlers, and the bookkeeper client

pub mod bookkeeper;
pub mod runner;
pub mod target;

pub use bookkeeper::{Bookkeeper, HttpBookkeeper, JournalBookkeeper};
pub use runner::{
    ClusterScheduler, ContainerEngine, ProcessRunner, RunOutcome, RunRequest, RunnerBackend,
    RunnerError,
};
pub use target::{FolderTarget, PushError, TargetChannel, TargetHandler, TargetRegistry};

// Test support - only compiled for tests or when explicitly requested
#[cfg(any(test, feature = "test-support"))]
pub use bookkeeper::FakeBookkeeper;
#[cfg(any(test, feature = "test-support"))]
pub use runner::{FakeRunner, RunnerCall};
#[cfg(any(test, feature = "test-support"))]
pub use target::{FakeTarget, PushCall};
