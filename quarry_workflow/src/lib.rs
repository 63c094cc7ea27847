//! The durable ingest workflow.
//!
//! Runs are persisted in a [`interface::WorkflowStore`]; the dispatcher starts them, and
//! [`worker::IngestWorker`]s claim and execute them:
//!
//! 1. the transform step runs the transformation binary through the
//!    [`activity::IngestActivities`] and commits its output to the run,
//! 2. the record step stores the partition in the catalog and completes the run.
//!
//! A run is resumed from its last committed state when the worker executing it goes away.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod activity;
pub mod interface;
pub mod mem;
pub mod postgres;
pub mod worker;

#[cfg(any(test, feature = "test_helpers"))]
pub mod interface_tests;
