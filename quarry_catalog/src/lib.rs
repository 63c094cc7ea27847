//! The quarry catalog which keeps track of the columns of every table and of the partitions
//! produced for it by the transformation step.
//!
//! Two implementations of [`interface::Catalog`] are provided: [`postgres::PostgresCatalog`] for
//! production and [`mem::MemCatalog`] for tests and single process deployments.
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;
pub mod postgres;
pub mod retry;
