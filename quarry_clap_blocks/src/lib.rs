//! Building blocks for [`clap`]-driven configs.
//!
//! They can easily be re-used using `#[clap(flatten)]`.
pub mod catalog_dsn;
pub mod dispatcher;
pub mod socket_addr;
pub mod transform;
pub mod worker;
pub mod workflow_store;
