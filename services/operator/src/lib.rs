//! gamefleet operator
//!
//! Keeps a pool of warm game servers per fleet and gives every game server a
//! unique set of host ports.
//!
//! ## Architecture
//!
//! - **Fleet reconciler**: counts instances per state, replaces crashed and
//!   completed ones, scales the standingBy pool and publishes fleet status
//! - **Instance reconciler**: creates the backing pod, records process exit,
//!   keeps the eviction annotation current and publishes the public address
//! - **Port registry**: host ports, allocated at instance creation and
//!   released by the instance finalizer
//! - **Pending ledgers**: creations and deletions not yet visible through the
//!   lagging cache; a fleet is not scaled until its ledgers settle
//!
//! ## Modules
//!
//! - `store`: object store traits and the in-memory store
//! - `controller`: work queue and worker pool driving a reconciler
//! - `operator`: wiring, event routing and periodic resync

pub mod address;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod fleet;
pub mod instance;
pub mod operator;
pub mod pod;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use error::ReconcileError;
pub use fleet::FleetReconciler;
pub use instance::InstanceReconciler;
pub use operator::Operator;
pub use store::MemoryStore;
