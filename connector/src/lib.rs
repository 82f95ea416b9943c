//! Data retrieval connector: a forwarding proxy for the upstream query API
//! plus paginated extraction of the built-in tables.

pub mod app;
pub mod client;
pub mod datasets;
pub mod model;
pub mod pages;
pub mod periods;
pub mod proxy;
pub mod tables;

pub use app::App;
