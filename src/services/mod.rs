//! Implementations of the external query and entity-search services

pub mod fixture;
pub mod nerdgraph;

pub use fixture::FixtureService;
pub use nerdgraph::NerdGraphClient;
