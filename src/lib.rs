pub mod artifacts;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod frontier;
pub mod logging;
pub mod models;
pub mod probe;
pub mod resort;
pub mod routing;
pub mod runs;
pub mod server;
pub mod state;
pub mod storage;
pub mod upload;
pub mod url_norm;

// Re-export main types for library usage
pub use coordinator::Coordinator;
pub use models::{DomainState, FileCandidate, HashRecord, SourceObservation};
pub use resort::{ConflictPolicy, ResortOptions};
pub use routing::{ElectoralPolicy, Placement, RoutingPolicy};
pub use server::build_router;
pub use state::StateStore;
