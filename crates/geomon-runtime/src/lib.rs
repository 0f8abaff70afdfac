//! Geomon runtime - deterministic streaming scheduler and the
//! geometric-method protocol kernel.
//!
//! The runtime drives records from a data source through an event/rule
//! engine into the installed monitoring methods: the SGM protocol
//! network, the TODS baseline, and the exact estimators. Everything is
//! single-threaded and fully deterministic under a fixed seed.

pub mod accurate;
pub mod channels;
pub mod config;
pub mod context;
pub mod gm;
pub mod query;
pub mod results;
pub mod source;
pub mod tods;

pub use config::{ConfigError, SimulationConfig};
pub use context::{RuleHandle, Sim, SimEvent};
pub use gm::sgm::SgmNetwork;
pub use gm::{CompressedState, GmProtocol, ProtocolConfig, ProtocolKind, Rebalancing};
pub use query::{ContinuousQuery, QueryState, SelfJoinQuery, TwoWayJoinQuery};
pub use source::{DataSource, Dataset, DsMetadata};
