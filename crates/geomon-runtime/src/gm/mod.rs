//! Protocol kernel common to the geometric-method family.

pub mod sgm;

use serde::Deserialize;
use std::fmt;

/// A drift (or state) vector paired with the number of raw updates it
/// aggregates. On the wire the sender ships whichever is smaller: the
/// full float32 vector or the raw update log.
#[derive(Debug, Clone)]
pub struct CompressedState {
    pub vec: Vec<f64>,
    pub updates: usize,
}

impl CompressedState {
    pub fn byte_size(&self) -> usize {
        // State vectors travel as float32; raw updates as 32-bit keys.
        (self.vec.len() * 4).min(self.updates * 4)
    }
}

/// The protocol variants of the geometric-method family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ProtocolKind {
    #[serde(rename = "SGM")]
    Sgm,
    #[serde(rename = "FGM")]
    Fgm,
    #[serde(rename = "FRGM")]
    Frgm,
}

impl ProtocolKind {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Sgm => "SGM",
            ProtocolKind::Fgm => "FGM",
            ProtocolKind::Frgm => "FRGM",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rebalancing strategy applied when a local violation arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rebalancing {
    /// Finish the round immediately.
    #[default]
    None,
    /// Grow a balancing set in a deterministic random order until its
    /// mean drift is admissible.
    Random,
    /// Like `Random`, with limits on the balancing-set size per
    /// sub-round and per round.
    RandomLimits,
}

/// Protocol-level knobs shared by the family.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Select the eikonal safe-zone variant.
    pub eikonal: bool,
    /// Use the cost model where the protocol supports one.
    pub use_cost_model: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            eikonal: true,
            use_cost_model: true,
        }
    }
}

/// Contract shared by the family's coordinators. The variants differ in
/// how violations and rebalancing are handled, not in the round
/// lifecycle itself.
pub trait GmProtocol {
    fn protocol_name(&self) -> &'static str;

    /// Broadcast a fresh safe zone built from the current estimate and
    /// reset every site.
    fn start_round(&mut self);

    /// React to a site reporting `Z(U_i) ≤ 0`.
    fn on_local_violation(&mut self, site: usize);

    /// Absorb a drift snapshot pulled from a site.
    fn on_drift_report(&mut self, site: usize, state: CompressedState);

    /// Collect outstanding drifts, move the estimate, and open the next
    /// round.
    fn finish_round(&mut self);
}
