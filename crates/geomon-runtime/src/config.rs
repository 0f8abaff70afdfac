//! Configuration of a monitoring run.
//!
//! The recognized options of the structured config document, as serde
//! structs, plus the factories that turn a validated config into live
//! queries and networks. Unknown or missing options are configuration
//! errors and fatal at init.

use crate::gm::{ProtocolConfig, ProtocolKind, Rebalancing};
use crate::query::{ContinuousQuery, SelfJoinQuery, TwoWayJoinQuery};
use crate::gm::sgm::SgmNetwork;
use crate::source::{DataSource, Dataset, GeneratorConfig, SourceError, SyntheticSource};
use geomon_core::agms::Projection;
use geomon_core::types::{Key, SourceId, StreamId};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing option `{0}`")]
    MissingOption(&'static str),

    #[error("invalid value for `{option}`: {reason}")]
    InvalidValue {
        option: &'static str,
        reason: String,
    },

    #[error("protocol {0} is recognized but not implemented; use SGM")]
    UnsupportedProtocol(ProtocolKind),

    #[error(transparent)]
    Source(#[from] SourceError),
}

fn default_name() -> String {
    "gm".to_string()
}

fn default_seed() -> u64 {
    20_250_801
}

/// Top-level configuration of one simulation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    /// Component instance name, used in result rows.
    #[serde(default = "default_name")]
    pub name: String,

    /// Master seed for every pseudo-random choice of the run.
    #[serde(default = "default_seed")]
    pub seed: u64,

    pub query: QueryConfig,
    pub projection: ProjectionConfig,

    #[serde(default)]
    pub protocol: ProtocolSection,

    #[serde(default)]
    pub rebalance_algorithm: Rebalancing,

    /// Safe-zone width parameter.
    pub theta: f64,

    #[serde(default)]
    pub dataset: DatasetConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    SelfJoin,
    TwowayJoin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    #[serde(rename = "type")]
    pub kind: QueryKind,
    pub stream: Option<StreamId>,
    pub stream1: Option<StreamId>,
    pub stream2: Option<StreamId>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectionConfig {
    pub depth: usize,
    pub width: usize,
    pub seed: u64,
}

/// The `protocol` section: variant selection plus the family knobs.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolSection {
    pub name: ProtocolKind,
    pub eikonal: bool,
    /// FGM only; accepted for every variant.
    pub use_cost_model: bool,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            name: ProtocolKind::Sgm,
            eikonal: true,
            use_cost_model: true,
        }
    }
}

impl ProtocolSection {
    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            eikonal: self.eikonal,
            use_cost_model: self.use_cost_model,
        }
    }
}

/// Dataset shaping options and the optional synthetic generator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetConfig {
    pub name: Option<String>,
    pub max_length: Option<usize>,
    pub hash_streams: Option<StreamId>,
    pub hash_sources: Option<SourceId>,
    pub time_window: Option<i64>,
    pub warmup_size: usize,
    pub generator: Option<GeneratorSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorSection {
    pub length: usize,
    #[serde(default = "one")]
    pub streams: StreamId,
    #[serde(default = "one")]
    pub sources: SourceId,
    pub key_domain: Key,
    #[serde(default)]
    pub skew: f64,
    pub seed: Option<u64>,
}

fn one() -> u32 {
    1
}

impl SimulationConfig {
    /// Check the document for inconsistencies. Everything reported here
    /// is fatal at init.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.theta > 0.0) {
            return Err(ConfigError::InvalidValue {
                option: "theta",
                reason: format!("must be positive, got {}", self.theta),
            });
        }
        if self.projection.depth == 0 || self.projection.width == 0 {
            return Err(ConfigError::InvalidValue {
                option: "projection",
                reason: "depth and width must be positive".to_string(),
            });
        }
        match self.query.kind {
            QueryKind::SelfJoin => {
                if self.query.stream.is_none() {
                    return Err(ConfigError::MissingOption("query.stream"));
                }
            }
            QueryKind::TwowayJoin => {
                let (s1, s2) = match (self.query.stream1, self.query.stream2) {
                    (Some(s1), Some(s2)) => (s1, s2),
                    (None, _) => return Err(ConfigError::MissingOption("query.stream1")),
                    (_, None) => return Err(ConfigError::MissingOption("query.stream2")),
                };
                if s1 == s2 {
                    return Err(ConfigError::InvalidValue {
                        option: "query.stream2",
                        reason: "the two join streams must differ".to_string(),
                    });
                }
            }
        }
        if self.protocol.name != ProtocolKind::Sgm {
            return Err(ConfigError::UnsupportedProtocol(self.protocol.name));
        }
        Ok(())
    }

    pub fn projection(&self) -> Projection {
        Projection::new(
            self.projection.depth,
            self.projection.width,
            self.projection.seed,
        )
    }

    /// Build the continuous query this config describes.
    pub fn build_query(&self) -> Result<Box<dyn ContinuousQuery>, ConfigError> {
        self.validate()?;
        let proj = self.projection();
        let config = self.protocol.protocol_config();
        Ok(match self.query.kind {
            QueryKind::SelfJoin => Box::new(SelfJoinQuery {
                sid: self.query.stream.expect("validated"),
                proj,
                theta: self.theta,
                config,
            }),
            QueryKind::TwowayJoin => Box::new(TwoWayJoinQuery {
                sid1: self.query.stream1.expect("validated"),
                sid2: self.query.stream2.expect("validated"),
                proj,
                theta: self.theta,
                config,
            }),
        })
    }

    /// Build the protocol network over the given sites.
    pub fn build_network(
        &self,
        sources: impl IntoIterator<Item = SourceId>,
    ) -> Result<SgmNetwork, ConfigError> {
        let query = self.build_query()?;
        Ok(SgmNetwork::new(
            self.name.clone(),
            query,
            self.rebalance_algorithm,
            sources,
            self.seed,
        ))
    }

    /// Shape a dataset builder around a raw source.
    pub fn shape_dataset(&self, src: Box<dyn DataSource>) -> Dataset {
        let name = self
            .dataset
            .name
            .clone()
            .unwrap_or_else(|| self.name.clone());
        let mut ds = Dataset::new(name)
            .load(src)
            .set_warmup_size(self.dataset.warmup_size);
        if let Some(n) = self.dataset.max_length {
            ds = ds.set_max_length(n);
        }
        if let Some(h) = self.dataset.hash_streams {
            ds = ds.set_hash_streams(h);
        }
        if let Some(h) = self.dataset.hash_sources {
            ds = ds.set_hash_sources(h);
        }
        if let Some(tw) = self.dataset.time_window {
            ds = ds.set_time_window(tw);
        }
        ds
    }

    /// Build the configured synthetic source, if the document declares
    /// one.
    pub fn build_generator(&self) -> Result<Option<SyntheticSource>, ConfigError> {
        let Some(gen) = &self.dataset.generator else {
            return Ok(None);
        };
        let src = SyntheticSource::new(GeneratorConfig {
            length: gen.length,
            streams: gen.streams,
            sources: gen.sources,
            key_domain: gen.key_domain,
            skew: gen.skew,
            seed: gen.seed.unwrap_or(self.seed),
        })?;
        Ok(Some(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
name: sj16
seed: 42
query:
  type: self_join
  stream: 0
projection:
  depth: 5
  width: 16
  seed: 1138
protocol:
  name: SGM
  eikonal: false
rebalance_algorithm: random_limits
theta: 0.1
dataset:
  warmup_size: 100
  generator:
    length: 1000
    sources: 4
    key_domain: 256
    skew: 1.2
"#;

    #[test]
    fn full_document_parses() {
        let cfg: SimulationConfig = serde_yaml::from_str(FULL).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.name, "sj16");
        assert_eq!(cfg.rebalance_algorithm, Rebalancing::RandomLimits);
        assert!(!cfg.protocol.eikonal);
        assert!(cfg.protocol.use_cost_model);
        assert_eq!(cfg.dataset.warmup_size, 100);
        let gen = cfg.build_generator().unwrap().unwrap();
        drop(gen);
        let q = cfg.build_query().unwrap();
        assert_eq!(q.state_vector_size(), 80);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let doc = "name: x\nquery:\n  type: self_join\n  stream: 0\n\
                   projection: {depth: 5, width: 16, seed: 1}\ntheta: 0.1\nbogus: 1\n";
        assert!(serde_yaml::from_str::<SimulationConfig>(doc).is_err());
    }

    #[test]
    fn self_join_requires_stream() {
        let doc = "query:\n  type: self_join\n\
                   projection: {depth: 5, width: 16, seed: 1}\ntheta: 0.1\n";
        let cfg: SimulationConfig = serde_yaml::from_str(doc).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingOption("query.stream"))
        ));
    }

    #[test]
    fn twoway_join_requires_distinct_streams() {
        let doc = "query:\n  type: twoway_join\n  stream1: 3\n  stream2: 3\n\
                   projection: {depth: 5, width: 16, seed: 1}\ntheta: 0.1\n";
        let cfg: SimulationConfig = serde_yaml::from_str(doc).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidValue { option: "query.stream2", .. })
        ));
    }

    #[test]
    fn fgm_is_recognized_but_rejected() {
        let doc = "query:\n  type: self_join\n  stream: 0\n\
                   projection: {depth: 5, width: 16, seed: 1}\ntheta: 0.1\n\
                   protocol: {name: FGM}\n";
        let cfg: SimulationConfig = serde_yaml::from_str(doc).unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnsupportedProtocol(ProtocolKind::Fgm))
        ));
    }

    #[test]
    fn theta_must_be_positive() {
        let doc = "query:\n  type: self_join\n  stream: 0\n\
                   projection: {depth: 5, width: 16, seed: 1}\ntheta: 0.0\n";
        let cfg: SimulationConfig = serde_yaml::from_str(doc).unwrap();
        assert!(cfg.validate().is_err());
    }
}
