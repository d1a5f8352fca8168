// THEORY:
// Every tunable of the engine lives in one plain struct tree. Each component
// owns its own section and validates it when constructed; `EngineConfig`
// simply aggregates them so a host can ship a single JSON document. Missing
// fields take their documented defaults, so `{}` is a valid configuration.

use crate::core_modules::fiducial::FiducialConfig;
use crate::core_modules::quad_detector::DetectorConfig;
use crate::core_modules::quad_tracker::TrackerConfig;
use crate::core_modules::rectifier::RectifierConfig;
use crate::core_modules::stability::StabilityConfig;
use crate::error::{EngineError, Result};
use crate::pipeline::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub detector: DetectorConfig,
    pub tracker: TrackerConfig,
    pub fiducial: FiducialConfig,
    pub rectifier: RectifierConfig,
    pub stability: StabilityConfig,
    pub session: SessionConfig,
}

impl EngineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::InvalidConfig(format!("malformed JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| EngineError::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&json)?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.detector.validate()?;
        self.tracker.validate()?;
        self.fiducial.validate()?;
        self.stability.validate()?;
        self.session.validate()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::InvalidConfig(e.to_string()))
    }
}
