//! Adaptive baseline cache.
//!
//! Per-detector learned parameters (audio noise floor, capacitive
//! occupancy levels) persist as small JSON files under
//! `<data_dir>/baselines/` and reload at startup. Anything missing or
//! corrupt rebuilds from scratch — the cache is an optimization, never a
//! source of truth.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;
use crate::events::DetectorId;

pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("baselines"),
        }
    }

    fn path_for(&self, detector: DetectorId) -> PathBuf {
        self.dir.join(format!("{detector}.json"))
    }

    /// Load the stored parameters; missing or unparsable files are empty.
    pub fn load(&self, detector: DetectorId) -> BTreeMap<String, f64> {
        let path = self.path_for(detector);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => {
                debug!(?path, "no baseline file — starting fresh");
                return BTreeMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(params) => params,
            Err(e) => {
                warn!(?path, error = %e, "corrupt baseline file, rebuilding");
                BTreeMap::new()
            }
        }
    }

    pub fn get(&self, detector: DetectorId, key: &str) -> Option<f64> {
        self.load(detector).get(key).copied()
    }

    /// Persist atomically: write a sibling temp file, then rename over.
    pub fn save(&self, detector: DetectorId, params: &BTreeMap<String, f64>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(detector);
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(params)
            .map_err(|e| crate::error::NightwatchError::Other(e.into()))?;
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        debug!(?path, keys = params.len(), "baseline saved");
        Ok(())
    }
}
