//! Persistence for the per-device bit-rate store.
//!
//! The store itself lives in memory ([`BitRateManager`]); this module only
//! moves its snapshot to and from `bit_rates.toml` at process start and exit.
//!
//! ```toml
//! [emulator-5554]
//! current_cap = 2000000
//! reduction_count = 1
//! stability_count = 4
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mirror_core::{BitRateManager, BitRateState};
use tracing::debug;

use super::config::{config_dir, load_toml_or_default, save_toml, ConfigError};

/// Name of the bit-rate file inside the config directory.
pub const BIT_RATES_FILE_NAME: &str = "bit_rates.toml";

/// Resolves the full path to `bit_rates.toml`.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn bit_rates_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(BIT_RATES_FILE_NAME))
}

/// Loads a store from `path`; a missing file yields an empty store.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Parse`].
pub fn load_bit_rates(path: &Path) -> Result<BitRateManager, ConfigError> {
    let states: BTreeMap<String, BitRateState> = load_toml_or_default(path)?;
    debug!(devices = states.len(), path = %path.display(), "loaded bit-rate state");
    Ok(BitRateManager::from_states(states))
}

/// Writes the current contents of `manager` to `path`.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_bit_rates(path: &Path, manager: &BitRateManager) -> Result<(), ConfigError> {
    let states = manager.snapshot();
    save_toml(path, &states)?;
    debug!(devices = states.len(), path = %path.display(), "saved bit-rate state");
    Ok(())
}
