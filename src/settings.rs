//! Persisted coordinator settings.
//!
//! Stored as a TOML file next to the rest of the application configuration.
//! Every field has a default so a partial file (or none at all) still yields
//! a usable configuration. Components read settings at use time through a
//! shared [`SettingsHandle`], so edits take effect without a restart.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_min_delay_speed_to_sync() -> u64 {
    60
}

fn default_max_delay_speed_to_sync() -> u64 {
    3000
}

fn default_speed_to_sync_duration() -> u64 {
    1000
}

fn default_min_delay_skip_to_sync() -> u64 {
    400
}

fn default_time_sync_device() -> String {
    "server".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Open direct peer data channels for clock sampling.
    #[serde(default = "default_true")]
    pub enable_webrtc: bool,
    /// Master switch for drift correction (both strategies).
    #[serde(default = "default_true")]
    pub enable_sync_correction: bool,
    /// Allow correcting small drift by nudging the playback rate.
    #[serde(default = "default_true")]
    pub use_speed_to_sync: bool,
    /// Allow correcting large drift by seeking.
    #[serde(default = "default_true")]
    pub use_skip_to_sync: bool,
    /// Smallest drift (ms) worth a rate-nudge.
    #[serde(default = "default_min_delay_speed_to_sync")]
    pub min_delay_speed_to_sync: u64,
    /// Drift (ms) beyond which a rate-nudge would be too slow.
    #[serde(default = "default_max_delay_speed_to_sync")]
    pub max_delay_speed_to_sync: u64,
    /// How long (ms) a rate-nudge is allowed to run.
    #[serde(default = "default_speed_to_sync_duration")]
    pub speed_to_sync_duration: u64,
    /// Smallest drift (ms) worth a seek-nudge.
    #[serde(default = "default_min_delay_skip_to_sync")]
    pub min_delay_skip_to_sync: u64,
    /// User-configured additive correction (ms) applied after the estimated
    /// server offset.
    #[serde(default)]
    pub extra_time_offset: f64,
    /// Clock endpoint used to define server time: `"server"` or a peer id.
    #[serde(default = "default_time_sync_device")]
    pub time_sync_device: String,
    /// Extra STUN/TURN URL appended to the default ICE server list.
    #[serde(default)]
    pub p2p_tracker: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enable_webrtc: true,
            enable_sync_correction: true,
            use_speed_to_sync: true,
            use_skip_to_sync: true,
            min_delay_speed_to_sync: default_min_delay_speed_to_sync(),
            max_delay_speed_to_sync: default_max_delay_speed_to_sync(),
            speed_to_sync_duration: default_speed_to_sync_duration(),
            min_delay_skip_to_sync: default_min_delay_skip_to_sync(),
            extra_time_offset: 0.0,
            time_sync_device: default_time_sync_device(),
            p2p_tracker: String::new(),
        }
    }
}

impl SyncSettings {
    /// Load settings from `path`. A missing file writes a commented template
    /// and returns the defaults; a malformed file is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let template = "# groupplay coordinator settings\n\
                            # enable_webrtc = true\n\
                            # time_sync_device = \"server\"\n\
                            # extra_time_offset = 0.0\n";
            fs::write(path, template)?;
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let settings: SyncSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn into_handle(self) -> SettingsHandle {
        Arc::new(RwLock::new(self))
    }
}

/// Shared, runtime-mutable settings. Components lock per read so settings
/// edits apply to the next operation.
pub type SettingsHandle = Arc<RwLock<SyncSettings>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = SyncSettings::default();
        assert!(s.enable_webrtc);
        assert!(s.enable_sync_correction);
        assert_eq!(s.min_delay_speed_to_sync, 60);
        assert_eq!(s.max_delay_speed_to_sync, 3000);
        assert_eq!(s.speed_to_sync_duration, 1000);
        assert_eq!(s.min_delay_skip_to_sync, 400);
        assert_eq!(s.extra_time_offset, 0.0);
        assert_eq!(s.time_sync_device, "server");
        assert!(s.p2p_tracker.is_empty());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let s: SyncSettings = toml::from_str(
            "enable_webrtc = false\nmin_delay_skip_to_sync = 250\n",
        )
        .unwrap();
        assert!(!s.enable_webrtc);
        assert_eq!(s.min_delay_skip_to_sync, 250);
        assert_eq!(s.max_delay_speed_to_sync, 3000);
        assert_eq!(s.time_sync_device, "server");
    }

    #[test]
    fn roundtrips_through_toml() {
        let mut s = SyncSettings::default();
        s.time_sync_device = "peer-7".to_string();
        s.extra_time_offset = -12.5;
        let text = toml::to_string_pretty(&s).unwrap();
        let back: SyncSettings = toml::from_str(&text).unwrap();
        assert_eq!(back.time_sync_device, "peer-7");
        assert_eq!(back.extra_time_offset, -12.5);
    }
}
