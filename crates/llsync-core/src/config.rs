//! Tunable timings and retry budgets for a session.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// All wall-clock and retry knobs in one place. Defaults match the
/// values production devices are tuned for; load/save lets deployments
/// override them from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlsyncConfig {
    /// Wait for the bind reply, in milliseconds.
    pub wait_bind_reply_ms: u64,
    /// Wait for the connection auth reply.
    pub wait_connect_reply_ms: u64,
    /// Wait for the unbind reply.
    pub wait_unbind_reply_ms: u64,
    /// Wait for the device-info reply.
    pub wait_device_info_ms: u64,
    /// Wait for property/action control replies.
    pub wait_control_reply_ms: u64,
    /// Wait for the OTA update-request reply.
    pub wait_update_reply_ms: u64,
    /// Wait for the device to announce its user-confirmation window.
    pub wait_user_check_window_reply_ms: u64,
    /// Confirmation window assumed when the device never announces one
    /// (older firmware).
    pub default_user_check_window_ms: u64,
    /// Gap between consecutive fragment writes.
    pub write_gap_ms: u64,
    /// Fallback gap between OTA data packets when the device does not
    /// negotiate one.
    pub ota_send_gap_ms: u64,
    /// Consecutive ack mismatches tolerated before an OTA cycle fails.
    pub ota_cycle_retry_limit: u32,
    /// Transport write attempts per OTA cycle before giving up.
    pub ota_write_retry_per_cycle: u32,
    /// Multiplier applied to the device-reported reboot ceiling while
    /// waiting for the post-update disconnect.
    pub reboot_wait_scale: u32,
    /// Reconnect attempts after the update reboot.
    pub reconnect_attempt_limit: u32,
    /// Gap between reconnect attempts.
    pub reconnect_gap_ms: u64,
    /// Granularity of the notify poll loop; bounds how quickly timeouts
    /// and cancellation are observed.
    pub poll_slice_ms: u64,
}

impl Default for LlsyncConfig {
    fn default() -> Self {
        Self {
            wait_bind_reply_ms: 10_000,
            wait_connect_reply_ms: 10_000,
            wait_unbind_reply_ms: 10_000,
            wait_device_info_ms: 10_000,
            wait_control_reply_ms: 10_000,
            wait_update_reply_ms: 10_000,
            wait_user_check_window_reply_ms: 10_000,
            default_user_check_window_ms: 60_000,
            write_gap_ms: 100,
            ota_send_gap_ms: 10,
            ota_cycle_retry_limit: 5,
            ota_write_retry_per_cycle: 5,
            reboot_wait_scale: 10,
            reconnect_attempt_limit: 10,
            reconnect_gap_ms: 3_000,
            poll_slice_ms: 100,
        }
    }
}

impl LlsyncConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LlsyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn write_gap(&self) -> Duration {
        Duration::from_millis(self.write_gap_ms)
    }

    pub fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = LlsyncConfig::default();
        assert_eq!(config.ota_cycle_retry_limit, 5);
        assert!(config.poll_slice_ms <= config.wait_bind_reply_ms);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: LlsyncConfig = toml::from_str("wait_bind_reply_ms = 500").unwrap();
        assert_eq!(config.wait_bind_reply_ms, 500);
        assert_eq!(config.reboot_wait_scale, 10);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = LlsyncConfig {
            reconnect_attempt_limit: 3,
            ..LlsyncConfig::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: LlsyncConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.reconnect_attempt_limit, 3);
    }
}
