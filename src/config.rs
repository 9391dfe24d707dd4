//! Persisted preferences, loaded the way the teacher's `ControlConfig` loads
//! its TOML (`std::fs::read_to_string` + `toml::from_str`, descriptive
//! `String` errors mapped onto `CoreError::PersistenceFailure`).

use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_MQTT_SERVER: &str = "";
pub const DEFAULT_MQTT_TOPIC: &str = "";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Prefs {
    pub node_name: String,
    pub owner_info: String,
    pub admin_password: String,
    pub guest_password: String,
    pub firmware_level: u8,

    /// Minutes x 2; 0 disables.
    pub advert_local_interval: u32,
    /// Hours; 0 disables.
    pub advert_flood_interval: u32,

    pub flood_max: u8,
    pub tx_delay_factor: f32,
    pub direct_tx_delay_factor: f32,
    /// <= 0 disables the rx-delay-by-quality adjustment.
    pub rx_delay_base: f32,
    pub airtime_factor: f32,
    pub server_response_delay_ms: u64,

    pub repeater_enabled: bool,

    pub mqtt_server: String,
    pub mqtt_topic: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub mqtt_banned: bool,
    pub bridge_autostart: bool,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            node_name: "repeater".to_string(),
            owner_info: String::new(),
            admin_password: String::new(),
            guest_password: String::new(),
            firmware_level: 2,
            advert_local_interval: 0,
            advert_flood_interval: 0,
            flood_max: 64,
            tx_delay_factor: 1.0,
            direct_tx_delay_factor: 1.0,
            rx_delay_base: 0.0,
            airtime_factor: 1.0,
            server_response_delay_ms: 300,
            repeater_enabled: true,
            mqtt_server: DEFAULT_MQTT_SERVER.to_string(),
            mqtt_topic: DEFAULT_MQTT_TOPIC.to_string(),
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            mqtt_banned: false,
            bridge_autostart: false,
        }
    }
}

impl Prefs {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::PersistenceFailure(format!("failed to read prefs file: {e}")))?;
        toml::from_str(&content).map_err(|e| CoreError::PersistenceFailure(format!("failed to parse prefs file: {e}")))
    }

    pub fn to_toml_string(&self) -> Result<String, CoreError> {
        toml::to_string_pretty(self).map_err(|e| CoreError::PersistenceFailure(format!("failed to serialize prefs: {e}")))
    }

    /// Reconnection is refused until the operator has set non-default
    /// credentials AND a non-default topic (§4.10 self-ban execution).
    pub fn has_valid_mqtt_credentials(&self) -> bool {
        !self.mqtt_server.is_empty()
            && self.mqtt_topic != DEFAULT_MQTT_TOPIC
            && !self.mqtt_user.is_empty()
            && !self.mqtt_pass.is_empty()
    }

    pub fn clear_mqtt_credentials(&mut self) {
        self.mqtt_server.clear();
        self.mqtt_topic.clear();
        self.mqtt_user.clear();
        self.mqtt_pass.clear();
        self.mqtt_banned = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mqtt_credentials_are_invalid() {
        assert!(!Prefs::default().has_valid_mqtt_credentials());
    }

    #[test]
    fn clearing_credentials_marks_banned() {
        let mut p = Prefs::default();
        p.mqtt_server = "broker.example.com".into();
        p.mqtt_topic = "mesh/bridge".into();
        p.mqtt_user = "u".into();
        p.mqtt_pass = "p".into();
        assert!(p.has_valid_mqtt_credentials());
        p.clear_mqtt_credentials();
        assert!(p.mqtt_banned);
        assert!(!p.has_valid_mqtt_credentials());
    }
}
