//! Capability & Config Surface — the one record allowed to persist.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// TURN relay configuration, present only when the user has configured one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    pub url: String,
    pub user: String,
    pub credential: String,
    pub force_relay: bool,
}

/// Immutable-per-session record of enumerated runtime options. Snapshotted
/// into a Peer Session at construction; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub use_stun: bool,
    pub use_compression: bool,
    pub use_unordered_file_channels: bool,
    pub use_striping: bool,
    /// Fast mode: 180 ms send-pump budget and doubled flush batch targets,
    /// vs. 32 ms / single batch target otherwise.
    pub transfer_fast: bool,
    pub lan_host_override: Option<Ipv4Addr>,
    pub turn: Option<TurnConfig>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            use_stun: true,
            use_compression: true,
            use_unordered_file_channels: false,
            use_striping: false,
            transfer_fast: false,
            lan_host_override: None,
            turn: None,
        }
    }
}

/// On-disk form, keyed exactly by the persisted state names. Kept distinct
/// from [`Configuration`] so the JSON file's flat key set never has to track
/// internal struct shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedConfig {
    pub use_stun: bool,
    pub signal_compress: bool,
    pub file_unordered: bool,
    pub transfer_fast: bool,
    pub lan_ip_override: bool,
    pub lan_ip_value: String,
    pub turn_enabled: bool,
    pub turn_url: String,
    pub turn_username: String,
    pub turn_credential: String,
    pub turn_force_relay: bool,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Configuration::default().into()
    }
}

impl From<Configuration> for PersistedConfig {
    fn from(cfg: Configuration) -> Self {
        let turn = cfg.turn.unwrap_or(TurnConfig {
            url: String::new(),
            user: String::new(),
            credential: String::new(),
            force_relay: false,
        });
        Self {
            use_stun: cfg.use_stun,
            signal_compress: cfg.use_compression,
            file_unordered: cfg.use_unordered_file_channels,
            transfer_fast: cfg.transfer_fast,
            lan_ip_override: cfg.lan_host_override.is_some(),
            lan_ip_value: cfg
                .lan_host_override
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            turn_enabled: !turn.url.is_empty(),
            turn_url: turn.url,
            turn_username: turn.user,
            turn_credential: turn.credential,
            turn_force_relay: turn.force_relay,
        }
    }
}

impl From<PersistedConfig> for Configuration {
    fn from(p: PersistedConfig) -> Self {
        let lan_host_override = if p.lan_ip_override {
            p.lan_ip_value.parse::<Ipv4Addr>().ok()
        } else {
            None
        };
        let turn = if p.turn_enabled {
            Some(TurnConfig {
                url: p.turn_url,
                user: p.turn_username,
                credential: p.turn_credential,
                force_relay: p.turn_force_relay,
            })
        } else {
            None
        };
        Self {
            use_stun: p.use_stun,
            use_compression: p.signal_compress,
            use_unordered_file_channels: p.file_unordered,
            // Striping has no persisted key in spec.md §6; it stays a
            // per-launch default rather than a saved preference.
            use_striping: Configuration::default().use_striping,
            transfer_fast: p.transfer_fast,
            lan_host_override,
            turn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_roundtrip_preserves_turn_and_lan_override() {
        let cfg = Configuration {
            use_stun: true,
            use_compression: false,
            use_unordered_file_channels: true,
            use_striping: true,
            transfer_fast: true,
            lan_host_override: Some(Ipv4Addr::new(192, 168, 1, 50)),
            turn: Some(TurnConfig {
                url: "turn:example.com:3478".into(),
                user: "alice".into(),
                credential: "secret".into(),
                force_relay: true,
            }),
        };

        let persisted: PersistedConfig = cfg.clone().into();
        let restored: Configuration = persisted.into();

        assert_eq!(restored.use_stun, cfg.use_stun);
        assert_eq!(restored.use_compression, cfg.use_compression);
        assert_eq!(restored.lan_host_override, cfg.lan_host_override);
        assert_eq!(restored.turn, cfg.turn);
    }

    #[test]
    fn default_has_no_turn_or_lan_override() {
        let cfg = Configuration::default();
        assert!(cfg.turn.is_none());
        assert!(cfg.lan_host_override.is_none());
        assert!(cfg.use_stun);
    }
}
