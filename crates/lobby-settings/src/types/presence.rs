//! Grace-period timing and disconnect classification.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a disconnect reason is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Spurious keep-alive noise. Dropped without a state change.
    Ignored,
    /// The client announced it was switching away.
    Voluntary,
    /// The transport went away under the client.
    Abrupt,
    Other,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    /// Track grace periods and broadcast away/back notices.
    pub enabled: bool,
    pub voluntary_grace_ms: u64,
    pub abrupt_grace_ms: u64,
    pub default_grace_ms: u64,
    pub ignored_reasons: Vec<String>,
    pub abrupt_reasons: Vec<String>,
    /// Sync call run on behalf of a user leaving a room, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leave_sync: Option<String>,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            voluntary_grace_ms: 20_000,
            abrupt_grace_ms: 60_000,
            default_grace_ms: 2_000,
            ignored_reasons: vec!["ping timeout".to_string()],
            abrupt_reasons: vec!["transport close".to_string(), "transport error".to_string()],
            leave_sync: None,
        }
    }
}

impl PresenceSettings {
    /// Classify a reason. `switched_away` wins over the reason text.
    pub fn classify(&self, reason: &str, switched_away: bool) -> DisconnectClass {
        if self.ignored_reasons.iter().any(|r| r == reason) {
            DisconnectClass::Ignored
        } else if switched_away {
            DisconnectClass::Voluntary
        } else if self.abrupt_reasons.iter().any(|r| r == reason) {
            DisconnectClass::Abrupt
        } else {
            DisconnectClass::Other
        }
    }

    pub fn grace_for(&self, class: DisconnectClass) -> Duration {
        let ms = match class {
            DisconnectClass::Voluntary => self.voluntary_grace_ms,
            DisconnectClass::Abrupt => self.abrupt_grace_ms,
            DisconnectClass::Other | DisconnectClass::Ignored => self.default_grace_ms,
        };
        Duration::from_millis(ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_classes() {
        let p = PresenceSettings::default();
        assert_eq!(p.classify("ping timeout", false), DisconnectClass::Ignored);
        assert_eq!(p.classify("ping timeout", true), DisconnectClass::Ignored);
        assert_eq!(p.classify("transport close", false), DisconnectClass::Abrupt);
        assert_eq!(p.classify("transport error", false), DisconnectClass::Abrupt);
        assert_eq!(p.classify("transport close", true), DisconnectClass::Voluntary);
        assert_eq!(p.classify("client namespace disconnect", false), DisconnectClass::Other);
    }

    #[test]
    fn default_durations() {
        let p = PresenceSettings::default();
        assert_eq!(p.grace_for(DisconnectClass::Voluntary), Duration::from_secs(20));
        assert_eq!(p.grace_for(DisconnectClass::Abrupt), Duration::from_secs(60));
        assert_eq!(p.grace_for(DisconnectClass::Other), Duration::from_secs(2));
    }
}
