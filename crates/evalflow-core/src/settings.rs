//! Runtime settings. Typed key/value lookups shared by every server process.
//!
//! Each [`SettingKey`] carries its own default, so a store only needs to hold
//! the values an operator changed.

use crate::error::Result;

/// A named setting with its default (stored as text).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingKey {
    pub name: &'static str,
    pub default: &'static str,
}

/// Grace window before the "created" notification goes out.
pub const CREATED_WAIT_SECS: SettingKey = SettingKey {
    name: "notify.created.wait_secs",
    default: "300",
};
pub const CREATED_ENABLED: SettingKey = SettingKey {
    name: "notify.created.enabled",
    default: "true",
};
pub const CREATED_INCLUDE_OWNER: SettingKey = SettingKey {
    name: "notify.created.include_owner",
    default: "true",
};
pub const AVAILABLE_INCLUDE_EVALUATEES: SettingKey = SettingKey {
    name: "notify.available.include_evaluatees",
    default: "true",
};
pub const REMINDER_AUDIENCE: SettingKey = SettingKey {
    name: "notify.reminder.audience",
    default: "nontakers",
};
/// Digest delivery instead of per-evaluation available/reminder mails.
pub const CONSOLIDATED_ENABLED: SettingKey = SettingKey {
    name: "consolidated.enabled",
    default: "false",
};
/// Still send the per-evaluation "available" mail while consolidated.
pub const CONSOLIDATED_FORCE_AVAILABLE: SettingKey = SettingKey {
    name: "consolidated.force_available",
    default: "false",
};
pub const CONSOLIDATED_REMINDER_INTERVAL_DAYS: SettingKey = SettingKey {
    name: "consolidated.reminder_interval_days",
    default: "7",
};
/// RFC 3339 instant of the next reminder digest; empty means "now".
pub const CONSOLIDATED_NEXT_REMINDER_AT: SettingKey = SettingKey {
    name: "consolidated.next_reminder_at",
    default: "",
};
pub const SYNC_GROUPS_ON_STATE_CHANGE: SettingKey = SettingKey {
    name: "groups.sync_on_state_change",
    default: "false",
};

/// Typed key/value lookup.
pub trait SettingsProvider: Send + Sync {
    /// Raw stored value, `None` when unset.
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str) -> Result<()>;

    fn get_str(&self, key: SettingKey) -> String {
        self.get(key.name).unwrap_or_else(|| key.default.to_string())
    }

    fn get_bool(&self, key: SettingKey) -> bool {
        let raw = self.get_str(key);
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" | "" => false,
            other => {
                tracing::warn!("⚠️ Setting {} has non-boolean value '{}', using default", key.name, other);
                key.default == "true"
            }
        }
    }

    fn get_i64(&self, key: SettingKey) -> i64 {
        let raw = self.get_str(key);
        raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("⚠️ Setting {} has non-numeric value '{}', using default", key.name, raw);
            key.default.parse().unwrap_or_default()
        })
    }
}
