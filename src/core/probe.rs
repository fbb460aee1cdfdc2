//! System probe: reads the host's current preference values into a typed,
//! immutable snapshot.
//!
//! Each key maps to exactly one read against the preference store. A
//! missing or unreadable key is recorded as absent, which is distinct from
//! an explicit false/0. The probe never mutates host state.

use crate::models::settings::PrefValue;
use crate::util::defaults::DefaultsStore;
use std::collections::BTreeMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefKind {
    Bool,
    Int,
    Float,
    Str,
}

/// One probeable preference: settings section, `defaults` domain, key name,
/// and the scalar kind the raw output is coerced to.
#[derive(Debug, Clone, Copy)]
pub struct PreferenceKey {
    pub section: &'static str,
    pub domain: &'static str,
    pub key: &'static str,
    pub kind: PrefKind,
}

const fn key(
    section: &'static str,
    domain: &'static str,
    name: &'static str,
    kind: PrefKind,
) -> PreferenceKey {
    PreferenceKey {
        section,
        domain,
        key: name,
        kind,
    }
}

pub const DOCK_KEYS: &[PreferenceKey] = &[
    key("dock", "com.apple.dock", "autohide", PrefKind::Bool),
    key("dock", "com.apple.dock", "autohide-delay", PrefKind::Float),
    key("dock", "com.apple.dock", "autohide-time-modifier", PrefKind::Float),
    key("dock", "com.apple.dock", "tilesize", PrefKind::Int),
    key("dock", "com.apple.dock", "orientation", PrefKind::Str),
    key("dock", "com.apple.dock", "show-recents", PrefKind::Bool),
    key("dock", "com.apple.dock", "static-only", PrefKind::Bool),
    key("dock", "com.apple.dock", "mineffect", PrefKind::Str),
];

pub const FINDER_KEYS: &[PreferenceKey] = &[
    key("finder", "com.apple.finder", "AppleShowAllFiles", PrefKind::Bool),
    key("finder", "com.apple.finder", "ShowStatusBar", PrefKind::Bool),
    key("finder", "com.apple.finder", "ShowPathbar", PrefKind::Bool),
    key("finder", "com.apple.finder", "FXDefaultSearchScope", PrefKind::Str),
    key("finder", "com.apple.finder", "FXPreferredViewStyle", PrefKind::Str),
];

pub const NSGLOBAL_KEYS: &[PreferenceKey] = &[
    key("nsglobal", "NSGlobalDomain", "AppleShowAllExtensions", PrefKind::Bool),
    key("nsglobal", "NSGlobalDomain", "ApplePressAndHoldEnabled", PrefKind::Bool),
    key("nsglobal", "NSGlobalDomain", "KeyRepeat", PrefKind::Int),
    key("nsglobal", "NSGlobalDomain", "InitialKeyRepeat", PrefKind::Int),
    key("nsglobal", "NSGlobalDomain", "AppleInterfaceStyle", PrefKind::Str),
];

/// Every preference the standard probe reads.
pub fn standard_keys() -> impl Iterator<Item = &'static PreferenceKey> {
    DOCK_KEYS.iter().chain(FINDER_KEYS).chain(NSGLOBAL_KEYS)
}

/// Point-in-time read of host preference values. Immutable once taken.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeSnapshot {
    values: BTreeMap<String, PrefValue>,
}

impl ProbeSnapshot {
    pub fn get(&self, section: &str, key: &str) -> Option<&PrefValue> {
        self.values.get(&format!("{section}.{key}"))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PrefValue)> {
        self.values.iter()
    }

    /// Test/seed constructor; production snapshots come from [`probe`].
    pub fn from_values(values: BTreeMap<String, PrefValue>) -> Self {
        Self { values }
    }
}

/// Coerce raw `defaults read` output to the key's scalar kind. `defaults`
/// prints booleans as 0/1 and occasionally YES/NO.
fn parse_value(raw: &str, kind: PrefKind) -> Option<PrefValue> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match kind {
        PrefKind::Bool => match raw {
            "1" | "YES" | "true" => Some(PrefValue::Bool(true)),
            "0" | "NO" | "false" => Some(PrefValue::Bool(false)),
            _ => None,
        },
        PrefKind::Int => raw.parse::<i64>().ok().map(PrefValue::Int),
        PrefKind::Float => raw.parse::<f64>().ok().map(PrefValue::Float),
        PrefKind::Str => Some(PrefValue::Str(raw.to_string())),
    }
}

/// Read the given keys into a snapshot. One store read per key; anything
/// missing, unreadable, or unparseable is recorded as absent rather than
/// failing the whole probe.
pub fn probe<'a>(
    store: &dyn DefaultsStore,
    keys: impl IntoIterator<Item = &'a PreferenceKey>,
) -> ProbeSnapshot {
    let mut values = BTreeMap::new();
    for pref in keys {
        match store.read(pref.domain, pref.key) {
            Ok(Some(raw)) => {
                if let Some(value) = parse_value(&raw, pref.kind) {
                    debug!(section = pref.section, key = pref.key, %value, "probed");
                    values.insert(format!("{}.{}", pref.section, pref.key), value);
                } else {
                    debug!(section = pref.section, key = pref.key, raw = %raw, "unparseable; recorded absent");
                }
            }
            Ok(None) => {
                debug!(section = pref.section, key = pref.key, "absent");
            }
            Err(e) => {
                warn!(section = pref.section, key = pref.key, error = %e, "read failed; recorded absent");
            }
        }
    }
    ProbeSnapshot { values }
}
