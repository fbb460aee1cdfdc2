//! Settings document model: identity, package categories, and preference
//! sections with their detect-from-host flags.

use crate::errors::GenesisError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;

/// Default settings shipped with the binary, used when no settings file
/// exists at the resolved path.
pub const DEFAULT_SETTINGS: &str = include_str!("../../config/default-settings.toml");

/// One scalar preference value. Anything else (arrays, tables) is rejected
/// at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for PrefValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A single preference entry in the settings document.
///
/// `detect = true` means a probed host value wins over `default`. A key with
/// neither a probed value nor a default is a fatal configuration error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefSetting {
    #[serde(default)]
    pub default: Option<PrefValue>,
    #[serde(default)]
    pub detect: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    #[serde(default)]
    pub github_user: Option<String>,
    #[serde(default)]
    pub git_name: Option<String>,
    #[serde(default)]
    pub git_email: Option<String>,
}

/// Package categories merged (first-seen order, duplicates removed) into
/// the generated packages module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesSection {
    #[serde(default)]
    pub core: Vec<String>,
    #[serde(default)]
    pub utilities: Vec<String>,
    #[serde(default)]
    pub containers: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl PackagesSection {
    /// Categories in declaration order; merge order follows this.
    pub fn categories(&self) -> [(&'static str, &[String]); 4] {
        [
            ("core", self.core.as_slice()),
            ("utilities", self.utilities.as_slice()),
            ("containers", self.containers.as_slice()),
            ("languages", self.languages.as_slice()),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomebrewSection {
    #[serde(default)]
    pub taps: Vec<String>,
    #[serde(default)]
    pub brews: Vec<String>,
    #[serde(default)]
    pub casks: Vec<String>,
}

/// The whole settings document. Loaded once at startup and treated as
/// immutable for the duration of the run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsDocument {
    #[serde(default)]
    pub identity: IdentitySection,
    #[serde(default)]
    pub packages: PackagesSection,
    #[serde(default)]
    pub homebrew: HomebrewSection,
    #[serde(default)]
    pub dock: BTreeMap<String, PrefSetting>,
    #[serde(default)]
    pub finder: BTreeMap<String, PrefSetting>,
    #[serde(default)]
    pub nsglobal: BTreeMap<String, PrefSetting>,
}

impl SettingsDocument {
    /// Parse a settings document, rejecting wrong-typed values and package
    /// entries that are not Nix attribute paths.
    pub fn parse(content: &str) -> Result<Self, GenesisError> {
        let doc: Self =
            toml::from_str(content).map_err(|e| GenesisError::InvalidSettings(e.to_string()))?;
        doc.validate_packages()?;
        Ok(doc)
    }

    /// Package entries are spliced into the generated module unquoted, so
    /// anything that is not an attribute path would corrupt the document.
    fn validate_packages(&self) -> Result<(), GenesisError> {
        for (category, names) in self.packages.categories() {
            if let Some(bad) = names.iter().find(|name| !is_attr_path(name)) {
                return Err(GenesisError::InvalidSettings(format!(
                    "packages.{category} entry '{bad}' is not a Nix attribute path"
                )));
            }
        }
        Ok(())
    }

    /// Load from `path`, falling back to the embedded defaults when the
    /// file does not exist.
    pub fn load(path: &Path) -> Result<Self, GenesisError> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            Self::parse(&content)
        } else {
            Self::parse(DEFAULT_SETTINGS)
        }
    }

    /// Preference sections in output order.
    pub fn pref_sections(&self) -> [(&'static str, &BTreeMap<String, PrefSetting>); 3] {
        [
            ("dock", &self.dock),
            ("finder", &self.finder),
            ("nsglobal", &self.nsglobal),
        ]
    }
}

/// Dotted attribute path: each segment starts with a letter or underscore
/// and continues with alphanumerics, `_`, `-`, or `'`.
fn is_attr_path(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
                _ => return false,
            }
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '\'')
        })
}

/// Identity values consumed by the credential provisioner and the config
/// synthesizer. Resolved once at startup: environment overrides beat the
/// settings document; no ambient lookups later.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub github_user: String,
    pub git_name: String,
    pub git_email: String,
}

impl Identity {
    pub fn resolve(section: &IdentitySection) -> Result<Self, GenesisError> {
        let pick = |var: &str, fallback: &Option<String>, what: &str| {
            env::var(var)
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| fallback.clone())
                .ok_or_else(|| {
                    GenesisError::InvalidSettings(format!(
                        "identity.{what} is not set (settings [identity] or ${var})"
                    ))
                })
        };
        Ok(Self {
            github_user: pick("GITHUB_USERNAME", &section.github_user, "github_user")?,
            git_name: pick("GIT_USER_NAME", &section.git_name, "git_name")?,
            git_email: pick("GIT_USER_EMAIL", &section.git_email, "git_email")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_parse() {
        let doc = SettingsDocument::parse(DEFAULT_SETTINGS).unwrap();
        assert!(!doc.packages.core.is_empty());
        assert!(doc.dock.contains_key("autohide"));
        assert!(doc.nsglobal.contains_key("AppleInterfaceStyle"));
    }

    #[test]
    fn test_pref_setting_detect_flag() {
        let doc = SettingsDocument::parse(
            r#"
            [dock.autohide]
            default = true
            detect = true
            "#,
        )
        .unwrap();
        let pref = &doc.dock["autohide"];
        assert!(pref.detect);
        assert_eq!(pref.default, Some(PrefValue::Bool(true)));
    }

    #[test]
    fn test_wrong_typed_package_entry_rejected() {
        let err = SettingsDocument::parse(
            r#"
            [packages]
            core = ["git", 42]
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid-settings");
    }

    #[test]
    fn test_dotted_package_paths_accepted() {
        let doc = SettingsDocument::parse(
            r#"
            [packages]
            languages = ["python3Packages.pip", "nodejs_22", "nerd-fonts.fira-code"]
            "#,
        )
        .unwrap();
        assert_eq!(doc.packages.languages.len(), 3);
    }

    #[test]
    fn test_package_entry_with_shell_text_rejected() {
        let err = SettingsDocument::parse(
            r#"
            [packages]
            core = ["git", "curl; rm -rf /"]
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid-settings");
        assert!(err.to_string().contains("curl; rm -rf /"));
    }

    #[test]
    fn test_package_entry_with_space_rejected() {
        let err = SettingsDocument::parse(
            r#"
            [packages]
            utilities = ["ripgrep fd"]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("packages.utilities"));
    }

    #[test]
    fn test_non_scalar_default_rejected() {
        let err = SettingsDocument::parse(
            r#"
            [dock.autohide]
            default = [1, 2]
            "#,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid-settings");
    }

    #[test]
    fn test_identity_env_override() {
        let section = IdentitySection {
            github_user: Some("settings-user".to_string()),
            git_name: Some("Settings Name".to_string()),
            git_email: Some("settings@example.com".to_string()),
        };
        env::set_var("GITHUB_USERNAME", "env-user");
        let identity = Identity::resolve(&section).unwrap();
        env::remove_var("GITHUB_USERNAME");
        assert_eq!(identity.github_user, "env-user");
        assert_eq!(identity.git_name, "Settings Name");
    }

    #[test]
    fn test_identity_missing_is_error() {
        env::remove_var("GIT_USER_EMAIL");
        let section = IdentitySection {
            github_user: Some("u".to_string()),
            git_name: Some("n".to_string()),
            git_email: None,
        };
        let err = Identity::resolve(&section).unwrap_err();
        assert!(err.to_string().contains("git_email"));
    }
}
