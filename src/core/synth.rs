//! Config synthesizer: maps the settings document plus a probe snapshot
//! into the declarative nix-darwin documents the external applier consumes.
//!
//! Output is deterministic: stable key ordering, fixed templates, and
//! explicit escaping, so repeated runs against unchanged inputs produce
//! byte-identical bundles.

use crate::constants;
use crate::core::paths::GenesisPaths;
use crate::core::probe::ProbeSnapshot;
use crate::errors::GenesisError;
use crate::models::settings::{HomebrewSection, PrefSetting, PrefValue, SettingsDocument};
use crate::util::command;
use crate::util::fs as genesis_fs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::env;
use std::process::Command;
use std::time::Duration;
use tracing::info;

/// Hostname/username pair substituted into the flake. Detected once per
/// run and passed in, keeping `synthesize` pure.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    pub username: String,
}

impl HostInfo {
    pub fn detect() -> Result<Self, GenesisError> {
        let mut cmd = Command::new("hostname");
        cmd.arg("-s");
        let out = command::output_checked(
            cmd,
            "hostname",
            Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
        )?;
        let hostname = String::from_utf8_lossy(&out).trim().to_string();
        let username = match env::var("USER") {
            Ok(u) if !u.is_empty() => u,
            _ => {
                let out = command::output_checked(
                    Command::new("whoami"),
                    "whoami",
                    Duration::from_secs(constants::COMMAND_TIMEOUT_SECS),
                )?;
                String::from_utf8_lossy(&out).trim().to_string()
            }
        };
        Ok(Self { hostname, username })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedFile {
    /// Path relative to the bundle root, e.g. `modules/system.nix`.
    pub name: String,
    pub contents: String,
}

/// Which settings sections and probed keys fed each generated file.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ManifestEntry {
    pub file: String,
    pub sections: Vec<String>,
    pub probed_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BundleManifest {
    pub entries: Vec<ManifestEntry>,
}

/// Ordered set of generated documents plus the contribution manifest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratedConfigBundle {
    pub files: Vec<GeneratedFile>,
    pub manifest: BundleManifest,
}

// ---- Nix literal rendering ------------------------------------------------

/// Escape a string for a double-quoted Nix literal.
fn nix_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '$' if chars.peek() == Some(&'{') => out.push_str("\\${"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn nix_value(value: &PrefValue) -> String {
    match value {
        PrefValue::Bool(b) => b.to_string(),
        PrefValue::Int(i) => i.to_string(),
        // Nix floats need a decimal point.
        PrefValue::Float(x) if x.fract() == 0.0 => format!("{x:.1}"),
        PrefValue::Float(x) => format!("{x}"),
        PrefValue::Str(s) => nix_str(s),
    }
}

fn nix_string_list(items: &[String], indent: &str) -> String {
    let mut out = String::from("[\n");
    for item in items {
        out.push_str(indent);
        out.push_str("  ");
        out.push_str(&nix_str(item));
        out.push('\n');
    }
    out.push_str(indent);
    out.push(']');
    out
}

// ---- Resolution -----------------------------------------------------------

/// Resolve one preference section. Order per key: probed value when the
/// settings mark it detect-from-host, else the configured default, else a
/// fatal `MissingConfigValue` naming the qualified key.
fn resolve_section(
    section: &str,
    prefs: &BTreeMap<String, PrefSetting>,
    snapshot: &ProbeSnapshot,
) -> Result<(BTreeMap<String, PrefValue>, Vec<String>), GenesisError> {
    let mut resolved = BTreeMap::new();
    let mut probed_keys = Vec::new();
    for (key, pref) in prefs {
        let qualified = format!("{section}.{key}");
        let from_host = if pref.detect {
            snapshot.get(section, key).cloned()
        } else {
            None
        };
        match from_host {
            Some(value) => {
                probed_keys.push(qualified);
                resolved.insert(key.clone(), value);
            }
            None => match &pref.default {
                Some(default) => {
                    resolved.insert(key.clone(), default.clone());
                }
                None => return Err(GenesisError::MissingConfigValue { key: qualified }),
            },
        }
    }
    Ok((resolved, probed_keys))
}

/// Merge package categories into one flat sequence: first-seen order across
/// category declaration order, duplicates removed.
pub fn merge_packages<'a>(categories: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    let mut merged = Vec::new();
    for category in categories {
        for package in category {
            if !merged.contains(package) {
                merged.push(package.clone());
            }
        }
    }
    merged
}

// ---- Document generators --------------------------------------------------

fn flake_nix(host: &HostInfo) -> String {
    format!(
        r#"{{
  description = "nix-darwin system configuration";

  inputs = {{
    nixpkgs.url = "github:NixOS/nixpkgs/nixpkgs-unstable";
    nix-darwin = {{
      url = "github:LnL7/nix-darwin";
      inputs.nixpkgs.follows = "nixpkgs";
    }};
    home-manager = {{
      url = "github:nix-community/home-manager";
      inputs.nixpkgs.follows = "nixpkgs";
    }};
  }};

  outputs = inputs@{{ self, nix-darwin, nixpkgs, home-manager }}: {{
    darwinConfigurations.{hostname} = nix-darwin.lib.darwinSystem {{
      system = "aarch64-darwin";

      modules = [
        ./darwin-configuration.nix
        home-manager.darwinModules.home-manager
        {{
          home-manager.useGlobalPkgs = true;
          home-manager.useUserPackages = true;
          home-manager.users.{username} = import ./home.nix;
        }}
      ];
    }};

    darwinPackages = self.darwinConfigurations.{hostname}.pkgs;
  }};
}}
"#,
        hostname = nix_str(&host.hostname),
        username = host.username,
    )
}

fn darwin_configuration(host: &HostInfo) -> String {
    format!(
        r#"{{ config, pkgs, ... }}:

{{
  imports = [
    ./modules/system.nix
    ./modules/packages.nix
    ./modules/homebrew.nix
  ];

  nix.settings = {{
    experimental-features = "nix-command flakes";
    trusted-users = [ "root" {username} ];
  }};

  programs.zsh.enable = true;

  system.stateVersion = 4;
  system.primaryUser = {username};

  users.users.{bare} = {{
    name = {username};
    home = "/Users/{bare}";
  }};

  nixpkgs.config.allowUnfree = true;
}}
"#,
        username = nix_str(&host.username),
        bare = host.username,
    )
}

fn home_nix() -> String {
    r#"{ config, pkgs, ... }:

{
  home.stateVersion = "23.11";

  programs.home-manager.enable = true;

  programs.git = {
    enable = true;
    extraConfig = {
      init.defaultBranch = "main";
      pull.rebase = false;
      push.autoSetupRemote = true;
    };
  };

  programs.zsh = {
    enable = true;
    enableAutosuggestions = true;
    enableCompletion = true;
    syntaxHighlighting.enable = true;

    shellAliases = {
      ll = "ls -la";
      gc = "git commit";
      gp = "git push";
      gs = "git status";
      rebuild = "darwin-rebuild switch --flake ~/.config/nix-darwin";
      pw = "pass";
      pwg = "pass generate";
      pws = "pass show";
      pwc = "pass show -c";
    };
  };
}
"#
    .to_string()
}

fn render_pref_block(name: &str, resolved: &BTreeMap<String, PrefValue>) -> String {
    let mut out = format!("    {name} = {{\n");
    for (key, value) in resolved {
        let rendered_key = if key.contains('-') {
            format!("\"{key}\"")
        } else {
            key.clone()
        };
        out.push_str(&format!("      {rendered_key} = {};\n", nix_value(value)));
    }
    out.push_str("    };\n");
    out
}

fn system_module(
    dock: &BTreeMap<String, PrefValue>,
    finder: &BTreeMap<String, PrefValue>,
    nsglobal: &BTreeMap<String, PrefValue>,
) -> String {
    let mut out = String::from("{ config, pkgs, ... }:\n\n{\n  system.defaults = {\n");
    out.push_str(&render_pref_block("dock", dock));
    out.push_str(&render_pref_block("finder", finder));
    out.push_str(&render_pref_block("NSGlobalDomain", nsglobal));
    out.push_str(
        "    screencapture = {\n      location = \"~/Desktop\";\n      type = \"png\";\n    };\n",
    );
    out.push_str("  };\n\n  security.pam.services.sudo_local.touchIdAuth = true;\n}\n");
    out
}

fn packages_module(packages: &[String]) -> String {
    format!(
        "{{ config, pkgs, ... }}:\n\n{{\n  environment.systemPackages = with pkgs; {};\n}}\n",
        nix_package_list(packages)
    )
}

// Package names are Nix attribute paths (e.g. python311Packages.pip), not
// string literals.
fn nix_package_list(packages: &[String]) -> String {
    let mut out = String::from("[\n");
    for package in packages {
        out.push_str("    ");
        out.push_str(package);
        out.push('\n');
    }
    out.push_str("  ]");
    out
}

fn homebrew_module(homebrew: &HomebrewSection) -> String {
    format!(
        r#"{{ config, pkgs, ... }}:

{{
  homebrew = {{
    enable = true;

    onActivation = {{
      autoUpdate = true;
      upgrade = true;
      cleanup = "zap";
    }};

    taps = {taps};
    brews = {brews};
    casks = {casks};
  }};
}}
"#,
        taps = nix_string_list(&homebrew.taps, "    "),
        brews = nix_string_list(&homebrew.brews, "    "),
        casks = nix_string_list(&homebrew.casks, "    "),
    )
}

// ---- Entry point ----------------------------------------------------------

/// Synthesize the declarative configuration bundle.
pub fn synthesize(
    settings: &SettingsDocument,
    snapshot: &ProbeSnapshot,
    host: &HostInfo,
) -> Result<GeneratedConfigBundle, GenesisError> {
    let (dock, dock_probed) = resolve_section("dock", &settings.dock, snapshot)?;
    let (finder, finder_probed) = resolve_section("finder", &settings.finder, snapshot)?;
    let (nsglobal, nsglobal_probed) = resolve_section("nsglobal", &settings.nsglobal, snapshot)?;

    let packages = merge_packages(
        settings
            .packages
            .categories()
            .iter()
            .map(|(_, list)| *list),
    );

    let mut system_probed = Vec::new();
    system_probed.extend(dock_probed);
    system_probed.extend(finder_probed);
    system_probed.extend(nsglobal_probed);

    let files = vec![
        GeneratedFile {
            name: "flake.nix".to_string(),
            contents: flake_nix(host),
        },
        GeneratedFile {
            name: "darwin-configuration.nix".to_string(),
            contents: darwin_configuration(host),
        },
        GeneratedFile {
            name: "home.nix".to_string(),
            contents: home_nix(),
        },
        GeneratedFile {
            name: "modules/system.nix".to_string(),
            contents: system_module(&dock, &finder, &nsglobal),
        },
        GeneratedFile {
            name: "modules/packages.nix".to_string(),
            contents: packages_module(&packages),
        },
        GeneratedFile {
            name: "modules/homebrew.nix".to_string(),
            contents: homebrew_module(&settings.homebrew),
        },
    ];

    let manifest = BundleManifest {
        entries: vec![
            ManifestEntry {
                file: "flake.nix".to_string(),
                sections: vec![],
                probed_keys: vec![],
            },
            ManifestEntry {
                file: "darwin-configuration.nix".to_string(),
                sections: vec![],
                probed_keys: vec![],
            },
            ManifestEntry {
                file: "home.nix".to_string(),
                sections: vec![],
                probed_keys: vec![],
            },
            ManifestEntry {
                file: "modules/system.nix".to_string(),
                sections: vec![
                    "dock".to_string(),
                    "finder".to_string(),
                    "nsglobal".to_string(),
                ],
                probed_keys: system_probed,
            },
            ManifestEntry {
                file: "modules/packages.nix".to_string(),
                sections: vec!["packages".to_string()],
                probed_keys: vec![],
            },
            ManifestEntry {
                file: "modules/homebrew.nix".to_string(),
                sections: vec!["homebrew".to_string()],
                probed_keys: vec![],
            },
        ],
    };

    Ok(GeneratedConfigBundle { files, manifest })
}

/// Write the bundle to the fixed target directory, overwriting any prior
/// bundle. The manifest lands alongside the documents.
pub fn write_bundle(paths: &GenesisPaths, bundle: &GeneratedConfigBundle) -> Result<(), GenesisError> {
    let to_io = |e: anyhow::Error| GenesisError::Io(std::io::Error::other(e.to_string()));
    genesis_fs::ensure_dir(&paths.config_dir, 0o755).map_err(to_io)?;
    genesis_fs::ensure_dir(&paths.modules_dir, 0o755).map_err(to_io)?;
    for file in &bundle.files {
        let target = paths.config_dir.join(&file.name);
        genesis_fs::atomic_write(&target, file.contents.as_bytes(), constants::CONFIG_FILE_MODE)
            .map_err(to_io)?;
        info!(file = %target.display(), "wrote configuration document");
    }
    let manifest = toml::to_string_pretty(&bundle.manifest)
        .map_err(|e| GenesisError::InvalidSettings(format!("serialize manifest: {e}")))?;
    genesis_fs::atomic_write(
        &paths.config_dir.join("manifest.toml"),
        manifest.as_bytes(),
        constants::CONFIG_FILE_MODE,
    )
    .map_err(to_io)?;
    Ok(())
}
