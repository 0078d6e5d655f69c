use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::rule::RuleSet;
use crate::template::TemplateRegistry;

/// Flat key/value configuration store. Keys are dotted
/// (`transcode.enable`, `templates.sd`, `rules.live/*`).
#[derive(Debug, Default, Clone)]
pub struct ConfigStore {
    entries: BTreeMap<String, String>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    /// Entries whose key starts with `prefix`, yielded as (suffix, value)
    /// in key order.
    pub fn prefixed<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .iter()
            .filter(move |(key, _)| key.starts_with(prefix))
            .map(move |(key, value)| (&key[prefix.len()..], value.as_str()))
    }

    /// Reads a `key = value` file. Lines starting with `#` or `;` and blank
    /// lines are skipped.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut store = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                store.set(key.trim(), value.trim());
            }
        }
        Ok(store)
    }
}

/// Hardware acceleration flavor, inserted into the encoder argv before `-i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAccel {
    #[default]
    None,
    Nvidia,
    Intel,
    Amd,
    Vaapi,
}

impl HwAccel {
    pub fn parse(value: &str) -> Self {
        match value {
            "nvidia" => Self::Nvidia,
            "intel" => Self::Intel,
            "amd" => Self::Amd,
            "vaapi" => Self::Vaapi,
            _ => Self::None,
        }
    }

    pub fn args(&self) -> &'static str {
        match self {
            Self::Nvidia => "-hwaccel cuda -hwaccel_output_format cuda",
            Self::Intel => "-hwaccel qsv -hwaccel_output_format qsv",
            Self::Amd => "-hwaccel d3d11va -hwaccel_output_format d3d11",
            Self::Vaapi => "-hwaccel vaapi -hwaccel_output_format vaapi -vaapi_device /dev/dri/renderD128",
            Self::None => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub enable: bool,
    pub max_concurrent: usize,
    pub temp_dir: PathBuf,
    pub timeout_sec: u64,
    pub ffmpeg_bin: String,
    pub hw_accel: HwAccel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enable: false,
            max_concurrent: 8,
            temp_dir: PathBuf::from("/tmp/transcode-hub"),
            timeout_sec: 0,
            ffmpeg_bin: "ffmpeg".to_string(),
            hw_accel: HwAccel::None,
        }
    }
}

impl Settings {
    fn parse(store: &ConfigStore) -> Self {
        let mut settings = Self::default();
        if let Some(v) = store.get("transcode.enable") {
            settings.enable = matches!(v, "1" | "true" | "on" | "yes");
        }
        if let Some(v) = store.get("transcode.max_concurrent") {
            if let Ok(n) = v.parse() {
                settings.max_concurrent = n;
            }
        }
        if let Some(v) = store.get("transcode.temp_dir") {
            settings.temp_dir = PathBuf::from(v);
        }
        if let Some(v) = store.get("transcode.timeout_sec") {
            if let Ok(n) = v.parse() {
                settings.timeout_sec = n;
            }
        }
        if let Some(v) = store.get("transcode.ffmpeg_bin") {
            settings.ffmpeg_bin = v.to_string();
        }
        if let Some(v) = store.get("transcode.hw_accel") {
            settings.hw_accel = HwAccel::parse(v);
        }
        settings
    }
}

/// Full transcode configuration: settings plus the template registry and the
/// rule set, built together so a reload swaps all three at once.
#[derive(Debug, Clone, Default)]
pub struct TranscodeConfig {
    pub settings: Settings,
    pub templates: TemplateRegistry,
    pub rules: RuleSet,
}

impl TranscodeConfig {
    pub fn load(store: &ConfigStore) -> anyhow::Result<Self> {
        let settings = Settings::parse(store);
        let templates = TemplateRegistry::parse(store);
        let rules = RuleSet::parse(store);

        let config = Self { settings, templates, rules };
        config.validate()?;
        Ok(config)
    }

    /// Atomically clears and rebuilds templates and rules (and settings).
    pub fn reload(&mut self, store: &ConfigStore) -> anyhow::Result<()> {
        *self = Self::load(store)?;
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.settings.enable {
            return Ok(());
        }

        let bin = &self.settings.ffmpeg_bin;
        if !binary_exists(bin) {
            anyhow::bail!("encoder binary not found: {}", bin);
        }

        if !self.settings.temp_dir.is_dir() {
            std::fs::create_dir_all(&self.settings.temp_dir).map_err(|e| {
                anyhow::anyhow!("cannot create temp directory {}: {}", self.settings.temp_dir.display(), e)
            })?;
            let perms = std::fs::Permissions::from_mode(0o755);
            std::fs::set_permissions(&self.settings.temp_dir, perms)?;
        }

        if self.templates.is_empty() {
            anyhow::bail!("no transcode templates configured");
        }

        Ok(())
    }
}

/// A bare name is resolved through PATH; anything with a separator must exist
/// as a file.
fn binary_exists(bin: &str) -> bool {
    if bin.contains('/') {
        return Path::new(bin).is_file();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(bin).is_file()))
        .unwrap_or(false)
}
