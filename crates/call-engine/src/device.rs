//! Device registry
//!
//! A device is one telephony identity: an extension the PBX routes, the
//! credentials it registers with, and the voice/personality it speaks as.
//! The registry owns every [`Device`]; calls hold `Arc` references and never
//! copy.
//!
//! Lookups are total: a reserved default device backs every miss, so callers
//! never deal with an absent identity. Reload rebuilds the lookup tables off
//! to the side and swaps them under a short write lock, so readers see
//! either the old set or the new one, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::DeviceConfig;
use crate::error::Result;

const SUPPORTED_LANGUAGES: &[&str] = &["en", "he", "ar", "ru", "fr", "es"];

/// One telephony identity
#[derive(Debug, Clone)]
pub struct Device {
    pub extension: String,
    pub name: String,
    pub auth_id: Option<String>,
    pub password: Option<String>,
    pub voice_id: Option<String>,
    pub language: String,
    pub greeting: String,
    pub thinking_phrase: String,
    pub personality: String,
}

impl Device {
    /// Devices with credentials maintain a SIP registration
    pub fn is_registrable(&self) -> bool {
        self.auth_id.as_deref().is_some_and(|a| !a.is_empty())
            && self.password.as_deref().is_some_and(|p| !p.is_empty())
    }

    /// The reserved identity returned when no device matches
    fn fallback(default_language: &str) -> Self {
        Self {
            extension: "0".into(),
            name: "default".into(),
            auth_id: None,
            password: None,
            voice_id: None,
            language: default_language.into(),
            greeting: "Hello, how can I help you?".into(),
            thinking_phrase: "One moment.".into(),
            personality: String::new(),
        }
    }
}

fn validate(config: &DeviceConfig, default_language: &str) -> std::result::Result<Device, String> {
    let extension = config.extension.trim();
    if extension.len() < 3 || extension.len() > 6 || !extension.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("extension {:?} is not 3-6 digits", config.extension));
    }
    let name = config.name.trim();
    if name.is_empty() {
        return Err("name is empty".into());
    }

    let language = match config.language.as_deref() {
        None => default_language.to_string(),
        Some(lang) if SUPPORTED_LANGUAGES.contains(&lang) => lang.to_string(),
        Some(other) => {
            return Err(format!("unsupported language {:?}", other));
        }
    };

    Ok(Device {
        extension: extension.to_string(),
        name: name.to_string(),
        auth_id: config.auth_id.clone().filter(|a| !a.is_empty()),
        password: config.password.clone().filter(|p| !p.is_empty()),
        voice_id: config.voice_id.clone(),
        language,
        greeting: config.greeting.clone().unwrap_or_else(|| "Hello, how can I help you?".into()),
        thinking_phrase: config.thinking_phrase.clone().unwrap_or_else(|| "One moment.".into()),
        personality: config.personality.clone().unwrap_or_default(),
    })
}

/// Double-buffered lookup tables, swapped whole on reload
struct Tables {
    by_extension: HashMap<String, Arc<Device>>,
    by_name: HashMap<String, Arc<Device>>,
    ordered: Vec<Arc<Device>>,
    default: Arc<Device>,
}

impl Tables {
    fn build(configs: &[DeviceConfig], default_language: &str) -> Self {
        let mut by_extension = HashMap::new();
        let mut by_name = HashMap::new();
        let mut ordered = Vec::new();

        for config in configs {
            let device = match validate(config, default_language) {
                Ok(d) => Arc::new(d),
                Err(reason) => {
                    warn!(name = %config.name, extension = %config.extension, "skipping device: {}", reason);
                    continue;
                }
            };
            if by_extension.contains_key(&device.extension) {
                warn!(extension = %device.extension, "skipping device: duplicate extension");
                continue;
            }
            let name_key = device.name.to_lowercase();
            if by_name.contains_key(&name_key) {
                warn!(name = %device.name, "skipping device: duplicate name");
                continue;
            }

            by_extension.insert(device.extension.clone(), device.clone());
            by_name.insert(name_key, device.clone());
            ordered.push(device);
        }

        Self { by_extension, by_name, ordered, default: Arc::new(Device::fallback(default_language)) }
    }
}

/// Source the registry reloads device definitions from
pub trait DeviceSource: Send + Sync {
    fn load(&self) -> Result<Vec<DeviceConfig>>;
}

/// Reload from the engine's TOML config file
pub struct ConfigFileSource {
    path: std::path::PathBuf,
}

impl ConfigFileSource {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeviceSource for ConfigFileSource {
    fn load(&self) -> Result<Vec<DeviceConfig>> {
        Ok(crate::config::EngineConfig::load(&self.path)?.devices)
    }
}

/// The registry. Read-mostly; reload swaps the whole table set.
pub struct DeviceRegistry {
    tables: RwLock<Arc<Tables>>,
    source: Option<Box<dyn DeviceSource>>,
    default_language: String,
}

impl DeviceRegistry {
    pub fn new(configs: &[DeviceConfig], default_language: &str) -> Self {
        let tables = Tables::build(configs, default_language);
        info!(devices = tables.ordered.len(), "device registry loaded");
        Self {
            tables: RwLock::new(Arc::new(tables)),
            source: None,
            default_language: default_language.to_string(),
        }
    }

    /// Attach a reload source (config file in production).
    pub fn with_source(mut self, source: Box<dyn DeviceSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Lookup by extension first, then case-insensitive name. Total: misses
    /// get the reserved default device.
    pub fn get(&self, identifier: &str) -> Arc<Device> {
        let tables = self.tables.read().clone();
        if let Some(device) = tables.by_extension.get(identifier) {
            return device.clone();
        }
        if let Some(device) = tables.by_name.get(&identifier.to_lowercase()) {
            return device.clone();
        }
        tables.default.clone()
    }

    /// As [`get`](Self::get) but distinguishing a genuine miss.
    pub fn find(&self, identifier: &str) -> Option<Arc<Device>> {
        let tables = self.tables.read().clone();
        tables
            .by_extension
            .get(identifier)
            .or_else(|| tables.by_name.get(&identifier.to_lowercase()))
            .cloned()
    }

    pub fn default_device(&self) -> Arc<Device> {
        self.tables.read().default.clone()
    }

    pub fn all(&self) -> Vec<Arc<Device>> {
        self.tables.read().ordered.clone()
    }

    /// Devices that should hold a SIP registration
    pub fn registrable(&self) -> Vec<Arc<Device>> {
        self.tables.read().ordered.iter().filter(|d| d.is_registrable()).cloned().collect()
    }

    /// Re-read the source and swap the tables. Readers never observe a
    /// partial set. Without a source this is a no-op.
    pub fn reload(&self) -> Result<usize> {
        let Some(source) = &self.source else {
            return Ok(self.tables.read().ordered.len());
        };
        let configs = source.load()?;
        let fresh = Arc::new(Tables::build(&configs, &self.default_language));
        let count = fresh.ordered.len();
        *self.tables.write() = fresh;
        info!(devices = count, "device registry reloaded");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<DeviceConfig> {
        vec![
            DeviceConfig {
                extension: "12611".into(),
                name: "Morpheus".into(),
                auth_id: Some("morpheus-auth".into()),
                password: Some("pw".into()),
                language: Some("en".into()),
                ..Default::default()
            },
            DeviceConfig {
                extension: "12612".into(),
                name: "Cephanie".into(),
                language: Some("he".into()),
                greeting: Some("שלום".into()),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn lookup_tries_extension_then_name_case_insensitively() {
        let registry = DeviceRegistry::new(&configs(), "en");
        assert_eq!(registry.get("12611").name, "Morpheus");
        assert_eq!(registry.get("cephanie").extension, "12612");
        assert_eq!(registry.get("MORPHEUS").extension, "12611");
    }

    #[test]
    fn miss_returns_the_reserved_default() {
        let registry = DeviceRegistry::new(&configs(), "en");
        let device = registry.get("99999");
        assert_eq!(device.name, "default");
        assert!(registry.find("99999").is_none());
        assert!(registry.find("Morpheus").is_some());
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let mut bad = configs();
        bad.push(DeviceConfig { extension: "12".into(), name: "TooShort".into(), ..Default::default() });
        bad.push(DeviceConfig { extension: "1261a".into(), name: "NotDigits".into(), ..Default::default() });
        bad.push(DeviceConfig {
            extension: "12613".into(),
            name: "morpheus".into(), // duplicate name, different case
            ..Default::default()
        });

        let registry = DeviceRegistry::new(&bad, "en");
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn registrable_filters_on_credentials() {
        let registry = DeviceRegistry::new(&configs(), "en");
        let registrable = registry.registrable();
        assert_eq!(registrable.len(), 1);
        assert_eq!(registrable[0].name, "Morpheus");
    }

    struct StaticSource(Vec<DeviceConfig>);

    impl DeviceSource for StaticSource {
        fn load(&self) -> Result<Vec<DeviceConfig>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn reload_with_identical_input_keeps_lookups_stable() {
        let registry =
            DeviceRegistry::new(&configs(), "en").with_source(Box::new(StaticSource(configs())));
        let before = registry.get("Cephanie").extension.clone();
        registry.reload().unwrap();
        assert_eq!(registry.get("Cephanie").extension, before);
        assert_eq!(registry.all().len(), 2);
    }

    #[test]
    fn reload_swaps_in_the_new_set() {
        let registry = DeviceRegistry::new(&configs(), "en").with_source(Box::new(StaticSource(vec![
            DeviceConfig { extension: "30001".into(), name: "Fresh".into(), ..Default::default() },
        ])));
        registry.reload().unwrap();
        assert!(registry.find("Morpheus").is_none());
        assert_eq!(registry.get("Fresh").extension, "30001");
    }
}
