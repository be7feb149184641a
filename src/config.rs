use crate::models::{ProviderConfig, ProviderId};
use anyhow::{Context, Result};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "screenai";
const SETTINGS_FILE_NAME: &str = "settings.json";
const KEYRING_SERVICE_PREFIX: &str = "screenai_api_key";
const KEYRING_USER: &str = "default";
/// `api_key_ref` value that reads the key from the OS keyring.
pub const KEYRING_REF: &str = "keyring";

/// Process-wide settings: one config per provider plus the persona and
/// response-language preferences applied to every turn.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub providers: HashMap<ProviderId, ProviderConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_language: Option<String>,
    // Provider used for new conversations
    #[serde(default = "default_provider")]
    pub default_provider: ProviderId,
}

fn default_provider() -> ProviderId {
    ProviderId::Ollama
}

impl Default for Settings {
    /// Every vendor present, only the local one enabled.
    fn default() -> Self {
        let providers = ProviderId::ALL
            .into_iter()
            .map(|id| {
                let mut config = ProviderConfig::new(id);
                config.enabled = !id.requires_api_key();
                (id, config)
            })
            .collect();
        Self {
            providers,
            system_prompt: None,
            response_language: None,
            default_provider: default_provider(),
        }
    }
}

impl Settings {
    /// Location of the settings file in the platform config directory.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Failed to resolve the platform config directory")?;
        Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        log::debug!("Loading settings from {}", path.display());
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file '{}'", path.display()))?;
        let mut settings: Settings = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse settings file '{}'", path.display()))?;

        // Providers absent from the file fall back to their disabled defaults
        for id in ProviderId::ALL {
            settings.providers.entry(id).or_insert_with(|| ProviderConfig::new(id));
        }
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory '{}'", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write settings file '{}'", path.display()))?;
        log::info!("Settings saved to {}", path.display());
        Ok(())
    }

    pub fn provider(&self, id: ProviderId) -> Option<&ProviderConfig> {
        self.providers.get(&id)
    }

    /// Points `provider` at the key stored in the keyring and enables it.
    /// An inline key would shadow the keyring, so it is removed.
    pub fn use_keyring_key(&mut self, provider: ProviderId) {
        let config = self
            .providers
            .entry(provider)
            .or_insert_with(|| ProviderConfig::new(provider));
        config.api_key = None;
        config.api_key_ref = Some(KEYRING_REF.to_string());
        config.enabled = true;
    }

    /// System prompt sent with every request, with the language preference
    /// appended as an instruction.
    pub fn effective_system_prompt(&self) -> Option<String> {
        let prompt = self.system_prompt.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let language = self
            .response_language
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|lang| format!("Respond in {}.", lang));

        match (prompt, language) {
            (Some(p), Some(l)) => Some(format!("{}\n\n{}", p, l)),
            (Some(p), None) => Some(p.to_string()),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        }
    }
}

// --- API Key Retrieval ---

/// Resolves the API key for a provider. An inline key wins over `api_key_ref`,
/// which may point at an environment variable (`env:NAME`) or the OS keyring
/// (`keyring`). Returns `None` when nothing usable is configured.
pub fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
    if let Some(key) = config.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
        return Some(key.to_string());
    }
    let reference = config.api_key_ref.as_deref()?;
    match read_key_ref(config.provider_id, reference) {
        Ok(key) if !key.trim().is_empty() => Some(key.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            log::warn!("No API key for {}: {:#}", config.provider_id, e);
            None
        }
    }
}

fn read_key_ref(provider: ProviderId, reference: &str) -> Result<String> {
    match reference {
        r if r.starts_with("env:") => {
            let env_var_name = r.trim_start_matches("env:");
            log::debug!("Retrieving API key from environment variable: {}", env_var_name);
            std::env::var(env_var_name)
                .with_context(|| format!("Failed to get API key from environment variable '{}'", env_var_name))
        }
        KEYRING_REF => {
            let entry = keyring_entry(provider)?;
            log::debug!("Retrieving API key from keyring for {}", provider);
            entry
                .get_password()
                .with_context(|| format!("Failed to get API key from keyring for '{}'", provider))
        }
        other => Err(anyhow::anyhow!("Unsupported api_key_ref format: {}", other)),
    }
}

/// Stores an API key in the OS keyring for the given provider.
pub fn set_api_key_in_keyring(provider: ProviderId, api_key: &str) -> Result<()> {
    let entry = keyring_entry(provider)?;
    log::info!("Setting API key in keyring for {}", provider);
    entry
        .set_password(api_key)
        .with_context(|| format!("Failed to set API key in keyring for '{}'", provider))
}

fn keyring_entry(provider: ProviderId) -> Result<Entry> {
    let service_name = format!("{}-{}", KEYRING_SERVICE_PREFIX, provider);
    Entry::new(&service_name, KEYRING_USER).context("Failed to create keyring entry")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_enables_only_the_local_provider() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(settings.providers.len(), ProviderId::ALL.len());
        assert!(settings.provider(ProviderId::Ollama).unwrap().enabled);
        assert!(!settings.provider(ProviderId::Anthropic).unwrap().enabled);
        assert_eq!(settings.default_provider, ProviderId::Ollama);
    }

    #[test]
    fn save_then_load_keeps_provider_settings() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        let anthropic = settings.providers.get_mut(&ProviderId::Anthropic).unwrap();
        anthropic.enabled = true;
        anthropic.api_key_ref = Some("env:ANTHROPIC_API_KEY".into());
        settings.response_language = Some("German".into());
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_fills_in_missing_providers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"providers": {"groq": {"provider_id": "groq", "api_key": "gsk", "enabled": true}}}"#,
        )
        .unwrap();

        let settings = Settings::load(&path).unwrap();
        let groq = settings.provider(ProviderId::Groq).unwrap();
        assert!(groq.enabled);
        assert_eq!(groq.effective_model(), ProviderId::Groq.default_model());
        assert!(!settings.provider(ProviderId::Ollama).unwrap().enabled);
        assert_eq!(settings.providers.len(), ProviderId::ALL.len());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse settings file"));
    }

    #[test]
    fn system_prompt_combines_with_language() {
        let mut settings = Settings::default();
        assert_eq!(settings.effective_system_prompt(), None);

        settings.response_language = Some("French".into());
        assert_eq!(settings.effective_system_prompt().as_deref(), Some("Respond in French."));

        settings.system_prompt = Some("You explain screenshots.".into());
        assert_eq!(
            settings.effective_system_prompt().as_deref(),
            Some("You explain screenshots.\n\nRespond in French.")
        );
    }

    #[test]
    fn keyring_reference_replaces_inline_key() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.providers.get_mut(&ProviderId::Gemini).unwrap().api_key = Some("stale".into());

        settings.use_keyring_key(ProviderId::Gemini);
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        let gemini = loaded.provider(ProviderId::Gemini).unwrap();
        assert!(gemini.enabled);
        assert_eq!(gemini.api_key, None);
        assert_eq!(gemini.api_key_ref.as_deref(), Some(KEYRING_REF));
        assert!(!loaded.provider(ProviderId::OpenAi).unwrap().enabled);
    }

    #[test]
    fn inline_key_wins_over_reference() {
        let mut config = ProviderConfig::new(ProviderId::OpenAi);
        config.api_key = Some(" sk-inline ".into());
        config.api_key_ref = Some("env:SCREENAI_TEST_UNUSED".into());
        assert_eq!(resolve_api_key(&config).as_deref(), Some("sk-inline"));
    }

    #[test]
    fn env_reference_is_resolved() {
        std::env::set_var("SCREENAI_TEST_GROQ_KEY", "gsk-env");
        let mut config = ProviderConfig::new(ProviderId::Groq);
        config.api_key_ref = Some("env:SCREENAI_TEST_GROQ_KEY".into());
        assert_eq!(resolve_api_key(&config).as_deref(), Some("gsk-env"));

        config.api_key_ref = Some("env:SCREENAI_TEST_MISSING_KEY".into());
        assert_eq!(resolve_api_key(&config), None);

        config.api_key_ref = Some("vault:foo".into());
        assert_eq!(resolve_api_key(&config), None);
    }
}
