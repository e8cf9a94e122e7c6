// ABOUTME: Per-language execution profiles for the container tier
// ABOUTME: Loads the bundled config/languages.json table and merges external overrides

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SandboxError};

/// How to build and run one language inside a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Base image
    pub image: String,
    /// Source file extension without the dot
    pub extension: String,
    /// Entrypoint; `{file}` is replaced with the source file name
    pub run_command: String,
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Runs only when a dependency manifest was submitted
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub manifest_file: Option<String>,
    /// Runs instead of `run_command` when tests were submitted; `{test_file}` is substituted
    #[serde(default)]
    pub test_command: Option<String>,
    #[serde(default)]
    pub test_file: Option<String>,
}

impl LanguageProfile {
    pub fn source_file(&self) -> String {
        format!("main.{}", self.extension)
    }

    pub fn run_command(&self) -> String {
        self.run_command.replace("{file}", &self.source_file())
    }

    /// Test invocation, if the profile supports tests
    pub fn test_command(&self) -> Option<String> {
        let command = self.test_command.as_ref()?;
        let test_file = self.test_file.clone().unwrap_or_default();
        Some(
            command
                .replace("{file}", &self.source_file())
                .replace("{test_file}", &test_file),
        )
    }
}

#[derive(Debug, Deserialize)]
struct ProfilesConfig {
    #[allow(dead_code)]
    version: String,
    languages: Vec<LanguageProfile>,
}

/// Registry of language profiles keyed by id and alias
#[derive(Debug, Clone)]
pub struct LanguageProfiles {
    profiles: HashMap<String, LanguageProfile>,
    aliases: HashMap<String, String>,
}

impl LanguageProfiles {
    /// Profiles shipped with the crate
    pub fn builtin() -> Result<Self> {
        let config_json = include_str!("../config/languages.json");
        let mut registry = Self {
            profiles: HashMap::new(),
            aliases: HashMap::new(),
        };
        registry.merge_json(config_json)?;
        Ok(registry)
    }

    /// Bundled profiles extended by an optional external file
    pub fn load(extra: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin()?;
        if let Some(path) = extra {
            registry.load_file(path)?;
        }
        Ok(registry)
    }

    /// Merge profiles from a JSON file. Entries with an existing id replace it.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(path)?;
        let added = self.merge_json(&contents)?;
        info!(
            "Loaded {} language profiles from {}",
            added,
            path.display()
        );
        Ok(())
    }

    fn merge_json(&mut self, json: &str) -> Result<usize> {
        let config: ProfilesConfig = serde_json::from_str(json)?;
        let count = config.languages.len();

        for profile in config.languages {
            if profile.image.is_empty() || profile.run_command.is_empty() {
                return Err(SandboxError::Validation(format!(
                    "language profile '{}' needs an image and a run command",
                    profile.id
                )));
            }
            let id = profile.id.to_lowercase();
            for alias in &profile.aliases {
                self.aliases.insert(alias.to_lowercase(), id.clone());
            }
            debug!("Registered language profile {} ({})", id, profile.image);
            self.profiles.insert(id, profile);
        }

        Ok(count)
    }

    /// Look up a profile by id or alias
    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile> {
        let key = language.to_lowercase();
        let id = self.aliases.get(&key).unwrap_or(&key);
        self.profiles
            .get(id)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    pub fn contains(&self, language: &str) -> bool {
        self.resolve(language).is_ok()
    }

    /// All profiles sorted by id
    pub fn list(&self) -> Vec<&LanguageProfile> {
        let mut profiles: Vec<_> = self.profiles.values().collect();
        profiles.sort_by(|a, b| a.id.cmp(&b.id));
        profiles
    }
}
