use serde::{Deserialize, Serialize};

/// Global configuration for Maestro
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MaestroConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub validate: ValidateConfig,
    #[serde(default)]
    pub graph: GraphConfig,
}

/// Configuration for the 'run' command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Workflow dialect catalog to compose with
    pub catalog: Option<String>,

    /// Enable verbose output
    #[serde(default)]
    pub verbose: bool,

    /// Print the journal after the workflow finishes
    #[serde(default)]
    pub show_journal: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            catalog: Some("native".to_string()),
            verbose: false,
            show_journal: true,
        }
    }
}

/// Configuration for the 'validate' command
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidateConfig {
    /// Show verbose output including all expressions checked
    #[serde(default)]
    pub verbose: bool,
}

/// Configuration for the 'graph' command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Workflow dialect catalog to compose with
    pub catalog: Option<String>,

    /// Emit compact JSON instead of pretty-printed output
    #[serde(default)]
    pub compact: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            catalog: Some("native".to_string()),
            compact: false,
        }
    }
}

impl MaestroConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Command line arguments (highest priority)
    /// 2. Environment variables (MAESTRO_*)
    /// 3. Config file (maestro.yaml in current dir or ~/.config/maestro/maestro.yaml)
    /// 4. Defaults (lowest priority)
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_builder = config::Config::builder()
            // Start with defaults
            .add_source(config::Config::try_from(&MaestroConfig::default())?)
            // Add config file from current directory
            .add_source(
                config::File::with_name("maestro")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            // Add config file from user's config directory
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/maestro/maestro",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            // Add environment variables with MAESTRO_ prefix
            .add_source(
                config::Environment::with_prefix("MAESTRO")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = config_builder.build()?;
        config.try_deserialize()
    }
}
