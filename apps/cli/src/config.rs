//! Configuration for the `tandem` command line

use serde::Deserialize;
use std::path::Path;
use tandem_graph::LoadStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub fhir: FhirConfig,
    #[serde(default)]
    pub terminology: TerminologyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
    /// Service base, e.g. `https://fhir.example.org/r4`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// `per-type` (one search per type) or `batch` (one batch bundle).
    #[serde(default)]
    pub load_strategy: LoadStrategy,
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TerminologyConfig {
    /// JSON file of category and code mappings. Built-in SDOH defaults when unset.
    pub mappings_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_base_url() -> String {
    "http://localhost:8080/fhir".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// Load configuration from defaults, an optional config file and the environment.
    ///
    /// Environment variables use a `TANDEM` prefix and `__` for nesting:
    /// `TANDEM__FHIR__BASE_URL` sets `fhir.base_url`.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .set_default("fhir.base_url", default_base_url())?
            .set_default("fhir.timeout_seconds", default_timeout() as i64)?
            .set_default("fhir.load_strategy", "per-type")?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?;

        builder = match file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("tandem").required(false)),
        };

        let config = builder
            .add_source(
                config::Environment::with_prefix("TANDEM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.fhir.base_url.trim().is_empty() {
            return Err("fhir.base_url must not be empty".to_string());
        }
        if self.fhir.timeout_seconds == 0 {
            return Err("fhir.timeout_seconds must be > 0".to_string());
        }
        if self.logging.level.trim().is_empty() {
            return Err("logging.level must not be empty".to_string());
        }
        Ok(())
    }
}
