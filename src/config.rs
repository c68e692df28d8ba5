use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap_serde_derive::ClapSerde;
use url::Url;

use crate::interpreter::{ModerationPolicy, DEFAULT_BLOCKED_LABELS, DEFAULT_THRESHOLD};

pub(crate) const DEFAULT_CONFIG_FILE: &str = "ModerationGateway.toml";

pub(crate) const DEFAULT_INFERENCE_URL: &str =
    "https://router.huggingface.co/hf-inference/models/LukeJacob2023/nsfw-image-detector";

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(8080)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Inference endpoint receiving the raw image bytes
    #[default(DEFAULT_INFERENCE_URL.to_string())]
    #[arg(long, env = "HF_API_URL")]
    pub(crate) inference_url: String,

    /// Bearer token for the inference endpoint, moderation is refused while unset
    #[default(String::new())]
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub(crate) inference_token: String,

    /// API key clients must present, authentication is disabled while unset
    #[default(String::new())]
    #[arg(long, env = "MOD_API_KEY", hide_env_values = true)]
    pub(crate) api_key: String,

    /// Minimum score at which a blocked label blocks the image
    #[default(DEFAULT_THRESHOLD)]
    #[arg(long, env = "MODERATION_THRESHOLD")]
    pub(crate) threshold: f64,

    /// Label substrings considered disallowed content
    #[default(DEFAULT_BLOCKED_LABELS.iter().map(|label| label.to_string()).collect())]
    #[arg(long, env, value_delimiter = ',')]
    pub(crate) blocked_labels: Vec<String>,

    /// Timeout in seconds for the inference request
    #[default(25)]
    #[arg(long, env)]
    pub(crate) upstream_timeout: u64,

    /// Largest accepted request body in bytes
    #[default(10_000_000)]
    #[arg(long, env)]
    pub(crate) max_upload_bytes: usize,

    /// OTLP collector endpoint, telemetry is only exported when set
    #[default(String::new())]
    #[arg(long, env)]
    pub(crate) otel_endpoint: String,

    /// Keep logging to the console while exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        Self::from_toml_str(&str)
    }

    /// Like [`Config::from_toml`], but a missing file yields `None`. Any other failure is an error.
    pub fn from_toml_if_present(path: &str) -> Result<Option<Self>> {
        match Self::from_toml(path) {
            Ok(config) => Ok(Some(config)),
            Err(err)
                if err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|err| err.kind() == std::io::ErrorKind::NotFound) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn from_toml_str(str: &str) -> Result<Self> {
        let opt: <Config as ClapSerde>::Opt = toml::from_str(str)?;
        Ok(Config::from(opt))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            bail!("Threshold {} is outside of [0, 1]", self.threshold);
        }
        if self.upstream_timeout == 0 {
            bail!("Upstream timeout must be at least one second");
        }
        if self.max_upload_bytes == 0 {
            bail!("Maximum upload size must be positive");
        }
        self.inference_url()?;
        Ok(())
    }

    pub fn inference_url(&self) -> Result<Url> {
        Url::parse(&self.inference_url)
            .with_context(|| format!("Invalid inference URL {}", self.inference_url))
    }

    pub fn inference_token(&self) -> Option<&str> {
        non_empty(&self.inference_token)
    }

    pub fn api_key(&self) -> Option<&str> {
        non_empty(&self.api_key)
    }

    pub fn otel_endpoint(&self) -> Option<&str> {
        non_empty(&self.otel_endpoint)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn policy(&self) -> ModerationPolicy {
        ModerationPolicy::new(self.threshold, &self.blocked_labels)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.threshold, 0.6);
        assert_eq!(config.upstream_timeout(), Duration::from_secs(25));
        assert_eq!(config.inference_url().unwrap().as_str(), DEFAULT_INFERENCE_URL);
        assert!(config.inference_token().is_none());
        assert!(config.api_key().is_none());
        assert!(config.otel_endpoint().is_none());
        assert_eq!(config.policy(), ModerationPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            port = 9000
            api_key = "  secret  "
            threshold = 0.8
            blocked_labels = ["nsfw", "gore"]
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.api_key(), Some("secret"));
        assert_eq!(config.policy(), ModerationPolicy::new(0.8, ["nsfw", "gore"]));
    }

    #[test]
    fn rejects_invalid_values() {
        let config = Config::from_toml_str("threshold = 1.5").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml_str("upstream_timeout = 0").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_toml_str(r#"inference_url = "not a url""#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_toml("/nonexistent/ModerationGateway.toml").is_err());
    }

    #[test]
    fn optional_file_may_be_missing() {
        let config = Config::from_toml_if_present("/nonexistent/ModerationGateway.toml").unwrap();
        assert!(config.is_none());
    }

    #[test]
    fn optional_file_with_syntax_error_is_fatal() {
        let path = std::env::temp_dir().join(format!(
            "moderation-gateway-broken-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "api_key = \"secret\"\nport = ").unwrap();

        let result = Config::from_toml_if_present(path.to_str().unwrap());
        std::fs::remove_file(&path).unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn optional_file_is_read_when_present() {
        let path = std::env::temp_dir().join(format!(
            "moderation-gateway-valid-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "api_key = \"secret\"").unwrap();

        let config = Config::from_toml_if_present(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.unwrap().api_key(), Some("secret"));
    }
}
