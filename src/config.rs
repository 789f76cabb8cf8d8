use crate::error::GatewayError;
use crate::gateway::codec::ClientProperties;
use crate::gateway::handshake::{Identity, default_properties};
use crate::gateway::intents::Intents;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;

const ENV_PREFIX: &str = "GATEWAY_";

#[derive(Clone)]
pub struct GatewayConfig {
    pub token: String,
    pub gateway_url: String,
    pub version: u8,
    pub encoding: String,
    /// Intent names; empty means every known intent.
    pub intents: Vec<String>,
    pub client_name: String,
    pub device_name: String,
    pub log_dir: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialGatewayConfig {
    token: Option<String>,
    gateway_url: Option<String>,
    version: Option<u8>,
    encoding: Option<String>,
    intents: Option<Vec<String>>,
    client_name: Option<String>,
    device_name: Option<String>,
    log_dir: Option<String>,
}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg".to_string()
}

fn default_encoding() -> String {
    "json".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

const DEFAULT_VERSION: u8 = 10;

impl GatewayConfig {
    /// Loads the optional TOML file at `config_path`, then applies `GATEWAY_*`
    /// environment overrides (a `.env` file is read first).
    pub fn load(config_path: Option<&Path>) -> Result<Self, GatewayError> {
        dotenv::dotenv().ok();

        let file_contents = match config_path {
            Some(path) => Some(fs::read_to_string(path).map_err(|e| {
                GatewayError::Config(format!("Failed to read config file at {path:?}: {e}"))
            })?),
            None => None,
        };
        Self::from_sources(file_contents.as_deref(), std::env::vars())
    }

    /// Same layering as [`load`](Self::load) over explicit sources.
    pub fn from_sources<I>(file_contents: Option<&str>, env: I) -> Result<Self, GatewayError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let file_config: PartialGatewayConfig = match file_contents {
            Some(contents) => toml::from_str(contents)
                .map_err(|e| GatewayError::Config(format!("Failed to parse TOML config: {e}")))?,
            None => PartialGatewayConfig::default(),
        };

        let env_config: PartialGatewayConfig = envy::prefixed(ENV_PREFIX)
            .from_iter(env)
            .map_err(|e| GatewayError::Config(format!("Failed to load config from environment: {e}")))?;

        // Environment overrides file.
        let config = GatewayConfig {
            token: env_config
                .token
                .or(file_config.token)
                .filter(|token| !token.trim().is_empty())
                .ok_or_else(|| GatewayError::Config(format!("{ENV_PREFIX}TOKEN is required")))?,
            gateway_url: env_config
                .gateway_url
                .or(file_config.gateway_url)
                .unwrap_or_else(default_gateway_url),
            version: env_config.version.or(file_config.version).unwrap_or(DEFAULT_VERSION),
            encoding: env_config
                .encoding
                .or(file_config.encoding)
                .unwrap_or_else(default_encoding),
            intents: env_config.intents.or(file_config.intents).unwrap_or_default(),
            client_name: env_config
                .client_name
                .or(file_config.client_name)
                .unwrap_or_else(|| default_properties().client_name),
            device_name: env_config
                .device_name
                .or(file_config.device_name)
                .unwrap_or_else(|| default_properties().device_name),
            log_dir: env_config.log_dir.or(file_config.log_dir).unwrap_or_else(default_log_dir),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.encoding != "json" {
            return Err(GatewayError::Config(format!(
                "unsupported encoding '{}', only 'json' is available",
                self.encoding
            )));
        }
        self.intents()?;
        Ok(())
    }

    /// `<gateway_url>/?v=<version>&encoding=<encoding>`
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/?v={}&encoding={}",
            self.gateway_url.trim_end_matches('/'),
            self.version,
            self.encoding
        )
    }

    pub fn intents(&self) -> Result<Intents, GatewayError> {
        if self.intents.is_empty() {
            return Ok(Intents::all());
        }
        Intents::from_names(&self.intents)
    }

    pub fn identity(&self) -> Result<Identity, GatewayError> {
        let properties = ClientProperties {
            client_name: self.client_name.clone(),
            device_name: self.device_name.clone(),
            ..default_properties()
        };
        Ok(Identity::new(self.token.clone(), self.intents()?).with_properties(properties))
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("gateway_url", &self.gateway_url)
            .field("version", &self.version)
            .field("encoding", &self.encoding)
            .field("intents", &self.intents)
            .field("client_name", &self.client_name)
            .field("device_name", &self.device_name)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults_with_token_only() {
        let config = GatewayConfig::from_sources(None, env(&[("GATEWAY_TOKEN", "abc")])).unwrap();
        assert_eq!(config.token, "abc");
        assert_eq!(config.endpoint_url(), "wss://gateway.discord.gg/?v=10&encoding=json");
        assert_eq!(config.intents().unwrap(), Intents::all());
        assert_eq!(config.log_dir, "logs");
    }

    #[test]
    fn test_missing_token_is_an_error() {
        let err = GatewayConfig::from_sources(None, env(&[("UNRELATED", "x")])).unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("GATEWAY_TOKEN")));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = r#"
            token = "from-file"
            gateway_url = "wss://example.test/"
            intents = ["GUILDS", "guild_messages"]
            log_dir = "/var/log/gateway"
        "#;
        let config = GatewayConfig::from_sources(
            Some(file),
            env(&[("GATEWAY_TOKEN", "from-env"), ("GATEWAY_VERSION", "9")]),
        )
        .unwrap();
        assert_eq!(config.token, "from-env");
        assert_eq!(config.endpoint_url(), "wss://example.test/?v=9&encoding=json");
        assert_eq!(config.intents().unwrap(), Intents::GUILDS | Intents::GUILD_MESSAGES);
        assert_eq!(config.log_dir, "/var/log/gateway");
    }

    #[test]
    fn test_env_intents_list() {
        let config = GatewayConfig::from_sources(
            None,
            env(&[("GATEWAY_TOKEN", "t"), ("GATEWAY_INTENTS", "DIRECT_MESSAGES,GUILDS")]),
        )
        .unwrap();
        assert_eq!(config.intents().unwrap(), Intents::DIRECT_MESSAGES | Intents::GUILDS);
    }

    #[test]
    fn test_rejects_unknown_encoding_and_intent() {
        let err = GatewayConfig::from_sources(
            None,
            env(&[("GATEWAY_TOKEN", "t"), ("GATEWAY_ENCODING", "etf")]),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));

        let err = GatewayConfig::from_sources(Some("token = \"t\"\nintents = [\"GUILDZ\"]"), env(&[]))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Config(msg) if msg.contains("GUILDZ")));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "token = \"file-token\"\nclient_name = \"bot\"").unwrap();
        let config = GatewayConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.client_name, "bot");
        assert_eq!(config.identity().unwrap().properties.client_name, "bot");
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = GatewayConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = GatewayConfig::from_sources(None, env(&[("GATEWAY_TOKEN", "secret-token")])).unwrap();
        assert!(!format!("{config:?}").contains("secret-token"));
    }
}
