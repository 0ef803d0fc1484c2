use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use validator::Validate;

use crate::forwarding::ForwardingResult;
use crate::node::{NodeOptions, NodeRole};
use crate::signatures::{DirectionalKeys, Ed25519Policy, SignaturePolicy, SigningKey, Unsigned, VerificationMode};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    pub node: NodeConfig,
    #[validate(nested)]
    pub server: ServerConfig,
    #[validate(nested)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    #[validate(nested)]
    pub signatures: SignaturesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NodeConfig {
    #[validate(length(min = 1, max = 48))]
    pub id: String,
    pub role: NodeRole,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    #[validate(length(min = 1))]
    pub host: String,
    pub port: u16,
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CorrelationConfig {
    #[validate(range(min = 1, max = 3600))]
    pub default_timeout_secs: u64,
    #[validate(range(min = 1, max = 3600))]
    pub relay_timeout_secs: u64,
    #[validate(range(min = 1, max = 60))]
    pub sweep_interval_secs: u64,
}

impl CorrelationConfig {
    pub fn node_options(&self) -> NodeOptions {
        NodeOptions {
            request_timeout: Duration::from_secs(self.default_timeout_secs),
            relay_timeout: Duration::from_secs(self.relay_timeout_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForwardingConfig {
    #[serde(default)]
    pub default_result: ForwardingResult,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SignaturesConfig {
    #[serde(default)]
    pub request_verification: VerificationMode,
    #[serde(default)]
    pub response_verification: VerificationMode,
    #[validate(nested)]
    pub signing_key: Option<SigningKeyConfig>,
    /// key id -> hex encoded Ed25519 public key
    #[serde(default)]
    pub trusted_keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SigningKeyConfig {
    #[validate(length(min = 1))]
    pub key_id: String,
    #[validate(length(equal = 64))]
    pub seed_hex: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// EnvFilter directives used when `RUST_LOG` is unset
    pub filter: Option<String>,
}

impl SignaturesConfig {
    /// Policy described by this section; `Unsigned` when nothing is configured.
    pub fn policy(&self) -> Result<Arc<dyn SignaturePolicy>> {
        let unconfigured = self.signing_key.is_none()
            && self.trusted_keys.is_empty()
            && self.request_verification == VerificationMode::Ignore
            && self.response_verification == VerificationMode::Ignore;
        if unconfigured {
            return Ok(Arc::new(Unsigned));
        }

        let signing_key = self
            .signing_key
            .as_ref()
            .map(|k| SigningKey::from_seed_hex(k.key_id.clone(), &k.seed_hex))
            .transpose()?
            .map(Arc::new);

        let keys = |mode: VerificationMode| -> Result<DirectionalKeys> {
            let mut keys = DirectionalKeys::new(mode);
            if let Some(key) = &signing_key {
                keys = keys.with_signing_key(key.clone());
            }
            for (key_id, public_key) in &self.trusted_keys {
                keys = keys.trust_hex(key_id.clone(), public_key)?;
            }
            Ok(keys)
        };

        Ok(Arc::new(Ed25519Policy::new(
            keys(self.request_verification)?,
            keys(self.response_verification)?,
        )))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("OCPP_NODE__").split("__"));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        [node]
        id = "NN01"
        role = "networking_node"

        [server]
        host = "127.0.0.1"
        port = 8080
        request_timeout_secs = 30

        [correlation]
        default_timeout_secs = 30
        relay_timeout_secs = 60
        sweep_interval_secs = 1
    "#;

    fn load(extra: &str) -> Result<Config> {
        Config::extract(Figment::new().merge(Toml::string(&format!("{BASE}\n{extra}"))))
    }

    #[test]
    fn test_defaults() {
        let config = load("").unwrap();
        assert_eq!(config.node.role, NodeRole::NetworkingNode);
        assert_eq!(config.forwarding.default_result, ForwardingResult::Forward);
        assert_eq!(config.correlation.node_options().relay_timeout, Duration::from_secs(60));
        assert_eq!(config.server.socket_addr().unwrap().port(), 8080);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.filter.is_none());
    }

    #[test]
    fn test_logging_section() {
        let config = load(
            r#"
            [logging]
            format = "pretty"
            filter = "warn,ocpp_node=trace"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.filter.as_deref(), Some("warn,ocpp_node=trace"));
    }

    #[test]
    fn test_forwarding_and_signatures() {
        let config = load(
            r#"
            [forwarding]
            default_result = "DROP"

            [signatures]
            request_verification = "require"
            trusted_keys = { cs001 = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a" }

            [signatures.signing_key]
            key_id = "nn01"
            seed_hex = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60"
            "#,
        )
        .unwrap();
        assert_eq!(config.forwarding.default_result, ForwardingResult::Drop);
        assert_eq!(config.signatures.request_verification, VerificationMode::Require);
        assert!(config.signatures.policy().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_sweep = Config::extract(Figment::new().merge(Toml::string(
            &BASE.replace("sweep_interval_secs = 1", "sweep_interval_secs = 0"),
        )));
        assert!(zero_sweep.is_err());

        let short_seed = load(
            r#"
            [signatures.signing_key]
            key_id = "nn01"
            seed_hex = "abcd"
            "#,
        );
        assert!(short_seed.is_err());
    }

    #[test]
    fn test_bad_trusted_key_fails_policy() {
        let config = load(
            r#"
            [signatures]
            trusted_keys = { cs001 = "zz" }
            "#,
        )
        .unwrap();
        assert!(config.signatures.policy().is_err());
    }
}
