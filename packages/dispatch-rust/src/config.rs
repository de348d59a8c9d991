//! Deployment and dispatcher configuration.

use std::sync::LazyLock;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use storelane_core::{ConnectTarget, Credentials, DeploymentIdentity};

/// Path segment after the host list, up to the query string.
static DATABASE_IN_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://[^/?]*/?([^?]*)").expect("static regex")
});

static URI_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("static regex"));

/// Errors raised while building or validating a [`DeploymentConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing connection uri")]
    MissingUri,
    #[error("connection uri has no scheme: {uri}")]
    InvalidUri { uri: String },
    #[error("failed to parse options: {0}")]
    InvalidOptions(#[from] serde_json::Error),
    #[error("options must be a JSON object")]
    OptionsNotObject,
}

/// One target deployment: where to connect, how, and how many operations may
/// be in flight against it at once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Display name, not part of the identity.
    #[serde(default)]
    pub name: Option<String>,
    /// Connection URI, e.g. `mongodb://db.internal:27017/orders`.
    #[serde(default)]
    pub uri: String,
    /// Driver options forwarded verbatim.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Maximum concurrently in-flight operations. 0 means unbounded.
    #[serde(default)]
    pub parallelism: u32,
    /// Set for deployments bound from the hosting platform; such deployments
    /// are keyed by service name instead of by connection fingerprint.
    #[serde(default)]
    pub service: Option<String>,
}

impl DeploymentConfig {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// A deployment bound from a platform service. Only the URI is known.
    #[must_use]
    pub fn for_service(service: impl Into<String>, uri: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            name: Some(service.clone()),
            uri: uri.into(),
            service: Some(service),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }

    /// Parses driver options from their raw JSON text.
    ///
    /// Blank input leaves the options empty.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidOptions`] for malformed JSON and
    /// [`ConfigError::OptionsNotObject`] when the JSON is not an object.
    pub fn with_options_json(mut self, raw: &str) -> Result<Self, ConfigError> {
        if raw.trim().is_empty() {
            return Ok(self);
        }
        match serde_json::from_str::<serde_json::Value>(raw)? {
            serde_json::Value::Object(options) => {
                self.options = options;
                Ok(self)
            }
            _ => Err(ConfigError::OptionsNotObject),
        }
    }

    /// Checks that the deployment names a connection target.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUri`] or [`ConfigError::InvalidUri`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::MissingUri);
        }
        if !URI_SCHEME.is_match(&self.uri) {
            return Err(ConfigError::InvalidUri {
                uri: self.uri.clone(),
            });
        }
        Ok(())
    }

    /// Admission limit for the pooled resource.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.parallelism as usize
    }

    /// Pool key for this deployment.
    #[must_use]
    pub fn identity(&self) -> DeploymentIdentity {
        if let Some(service) = &self.service {
            return DeploymentIdentity::service(service.clone());
        }
        let mut hasher = Sha256::new();
        hasher.update(self.uri.as_bytes());
        hasher.update([0]);
        // serde_json's default map is ordered, so this is canonical.
        hasher.update(serde_json::Value::Object(self.options.clone()).to_string().as_bytes());
        hasher.update([0]);
        if let Some(credentials) = &self.credentials {
            hasher.update(credentials.user.as_bytes());
            hasher.update([0]);
            hasher.update(credentials.password.as_bytes());
        }
        let digest = hasher.finalize();
        DeploymentIdentity::configured(hex::encode(&digest[..16]))
    }

    /// Database named by the percent-decoded URI path, or empty for the
    /// driver default.
    #[must_use]
    pub fn database_name(&self) -> String {
        DATABASE_IN_URI
            .captures(&self.uri)
            .and_then(|caps| caps.get(1))
            .map(|m| percent_decode_str(m.as_str()).decode_utf8_lossy().into_owned())
            .unwrap_or_default()
    }

    /// What the driver needs to open a connection for this deployment.
    #[must_use]
    pub fn connect_target(&self) -> ConnectTarget {
        ConnectTarget {
            uri: self.uri.clone(),
            database: self.database_name(),
            options: self.options.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// Per-dispatcher settings.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Collection used when set; otherwise each task names its own.
    pub collection: Option<String>,
    /// Operation used when set; otherwise each task names its own.
    pub operation: Option<String>,
    /// Minimum spacing of profiling status reports.
    pub status_interval: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            collection: None,
            operation: None,
            status_interval: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_name_comes_from_uri_path() {
        let cases = [
            ("mongodb://localhost:27017/orders", "orders"),
            ("mongodb://a:1,b:2/orders?replicaSet=rs0", "orders"),
            ("mongodb://localhost:27017", ""),
            ("mongodb://localhost:27017/?w=1", ""),
            ("mongodb+srv://cluster.example.net/app", "app"),
        ];
        for (uri, expected) in cases {
            assert_eq!(DeploymentConfig::new(uri).database_name(), expected, "{uri}");
        }
    }

    #[test]
    fn database_name_is_percent_decoded() {
        let config = DeploymentConfig::new("mongodb://h/my%20db?w=1");
        assert_eq!(config.database_name(), "my db");
        assert_eq!(config.connect_target().database, "my db");
        assert_eq!(DeploymentConfig::new("mongodb://h/caf%C3%A9").database_name(), "café");
    }

    #[test]
    fn validate_rejects_missing_or_schemeless_uri() {
        assert!(matches!(
            DeploymentConfig::new("  ").validate(),
            Err(ConfigError::MissingUri)
        ));
        assert!(matches!(
            DeploymentConfig::new("localhost:27017").validate(),
            Err(ConfigError::InvalidUri { .. })
        ));
        assert!(DeploymentConfig::new("mongodb://localhost/db").validate().is_ok());
    }

    #[test]
    fn identity_depends_on_target_options_and_credentials() {
        let base = DeploymentConfig::new("mongodb://localhost/db");
        let same = DeploymentConfig::new("mongodb://localhost/db").with_parallelism(4);
        assert_eq!(base.identity(), same.identity(), "parallelism is not part of the key");

        let other_uri = DeploymentConfig::new("mongodb://localhost/other");
        let with_options = base.clone().with_options_json(r#"{"poolSize": 5}"#).unwrap();
        let with_creds = base.clone().with_credentials("app", "pw");
        assert_ne!(base.identity(), other_uri.identity());
        assert_ne!(base.identity(), with_options.identity());
        assert_ne!(base.identity(), with_creds.identity());
    }

    #[test]
    fn service_deployments_are_keyed_by_name() {
        let a = DeploymentConfig::for_service("mongo-orders", "mongodb://a/db");
        let b = DeploymentConfig::for_service("mongo-orders", "mongodb://b/db");
        assert_eq!(a.identity(), b.identity());
        assert_eq!(a.identity(), DeploymentIdentity::service("mongo-orders"));
    }

    #[test]
    fn options_must_be_a_json_object() {
        let config = DeploymentConfig::new("mongodb://localhost/db");
        assert!(matches!(
            config.clone().with_options_json("[1, 2]"),
            Err(ConfigError::OptionsNotObject)
        ));
        assert!(matches!(
            config.clone().with_options_json("{not json"),
            Err(ConfigError::InvalidOptions(_))
        ));
        assert!(config.with_options_json("").unwrap().options.is_empty());
    }

    #[test]
    fn connect_target_carries_credentials() {
        let target = DeploymentConfig::new("mongodb://localhost/orders")
            .with_credentials("app", "pw")
            .connect_target();
        assert_eq!(target.database, "orders");
        assert_eq!(target.credentials.unwrap().user, "app");
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: DeploymentConfig =
            serde_json::from_str(r#"{"uri": "mongodb://localhost/db", "parallelism": 3}"#).unwrap();
        assert_eq!(config.limit(), 3);
        assert!(config.credentials.is_none());
        assert!(config.service.is_none());
    }

    #[test]
    fn dispatcher_settings_defaults() {
        let settings = DispatcherSettings::default();
        assert!(settings.collection.is_none());
        assert!(settings.operation.is_none());
        assert_eq!(settings.status_interval, Duration::from_secs(1));
    }
}
