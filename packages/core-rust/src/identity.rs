//! Keys for pooled resources and the consumers bound to them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable key of one target resource configuration.
///
/// Two dispatchers share a pooled connection exactly when their identities
/// compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeploymentIdentity {
    /// A locally configured deployment, keyed by a fingerprint of its
    /// connection target, driver options and credentials.
    Configured { fingerprint: String },
    /// A deployment bound from the hosting platform, keyed by service name.
    Service { name: String },
}

impl DeploymentIdentity {
    /// Identity of a locally configured deployment.
    #[must_use]
    pub fn configured(fingerprint: impl Into<String>) -> Self {
        Self::Configured {
            fingerprint: fingerprint.into(),
        }
    }

    /// Identity of a platform-bound service.
    #[must_use]
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service { name: name.into() }
    }
}

impl fmt::Display for DeploymentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configured { fingerprint } => write!(f, "deployment:{fingerprint}"),
            Self::Service { name } => write!(f, "service:{name}"),
        }
    }
}

/// Process-unique identifier of a consumer (one dispatcher instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl ConsumerId {
    /// Allocates the next identifier.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}
