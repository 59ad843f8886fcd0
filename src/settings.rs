use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::authz::engine::MethodCallDefault;
use crate::errors::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    pub server: Server,
    pub policies: Policies,
    pub org_cache: OrgCache,
    #[serde(default)]
    pub method_calls: MethodCalls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    /// Port of the admin API
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policies {
    /// Directory of `.kdl` policy files
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgCache {
    /// Prefix of every cache key
    pub name: String,
    pub ttl_secs: u64,
    pub max_capacity: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MethodCalls {
    /// Verdict for methods no ACL entry mentions
    #[serde(default)]
    pub default: MethodCallDefault,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8181,
        }
    }
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("policies"),
        }
    }
}

impl Default for OrgCache {
    fn default() -> Self {
        Self {
            name: "org_descendants".to_string(),
            ttl_secs: 3600,
            max_capacity: 100_000,
        }
    }
}

impl Settings {
    pub fn load(path: &str) -> Result<Self, ServiceError> {
        let mut builder = config::Config::builder()
            .set_default("server.host", Server::default().host)?
            .set_default("server.port", Server::default().port)?
            .set_default(
                "policies.dir",
                Policies::default().dir.to_string_lossy().to_string(),
            )?
            .set_default("org_cache.name", OrgCache::default().name)?
            .set_default("org_cache.ttl_secs", OrgCache::default().ttl_secs)?
            .set_default("org_cache.max_capacity", OrgCache::default().max_capacity)?
            .set_default("method_calls.default", "allow")?;

        // Optional file
        if Path::new(path).exists() {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Environment overrides: GATEKEEPER__SERVER__PORT=9090, etc.
        builder =
            builder.add_source(config::Environment::with_prefix("GATEKEEPER").separator("__"));

        let mut s: Settings = builder.build()?.try_deserialize()?;

        if s.policies.dir.is_relative() {
            s.policies.dir = std::env::current_dir()?.join(&s.policies.dir);
        }

        Ok(s)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
