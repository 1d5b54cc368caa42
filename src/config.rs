use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use config::{Config as ConfigLib, ConfigError, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::Deserialize;

use crate::pki::crl::errors::{CheckerResult, RevocationError};
use crate::pki::crl::fetcher::DEFAULT_MAX_CRL_SIZE;

const CRL_RESOURCES_KEY: &str = "revocation.crl_resources";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub revocation: RevocationConfig,
}

/// Immutable snapshot of everything needed to assemble a revocation checker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    pub checker: CheckerKind,
    pub fetcher: FetcherKind,
    pub check_all: bool,
    pub throw_on_fetch_failure: bool,
    pub unavailable_policy: PolicyKind,
    pub expired_policy: PolicyKind,
    /// Grace window past `nextUpdate` for the threshold policy
    pub threshold_seconds: u64,
    pub cache: CacheConfig,
    pub refresh_interval_seconds: u64,
    pub crl_resources: Vec<String>,
    pub fetch_timeout_seconds: u64,
    /// Deadline for a whole check across all sources; 0 disables it
    pub check_timeout_seconds: u64,
    pub max_crl_size_bytes: usize,
    pub ldap: Option<LdapConfig>,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            checker: CheckerKind::NoOp,
            fetcher: FetcherKind::Resource,
            check_all: false,
            throw_on_fetch_failure: false,
            unavailable_policy: PolicyKind::Deny,
            expired_policy: PolicyKind::Deny,
            threshold_seconds: 48 * 60 * 60,
            cache: CacheConfig::default(),
            refresh_interval_seconds: 3600,
            crl_resources: Vec::new(),
            fetch_timeout_seconds: 30,
            check_timeout_seconds: 0,
            max_crl_size_bytes: DEFAULT_MAX_CRL_SIZE,
            ldap: None,
        }
    }
}

impl RevocationConfig {
    pub fn validate(&self) -> CheckerResult<()> {
        if self.checker == CheckerKind::StaticResource {
            if self.crl_resources.is_empty() {
                return Err(RevocationError::Config(
                    "the resource checker requires at least one entry in crl_resources".into(),
                ));
            }
            if self.refresh_interval_seconds == 0 {
                return Err(RevocationError::Config(
                    "refresh_interval_seconds must be greater than zero".into(),
                ));
            }
        }
        if self.fetcher == FetcherKind::Ldap && self.ldap.is_none() {
            return Err(RevocationError::Config(
                "the ldap fetcher requires an [revocation.ldap] section".into(),
            ));
        }
        if self.fetch_timeout_seconds == 0 {
            return Err(RevocationError::Config(
                "fetch_timeout_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        (self.check_timeout_seconds > 0).then(|| Duration::from_secs(self.check_timeout_seconds))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_secs(self.threshold_seconds)
    }
}

/// Cache eviction settings. A zero TTL or TTI disables that discipline;
/// with both disabled entries live until evicted by `max_entries`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub tti_seconds: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 7200,
            tti_seconds: 0,
            max_entries: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LdapConfig {
    /// Connection URL used when a source does not carry its own host
    #[serde(default)]
    pub url: Option<String>,
    /// Search base; falls back to the DN encoded in the LDAP URL
    #[serde(default)]
    pub base_dn: Option<String>,
    #[serde(default = "default_search_filter")]
    pub search_filter: String,
    #[serde(default = "default_crl_attribute")]
    pub attribute: String,
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub bind_credential: Option<SecretString>,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            url: None,
            base_dn: None,
            search_filter: default_search_filter(),
            attribute: default_crl_attribute(),
            bind_dn: None,
            bind_credential: None,
        }
    }
}

fn default_search_filter() -> String {
    "(objectClass=*)".to_string()
}

fn default_crl_attribute() -> String {
    "certificateRevocationList;binary".to_string()
}

/// Selects the revocation checker variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum CheckerKind {
    #[default]
    NoOp,
    DistributionPoint,
    StaticResource,
}

impl TryFrom<String> for CheckerKind {
    type Error = UnknownOption;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" | "noop" => Ok(Self::NoOp),
            "crl" | "distribution_point" => Ok(Self::DistributionPoint),
            "resource" | "static_resource" => Ok(Self::StaticResource),
            _ => Err(UnknownOption::new("checker", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum FetcherKind {
    #[default]
    Resource,
    Ldap,
}

impl TryFrom<String> for FetcherKind {
    type Error = UnknownOption;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "resource" => Ok(Self::Resource),
            "ldap" => Ok(Self::Ldap),
            _ => Err(UnknownOption::new("fetcher", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum PolicyKind {
    Allow,
    #[default]
    Deny,
    Threshold,
}

impl TryFrom<String> for PolicyKind {
    type Error = UnknownOption;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "threshold" => Ok(Self::Threshold),
            _ => Err(UnknownOption::new("policy", value)),
        }
    }
}

#[derive(Debug)]
pub struct UnknownOption {
    option: &'static str,
    value: String,
}

impl UnknownOption {
    fn new(option: &'static str, value: String) -> Self {
        Self { option, value }
    }
}

impl fmt::Display for UnknownOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.option, self.value)
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder =
            ConfigLib::builder().add_source(File::with_name("config/settings").required(false));

        // Explicit overrides replace the process environment so tests do not
        // pick up variables from the host
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = if key == CRL_RESOURCES_KEY {
                    builder.set_override(&key, split_list(&value))?
                } else {
                    builder.set_override(&key, value)?
                };
            }
        } else {
            // APP_REVOCATION__CHECK_ALL=true, APP_REVOCATION__CRL_RESOURCES=a,b
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key(CRL_RESOURCES_KEY),
            );
        }

        builder.build()?.try_deserialize()
    }

    /// Parse a complete configuration document, without file or environment
    /// layering.
    pub fn from_document(contents: &str, format: FileFormat) -> Result<Self, ConfigError> {
        ConfigLib::builder()
            .add_source(File::from_str(contents, format))
            .build()?
            .try_deserialize()
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
