use std::time::Duration;

use async_trait::async_trait;
use ldap3::{LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use secrecy::ExposeSecret;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::LdapConfig;

use super::errors::{CheckerResult, FetchError};
use super::fetcher::{CrlFetcher, ResourceCrlFetcher};
use super::types::CrlSourceId;

/// LDAP result code for `noSuchObject`
const NO_SUCH_OBJECT: u32 = 32;

/// Fetches CRLs stored as directory attributes.
///
/// `ldap://` and `ldaps://` sources are searched in the directory; any other
/// source is handed to an embedded [`ResourceCrlFetcher`], so distribution
/// points mixing HTTP and LDAP URLs keep working.
pub struct LdapCrlFetcher {
    config: LdapConfig,
    request_timeout: Duration,
    resources: ResourceCrlFetcher,
}

/// Where and how to search for one CRL.
struct SearchTarget {
    connection_url: String,
    base_dn: String,
    scope: Scope,
    filter: String,
    attribute: String,
}

impl LdapCrlFetcher {
    /// Returns an error if the fallback HTTP client cannot be initialized
    pub fn new(
        config: LdapConfig,
        request_timeout: Duration,
        max_size: usize,
    ) -> CheckerResult<Self> {
        Ok(Self {
            config,
            request_timeout,
            resources: ResourceCrlFetcher::with_max_size(request_timeout, max_size)?,
        })
    }

    /// Resolve an LDAP URL (`ldap://host:port/<dn>?<attribute>?<scope>?<filter>`)
    /// against the configured defaults. Configured base DN and connection URL
    /// win; attribute, scope and filter encoded in the URL win over config.
    fn search_target(&self, source: &CrlSourceId) -> Result<SearchTarget, FetchError> {
        let url = Url::parse(source.as_str())
            .map_err(|e| FetchError::Transport(format!("invalid LDAP URL {source}: {e}")))?;

        let connection_url = match (url.host_str(), &self.config.url) {
            (Some(host), _) if !host.is_empty() => match url.port() {
                Some(port) => format!("{}://{host}:{port}", url.scheme()),
                None => format!("{}://{host}", url.scheme()),
            },
            (_, Some(configured)) => configured.clone(),
            _ => {
                return Err(FetchError::Transport(format!(
                    "no directory host in {source} and no ldap.url configured"
                )));
            }
        };

        let url_dn = decode(url.path().trim_start_matches('/'))?;
        let mut query = url.query().unwrap_or_default().split('?');
        let url_attribute = decode(query.next().unwrap_or_default())?;
        let url_scope = query.next().unwrap_or_default().to_ascii_lowercase();
        let url_filter = decode(query.next().unwrap_or_default())?;

        let (base_dn, default_scope) = match &self.config.base_dn {
            Some(base_dn) => (base_dn.clone(), Scope::Subtree),
            None if !url_dn.is_empty() => (url_dn, Scope::Base),
            None => {
                return Err(FetchError::Transport(format!(
                    "no base DN in {source} and no ldap.base_dn configured"
                )));
            }
        };

        let scope = match url_scope.as_str() {
            "base" => Scope::Base,
            "one" => Scope::OneLevel,
            "sub" => Scope::Subtree,
            _ => default_scope,
        };

        let attribute = url_attribute
            .split(',')
            .next()
            .filter(|attribute| !attribute.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.config.attribute.clone());

        let filter = if url_filter.is_empty() {
            self.config.search_filter.clone()
        } else {
            url_filter
        };

        Ok(SearchTarget {
            connection_url,
            base_dn,
            scope,
            filter,
            attribute,
        })
    }

    async fn search(
        &self,
        source: &CrlSourceId,
        target: SearchTarget,
    ) -> Result<Vec<u8>, FetchError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.request_timeout);
        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &target.connection_url)
            .await
            .map_err(|e| map_ldap_error(source, e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!("LDAP connection error: {}", e);
            }
        });

        if let Some(bind_dn) = &self.config.bind_dn {
            let credential = self
                .config
                .bind_credential
                .as_ref()
                .map(|secret| secret.expose_secret().to_string())
                .unwrap_or_default();
            ldap.simple_bind(bind_dn, &credential)
                .await
                .and_then(|result| result.success())
                .map_err(|e| map_ldap_error(source, e))?;
        }

        debug!(
            "Searching {} under '{}' with {} for {}",
            target.connection_url, target.base_dn, target.filter, target.attribute
        );

        let searched = ldap
            .search(
                &target.base_dn,
                target.scope,
                &target.filter,
                vec![target.attribute.as_str()],
            )
            .await
            .and_then(|result| result.success());

        if let Err(e) = ldap.unbind().await {
            debug!("LDAP unbind failed: {}", e);
        }

        let (entries, _) = searched.map_err(|e| map_ldap_error(source, e))?;

        entries
            .into_iter()
            .map(SearchEntry::construct)
            .find_map(|entry| crl_attribute_value(entry, &target.attribute))
            .ok_or_else(|| {
                FetchError::NotFound(format!(
                    "no entry with attribute {} found for {source}",
                    target.attribute
                ))
            })
    }
}

#[async_trait]
impl CrlFetcher for LdapCrlFetcher {
    async fn fetch(&self, source: &CrlSourceId) -> Result<Vec<u8>, FetchError> {
        if !source.is_ldap() {
            return self.resources.fetch(source).await;
        }

        info!("Fetching CRL from directory: {}", source);
        let target = self.search_target(source)?;

        match timeout(self.request_timeout, self.search(source, target)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(source.to_string())),
        }
    }
}

/// Attribute names come back as the server spells them, so compare them
/// case-insensitively and without options such as `;binary`, which a server
/// may add or drop.
fn crl_attribute_value(entry: SearchEntry, attribute: &str) -> Option<Vec<u8>> {
    let wanted = attribute_type(attribute);
    let matches = |name: &str| attribute_type(name).eq_ignore_ascii_case(wanted);

    let binary = entry
        .bin_attrs
        .into_iter()
        .filter(|(name, _)| matches(name))
        .find_map(|(_, values)| values.into_iter().find(|value| !value.is_empty()));

    binary.or_else(|| {
        entry
            .attrs
            .into_iter()
            .filter(|(name, _)| matches(name))
            .find_map(|(_, values)| values.into_iter().find(|value| !value.is_empty()))
            .map(String::into_bytes)
    })
}

fn attribute_type(description: &str) -> &str {
    description
        .split_once(';')
        .map_or(description, |(name, _)| name)
}

fn decode(component: &str) -> Result<String, FetchError> {
    urlencoding::decode(component)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| FetchError::Transport(format!("invalid LDAP URL encoding: {e}")))
}

fn map_ldap_error(source: &CrlSourceId, error: LdapError) -> FetchError {
    match error {
        LdapError::LdapResult { result } if result.rc == NO_SUCH_OBJECT => {
            FetchError::NotFound(format!("{source}: {}", result.text))
        }
        LdapError::Timeout { .. } => FetchError::Timeout(source.to_string()),
        error => FetchError::Transport(format!("LDAP request to {source} failed: {error}")),
    }
}
