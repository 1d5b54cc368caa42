//! Certificate Revocation List (CRL) retrieval and caching
//!
//! # Features
//! - DER and PEM CRL parsing with revocation reasons
//! - Fetching from HTTP(S) URLs, files and LDAP directories
//! - Cache with TTL / TTI expiry, a size bound and fetch coalescing
//! - Scheduled background refresh of configured CRL resources

pub mod cache;
pub mod errors;
pub mod fetcher;
pub mod ldap;
pub mod parser;
pub mod scheduler;
pub mod types;

// Re-export public types
pub use cache::{CacheExpiry, CacheSettings, CrlCache};
pub use errors::{CheckerResult, FetchError, RevocationError};
pub use fetcher::{CrlFetcher, DEFAULT_MAX_CRL_SIZE, ResourceCrlFetcher};
pub use ldap::LdapCrlFetcher;
pub use parser::{extract_crl_distribution_points, is_supported_crl_url, parse_crl};
pub use scheduler::{CrlRefresher, RefresherHandle};
pub use types::{Crl, CrlSourceId, RevocationReason, RevokedEntry, SerialNumber};
