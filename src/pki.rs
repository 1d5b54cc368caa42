pub mod certificate;
pub mod crl;
pub mod revocation;

// Re-export commonly used types
pub use certificate::ClientCertificate;
pub use crl::{CheckerResult, CrlSourceId, FetchError, RevocationError, SerialNumber};
pub use revocation::{RevocationChecker, RevocationPolicy, RevocationResult};
