use x509_parser::prelude::{FromDer, X509Certificate};

use crate::pki::crl::errors::RevocationError;
use crate::pki::crl::parser::extract_crl_distribution_points;
use crate::pki::crl::types::SerialNumber;

const PEM_CERTIFICATE_TAG: &str = "CERTIFICATE";

/// The parts of a client certificate the revocation checker needs.
///
/// The authentication handler owns certificate parsing and chain validation;
/// this is the narrow view handed to the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub serial: SerialNumber,
    pub subject: String,
    pub issuer: String,
    pub distribution_points: Vec<String>,
}

impl ClientCertificate {
    pub fn new(
        serial: SerialNumber,
        subject: impl Into<String>,
        issuer: impl Into<String>,
        distribution_points: Vec<String>,
    ) -> Self {
        Self {
            serial,
            subject: subject.into(),
            issuer: issuer.into(),
            distribution_points,
        }
    }

    pub fn from_x509(cert: &X509Certificate<'_>) -> Self {
        Self {
            serial: SerialNumber::from_be_bytes(&cert.tbs_certificate.serial.to_bytes_be()),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            distribution_points: extract_crl_distribution_points(cert),
        }
    }

    pub fn from_der(der: &[u8]) -> Result<Self, RevocationError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| RevocationError::Certificate(e.to_string()))?;
        Ok(Self::from_x509(&cert))
    }

    /// Accepts a single PEM `CERTIFICATE` block or raw DER.
    pub fn from_pem_or_der(data: &[u8]) -> Result<Self, RevocationError> {
        if data.trim_ascii_start().starts_with(b"-----BEGIN") {
            let pem =
                pem::parse(data).map_err(|e| RevocationError::Certificate(e.to_string()))?;
            if pem.tag() != PEM_CERTIFICATE_TAG {
                return Err(RevocationError::Certificate(format!(
                    "unexpected PEM block '{}'",
                    pem.tag()
                )));
            }
            return Self::from_der(pem.contents());
        }
        Self::from_der(data)
    }
}
