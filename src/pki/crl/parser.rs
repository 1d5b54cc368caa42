use tracing::{debug, warn};
use url::Url;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::{CertificateRevocationList, FromDer, X509Certificate};

use super::errors::FetchError;
use super::types::{Crl, RevocationReason, RevokedEntry, SerialNumber};

const PEM_CRL_TAG: &str = "X509 CRL";

/// Decode a CRL from DER or PEM armoured DER.
pub fn parse_crl(data: &[u8]) -> Result<Crl, FetchError> {
    if looks_like_pem(data) {
        let pem = pem::parse(data).map_err(|e| FetchError::Malformed(e.to_string()))?;
        if pem.tag() != PEM_CRL_TAG {
            return Err(FetchError::Malformed(format!(
                "unexpected PEM block '{}', expected '{PEM_CRL_TAG}'",
                pem.tag()
            )));
        }
        return parse_der_crl(pem.contents());
    }
    parse_der_crl(data)
}

fn looks_like_pem(data: &[u8]) -> bool {
    let start = data
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(data.len());
    data[start..].starts_with(b"-----BEGIN")
}

fn parse_der_crl(der: &[u8]) -> Result<Crl, FetchError> {
    let (_, crl) = CertificateRevocationList::from_der(der)
        .map_err(|e| FetchError::Malformed(e.to_string()))?;

    let tbs = &crl.tbs_cert_list;
    let issuer = tbs.issuer.to_string();
    let this_update = tbs.this_update.to_datetime();
    let next_update = tbs.next_update.map(|t| t.to_datetime());

    if let Some(next_update) = next_update
        && next_update < this_update
    {
        return Err(FetchError::Malformed(format!(
            "CRL from {issuer} has nextUpdate {next_update} before thisUpdate {this_update}"
        )));
    }

    let revoked: Vec<RevokedEntry> = tbs
        .revoked_certificates
        .iter()
        .map(|revoked_cert| RevokedEntry {
            serial: SerialNumber::from_be_bytes(&revoked_cert.user_certificate.to_bytes_be()),
            revocation_date: revoked_cert.revocation_date.to_datetime(),
            reason: revoked_cert
                .reason_code()
                .and_then(|(_, code)| RevocationReason::from_u8(code.0)),
        })
        .collect();

    debug!(
        "Parsed CRL from {} with {} revoked certificates",
        issuer,
        revoked.len()
    );

    Ok(Crl::new(issuer, this_update, next_update, revoked))
}

/// Extract CRL distribution point URIs from a certificate.
///
/// Only URIs with a scheme accepted by [`is_supported_crl_url`] are returned,
/// in extension order and without duplicates.
pub fn extract_crl_distribution_points(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut distribution_points: Vec<String> = Vec::new();

    for ext in cert.tbs_certificate.extensions() {
        let ParsedExtension::CRLDistributionPoints(points) = ext.parsed_extension() else {
            continue;
        };
        for point in points.points.iter() {
            let Some(DistributionPointName::FullName(names)) = &point.distribution_point else {
                continue;
            };
            for name in names {
                if let GeneralName::URI(uri) = name {
                    if !is_supported_crl_url(uri) {
                        warn!("Ignoring unsupported CRL distribution point: {}", uri);
                    } else if !distribution_points.iter().any(|known| known == uri) {
                        distribution_points.push(uri.to_string());
                    }
                }
            }
        }
    }

    if distribution_points.is_empty() {
        debug!("No CRL distribution points found in certificate extensions");
    } else {
        debug!(
            "Found {} CRL distribution points",
            distribution_points.len()
        );
    }

    distribution_points
}

/// Distribution points come from untrusted certificates, so only network
/// schemes with a host are followed.
pub fn is_supported_crl_url(url: &str) -> bool {
    let Ok(parsed_url) = Url::parse(url) else {
        return false;
    };

    matches!(parsed_url.scheme(), "http" | "https" | "ldap" | "ldaps")
        && parsed_url.host_str().is_some_and(|host| !host.is_empty())
}

#[cfg(test)]
mod tests {
    use rcgen::{
        BasicConstraints, CertificateParams, CertificateRevocationListParams,
        CrlDistributionPoint, DistinguishedName, DnType, IsCa, Issuer, KeyIdMethod, KeyPair,
        KeyUsagePurpose, RevokedCertParams,
    };
    use time::{Duration, OffsetDateTime};

    use super::*;

    fn test_ca() -> Issuer<'static, KeyPair> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Parser Test CA");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key_pair = KeyPair::generate().unwrap();
        Issuer::new(params, key_pair)
    }

    fn crl_der(
        ca: &Issuer<'static, KeyPair>,
        this_update: OffsetDateTime,
        next_update: OffsetDateTime,
        revoked: &[u64],
    ) -> Vec<u8> {
        let params = CertificateRevocationListParams {
            this_update,
            next_update,
            crl_number: rcgen::SerialNumber::from(1u64),
            issuing_distribution_point: None,
            revoked_certs: revoked
                .iter()
                .map(|serial| RevokedCertParams {
                    serial_number: rcgen::SerialNumber::from(*serial),
                    revocation_time: this_update,
                    reason_code: Some(rcgen::RevocationReason::KeyCompromise),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        params.signed_by(ca).unwrap().der().to_vec()
    }

    #[test]
    fn test_parse_der_crl() {
        let ca = test_ca();
        let now = OffsetDateTime::now_utc();
        let der = crl_der(&ca, now - Duration::hours(1), now + Duration::hours(1), &[7, 300]);

        let crl = parse_crl(&der).unwrap();

        assert!(crl.issuer.contains("Parser Test CA"));
        assert_eq!(crl.revoked_count(), 2);
        assert!(crl.is_revoked(&SerialNumber::from(7u64)));
        assert!(crl.is_revoked(&SerialNumber::from(300u64)));
        assert!(!crl.is_revoked(&SerialNumber::from(8u64)));
        assert_eq!(
            crl.revoked_entry(&SerialNumber::from(7u64))
                .and_then(|entry| entry.reason),
            Some(RevocationReason::KeyCompromise)
        );
        assert!(!crl.is_expired(now));
    }

    #[test]
    fn test_parse_pem_crl() {
        let ca = test_ca();
        let now = OffsetDateTime::now_utc();
        let der = crl_der(&ca, now - Duration::hours(50), now - Duration::hours(40), &[1]);
        let armoured = pem::encode(&pem::Pem::new(PEM_CRL_TAG, der));

        let crl = parse_crl(armoured.as_bytes()).unwrap();

        assert!(crl.is_revoked(&SerialNumber::from(1u64)));
        assert!(crl.is_expired(now));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_crl(b"definitely not a CRL"),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(parse_crl(&[]), Err(FetchError::Malformed(_))));
    }

    #[test]
    fn test_parse_rejects_wrong_pem_tag() {
        let armoured = pem::encode(&pem::Pem::new("CERTIFICATE", vec![0x30, 0x00]));
        assert!(matches!(
            parse_crl(armoured.as_bytes()),
            Err(FetchError::Malformed(message)) if message.contains("CERTIFICATE")
        ));
    }

    #[test]
    fn test_extract_distribution_points() {
        let ca = test_ca();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "leaf");
        params.crl_distribution_points = vec![
            CrlDistributionPoint {
                uris: vec![
                    "http://crl.example.com/ca.crl".to_string(),
                    "file:///etc/passwd".to_string(),
                ],
            },
            CrlDistributionPoint {
                uris: vec![
                    "ldap://dir.example.com/cn=CA,dc=example,dc=com".to_string(),
                    "http://crl.example.com/ca.crl".to_string(),
                ],
            },
        ];
        let key_pair = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key_pair, &ca).unwrap();
        let (_, parsed) = X509Certificate::from_der(cert.der()).unwrap();

        let points = extract_crl_distribution_points(&parsed);

        assert_eq!(
            points,
            vec![
                "http://crl.example.com/ca.crl".to_string(),
                "ldap://dir.example.com/cn=CA,dc=example,dc=com".to_string(),
            ]
        );
    }

    #[test]
    fn test_supported_crl_urls() {
        assert!(is_supported_crl_url("http://crl.example.com/ca.crl"));
        assert!(is_supported_crl_url("https://crl.example.com/"));
        assert!(is_supported_crl_url("ldap://dir.example.com/cn=CA"));
        assert!(!is_supported_crl_url("file:///tmp/ca.crl"));
        assert!(!is_supported_crl_url("ftp://crl.example.com/ca.crl"));
        assert!(!is_supported_crl_url("not a url"));
    }
}
