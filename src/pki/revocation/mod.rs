//! Revocation decisions for client certificates
//!
//! A [`RevocationChecker`] turns a [`ClientCertificate`](crate::pki::certificate::ClientCertificate)
//! into a [`RevocationResult`], consulting a [`RevocationPolicy`] whenever a
//! usable CRL cannot be obtained or has expired.

mod checker;
mod policy;

pub use checker::{CheckerOptions, CrlChecker, RevocationChecker, RevocationResult};
pub use policy::{PolicyContext, PolicyVerdict, RevocationPolicy};
