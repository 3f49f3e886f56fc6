//! Certificate handling for Ferry
//!
//! - [`CertificateAuthority`]: a self-generated CA plus serving certificates
//!   for the exchange server's TLS listener
//! - [`DynamicCertIssuer`]: signs short-lived client certificates with a CA
//!   that can be swapped at runtime
//! - [`CertificateInfo`]: validity and subject of a parsed certificate

#![deny(missing_docs)]

pub mod authority;
pub mod error;
pub mod issuer;

pub use authority::{parse_pem, CertificateAuthority, CertificateInfo, ROTATION_THRESHOLD};
pub use error::{PkiError, Result};
#[cfg(any(test, feature = "mock"))]
pub use issuer::MockCertIssuer;
pub use issuer::{
    CaMaterial, CertIssuer, DynamicCertIssuer, IssuedCertificate, Subject, CLOCK_SKEW_BACKDATE,
};
