//! Short-lived client certificate issuance with a hot-swappable CA
//!
//! [`DynamicCertIssuer`] holds the current CA behind an atomic pointer. Each
//! issuance loads one snapshot and signs with it from start to finish, so a
//! CA swap in the middle of a request never mixes one CA's key with another's
//! subject name or expiry.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use tracing::{debug, info};

use crate::authority::CertificateInfo;
use crate::error::{PkiError, Result};

/// Leaf certificates are valid from this long before issuance
pub const CLOCK_SKEW_BACKDATE: Duration = Duration::from_secs(5 * 60);

/// Subject of a client certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Becomes the certificate CN
    pub common_name: String,
    /// Each becomes one O attribute, in order
    pub organizations: Vec<String>,
}

impl Subject {
    /// Build a subject from a username and its groups
    pub fn new<I, S>(common_name: impl Into<String>, organizations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            common_name: common_name.into(),
            organizations: organizations.into_iter().map(Into::into).collect(),
        }
    }
}

/// A freshly issued certificate and its private key
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM certificate
    pub cert_pem: String,
    /// PEM (PKCS#8) private key
    pub key_pem: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Issues client certificates
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
pub trait CertIssuer: Send + Sync {
    /// Issue a client certificate for `subject` valid for at most `ttl`
    fn issue_pem(&self, subject: &Subject, sans: &[String], ttl: Duration)
        -> Result<IssuedCertificate>;
}

/// A parsed signing CA
pub struct CaMaterial {
    cert_pem: String,
    cert: X509,
    key: PKey<Private>,
    not_after: DateTime<Utc>,
}

impl fmt::Debug for CaMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaMaterial")
            .field("subject", &self.cert.subject_name())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl CaMaterial {
    /// Parse a CA certificate and its private key
    ///
    /// Fails if the certificate is not a CA or the key does not belong to it.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let info = CertificateInfo::from_pem(cert_pem)?;
        if !info.is_ca {
            return Err(PkiError::ParseError(
                "certificate is not a CA (basic constraints)".into(),
            ));
        }

        let cert = X509::from_pem(cert_pem.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        let key = PKey::private_key_from_pem(key_pem.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        let public = cert
            .public_key()
            .map_err(|e| PkiError::ParseError(format!("CA cert has no usable public key: {}", e)))?;
        if !public.public_eq(&key) {
            return Err(PkiError::ParseError(
                "CA key does not match CA certificate".into(),
            ));
        }

        let not_after = Utc
            .timestamp_opt(info.not_after, 0)
            .single()
            .ok_or_else(|| PkiError::ParseError("CA notAfter out of range".into()))?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert,
            key,
            not_after,
        })
    }

    /// CA certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// End of the CA's validity
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Sign a client certificate at time `now`
    ///
    /// The result is never valid past the CA's own notAfter.
    pub fn issue_at(
        &self,
        subject: &Subject,
        sans: &[String],
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<IssuedCertificate> {
        if now >= self.not_after {
            return Err(PkiError::CaExpired(self.not_after));
        }
        if subject.common_name.is_empty() {
            return Err(PkiError::CertificateGenerationFailed(
                "empty common name".into(),
            ));
        }
        let backdate = chrono::Duration::from_std(CLOCK_SKEW_BACKDATE)
            .map_err(|e| PkiError::CertificateGenerationFailed(e.to_string()))?;
        let not_before = now.checked_sub_signed(backdate).ok_or_else(|| {
            PkiError::CertificateGenerationFailed("notBefore out of range".into())
        })?;

        // A ttl past the representable range ends at the CA's notAfter like any other long ttl
        let not_after = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .map_or(self.not_after, |end| end.min(self.not_after));

        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
            .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))?;
        let leaf_key = EcKey::generate(&group)
            .and_then(PKey::from_ec_key)
            .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))?;

        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_nid(Nid::COMMONNAME, &subject.common_name)?;
        for org in &subject.organizations {
            name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
        }
        let name = name.build();

        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;

        let mut builder = X509Builder::new()?;
        builder.set_version(2)?;
        let serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&leaf_key)?;
        let not_before_asn1 = Asn1Time::from_unix(not_before.timestamp() as _)?;
        let not_after_asn1 = Asn1Time::from_unix(not_after.timestamp() as _)?;
        builder.set_not_before(&not_before_asn1)?;
        builder.set_not_after(&not_after_asn1)?;

        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;
        builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;

        if !sans.is_empty() {
            let mut alt = SubjectAlternativeName::new();
            for san in sans {
                if san.parse::<IpAddr>().is_ok() {
                    alt.ip(san);
                } else {
                    alt.dns(san);
                }
            }
            let ext = alt.build(&builder.x509v3_context(Some(&self.cert), None))?;
            builder.append_extension(ext)?;
        }

        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(&self.cert), None))?;
        builder.append_extension(aki)?;

        builder.sign(&self.key, MessageDigest::sha256())?;
        let cert = builder.build();

        let cert_pem = String::from_utf8(cert.to_pem()?)
            .map_err(|e| PkiError::CertificateGenerationFailed(e.to_string()))?;
        let key_pem = String::from_utf8(leaf_key.private_key_to_pem_pkcs8()?)
            .map_err(|e| PkiError::CertificateGenerationFailed(e.to_string()))?;

        Ok(IssuedCertificate {
            cert_pem,
            key_pem,
            not_before: truncate_to_second(not_before),
            not_after: truncate_to_second(not_after),
        })
    }
}

fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

/// [`CertIssuer`] whose CA can be replaced while requests are in flight
pub struct DynamicCertIssuer {
    ca: ArcSwapOption<CaMaterial>,
    policy_max_ttl: Duration,
}

impl DynamicCertIssuer {
    /// Create an issuer with no CA loaded; issuance fails until [`set_ca`](Self::set_ca)
    pub fn new(policy_max_ttl: Duration) -> Self {
        Self {
            ca: ArcSwapOption::empty(),
            policy_max_ttl,
        }
    }

    /// Install a new signing CA
    pub fn set_ca(&self, material: CaMaterial) {
        info!(
            subject = ?material.cert.subject_name(),
            not_after = %material.not_after,
            "Installed signing CA"
        );
        self.ca.store(Some(Arc::new(material)));
    }

    /// Current CA snapshot, if one is loaded
    pub fn current(&self) -> Option<Arc<CaMaterial>> {
        self.ca.load_full()
    }

    /// Upper bound applied to every requested ttl
    pub fn policy_max_ttl(&self) -> Duration {
        self.policy_max_ttl
    }
}

impl CertIssuer for DynamicCertIssuer {
    fn issue_pem(
        &self,
        subject: &Subject,
        sans: &[String],
        ttl: Duration,
    ) -> Result<IssuedCertificate> {
        let ca = self.ca.load_full().ok_or(PkiError::CaNotLoaded)?;
        let ttl = ttl.min(self.policy_max_ttl);
        let issued = ca.issue_at(subject, sans, ttl, Utc::now())?;
        debug!(
            common_name = %subject.common_name,
            organizations = ?subject.organizations,
            not_after = %issued.not_after,
            "Issued client certificate"
        );
        Ok(issued)
    }
}
