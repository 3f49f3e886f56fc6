//! Validate-then-issue step of the token credential exchange

use std::sync::Arc;
use std::time::Duration;

use ferry_common::{
    ApiGroups, AuthenticatorKind, ClusterCredential, TokenCredentialRequest,
    TOKEN_CREDENTIAL_REQUEST_KIND,
};
use ferry_pki::{CertIssuer, IssuedCertificate, Subject};
use tracing::{debug, info, warn};

use crate::authenticator::{AuthError, AuthenticatorRegistry};
use crate::error::{Error, Result};

/// Lifetime requested for every client certificate
pub const CLIENT_CERT_TTL: Duration = Duration::from_secs(5 * 60);

/// Turns validated identity tokens into client certificates
pub struct ExchangeService {
    registry: AuthenticatorRegistry,
    issuer: Arc<dyn CertIssuer>,
    api_groups: ApiGroups,
}

impl ExchangeService {
    /// Create a service over a registry and an issuer
    pub fn new(
        registry: AuthenticatorRegistry,
        issuer: Arc<dyn CertIssuer>,
        api_groups: ApiGroups,
    ) -> Self {
        Self {
            registry,
            issuer,
            api_groups,
        }
    }

    /// API groups this service answers for
    pub fn api_groups(&self) -> &ApiGroups {
        &self.api_groups
    }

    /// Validate the request's token and issue a certificate for its identity
    ///
    /// Any authenticator failure, including an unknown authenticator, is
    /// reported as [`Error::Unauthenticated`] without detail. The issuer is
    /// only called for an accepted token.
    pub async fn handle(&self, request: &TokenCredentialRequest) -> Result<IssuedCertificate> {
        self.validate_request(request)?;

        let reference = &request.spec.authenticator;
        if let Some(group) = &reference.api_group {
            if *group != self.api_groups.authentication_group() {
                debug!(api_group = %group, "Authenticator reference in unknown API group");
                return Err(Error::Unauthenticated);
            }
        }

        let authenticator = AuthenticatorKind::from_kind_name(&reference.kind)
            .and_then(|kind| self.registry.get(kind, &reference.name))
            .ok_or_else(|| {
                debug!(
                    kind = %reference.kind,
                    name = %reference.name,
                    "No such authenticator"
                );
                Error::Unauthenticated
            })?;

        let identity = match authenticator.authenticate(&request.spec.token).await {
            Ok(identity) if !identity.username.is_empty() => identity,
            Ok(_) => {
                warn!(authenticator = %reference.name, "Authenticator returned an empty username");
                return Err(Error::Unauthenticated);
            }
            Err(AuthError::Unavailable(reason)) => {
                warn!(authenticator = %reference.name, reason = %reason, "Authenticator unavailable");
                return Err(Error::Unauthenticated);
            }
            Err(AuthError::Rejected(reason)) => {
                debug!(authenticator = %reference.name, reason = %reason, "Token rejected");
                return Err(Error::Unauthenticated);
            }
        };

        let subject = Subject::new(identity.username.clone(), identity.groups.iter().cloned());
        let issued = self.issuer.issue_pem(&subject, &[], CLIENT_CERT_TTL)?;

        info!(
            username = %identity.username,
            groups = ?identity.groups,
            expires = %issued.not_after,
            "Issued cluster credential"
        );
        Ok(issued)
    }

    fn validate_request(&self, request: &TokenCredentialRequest) -> Result<()> {
        if request.api_version != self.api_groups.login_api_version() {
            return Err(Error::BadRequest(format!(
                "unsupported apiVersion {:?}",
                request.api_version
            )));
        }
        if request.kind != TOKEN_CREDENTIAL_REQUEST_KIND {
            return Err(Error::BadRequest(format!("unsupported kind {:?}", request.kind)));
        }
        if request.spec.token.is_empty() {
            return Err(Error::BadRequest("spec.token must be supplied".into()));
        }
        Ok(())
    }
}

/// Wrap an issued certificate as the wire credential
pub fn cluster_credential(issued: IssuedCertificate) -> ClusterCredential {
    ClusterCredential {
        expiration_timestamp: issued.not_after,
        token: None,
        client_certificate_data: Some(issued.cert_pem),
        client_key_data: Some(issued.key_pem),
    }
}
