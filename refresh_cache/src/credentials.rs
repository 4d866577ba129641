//! Value types for the usual consumers of the cache

use std::time::Duration;

use refresh_clock::{Clock, UnixTime};
use serde::{Deserialize, Serialize};

use crate::{
    AccessKeyId, AccessKeyIdRef, AccessToken, AccessTokenRef, Expiring, SecretAccessKey,
    SecretAccessKeyRef, SessionToken, SessionTokenRef,
};

/// A set of AWS credentials, usually temporary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwsCredentials {
    access_key_id: AccessKeyId,
    secret_access_key: SecretAccessKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_token: Option<SessionToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<UnixTime>,
}

impl AwsCredentials {
    /// Constructs long-lived credentials without a session token or expiration
    pub fn new(access_key_id: AccessKeyId, secret_access_key: SecretAccessKey) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            session_token: None,
            expiration: None,
        }
    }

    /// Attaches a session token
    pub fn with_session_token(mut self, session_token: SessionToken) -> Self {
        self.session_token = Some(session_token);
        self
    }

    /// Attaches an expiration
    pub fn with_expiration(mut self, expiration: UnixTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Gets the access key ID
    #[inline]
    pub fn access_key_id(&self) -> &AccessKeyIdRef {
        &self.access_key_id
    }

    /// Gets the secret access key
    #[inline]
    pub fn secret_access_key(&self) -> &SecretAccessKeyRef {
        &self.secret_access_key
    }

    /// Gets the session token, if these are temporary credentials
    #[inline]
    pub fn session_token(&self) -> Option<&SessionTokenRef> {
        self.session_token.as_deref()
    }
}

impl Expiring for AwsCredentials {
    #[inline]
    fn expiration(&self) -> Option<UnixTime> {
        self.expiration
    }
}

/// An OAuth2 bearer token, as issued by an SSO-OIDC token exchange
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerToken {
    token: AccessToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<UnixTime>,
}

impl BearerToken {
    /// Constructs a token that expires at `expiration`
    pub fn new(token: AccessToken, expiration: UnixTime) -> Self {
        Self {
            token,
            expiration: Some(expiration),
        }
    }

    /// Constructs a token from an `expires_in` lifetime, as returned by a token endpoint
    pub fn expires_in<C: Clock>(token: AccessToken, expires_in: Duration, clock: &C) -> Self {
        Self::new(token, clock.now() + expires_in)
    }

    /// Constructs a token with no known expiration
    pub fn without_expiration(token: AccessToken) -> Self {
        Self {
            token,
            expiration: None,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn token(&self) -> &AccessTokenRef {
        &self.token
    }
}

impl Expiring for BearerToken {
    #[inline]
    fn expiration(&self) -> Option<UnixTime> {
        self.expiration
    }
}
