// ABOUTME: Core domain entities for the identity platform
// ABOUTME: Users, clients, secret versions, authorization requests, sessions, consents, challenges, tokens, credentials
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

//! Domain model
//!
//! Every entity is identified by a time-ordered UUID (v7 layout) so that
//! primary-key index locality matches insertion order. State machines are
//! explicit: entities carry status enums and timestamps, and every state
//! change is a persisted write guarded by its predecessor state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Account status for a [`User`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    /// Normal account, may authenticate
    Active,
    /// Administratively locked; all authentication fails
    Locked,
    /// Soft-deleted; invisible to every query except purge
    Deleted,
}

impl UserStatus {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Deleted => "deleted",
        }
    }

    /// Parse from the storage string form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "locked" => Self::Locked,
            "deleted" => Self::Deleted,
            _ => Self::Active,
        }
    }
}

/// A registered end user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Unique username, stored case-folded
    pub username: String,
    /// Optional display name
    pub display_name: Option<String>,
    /// Unique email address, when present
    pub email: Option<String>,
    /// Tagged password verifier (`pbkdf2$...` or legacy)
    pub password_hash: String,
    /// Account status
    pub status: UserStatus,
    /// AES-GCM-encrypted TOTP secret, when enrolled
    pub totp_secret_enc: Option<String>,
    /// Phone number for SMS OTP delivery, when enrolled
    pub otp_phone: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Create a new active user with a freshly minted identifier
    #[must_use]
    pub fn new(username: &str, password_hash: String, email: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            username: username.to_lowercase(),
            display_name: None,
            email,
            password_hash,
            status: UserStatus::Active,
            totp_secret_enc: None,
            otp_phone: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Client authentication method (RFC 8414 `token_endpoint_auth_methods`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// `client_secret_basic` - Authorization header
    SecretBasic,
    /// `client_secret_post` - form body
    SecretPost,
    /// `client_secret_jwt` - HMAC client assertion
    SecretJwt,
    /// `private_key_jwt` - asymmetric client assertion
    PrivateKeyJwt,
    /// Mutual TLS with a CA-issued certificate
    Mtls,
    /// Mutual TLS with a pinned self-signed certificate
    SelfSignedMtls,
}

impl ClientAuthMethod {
    /// Stable string form used in storage and discovery metadata
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SecretBasic => "client_secret_basic",
            Self::SecretPost => "client_secret_post",
            Self::SecretJwt => "client_secret_jwt",
            Self::PrivateKeyJwt => "private_key_jwt",
            Self::Mtls => "tls_client_auth",
            Self::SelfSignedMtls => "self_signed_tls_client_auth",
        }
    }

    /// Parse from the storage string form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "client_secret_post" => Self::SecretPost,
            "client_secret_jwt" => Self::SecretJwt,
            "private_key_jwt" => Self::PrivateKeyJwt,
            "tls_client_auth" => Self::Mtls,
            "self_signed_tls_client_auth" => Self::SelfSignedMtls,
            _ => Self::SecretBasic,
        }
    }

    /// Whether this method verifies against stored secret versions
    #[must_use]
    pub const fn is_secret_based(self) -> bool {
        matches!(self, Self::SecretBasic | Self::SecretPost | Self::SecretJwt)
    }
}

/// Token lifetimes configured per client
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenLifetimes {
    /// Access token lifetime in seconds
    pub access_secs: i64,
    /// Refresh token lifetime in seconds
    pub refresh_secs: i64,
    /// ID token lifetime in seconds
    pub id_secs: i64,
}

impl Default for TokenLifetimes {
    fn default() -> Self {
        Self {
            access_secs: 3600,
            refresh_secs: 30 * 24 * 3600,
            id_secs: 3600,
        }
    }
}

/// A registered OAuth client (relying party)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Public `client_id` presented on the wire
    pub client_id: String,
    /// Display name
    pub name: String,
    /// Permitted grant types
    pub grant_types: Vec<String>,
    /// Permitted response types
    pub response_types: Vec<String>,
    /// Registered redirect URIs; matched byte-for-byte
    pub redirect_uris: Vec<String>,
    /// Scopes this client may request
    pub allowed_scopes: Vec<String>,
    /// How this client authenticates at the token endpoint
    pub auth_method: ClientAuthMethod,
    /// PKCE is required for every client; the flag exists only for storage fidelity
    pub require_pkce: bool,
    /// Token lifetimes for artifacts issued to this client
    pub token_lifetimes: TokenLifetimes,
    /// SHA-256 certificate fingerprint pin for `self_signed_tls_client_auth`
    pub mtls_fingerprint: Option<String>,
    /// JWKS document (JSON) holding the client's registered assertion keys
    /// for `private_key_jwt`
    pub assertion_jwks: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// Whether `redirect_uri` matches a registered URI
    ///
    /// Comparison is byte-for-byte after lowercasing only scheme and host.
    /// No wildcards, no prefix matching, no trailing-slash forgiveness.
    #[must_use]
    pub fn redirect_uri_matches(&self, redirect_uri: &str) -> bool {
        let normalized = normalize_redirect_uri(redirect_uri);
        self.redirect_uris
            .iter()
            .any(|registered| normalize_redirect_uri(registered) == normalized)
    }

    /// Whether every scope in `requested` is in the client allow-list
    #[must_use]
    pub fn scopes_allowed(&self, requested: &[&str]) -> bool {
        requested
            .iter()
            .all(|s| self.allowed_scopes.iter().any(|a| a == s))
    }
}

/// Lowercase the scheme and host of a URI, leaving path/query byte-exact
#[must_use]
pub fn normalize_redirect_uri(uri: &str) -> String {
    url::Url::parse(uri).map_or_else(
        |_| uri.to_owned(),
        |parsed| {
            // Url::parse already lowercases scheme and host; serialize back
            parsed.to_string()
        },
    )
}

/// One version of a client secret
///
/// At most one version is active and at most one is retiring (past
/// retirement, before grace end). Verification succeeds against either.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSecretVersion {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Owning client
    pub client_id: Uuid,
    /// Monotonic version number per client
    pub version: i64,
    /// Tagged PBKDF2 hash of the secret
    pub secret_hash: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When this version became the active signer
    pub activated_at: DateTime<Utc>,
    /// When this version was retired by a rotation, if ever
    pub retired_at: Option<DateTime<Utc>>,
    /// End of the verification grace window after retirement
    pub grace_until: Option<DateTime<Utc>>,
}

impl ClientSecretVersion {
    /// Whether this version is the current active secret
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Whether this version still verifies at `now`
    ///
    /// Active versions always verify; retired versions verify until their
    /// grace window ends.
    #[must_use]
    pub fn verifiable_at(&self, now: DateTime<Utc>) -> bool {
        match (self.retired_at, self.grace_until) {
            (None, _) => true,
            (Some(_), Some(grace_until)) => now < grace_until,
            (Some(_), None) => false,
        }
    }
}

/// A pending authorization request (the `/authorize` → login → token bridge)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Unique identifier (UUID v7); carried through the login redirect
    pub id: Uuid,
    /// Owning client
    pub client_id: Uuid,
    /// Exact copy of the request's redirect URI
    pub redirect_uri: String,
    /// Requested scope (space-separated)
    pub scope: String,
    /// Opaque client state, echoed on redirect
    pub state: Option<String>,
    /// PKCE S256 challenge
    pub code_challenge: String,
    /// Challenge method; only `S256` is ever persisted
    pub code_challenge_method: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Hard expiry (created + 5 minutes)
    pub expires_at: DateTime<Utc>,
    /// Whether the authorization code has been redeemed
    pub consumed: bool,
    /// When the code was redeemed
    pub consumed_at: Option<DateTime<Utc>>,
    /// Authenticated user, set when login completes
    pub user_id: Option<Uuid>,
    /// Authorization code, set when consent completes
    pub code: Option<String>,
    /// Code expiry, set when the code is minted
    pub code_expires_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency version counter
    pub row_version: i64,
}

impl AuthorizationRequest {
    /// Default request time-to-live
    #[must_use]
    pub fn ttl() -> Duration {
        Duration::minutes(5)
    }

    /// Whether the request is expired at `now` (`now == expires_at` counts as expired)
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Monotonic rank of achieved authentication strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceLevel {
    /// Password (or equivalent single factor) only
    Password,
    /// One additional factor: OTP, magic link, or TOTP
    BasicMfa,
    /// WebAuthn, or a TOTP-plus-OTP chain
    StrongMfa,
}

impl AssuranceLevel {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::BasicMfa => "basic_mfa",
            Self::StrongMfa => "strong_mfa",
        }
    }

    /// Parse from the storage string form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "basic_mfa" => Self::BasicMfa,
            "strong_mfa" => Self::StrongMfa,
            _ => Self::Password,
        }
    }
}

/// An authenticated browser session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Opaque session token carried by the cookie (32 bytes, base64url)
    pub token: String,
    /// CSRF token bound to this session (32 bytes, base64url)
    pub csrf_token: String,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Rolling idle expiry; refreshed on each authenticated touch
    pub idle_expires_at: DateTime<Utc>,
    /// Hard expiry; never extended
    pub absolute_expires_at: DateTime<Utc>,
    /// Achieved authentication assurance; only ever increases
    pub assurance: AssuranceLevel,
    /// Last observed client IP
    pub last_ip: Option<String>,
    /// Last observed user agent
    pub last_user_agent: Option<String>,
    /// Optimistic-concurrency version counter
    pub row_version: i64,
}

impl Session {
    /// Whether the session is live at `now`
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.idle_expires_at && now < self.absolute_expires_at
    }
}

/// A recorded consent grant for a (user, client) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentDecision {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Granting user
    pub user_id: Uuid,
    /// Receiving client
    pub client_id: Uuid,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Expiry (created + 30 days)
    pub expires_at: DateTime<Utc>,
}

impl ConsentDecision {
    /// Default consent time-to-live
    #[must_use]
    pub fn ttl() -> Duration {
        Duration::days(30)
    }

    /// Whether this decision covers every scope in `requested` at `now`
    #[must_use]
    pub fn covers(&self, requested: &[&str], now: DateTime<Utc>) -> bool {
        now < self.expires_at && requested.iter().all(|s| self.scopes.iter().any(|g| g == s))
    }
}

/// Kind of an [`AuthenticationChallenge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// 6-digit code over SMS
    SmsOtp,
    /// 6-digit code over email
    EmailOtp,
    /// 32-byte token embedded in an emailed link
    MagicLink,
    /// WebAuthn registration ceremony
    WebauthnRegistration,
    /// WebAuthn assertion ceremony
    WebauthnAssertion,
}

impl ChallengeKind {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SmsOtp => "sms_otp",
            Self::EmailOtp => "email_otp",
            Self::MagicLink => "magic_link",
            Self::WebauthnRegistration => "webauthn_registration",
            Self::WebauthnAssertion => "webauthn_assertion",
        }
    }

    /// Parse from the storage string form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "sms_otp" => Self::SmsOtp,
            "magic_link" => Self::MagicLink,
            "webauthn_registration" => Self::WebauthnRegistration,
            "webauthn_assertion" => Self::WebauthnAssertion,
            _ => Self::EmailOtp,
        }
    }

    /// Challenge time-to-live for this kind
    #[must_use]
    pub fn ttl(self) -> Duration {
        match self {
            Self::MagicLink => Duration::minutes(15),
            Self::SmsOtp
            | Self::EmailOtp
            | Self::WebauthnRegistration
            | Self::WebauthnAssertion => Duration::minutes(5),
        }
    }
}

/// A short-lived record binding a generated secret to the subject that may consume it
///
/// Covers OTP codes, magic-link tokens, and WebAuthn ceremony challenges.
/// `consumed` and `failed` are both terminal; a failed challenge is
/// indistinguishable from a missing one to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationChallenge {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Challenge kind
    pub kind: ChallengeKind,
    /// Subject user, when user-bound
    pub user_id: Option<Uuid>,
    /// PBKDF2 hash of the OTP / magic-link secret
    pub verifier_hash: Option<String>,
    /// Raw WebAuthn challenge bytes (base64url) for ceremony challenges
    pub webauthn_challenge: Option<String>,
    /// Kind-specific metadata (delivery address mask, credential options)
    pub metadata: serde_json::Value,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Hard expiry
    pub expires_at: DateTime<Utc>,
    /// Failed verification attempts so far
    pub attempts: i64,
    /// Attempt ceiling; exceeding it fails the challenge terminally
    pub max_attempts: i64,
    /// Successfully consumed (terminal)
    pub consumed: bool,
    /// Terminally failed (terminal, indistinguishable from missing)
    pub failed: bool,
}

impl AuthenticationChallenge {
    /// Whether the challenge can still be attempted at `now`
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.failed && now < self.expires_at
    }
}

/// Stored record of an issued access token (JWS referenced by `jti`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    /// JWT ID claim; primary key
    pub jti: Uuid,
    /// Subject user; `None` for `client_credentials` tokens
    pub user_id: Option<Uuid>,
    /// Issuing client
    pub client_id: Uuid,
    /// Granted scope (space-separated)
    pub scope: String,
    /// Token family, shared with sibling refresh tokens
    pub family_id: Uuid,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been revoked
    pub revoked: bool,
}

/// Stored record of an opaque refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Opaque token value (32 bytes, base64url); unique-indexed
    pub token: String,
    /// Subject user
    pub user_id: Uuid,
    /// Issuing client
    pub client_id: Uuid,
    /// Granted scope (space-separated)
    pub scope: String,
    /// Token family; every rotation descendant shares it
    pub family_id: Uuid,
    /// Issue timestamp
    pub issued_at: DateTime<Utc>,
    /// Expiry timestamp
    pub expires_at: DateTime<Utc>,
    /// Whether the token has been revoked
    pub revoked: bool,
}

/// State of a [`WebAuthnCredential`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebAuthnCredentialState {
    /// Registered, never asserted
    Registered,
    /// At least one successful assertion
    InUse,
    /// Sign-counter regression observed; terminal until operator reset
    Suspect,
}

impl WebAuthnCredentialState {
    /// Stable string form used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::InUse => "in_use",
            Self::Suspect => "suspect",
        }
    }

    /// Parse from the storage string form
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "in_use" => Self::InUse,
            "suspect" => Self::Suspect,
            _ => Self::Registered,
        }
    }
}

/// A registered WebAuthn authenticator credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebAuthnCredential {
    /// Credential ID as produced by the authenticator (base64url)
    pub credential_id: String,
    /// Owning user
    pub user_id: Uuid,
    /// COSE-encoded public key bytes
    pub public_key_cose: Vec<u8>,
    /// Attestation statement format tag (`none`, `packed`, ...)
    pub attestation_format: String,
    /// Authenticator AAGUID (hex), when reported
    pub aaguid: Option<String>,
    /// Last accepted signature counter; must strictly increase
    pub sign_count: i64,
    /// Lifecycle state
    pub state: WebAuthnCredentialState,
    /// User-facing device label
    pub label: Option<String>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last successful assertion
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Append-only audit record for key and secret rotations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationEvent {
    /// Unique identifier (UUID v7)
    pub id: Uuid,
    /// Rotated key identifier (client UUID or signing `kid`)
    pub key_id: String,
    /// Version before rotation
    pub old_version: i64,
    /// Version after rotation
    pub new_version: i64,
    /// Operator-supplied reason
    pub reason: String,
    /// Acting principal
    pub actor: String,
    /// Event timestamp
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ids_are_time_ordered() {
        let a = User::new("alice", "h".into(), None);
        let b = User::new("bob", "h".into(), None);
        assert!(a.id < b.id);
    }

    #[test]
    fn username_is_case_folded() {
        let u = User::new("Alice", "h".into(), None);
        assert_eq!(u.username, "alice");
    }

    #[test]
    fn redirect_uri_trailing_slash_is_a_different_uri() {
        let client = Client {
            id: Uuid::now_v7(),
            client_id: "demo-client".into(),
            name: "Demo".into(),
            grant_types: vec!["authorization_code".into()],
            response_types: vec!["code".into()],
            redirect_uris: vec!["https://rp.example/cb".into()],
            allowed_scopes: vec!["openid".into()],
            auth_method: ClientAuthMethod::SecretBasic,
            require_pkce: true,
            token_lifetimes: TokenLifetimes::default(),
            mtls_fingerprint: None,
            assertion_jwks: None,
            created_at: Utc::now(),
        };
        assert!(client.redirect_uri_matches("https://rp.example/cb"));
        assert!(client.redirect_uri_matches("HTTPS://RP.EXAMPLE/cb"));
        assert!(!client.redirect_uri_matches("https://rp.example/cb/"));
        assert!(!client.redirect_uri_matches("https://rp.example/CB"));
    }

    #[test]
    fn request_expiry_boundary_is_inclusive() {
        let now = Utc::now();
        let request = AuthorizationRequest {
            id: Uuid::now_v7(),
            client_id: Uuid::now_v7(),
            redirect_uri: "https://rp.example/cb".into(),
            scope: "openid".into(),
            state: None,
            code_challenge: "x".repeat(43),
            code_challenge_method: "S256".into(),
            created_at: now - AuthorizationRequest::ttl(),
            expires_at: now,
            consumed: false,
            consumed_at: None,
            user_id: None,
            code: None,
            code_expires_at: None,
            row_version: 0,
        };
        assert!(request.is_expired(now));
    }

    #[test]
    fn retired_secret_verifies_only_inside_grace() {
        let now = Utc::now();
        let version = ClientSecretVersion {
            id: Uuid::now_v7(),
            client_id: Uuid::now_v7(),
            version: 1,
            secret_hash: "pbkdf2$...".into(),
            created_at: now - Duration::days(30),
            activated_at: now - Duration::days(30),
            retired_at: Some(now - Duration::days(1)),
            grace_until: Some(now + Duration::days(6)),
        };
        assert!(version.verifiable_at(now));
        assert!(!version.verifiable_at(now + Duration::days(7)));
    }

    #[test]
    fn assurance_levels_are_ordered() {
        assert!(AssuranceLevel::Password < AssuranceLevel::BasicMfa);
        assert!(AssuranceLevel::BasicMfa < AssuranceLevel::StrongMfa);
    }
}
