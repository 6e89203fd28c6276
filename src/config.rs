//! Configuration management
//!
//! A YAML file merged with `AUTHGATE_`-prefixed environment variables
//! (`__` separates nesting levels), converted once into the immutable
//! runtime [`Guard`].

use std::{env, path::Path, sync::Arc, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::Deserialize;

use crate::authenticator::{
    Authenticator, AuthenticatorChain, DigestAlgorithm, HmacAuthenticator, JwtAuthenticator,
    TextEncoding,
    jwt::{DEFAULT_SCHEME, DEFAULT_TOKEN_HEADER},
};
use crate::channel::{ChannelKind, ValueChannel};
use crate::cookie::CookieOptions;
use crate::crypto::AesGcmBox;
use crate::issuer::{
    DiscoveryIssuer, Issuer, IssuerPolicy, KeyMaterial, KeySetFetcher, SessionNonce,
    StaticKeyIssuer, discovery::DEFAULT_FETCH_TIMEOUT,
};
use crate::lifecycle::{DEFAULT_BODY_LIMIT, Guard};
use crate::session::SessionManager;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files loaded before `${VAR}` expansion.
    /// Paths support ~ expansion; later files override earlier ones.
    pub env_files: Vec<String>,
    /// Listener settings for `serve`
    pub server: ServerConfig,
    /// Discovery fetch settings shared by all discovery issuers
    pub discovery: DiscoveryConfig,
    /// Session transport (sessions are off when absent)
    pub session: Option<SessionConfig>,
    /// Authenticator chain, in evaluation order
    pub authenticators: Vec<AuthenticatorConfig>,
    /// Role gate applied after authentication
    pub authorization: AuthorizationConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Maximum request body size in bytes
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Discovery fetch configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Cache lifetime for configuration and key-set documents (0 disables)
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// Refuse plain `http://` URLs
    pub https_only: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_FETCH_TIMEOUT,
            cache_ttl: Duration::ZERO,
            https_only: true,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Where the session document travels
    pub channel: ChannelKind,
    /// Header, cookie or body path name
    pub key: String,
    /// Cookie attributes when `channel` is `cookie`
    pub cookie: CookieOptions,
    /// Create a new session when none arrives
    pub create_new: bool,
    /// Encrypt the session document with a key derived from this secret
    pub secret: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel: ChannelKind::Cookie,
            key: "session".to_string(),
            cookie: CookieOptions {
                http_only: true,
                path: Some("/".to_string()),
                ..CookieOptions::default()
            },
            create_new: true,
            secret: None,
        }
    }
}

/// Role gate configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// At least one of these roles is required (empty: no gate)
    pub required_roles: Vec<String>,
    /// Reject unauthenticated requests with 401
    pub enforce: bool,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            required_roles: Vec::new(),
            enforce: true,
        }
    }
}

/// One chain link
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthenticatorConfig {
    /// Bearer token mechanism
    Jwt(JwtConfig),
    /// Body signature mechanism
    Hmac(HmacConfig),
}

/// JWT mechanism configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Mechanism name
    pub name: String,
    /// Failure denies the request even if another link verifies
    pub required: bool,
    /// Where the token travels
    pub channel: ChannelKind,
    /// Header, cookie, query or body field name
    pub field: String,
    /// Scheme prefix (`~` or empty reads the raw value)
    pub scheme: Option<String>,
    /// Cookie attributes when `channel` is `cookie`
    pub cookie: CookieOptions,
    /// Trusted issuers
    pub issuers: Vec<IssuerConfig>,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            name: "jwt".to_string(),
            required: false,
            channel: ChannelKind::Header,
            field: DEFAULT_TOKEN_HEADER.to_string(),
            scheme: Some(DEFAULT_SCHEME.to_string()),
            cookie: CookieOptions::default(),
            issuers: Vec::new(),
        }
    }
}

/// HMAC mechanism configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HmacConfig {
    /// Mechanism name
    pub name: String,
    /// Failure denies the request even if another link verifies
    pub required: bool,
    /// Shared secret (supports `${VAR}`)
    pub secret: String,
    /// Where the signature travels
    pub channel: ChannelKind,
    /// Header, cookie, query or body field name
    pub field: String,
    /// Cookie attributes when `channel` is `cookie`
    pub cookie: CookieOptions,
    /// Digest algorithm
    pub algorithm: DigestAlgorithm,
    /// Signature text encoding
    pub encoding: TextEncoding,
    /// Prefix stripped from the signature (e.g. `sha256=`)
    pub prefix: Option<String>,
    /// Roles granted on success
    pub roles: Vec<String>,
}

impl Default for HmacConfig {
    fn default() -> Self {
        Self {
            name: "hmac".to_string(),
            required: false,
            secret: String::new(),
            channel: ChannelKind::Header,
            field: "x-signature".to_string(),
            cookie: CookieOptions::default(),
            algorithm: DigestAlgorithm::default(),
            encoding: TextEncoding::default(),
            prefix: None,
            roles: Vec::new(),
        }
    }
}

/// Trusted issuer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// Expected `iss`; may contain `{claim}` placeholders
    pub name: String,
    /// Accepted audiences (empty: any)
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Roles granted on success
    #[serde(default)]
    pub roles: Vec<String>,
    /// Session key holding the expected `nonce` (enables nonce validation)
    #[serde(default)]
    pub nonce_key: Option<String>,
    /// Key source
    #[serde(flatten)]
    pub source: IssuerSource,
}

/// Where an issuer's verification key comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssuerSource {
    /// Key material in configuration
    Static {
        /// The key
        key: KeyMaterial,
    },
    /// OpenID discovery document, then JWKS
    Discovery {
        /// Configuration URL; may contain `{claim}` placeholders
        config_url: String,
    },
}

/// Channel for `kind`, refusing cookie attributes that cannot be emitted.
fn channel(kind: ChannelKind, cookie: &CookieOptions) -> Result<ValueChannel> {
    if kind == ChannelKind::Cookie {
        cookie
            .validate()
            .map_err(|e| Error::Config(format!("Invalid cookie options: {e}")))?;
    }
    Ok(ValueChannel::from_kind(kind, cookie.clone()))
}

impl IssuerConfig {
    fn build(&self, fetcher: &Arc<KeySetFetcher>) -> Result<Issuer> {
        let mut policy = IssuerPolicy::new(&self.name)?
            .audiences(self.audiences.clone())
            .roles(self.roles.clone());
        if let Some(key) = &self.nonce_key {
            policy = policy.nonce(Arc::new(SessionNonce::new(key)));
        }

        Ok(match &self.source {
            IssuerSource::Static { key } => StaticKeyIssuer::new(policy, key)?.into(),
            IssuerSource::Discovery { config_url } => {
                DiscoveryIssuer::new(policy, config_url, Arc::clone(fetcher))?.into()
            }
        })
    }
}

impl JwtConfig {
    fn build(&self, fetcher: &Arc<KeySetFetcher>) -> Result<JwtAuthenticator> {
        if self.issuers.is_empty() {
            return Err(Error::Config(format!(
                "JWT authenticator '{}' has no issuers",
                self.name
            )));
        }
        let issuers = self
            .issuers
            .iter()
            .map(|i| i.build(fetcher))
            .collect::<Result<Vec<_>>>()?;
        Ok(JwtAuthenticator::new(&self.name, issuers)
            .from_channel(channel(self.channel, &self.cookie)?, &self.field)
            .scheme(self.scheme.clone()))
    }
}

impl HmacConfig {
    fn build(&self) -> Result<HmacAuthenticator> {
        Ok(HmacAuthenticator::new(&self.name, &self.secret, &self.field)?
            .channel(channel(self.channel, &self.cookie)?)
            .algorithm(self.algorithm)
            .encoding(self.encoding)
            .prefix(self.prefix.clone())
            .roles(self.roles.clone()))
    }
}

impl SessionConfig {
    fn build(&self) -> Result<SessionManager> {
        let channel = channel(self.channel, &self.cookie)?;
        if channel.is_read_only() {
            return Err(Error::Config(format!(
                "Session channel '{:?}' cannot carry a response value",
                self.channel
            )));
        }
        if self.key.is_empty() {
            return Err(Error::Config("Session key must not be empty".to_string()));
        }

        let mut manager = SessionManager::new(channel, &self.key).create_new(self.create_new);
        if let Some(secret) = &self.secret {
            manager = manager.secure(Arc::new(AesGcmBox::from_secret(secret)?));
        }
        Ok(manager)
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Build the immutable request guard.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty chain, bad key material, a
    /// read-only session channel or duplicate mechanism names.
    pub fn build_guard(&self) -> Result<Guard> {
        if self.authenticators.is_empty() {
            return Err(Error::Config(
                "At least one authenticator must be configured".to_string(),
            ));
        }

        let fetcher = Arc::new(KeySetFetcher::new(
            self.discovery.timeout,
            self.discovery.cache_ttl,
            self.discovery.https_only,
        )?);

        let mut chain = AuthenticatorChain::builder();
        for entry in &self.authenticators {
            let (authenticator, required): (Authenticator, bool) = match entry {
                AuthenticatorConfig::Jwt(c) => (c.build(&fetcher)?.into(), c.required),
                AuthenticatorConfig::Hmac(c) => (c.build()?.into(), c.required),
            };
            chain = if required {
                chain.required(authenticator)
            } else {
                chain.link(authenticator)
            };
        }

        let mut guard = Guard::builder(chain.build()?)
            .required_roles(self.authorization.required_roles.clone())
            .enforce(self.authorization.enforce)
            .body_limit(self.server.body_limit);
        if let Some(session) = &self.session {
            guard = guard.sessions(session.build()?);
        }
        Ok(guard.build())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secrets, keys and URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(session) = &mut self.session {
            if let Some(secret) = &mut session.secret {
                *secret = expand_string(&re, secret);
            }
        }

        for entry in &mut self.authenticators {
            match entry {
                AuthenticatorConfig::Hmac(c) => c.secret = expand_string(&re, &c.secret),
                AuthenticatorConfig::Jwt(c) => {
                    for issuer in &mut c.issuers {
                        issuer.name = expand_string(&re, &issuer.name);
                        match &mut issuer.source {
                            IssuerSource::Static { key } => expand_key(&re, key),
                            IssuerSource::Discovery { config_url } => {
                                *config_url = expand_string(&re, config_url);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn expand_key(re: &Regex, key: &mut KeyMaterial) {
    match key {
        KeyMaterial::Secret(s)
        | KeyMaterial::RsaPem(s)
        | KeyMaterial::EcPem(s)
        | KeyMaterial::EdPem(s) => *s = expand_string(re, s),
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Human-readable `Duration` fields ("30s", "5m", "250ms", bare seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer};

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}
