use std::net::SocketAddr;

use anyhow::{Context, Result};
use platform_authn::IdentitySettings;
use platform_authz::PermissionsSettings;
use url::Url;

pub const SERVICE_NAME: &str = "permissions-demo";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind: SocketAddr,
    /// Base that item URLs and relative actors in item permissions resolve
    /// against. Falls back to the request's Host header.
    pub public_base_url: Option<Url>,
    pub cors_allowed_origins: Vec<String>,
    pub permissions: PermissionsSettings,
    pub identity: IdentitySettings,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind = lookup("BIND")
            .unwrap_or_else(|| "127.0.0.1:8080".into())
            .parse()
            .context("invalid BIND address")?;

        let public_base_url = lookup("PUBLIC_BASE_URL")
            .filter(|raw| !raw.trim().is_empty())
            .map(|raw| with_trailing_slash(raw.trim()))
            .map(|raw| Url::parse(&raw).with_context(|| format!("invalid PUBLIC_BASE_URL {raw}")))
            .transpose()?;

        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|s| {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            })
            .collect::<Vec<_>>();

        let mut permissions =
            PermissionsSettings::from_lookup(&lookup).context("invalid permissions settings")?;
        if lookup("COMPONENT_NAME").is_none() {
            permissions.component = SERVICE_NAME.into();
        }

        Ok(Self {
            bind,
            public_base_url,
            cors_allowed_origins,
            permissions,
            identity: IdentitySettings::from_lookup(&lookup),
        })
    }
}

fn with_trailing_slash(raw: &str) -> String {
    if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    }
}
