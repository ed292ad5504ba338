use thiserror::Error;
use url::Url;

pub const DEFAULT_COMPONENT: &str = "permissions-client";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid PERMISSIONS_SERVICE_URL {value:?}: {source}")]
    InvalidBaseUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },
    #[error("PERMISSIONS_SERVICE_URL is unset and no in-process router was supplied")]
    MissingRouter,
}

/// Endpoint paths on the permissions service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePaths {
    pub permissions: String,
    pub teams: String,
    pub allowed: String,
    pub directory: String,
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self {
            permissions: "/az-permissions".into(),
            teams: "/az-teams".into(),
            allowed: "/az-is-allowed".into(),
            directory: "/dir-entries".into(),
        }
    }
}

/// How the permissions service is reached and how this component names
/// itself in diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionsSettings {
    /// Absolute base URL; `None` routes requests in-process.
    pub base_url: Option<Url>,
    pub component: String,
    pub paths: ServicePaths,
}

impl Default for PermissionsSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            component: DEFAULT_COMPONENT.into(),
            paths: ServicePaths::default(),
        }
    }
}

impl PermissionsSettings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base_url = get("PERMISSIONS_SERVICE_URL")
            .map(|value| {
                Url::parse(&value).map_err(|source| SettingsError::InvalidBaseUrl { value, source })
            })
            .transpose()?;

        let defaults = ServicePaths::default();
        let paths = ServicePaths {
            permissions: get("PERMISSIONS_PATH").map_or(defaults.permissions, normalize_path),
            teams: get("TEAMS_PATH").map_or(defaults.teams, normalize_path),
            allowed: get("ALLOWED_PATH").map_or(defaults.allowed, normalize_path),
            directory: get("DIRECTORY_PATH").map_or(defaults.directory, normalize_path),
        };

        Ok(Self {
            base_url,
            component: get("COMPONENT_NAME").unwrap_or_else(|| DEFAULT_COMPONENT.into()),
            paths,
        })
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }
}

fn normalize_path(raw: String) -> String {
    let trimmed = raw.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_routes_in_process() {
        let settings = PermissionsSettings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings, PermissionsSettings::default());
    }

    #[test]
    fn blank_base_url_counts_as_unset() {
        let settings =
            PermissionsSettings::from_lookup(lookup(&[("PERMISSIONS_SERVICE_URL", "  ")])).unwrap();
        assert!(settings.base_url.is_none());
    }

    #[test]
    fn reads_base_url_component_and_paths() {
        let settings = PermissionsSettings::from_lookup(lookup(&[
            ("PERMISSIONS_SERVICE_URL", "http://perms.internal:3200"),
            ("COMPONENT_NAME", "items"),
            ("PERMISSIONS_PATH", "permissions/"),
            ("DIRECTORY_PATH", "/name-entries"),
        ]))
        .unwrap();
        assert_eq!(settings.component, "items");
        assert_eq!(settings.paths.permissions, "/permissions");
        assert_eq!(settings.paths.directory, "/name-entries");
        assert_eq!(settings.paths.teams, "/az-teams");
        let base = settings.base_url.unwrap();
        assert_eq!(base.host_str(), Some("perms.internal"));
        assert_eq!(base.port(), Some(3200));
    }

    #[test]
    fn relative_base_url_is_rejected() {
        let err = PermissionsSettings::from_lookup(lookup(&[(
            "PERMISSIONS_SERVICE_URL",
            "/az-permissions",
        )]))
        .unwrap_err();
        assert!(matches!(err, SettingsError::InvalidBaseUrl { .. }));
    }
}
