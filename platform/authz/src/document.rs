//! Permission and team documents exchanged with the permissions service.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

pub const SELF_PROPERTY: &str = "_self";
pub const GOVERN_ACTION: &str = "govern";

/// Action name (`read`, `update`, `govern`, ...) to the actors holding it.
pub type ActionMap = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("value of _subject ({subject}) must match the resource URL ({resource})")]
    SubjectMismatch { subject: String, resource: String },
    #[error("permissions must declare _inheritsPermissionsOf or at least one _self.govern actor")]
    NoGovernance,
    #[error("team name must not be empty")]
    UnnamedTeam,
}

/// A permission document: property name to action map, plus the reserved
/// `_`-prefixed metadata keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(rename = "_subject", default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(
        rename = "_inheritsPermissionsOf",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "one_or_many"
    )]
    pub inherits_permissions_of: Option<Vec<String>>,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(rename = "_sharedWith", default, skip_serializing_if = "Option::is_none")]
    pub shared_with: Option<Value>,
    #[serde(flatten)]
    pub properties: BTreeMap<String, ActionMap>,
}

impl Permissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: Some(subject.into()),
            ..Self::default()
        }
    }

    /// Adds `actor` to `action` on `property`.
    pub fn grant(
        mut self,
        property: impl Into<String>,
        action: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        self.properties
            .entry(property.into())
            .or_default()
            .entry(action.into())
            .or_default()
            .push(actor.into());
        self
    }

    pub fn inherit_from(mut self, sharing_set: impl Into<String>) -> Self {
        self.inherits_permissions_of
            .get_or_insert_with(Vec::new)
            .push(sharing_set.into());
        self
    }

    /// Actors listed under `_self.govern`.
    pub fn governors(&self) -> &[String] {
        self.properties
            .get(SELF_PROPERTY)
            .and_then(|actions| actions.get(GOVERN_ACTION))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn inherits(&self) -> bool {
        self.inherits_permissions_of
            .as_ref()
            .is_some_and(|parents| !parents.is_empty())
    }

    /// Checks the document can protect `resource_url` and fills in a
    /// missing `_subject`.
    pub fn bind_to(&mut self, resource_url: &str) -> Result<(), DocumentError> {
        match self.subject.as_deref() {
            None => self.subject = Some(resource_url.to_string()),
            Some(subject) if subject == resource_url => {}
            Some(subject) => {
                return Err(DocumentError::SubjectMismatch {
                    subject: subject.to_string(),
                    resource: resource_url.to_string(),
                });
            }
        }
        if !self.inherits() && self.governors().is_empty() {
            return Err(DocumentError::NoGovernance);
        }
        Ok(())
    }

    /// Resolves `_subject` and every actor that is not already an absolute
    /// http(s) URL against `base`. Metadata keys are left alone.
    pub fn resolve_relative_urls(&mut self, base: &Url) {
        if let Some(subject) = self.subject.as_mut() {
            *subject = resolve(base, subject);
        }
        for actors in self.properties.values_mut().flat_map(BTreeMap::values_mut) {
            for actor in actors.iter_mut() {
                *actor = resolve(base, actor);
            }
        }
    }
}

/// Absolute references are returned untouched: re-serializing them through
/// the URL parser would insert a `/` before a bare fragment.
fn resolve(base: &Url, reference: &str) -> String {
    if is_absolute(reference) {
        return reference.to_string();
    }
    match base.join(reference) {
        Ok(resolved) => resolved.into(),
        Err(err) => {
            tracing::warn!(reference, error = %err, "leaving unresolvable actor reference as-is");
            reference.to_string()
        }
    }
}

fn is_absolute(reference: &str) -> bool {
    ["http://", "https://"].iter().any(|scheme| {
        reference
            .get(..scheme.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme))
    })
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(Option::<OneOrMany>::deserialize(deserializer)?.map(|value| match value {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    }))
}

/// Team payload; fields beyond `name` travel to the service untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Team {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        if self.name.trim().is_empty() {
            return Err(DocumentError::UnnamedTeam);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("https://svc.example.com/items/").unwrap()
    }

    #[test]
    fn parses_reserved_keys_and_action_maps() {
        let doc: Permissions = serde_json::from_value(json!({
            "_subject": "https://svc/items/42",
            "_inheritsPermissionsOf": "https://svc/folders/1",
            "_metadata": {"etag": 3},
            "_self": {"govern": ["https://svc/users/7"], "read": ["/users/8"]},
            "title": {"update": ["/teams/1#members"]}
        }))
        .unwrap();
        assert_eq!(doc.subject.as_deref(), Some("https://svc/items/42"));
        assert_eq!(
            doc.inherits_permissions_of,
            Some(vec!["https://svc/folders/1".to_string()])
        );
        assert_eq!(doc.governors(), ["https://svc/users/7".to_string()]);
        assert_eq!(doc.properties["title"]["update"], vec!["/teams/1#members"]);
    }

    #[test]
    fn serializes_with_reserved_names() {
        let doc = Permissions::for_subject("https://svc/items/1")
            .grant(SELF_PROPERTY, GOVERN_ACTION, "https://svc/users/7");
        assert_eq!(
            serde_json::to_value(&doc).unwrap(),
            json!({
                "_subject": "https://svc/items/1",
                "_self": {"govern": ["https://svc/users/7"]}
            })
        );
    }

    #[test]
    fn resolves_relative_actors_only() {
        let mut doc = Permissions::for_subject("42")
            .grant(SELF_PROPERTY, GOVERN_ACTION, "/users/7")
            .grant(SELF_PROPERTY, "read", "https://other.example.com/teams/1#members")
            .grant("title", "update", "HTTP://Other.example.com/x")
            .inherit_from("/folders/1");
        doc.metadata = Some(json!({"owner": "/users/7"}));
        doc.shared_with = Some(json!(["/users/9"]));

        doc.resolve_relative_urls(&base());

        assert_eq!(doc.subject.as_deref(), Some("https://svc.example.com/items/42"));
        assert_eq!(doc.governors(), ["https://svc.example.com/users/7".to_string()]);
        assert_eq!(
            doc.properties[SELF_PROPERTY]["read"],
            vec!["https://other.example.com/teams/1#members"]
        );
        assert_eq!(doc.properties["title"]["update"], vec!["HTTP://Other.example.com/x"]);
        assert_eq!(doc.inherits_permissions_of, Some(vec!["/folders/1".to_string()]));
        assert_eq!(doc.metadata, Some(json!({"owner": "/users/7"})));
        assert_eq!(doc.shared_with, Some(json!(["/users/9"])));
    }

    #[test]
    fn relative_fragment_reference_keeps_fragment() {
        let mut doc = Permissions::new().grant("_self", "read", "/teams/1#members");
        doc.resolve_relative_urls(&base());
        assert_eq!(
            doc.properties["_self"]["read"],
            vec!["https://svc.example.com/teams/1#members"]
        );
    }

    #[test]
    fn bind_defaults_subject() {
        let mut doc = Permissions::new().grant(SELF_PROPERTY, GOVERN_ACTION, "u");
        doc.bind_to("https://svc/items/42").unwrap();
        assert_eq!(doc.subject.as_deref(), Some("https://svc/items/42"));
    }

    #[test]
    fn bind_rejects_conflicting_subject() {
        let mut doc = Permissions::for_subject("https://svc/items/1")
            .grant(SELF_PROPERTY, GOVERN_ACTION, "u");
        assert!(matches!(
            doc.bind_to("https://svc/items/2"),
            Err(DocumentError::SubjectMismatch { .. })
        ));
    }

    #[test]
    fn bind_requires_inheritance_or_governor() {
        let mut bare = Permissions::new().grant(SELF_PROPERTY, "read", "u");
        assert_eq!(bare.bind_to("r"), Err(DocumentError::NoGovernance));

        let mut empty_parents = Permissions::new();
        empty_parents.inherits_permissions_of = Some(Vec::new());
        assert_eq!(empty_parents.bind_to("r"), Err(DocumentError::NoGovernance));

        let mut inherited = Permissions::new().inherit_from("/folders/1");
        assert!(inherited.bind_to("r").is_ok());
    }

    #[test]
    fn team_keeps_extra_fields() {
        let team: Team =
            serde_json::from_value(json!({"name": "ops", "members": ["/users/7"]})).unwrap();
        assert_eq!(team.name, "ops");
        assert_eq!(team.fields["members"], json!(["/users/7"]));
        assert!(team.validate().is_ok());
        assert_eq!(Team::named(" ").validate(), Err(DocumentError::UnnamedTeam));
    }
}
