//! Rewrites resource URLs embedded in JSON bodies when they cross the
//! boundary between the permissions service and the calling service.

use serde_json::Value;
use url::{Position, Url};

pub trait UrlRewriter: Send + Sync {
    /// Turns absolute URLs pointing at `service` into relative ones.
    fn internalize(&self, body: &mut Value, service: &Url);

    /// Turns relative (`/...`) URLs into absolute ones on `origin`
    /// (`scheme://host[:port]`).
    fn externalize(&self, body: &mut Value, origin: &str);
}

/// Rewrites every string leaf of a JSON value. Object keys are kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct AuthorityRewriter;

impl UrlRewriter for AuthorityRewriter {
    fn internalize(&self, body: &mut Value, service: &Url) {
        for_each_string(body, &mut |text: &mut String| {
            if let Some(relative) = strip_authority(text, service) {
                *text = relative;
            }
        });
    }

    fn externalize(&self, body: &mut Value, origin: &str) {
        let origin = origin.trim_end_matches('/');
        for_each_string(body, &mut |text: &mut String| {
            if text.starts_with('/') && !text.starts_with("//") {
                *text = format!("{origin}{text}");
            }
        });
    }
}

/// Host and port are compared after parsing, so `perms:80` and `perms`
/// name the same http service.
fn strip_authority(text: &str, service: &Url) -> Option<String> {
    if !text.starts_with("http://") && !text.starts_with("https://") {
        return None;
    }
    let url = Url::parse(text).ok()?;
    let same_host = url.host_str().is_some() && url.host_str() == service.host_str();
    if !same_host || url.port_or_known_default() != service.port_or_known_default() {
        return None;
    }
    Some(url[Position::BeforePath..].to_string())
}

fn for_each_string(value: &mut Value, f: &mut impl FnMut(&mut String)) {
    match value {
        Value::String(text) => f(text),
        Value::Array(items) => {
            for item in items {
                for_each_string(item, f);
            }
        }
        Value::Object(fields) => {
            for item in fields.values_mut() {
                for_each_string(item, f);
            }
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn internalize_strips_only_matching_authority() {
        let mut body = json!({
            "self": "http://perms:3200/az-permissions?https://svc/items/1",
            "nested": [{"root": "https://perms:3200"}, "https://perms:32001/x"],
            "other": "https://elsewhere/items/1",
            "count": 2
        });
        AuthorityRewriter.internalize(&mut body, &Url::parse("http://perms:3200").unwrap());
        assert_eq!(
            body,
            json!({
                "self": "/az-permissions?https://svc/items/1",
                "nested": [{"root": "/"}, "https://perms:32001/x"],
                "other": "https://elsewhere/items/1",
                "count": 2
            })
        );
    }

    #[test]
    fn internalize_matches_explicit_default_port() {
        let service = Url::parse("http://perms.internal:80").unwrap();
        let mut body = json!({
            "self": "http://perms.internal:80/az-permissions?x",
            "implicit": "http://perms.internal/az-teams/1#members",
            "other_port": "http://perms.internal:8080/az-teams/1"
        });
        AuthorityRewriter.internalize(&mut body, &service);
        assert_eq!(
            body,
            json!({
                "self": "/az-permissions?x",
                "implicit": "/az-teams/1#members",
                "other_port": "http://perms.internal:8080/az-teams/1"
            })
        );
    }

    #[test]
    fn externalize_prefixes_relative_paths() {
        let mut body = json!({
            "_subject": "/items/42",
            "_self": {"govern": ["/users/7", "https://idp/users/8", "//cdn/x"]},
            "/keys-stay": "plain text"
        });
        AuthorityRewriter.externalize(&mut body, "https://api.example.com/");
        assert_eq!(
            body,
            json!({
                "_subject": "https://api.example.com/items/42",
                "_self": {"govern": ["https://api.example.com/users/7", "https://idp/users/8", "//cdn/x"]},
                "/keys-stay": "plain text"
            })
        );
    }
}
