//! Authorization facade backed by the external permissions service.
//!
//! Services never evaluate permissions themselves. They hand permission
//! documents to the permissions service when resources are created, delete
//! them when resources go away, and ask it whether a caller may act on a
//! resource. `PermissionsClient` wraps each of those exchanges and maps the
//! service's answers onto [`platform_api::ApiError`].

mod client;
mod document;
mod rewrite;
mod settings;
mod transport;

pub use client::{AllowedQuery, CreateOptions, Created, Decision, ErrorHook, PermissionsClient};
pub use document::{
    ActionMap, DocumentError, GOVERN_ACTION, Permissions, SELF_PROPERTY, Team,
};
pub use rewrite::{AuthorityRewriter, UrlRewriter};
pub use settings::{DEFAULT_COMPONENT, PermissionsSettings, ServicePaths, SettingsError};
pub use transport::{
    HttpTransport, OutboundRequest, RouterTransport, ServiceResponse, Transport, TransportError,
};
