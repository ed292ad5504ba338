use std::{fmt, sync::Arc};

use axum::{
    Router,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{self, ACCEPT, CONTENT_TYPE},
    },
    response::Response,
};
use platform_api::{ApiError, ApiResult, Diagnostic};
use platform_authn::{BearerIdentity, IdentityExtractor};
use serde_json::Value;
use tracing::{Span, field, instrument};
use url::Url;

use crate::{
    document::{Permissions, Team},
    rewrite::{AuthorityRewriter, UrlRewriter},
    settings::{PermissionsSettings, SettingsError},
    transport::{HttpTransport, OutboundRequest, RouterTransport, ServiceResponse, Transport},
};

/// Caller headers that must not be copied onto the outbound request.
const LOCAL_HEADERS: [HeaderName; 12] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONTENT_TYPE,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::ACCEPT_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
    header::PROXY_AUTHORIZATION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
];

const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FORWARDED_HOST: &str = "x-forwarded-host";

/// Decides the response for a non-201 create outcome instead of the default
/// status mapping. Receives the service status and raw body.
pub type ErrorHook = Arc<dyn Fn(StatusCode, &str) -> Response + Send + Sync>;

#[derive(Clone, Default)]
pub struct CreateOptions {
    pub on_error: Option<ErrorHook>,
}

impl CreateOptions {
    pub fn on_error(hook: impl Fn(StatusCode, &str) -> Response + Send + Sync + 'static) -> Self {
        Self {
            on_error: Some(Arc::new(hook)),
        }
    }
}

impl fmt::Debug for CreateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreateOptions")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Outcome of a successful create: where the service stored the document
/// and what it stored.
#[derive(Clone, Debug, PartialEq)]
pub struct Created {
    pub location: String,
    pub body: Value,
}

/// Parameters of an "is this caller allowed" check.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedQuery {
    pub resources: Vec<String>,
    pub property: Option<String>,
    pub action: Option<String>,
    pub base: Option<String>,
    pub path: Option<String>,
    pub with_scopes: bool,
}

impl AllowedQuery {
    pub fn new(resource: impl Into<String>) -> Self {
        Self::for_resources([resource])
    }

    pub fn for_resources<I, S>(resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn property(mut self, property: impl Into<String>) -> Self {
        self.property = Some(property.into());
        self
    }

    pub fn base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_scopes(mut self) -> Self {
        self.with_scopes = true;
        self
    }

    fn query_string(&self, user: Option<&str>) -> String {
        let mut params: Vec<String> = self
            .resources
            .iter()
            .map(|resource| format!("resource={}", urlencoding::encode(resource)))
            .collect();
        let optional = [
            ("user", user),
            ("action", self.action.as_deref()),
            ("property", self.property.as_deref()),
            ("base", self.base.as_deref()),
            ("path", self.path.as_deref()),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                params.push(format!("{name}={}", urlencoding::encode(value)));
            }
        }
        if self.with_scopes {
            params.push("withScopes".into());
        }
        params.join("&")
    }
}

/// Answer from the permissions service: a bare boolean, or an object with
/// an `allowed` flag plus scopes when scopes were requested. Bodies that are
/// not JSON arrive as a JSON string.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    body: Value,
    scoped: bool,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        let flag = if self.scoped {
            self.body.get("allowed")
        } else {
            Some(&self.body)
        };
        matches!(flag, Some(Value::Bool(true)))
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }

    pub fn scope(&self, name: &str) -> Option<&Value> {
        self.body.get(name)
    }
}

#[derive(Clone, Copy, Debug)]
enum CreateKind {
    Permissions,
    Team,
}

/// Client for the permissions service. Cheap to clone; holds no mutable
/// state.
#[derive(Clone)]
pub struct PermissionsClient {
    settings: Arc<PermissionsSettings>,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentityExtractor>,
    rewriter: Arc<dyn UrlRewriter>,
}

impl fmt::Debug for PermissionsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionsClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl PermissionsClient {
    pub fn new(settings: PermissionsSettings, transport: Arc<dyn Transport>) -> Self {
        Self {
            settings: Arc::new(settings),
            transport,
            identity: Arc::new(BearerIdentity::default()),
            rewriter: Arc::new(AuthorityRewriter),
        }
    }

    /// Picks the HTTP transport when a base URL is configured, otherwise
    /// routes into `local`.
    pub fn from_settings(
        settings: PermissionsSettings,
        local: Option<Router>,
    ) -> Result<Self, SettingsError> {
        let transport: Arc<dyn Transport> = match (&settings.base_url, local) {
            (Some(base), _) => Arc::new(HttpTransport::new(base)),
            (None, Some(router)) => Arc::new(RouterTransport::new(router)),
            (None, None) => return Err(SettingsError::MissingRouter),
        };
        Ok(Self::new(settings, transport))
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityExtractor>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn UrlRewriter>) -> Self {
        self.rewriter = rewriter;
        self
    }

    pub fn settings(&self) -> &PermissionsSettings {
        &self.settings
    }

    pub fn user(&self, headers: &HeaderMap) -> Option<String> {
        self.identity.user_from_headers(headers)
    }

    /// Stores `permissions` as the permission document of `resource_url`.
    #[instrument(name = "permissions.create", skip_all, fields(resource = %resource_url, status = field::Empty))]
    pub async fn create_permissions(
        &self,
        headers: &HeaderMap,
        resource_url: &str,
        permissions: Option<Permissions>,
        options: &CreateOptions,
    ) -> ApiResult<Created> {
        if self.user(headers).is_none() {
            return Err(ApiError::Unauthorized(None));
        }
        let mut permissions = permissions
            .ok_or_else(|| ApiError::bad_request("may not set null permissions"))?;
        permissions
            .bind_to(resource_url)
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        let body = serde_json::to_string(&permissions).map_err(|err| {
            ApiError::internal(self.diagnostic(format!(
                "unable to serialize permissions for {resource_url}: {err}"
            )))
        })?;

        let path = self.settings.paths.permissions.clone();
        let response = self
            .dispatch(Method::POST, &path, headers, Some(body))
            .await?;
        self.finish_create(CreateKind::Permissions, headers, &path, response, options)
    }

    /// Removes the permission document protecting `resource_url`.
    #[instrument(name = "permissions.delete", skip_all, fields(resource = %resource_url, status = field::Empty))]
    pub async fn delete_permissions(&self, headers: &HeaderMap, resource_url: &str) -> ApiResult<()> {
        let path = format!(
            "{}?{}",
            self.settings.paths.permissions,
            urlencoding::encode(resource_url)
        );
        let response = self.dispatch(Method::DELETE, &path, headers, None).await?;
        if response.status == StatusCode::OK {
            return Ok(());
        }
        Err(self.upstream_failure(
            format!("unable to delete permissions for {resource_url}"),
            &path,
            &response,
        ))
    }

    #[instrument(name = "permissions.create_team", skip_all, fields(team = %team.name, status = field::Empty))]
    pub async fn create_team(
        &self,
        headers: &HeaderMap,
        team: &Team,
        options: &CreateOptions,
    ) -> ApiResult<Created> {
        if self.user(headers).is_none() {
            return Err(ApiError::Unauthorized(None));
        }
        team.validate()
            .map_err(|err| ApiError::bad_request(err.to_string()))?;
        let body = serde_json::to_string(team).map_err(|err| {
            ApiError::internal(self.diagnostic(format!("unable to serialize team: {err}")))
        })?;

        let path = self.settings.paths.teams.clone();
        let response = self
            .dispatch(Method::POST, &path, headers, Some(body))
            .await?;
        self.finish_create(CreateKind::Team, headers, &path, response, options)
    }

    /// Deletes a team by URL; absolute URLs are reduced to their path.
    #[instrument(name = "permissions.delete_team", skip_all, fields(team = %team_url, status = field::Empty))]
    pub async fn delete_team(&self, headers: &HeaderMap, team_url: &str) -> ApiResult<()> {
        let path = team_path(team_url);
        let response = self.dispatch(Method::DELETE, &path, headers, None).await?;
        if response.status == StatusCode::OK {
            return Ok(());
        }
        Err(self.upstream_failure(format!("unable to delete team {team_url}"), &path, &response))
    }

    #[instrument(name = "permissions.create_dir_entry", skip_all, fields(status = field::Empty))]
    pub async fn create_dir_entry(
        &self,
        headers: &HeaderMap,
        entry: &Value,
    ) -> ApiResult<ServiceResponse> {
        let path = self.settings.paths.directory.clone();
        self.dispatch(Method::POST, &path, headers, Some(entry.to_string()))
            .await
    }

    #[instrument(name = "permissions.get_dir_entry", skip_all, fields(query = %query, status = field::Empty))]
    pub async fn get_dir_entry(&self, headers: &HeaderMap, query: &str) -> ApiResult<ServiceResponse> {
        let path = format!("{}?{query}", self.settings.paths.directory);
        self.dispatch(Method::GET, &path, headers, None).await
    }

    #[instrument(name = "permissions.delete_dir_entry", skip_all, fields(query = %query, status = field::Empty))]
    pub async fn delete_dir_entry(
        &self,
        headers: &HeaderMap,
        query: &str,
    ) -> ApiResult<ServiceResponse> {
        let path = format!("{}?{query}", self.settings.paths.directory);
        self.dispatch(Method::DELETE, &path, headers, None).await
    }

    /// Asks the permissions service for a decision and returns it whatever
    /// it is; only service-level failures become errors.
    #[instrument(name = "permissions.with_allowed", skip_all, fields(resources = ?query.resources, status = field::Empty))]
    pub async fn with_allowed(&self, headers: &HeaderMap, query: &AllowedQuery) -> ApiResult<Decision> {
        let user = self.user(headers);
        self.check(headers, user.as_deref(), query).await
    }

    /// Like [`with_allowed`](Self::with_allowed) but turns a negative
    /// decision into Forbidden (identified caller) or Unauthorized
    /// (anonymous caller).
    #[instrument(name = "permissions.if_allowed", skip_all, fields(resources = ?query.resources, status = field::Empty))]
    pub async fn if_allowed(&self, headers: &HeaderMap, query: &AllowedQuery) -> ApiResult<Decision> {
        let user = self.user(headers);
        let decision = self.check(headers, user.as_deref(), query).await?;
        if decision.is_allowed() {
            Ok(decision)
        } else if user.is_some() {
            Err(ApiError::Forbidden(None))
        } else {
            Err(ApiError::Unauthorized(None))
        }
    }

    async fn check(
        &self,
        headers: &HeaderMap,
        user: Option<&str>,
        query: &AllowedQuery,
    ) -> ApiResult<Decision> {
        if query.resources.is_empty() {
            return Err(ApiError::bad_request("at least one resource is required"));
        }
        let path = format!("{}?{}", self.settings.paths.allowed, query.query_string(user));
        let response = self.dispatch(Method::GET, &path, headers, None).await?;

        let body = response.json().unwrap_or_else(|err| {
            tracing::warn!(
                url = %self.transport.describe(&path),
                body = %response.body,
                error = %err,
                "is-allowed response is not JSON; passing raw body through"
            );
            Value::String(response.body.clone())
        });

        match response.status {
            StatusCode::OK => Ok(Decision {
                body,
                scoped: query.with_scopes,
            }),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized(Some(response.body))),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden(Some(response.body))),
            _ => Err(self.upstream_failure("unable to retrieve is-allowed decision", &path, &response)),
        }
    }

    fn finish_create(
        &self,
        kind: CreateKind,
        headers: &HeaderMap,
        path: &str,
        response: ServiceResponse,
        options: &CreateOptions,
    ) -> ApiResult<Created> {
        if response.status == StatusCode::CREATED {
            return self.created(headers, path, response);
        }
        if let Some(hook) = &options.on_error {
            return Err(ApiError::Handled(hook(response.status, &response.body)));
        }
        let component = &self.settings.component;
        match response.status {
            StatusCode::BAD_REQUEST => Err(ApiError::BadRequest(response.body)),
            StatusCode::FORBIDDEN => Err(ApiError::Forbidden(Some(match kind {
                CreateKind::Permissions => format!(
                    "Forbidden. component: {component}. You are not allowed to create permissions for this resource or to inherit from the referenced sharing set"
                ),
                CreateKind::Team => {
                    format!("Forbidden. component: {component}. You are not allowed to create this team")
                }
            }))),
            StatusCode::CONFLICT => Err(ApiError::Duplicate(response.body)),
            _ => {
                let message = match kind {
                    CreateKind::Permissions => "unable to create permissions",
                    CreateKind::Team => "unable to create team",
                };
                Err(self.upstream_failure(message, path, &response))
            }
        }
    }

    fn created(&self, headers: &HeaderMap, path: &str, response: ServiceResponse) -> ApiResult<Created> {
        let Some(location) = response.location().map(str::to_string) else {
            return Err(self.upstream_failure("created response carries no Location header", path, &response));
        };
        let mut body = response.json().map_err(|err| {
            self.upstream_failure(format!("created response is not JSON: {err}"), path, &response)
        })?;
        if let Some(service) = &self.settings.base_url {
            self.rewriter.internalize(&mut body, service);
        }
        if let Some(origin) = caller_origin(headers) {
            self.rewriter.externalize(&mut body, &origin);
        }
        Ok(Created { location, body })
    }

    async fn dispatch(
        &self,
        method: Method,
        path: &str,
        caller: &HeaderMap,
        body: Option<String>,
    ) -> ApiResult<ServiceResponse> {
        let mut headers = flow_through(caller);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if body.is_some() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        let request = OutboundRequest {
            method: method.clone(),
            path: path.to_string(),
            headers,
            body,
        };
        let response = self.transport.send(request).await.map_err(|err| {
            ApiError::internal(
                self.diagnostic(format!("{method} to permissions service failed: {err}"))
                    .with_url(self.transport.describe(path)),
            )
        })?;
        Span::current().record("status", response.status.as_u16());
        Ok(response)
    }

    fn diagnostic(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::new(self.settings.component.clone(), message)
    }

    fn upstream_failure(
        &self,
        message: impl Into<String>,
        path: &str,
        response: &ServiceResponse,
    ) -> ApiError {
        ApiError::internal(
            self.diagnostic(message)
                .with_status(response.status)
                .with_url(self.transport.describe(path))
                .with_body(response.body.clone()),
        )
    }
}

fn flow_through(caller: &HeaderMap) -> HeaderMap {
    caller
        .iter()
        .filter(|(name, _)| !LOCAL_HEADERS.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// `scheme://host` the caller used to reach us; `x-forwarded-host` stands in
/// when there is no Host header.
fn caller_origin(headers: &HeaderMap) -> Option<String> {
    let host = headers
        .get(header::HOST)
        .or_else(|| headers.get(FORWARDED_HOST))?
        .to_str()
        .ok()?;
    let scheme = headers
        .get(FORWARDED_PROTO)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

fn team_path(team_url: &str) -> String {
    match Url::parse(team_url) {
        Ok(url) if url.has_host() => match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        },
        _ if team_url.starts_with('/') => team_url.to_string(),
        _ => format!("/{team_url}"),
    }
}
