use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::{self, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header::LOCATION},
    response::IntoResponse,
    routing::{get, post},
};
use platform_api::{ApiError, ApiResult};
use platform_authz::{
    AllowedQuery, CreateOptions, GOVERN_ACTION, Permissions, PermissionsClient, SELF_PROPERTY,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;

#[derive(Clone, Debug, Serialize)]
pub struct Item {
    pub id: Uuid,
    pub title: String,
    #[serde(rename = "self")]
    pub self_url: String,
    pub permissions: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub permissions: PermissionsClient,
    items: Arc<RwLock<HashMap<Uuid, Item>>>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, permissions: PermissionsClient) -> Self {
        Self {
            config,
            permissions,
            items: Arc::default(),
        }
    }
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "items service listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();
    let allow_origin = if allowed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed)
    };
    CorsLayer::new()
        .allow_headers([http::header::CONTENT_TYPE, http::header::AUTHORIZATION])
        .allow_methods([Method::POST, Method::GET, Method::DELETE])
        .allow_origin(allow_origin)
}

pub fn build_router(state: AppState) -> Router {
    let header_name = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/health", get(health_handler))
        .route("/items", post(create_item_handler))
        .route("/items/{id}", get(get_item_handler).delete(delete_item_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(header_name.clone(), MakeRequestUuid))
                .layer(PropagateRequestIdLayer::new(header_name))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&state.config.cors_allowed_origins)),
        )
        .with_state(state)
}

#[derive(Deserialize)]
struct CreateItem {
    title: String,
    #[serde(default)]
    permissions: Option<Permissions>,
}

async fn create_item_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    input: Result<Json<CreateItem>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(input) = input.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let user = state
        .permissions
        .user(&headers)
        .ok_or(ApiError::Unauthorized(None))?;
    let id = Uuid::new_v4();
    let self_url = item_url(&state, &headers, id)?;

    let mut permissions = input
        .permissions
        .unwrap_or_else(|| Permissions::new().grant(SELF_PROPERTY, GOVERN_ACTION, user));
    if let Some(base) = &state.config.public_base_url {
        permissions.resolve_relative_urls(base);
    }

    let created = state
        .permissions
        .create_permissions(&headers, &self_url, Some(permissions), &CreateOptions::default())
        .await?;

    let item = Item {
        id,
        title: input.title,
        self_url: self_url.clone(),
        permissions: created.location,
    };
    state.items.write().await.insert(id, item.clone());
    info!(%self_url, "item created");
    Ok((StatusCode::CREATED, [(LOCATION, self_url)], Json(item)))
}

async fn get_item_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Item>> {
    let self_url = item_url(&state, &headers, id)?;
    state
        .permissions
        .if_allowed(&headers, &AllowedQuery::new(&self_url).action("read"))
        .await?;
    let items = state.items.read().await;
    items.get(&id).cloned().map(Json).ok_or(ApiError::NotFound)
}

async fn delete_item_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Item>> {
    let self_url = item_url(&state, &headers, id)?;
    state
        .permissions
        .if_allowed(&headers, &AllowedQuery::new(&self_url).action("delete"))
        .await?;
    if !state.items.read().await.contains_key(&id) {
        return Err(ApiError::NotFound);
    }
    state
        .permissions
        .delete_permissions(&headers, &self_url)
        .await?;
    let item = state
        .items
        .write()
        .await
        .remove(&id)
        .ok_or(ApiError::NotFound)?;
    info!(%self_url, "item deleted");
    Ok(Json(item))
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        ok: true,
        component: state.permissions.settings().component.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    component: String,
    version: &'static str,
}

fn item_url(state: &AppState, headers: &HeaderMap, id: Uuid) -> ApiResult<String> {
    let base = match &state.config.public_base_url {
        Some(base) => base.clone(),
        None => {
            let host = headers
                .get(http::header::HOST)
                .and_then(|value| value.to_str().ok())
                .ok_or_else(|| ApiError::bad_request("missing Host header"))?;
            Url::parse(&format!("http://{host}/"))
                .map_err(|_| ApiError::bad_request("invalid Host header"))?
        }
    };
    base.join(&format!("items/{id}"))
        .map(String::from)
        .map_err(|_| ApiError::bad_request("unable to build item URL"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    ctrl_c.await;

    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    };
    info!("shutdown signal received");
}
