use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError};
use tracing::{info, warn};

use crate::channel_map::{ChannelEntry, ChannelMap};
use crate::channel_stats::StateSnapshot;
use crate::dispatcher::SharedSnapshot;
use crate::driver::{SourceRegistry, SourceStatus};

#[derive(Clone)]
pub struct AppState {
    pub channel_map: Arc<ChannelMap>,
    pub snapshot: SharedSnapshot,
    pub registry: Arc<SourceRegistry>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            status: "ok".to_string(),
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: "error".to_string(),
            data: None,
            error: Some(message),
        }
    }
}

// Query parameters
#[derive(Debug, Deserialize)]
pub struct SourceQuery {
    pub source: Option<u8>,
}

pub async fn get_channels(
    State(state): State<AppState>,
    Query(params): Query<SourceQuery>,
) -> Result<Json<ApiResponse<Vec<ChannelEntry>>>, StatusCode> {
    info!(?params, "GET /api/channels called");
    let entries = state
        .channel_map
        .entries()
        .into_iter()
        .filter(|e| params.source.is_none_or(|s| s == e.source))
        .collect();
    Ok(Json(ApiResponse::ok(entries)))
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(params): Query<SourceQuery>,
) -> Result<Json<ApiResponse<StateSnapshot>>, StatusCode> {
    info!(?params, "GET /api/stats called");
    let snapshot = state
        .snapshot
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    match snapshot {
        Some(mut snapshot) => {
            if let Some(source) = params.source {
                snapshot.channels.retain(|c| c.source == source);
            }
            Ok(Json(ApiResponse::ok(snapshot)))
        }
        None => {
            warn!("Statistics requested before the first snapshot");
            Ok(Json(ApiResponse::error("No statistics available yet".to_string())))
        }
    }
}

pub async fn get_sources(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<SourceStatus>>>, StatusCode> {
    info!("GET /api/sources called");
    Ok(Json(ApiResponse::ok(state.registry.all())))
}

pub fn create_api_router(state: AppState) -> Router {
    Router::new()
        .route("/channels", get(get_channels))
        .route("/stats", get(get_stats))
        .route("/sources", get(get_sources))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::RwLock;
    use tower::ServiceExt;

    use crate::channel_map::ChannelInfo;
    use crate::channel_stats::ChannelStats;
    use marine_proto::Message;

    fn state() -> AppState {
        let channel_map = Arc::new(ChannelMap::new());
        channel_map.declare(0x30, "GPS", &[(5, ChannelInfo::new("Sentence"))]);
        channel_map.declare(0x60, "Buoy", &[(4, ChannelInfo::new("Signal"))]);
        AppState {
            channel_map,
            snapshot: Arc::new(RwLock::new(None)),
            registry: Arc::new(SourceRegistry::new()),
        }
    }

    async fn get_json(state: AppState, uri: &str) -> serde_json::Value {
        let response = create_api_router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_channels() {
        let json = get_json(state(), "/channels").await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"].as_array().unwrap().len(), 2);
        assert_eq!(json["data"][0]["source_name"], "GPS");
        assert_eq!(json["data"][0]["name"], "Sentence");
    }

    #[tokio::test]
    async fn test_channels_filtered_by_source() {
        let json = get_json(state(), "/channels?source=96").await;
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["source"], 0x60);
    }

    #[tokio::test]
    async fn test_stats_before_first_snapshot() {
        let json = get_json(state(), "/stats").await;
        assert_eq!(json["status"], "error");
        assert!(json["data"].is_null());
    }

    #[tokio::test]
    async fn test_stats() {
        let state = state();
        let mut stats = ChannelStats::new();
        stats.update(&Message::float(0x60, 4, 1.0));
        stats.update(&Message::float(0x60, 4, 1.0));
        *state.snapshot.write().unwrap() = Some(stats.snapshot(&state.channel_map));

        let json = get_json(state, "/stats").await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["data"]["channels"][0]["count"], 2);
        assert_eq!(json["data"]["channels"][0]["name"], "Signal");
    }

    #[tokio::test]
    async fn test_sources_empty() {
        let json = get_json(state(), "/sources").await;
        assert_eq!(json["data"].as_array().unwrap().len(), 0);
    }
}
