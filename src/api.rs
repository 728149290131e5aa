// # HTTP API
//
// Thin administrative surface over the queue and matcher. Mutations are
// enqueued and answered with the queue item id; search runs synchronously
// against the shard set.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::document::{self, canonicalize, DocumentId};
use crate::error::{MatchError, Result};
use crate::matcher::{find_matches, SearchMatches};
use crate::posting::client::ShardSet;
use crate::queue::{Queue, QueueItem, QueueItemKind, QueueStats};
use crate::registry::Registry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<Registry>,
    pub queue: Queue,
    pub shards: ShardSet,
}

pub struct ApiError(MatchError);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl<E: Into<MatchError>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MatchError::NotFound(_) => StatusCode::NOT_FOUND,
            MatchError::Conflict(_) => StatusCode::CONFLICT,
            MatchError::Invalid(_) | MatchError::Configuration(_) => StatusCode::BAD_REQUEST,
            MatchError::Unavailable(_) | MatchError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            MatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddDocumentBody {
    #[serde(default)]
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchBody {
    pub text: String,
    #[serde(default)]
    pub threshold: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchBody {
    pub source: DocumentId,
    pub target: DocumentId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnqueuedResponse {
    pub queue_id: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardStatus {
    pub address: String,
    pub state: String,
    pub postings: u64,
    pub occupied_groups: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub queue: QueueStats,
    pub documents: u64,
    pub shards: Vec<ShardStatus>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/document/{doctype}/{docid}",
            post(add_document).delete(delete_document).get(get_document),
        )
        .route("/associate/{doctype}/{docid}", post(associate_document))
        .route("/switch", post(switch_document))
        .route("/search", post(search))
        .route("/queue/{id}", get(queue_item))
        .route("/status", get(status))
        .with_state(state)
}

pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut stop: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        })
        .await
        .map_err(|e| MatchError::Network(e.to_string()))
}

async fn add_document(
    State(state): State<ApiState>,
    Path((doctype, docid)): Path<(u32, u32)>,
    Json(body): Json<AddDocumentBody>,
) -> ApiResult<(StatusCode, Json<EnqueuedResponse>)> {
    let target = DocumentId::new(doctype, docid);
    let payload = serde_json::to_vec(&body).map_err(MatchError::from)?;
    let item = state
        .queue
        .enqueue(QueueItemKind::AddDocument, Some(target), None, payload)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { queue_id: item.id })))
}

async fn delete_document(
    State(state): State<ApiState>,
    Path((doctype, docid)): Path<(u32, u32)>,
) -> ApiResult<(StatusCode, Json<EnqueuedResponse>)> {
    let target = DocumentId::new(doctype, docid);
    let item = state
        .queue
        .enqueue(QueueItemKind::DeleteDocument, Some(target), None, Vec::new())
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { queue_id: item.id })))
}

async fn get_document(
    State(state): State<ApiState>,
    Path((doctype, docid)): Path<(u32, u32)>,
) -> ApiResult<Json<document::Document>> {
    let id = DocumentId::new(doctype, docid);
    let doc = document::get_document(state.registry.store.as_ref(), id)
        .await?
        .ok_or_else(|| MatchError::NotFound(format!("document {}", id)))?;
    Ok(Json(doc))
}

async fn associate_document(
    State(state): State<ApiState>,
    Path((doctype, docid)): Path<(u32, u32)>,
) -> ApiResult<(StatusCode, Json<EnqueuedResponse>)> {
    let target = DocumentId::new(doctype, docid);
    let item = state
        .queue
        .enqueue(
            QueueItemKind::AssociateDocument,
            Some(target),
            None,
            Vec::new(),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { queue_id: item.id })))
}

async fn switch_document(
    State(state): State<ApiState>,
    Json(body): Json<SwitchBody>,
) -> ApiResult<(StatusCode, Json<EnqueuedResponse>)> {
    let item = state
        .queue
        .enqueue(
            QueueItemKind::Switch,
            Some(body.target),
            Some(body.source),
            Vec::new(),
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(EnqueuedResponse { queue_id: item.id })))
}

async fn search(
    State(state): State<ApiState>,
    Json(body): Json<SearchBody>,
) -> ApiResult<Json<SearchMatches>> {
    let registry = &state.registry;
    let text = canonicalize(&body.text);
    let threshold = body.threshold.unwrap_or(registry.match_threshold);
    let matches = find_matches(
        &state.shards,
        registry.key,
        &text,
        threshold,
        None,
        &registry.cancel,
    )
    .await?;
    Ok(Json(matches))
}

async fn queue_item(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> ApiResult<Json<QueueItem>> {
    let item = state
        .queue
        .get(id)
        .await?
        .ok_or_else(|| MatchError::NotFound(format!("queue item {}", id)))?;
    Ok(Json(item))
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<StatusResponse>> {
    let queue = state.queue.stats().await?;
    let documents = state.registry.store.document_count().await?;
    let mut shards = Vec::with_capacity(state.shards.len());
    for (i, config) in state.registry.posting_configs.iter().enumerate() {
        let shard = match state.shards.client(i).status().await {
            Ok((shard_state, postings, occupied_groups)) => ShardStatus {
                address: config.address.clone(),
                state: shard_state.to_string(),
                postings,
                occupied_groups,
            },
            Err(_) => ShardStatus {
                address: config.address.clone(),
                state: "unreachable".to_string(),
                postings: 0,
                occupied_groups: 0,
            },
        };
        shards.push(shard);
    }
    Ok(Json(StatusResponse {
        queue,
        documents,
        shards,
    }))
}
