use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post, put},
};
use std::sync::Arc;
use std::time::Duration;

use super::entry::SessionId;
use super::protocol::{
    AckResponse, CommandResponse, CreateSessionRequest, CreateSessionResponse, ENDPOINT_EXECUTE,
    ENDPOINT_HEALTH, ENDPOINT_PARTITION, ENDPOINT_REPLICATE, ENDPOINT_SESSIONS, ENDPOINT_STATS,
    ErrorResponse, ForwardRequest, HealthResponse, PartitionSnapshot, ReplicateRequest,
    SessionSnapshot, StatsResponse,
};
use super::store::SessionStore;
use crate::error::StoreError;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// How long a forwarded command may wait for this node to install the view
/// its sender routed with.
const CATCH_UP_BOUND: Duration = Duration::from_millis(500);

/// Every HTTP route a node serves: the internal node-to-node surface and
/// the thin public session API.
pub fn router(store: Arc<SessionStore>) -> Router {
    let partition_path = format!("{}/:partition", ENDPOINT_PARTITION);
    let session_path = format!("{}/:id", ENDPOINT_SESSIONS);
    let attribute_path = format!("{}/:id/attributes/:name", ENDPOINT_SESSIONS);

    Router::new()
        .route(ENDPOINT_EXECUTE, post(handle_execute))
        .route(ENDPOINT_REPLICATE, post(handle_replicate))
        .route(
            &partition_path,
            get(handle_partition_dump).post(handle_partition_push),
        )
        .route(ENDPOINT_STATS, get(handle_stats))
        .route(ENDPOINT_HEALTH, get(handle_health))
        .route(ENDPOINT_SESSIONS, post(handle_create_session))
        .route(
            &session_path,
            get(handle_get_session).delete(handle_delete_session),
        )
        .route(
            &attribute_path,
            put(handle_set_attribute)
                .get(handle_get_attribute)
                .delete(handle_remove_attribute),
        )
        .layer(Extension(store))
}

// --- Internal surface ---

fn in_range(store: &SessionStore, partition: u32) -> bool {
    let valid = partition < store.partitioner().num_partitions;
    if !valid {
        tracing::warn!("Rejecting request for out-of-range partition {}", partition);
    }
    valid
}

fn refused() -> Json<AckResponse> {
    Json(AckResponse {
        success: false,
        applied: 0,
    })
}

pub async fn handle_execute(
    Extension(store): Extension<Arc<SessionStore>>,
    Json(req): Json<ForwardRequest>,
) -> (StatusCode, Json<CommandResponse>) {
    let partition = store.partitioner().get_partition(req.command.session_id().as_str());
    if partition != req.partition {
        tracing::warn!(
            "Forwarded command resolved to partition {} locally but {} by sender",
            partition,
            req.partition
        );
    }

    store.catch_up(req.view_version, CATCH_UP_BOUND).await;
    let response = store.execute_detached(partition, req.command).await;
    (StatusCode::OK, Json(response))
}

pub async fn handle_replicate(
    Extension(store): Extension<Arc<SessionStore>>,
    Json(req): Json<ReplicateRequest>,
) -> (StatusCode, Json<AckResponse>) {
    tracing::trace!(
        "Replica {} v{} for partition {}",
        req.key,
        req.version,
        req.partition
    );
    if !in_range(&store, req.partition) {
        return (StatusCode::BAD_REQUEST, refused());
    }
    let applied = store.apply_replica(req);
    // Stale versions are acknowledged too: the backup already holds newer state.
    (
        StatusCode::OK,
        Json(AckResponse {
            success: true,
            applied: usize::from(applied),
        }),
    )
}

pub async fn handle_partition_dump(
    Extension(store): Extension<Arc<SessionStore>>,
    Path(partition): Path<u32>,
) -> Result<(StatusCode, Json<PartitionSnapshot>), ApiError> {
    if !in_range(&store, partition) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("partition {} out of range", partition),
            }),
        ));
    }
    Ok((StatusCode::OK, Json(store.partition_snapshot(partition))))
}

pub async fn handle_partition_push(
    Extension(store): Extension<Arc<SessionStore>>,
    Path(partition): Path<u32>,
    Json(snapshot): Json<PartitionSnapshot>,
) -> (StatusCode, Json<AckResponse>) {
    if !in_range(&store, partition) {
        return (StatusCode::BAD_REQUEST, refused());
    }
    if snapshot.partition != partition {
        tracing::error!(
            "Partition push for {} carried partition {}",
            partition,
            snapshot.partition
        );
        return (StatusCode::BAD_REQUEST, refused());
    }

    let applied = store.accept_snapshot(snapshot);
    (
        StatusCode::OK,
        Json(AckResponse {
            success: true,
            applied,
        }),
    )
}

pub async fn handle_stats(
    Extension(store): Extension<Arc<SessionStore>>,
) -> (StatusCode, Json<StatsResponse>) {
    (StatusCode::OK, Json(store.stats()))
}

pub async fn handle_health(
    Extension(store): Extension<Arc<SessionStore>>,
) -> (StatusCode, Json<HealthResponse>) {
    let membership = store.membership();
    let view = membership.view();
    let status = if membership.is_joined() {
        "ok"
    } else {
        "joining"
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            node_id: membership.local_id().to_string(),
            view_version: view.version,
            members: view
                .members
                .iter()
                .map(|node| format!("{}@{}", node.id, node.http_addr))
                .collect(),
        }),
    )
}

// --- Public session API ---

fn api_error(err: StoreError) -> ApiError {
    let status = match err {
        StoreError::SessionNotFound(_) | StoreError::AttributeNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        StoreError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn handle_create_session(
    Extension(store): Extension<Arc<SessionStore>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let result = match (req.time_to_live_secs, req.idle_timeout_secs) {
        (None, None) => store.create().await,
        (ttl, idle) => {
            let (default_ttl, default_idle) = store.default_lifetimes();
            store
                .create_with(
                    ttl.map(Duration::from_secs).unwrap_or(default_ttl),
                    idle.map(Duration::from_secs).unwrap_or(default_idle),
                )
                .await
        }
    };

    let id = result.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(CreateSessionResponse { id })))
}

pub async fn handle_get_session(
    Extension(store): Extension<Arc<SessionStore>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SessionSnapshot>), ApiError> {
    let session = store
        .get(&SessionId(id))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::OK, Json(session)))
}

pub async fn handle_delete_session(
    Extension(store): Extension<Arc<SessionStore>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    store.delete(&SessionId(id)).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_get_attribute(
    Extension(store): Extension<Arc<SessionStore>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let value = store
        .get_attribute(&SessionId(id), &name)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::OK, Json(value)))
}

pub async fn handle_set_attribute(
    Extension(store): Extension<Arc<SessionStore>>,
    Path((id, name)): Path<(String, String)>,
    Json(value): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    store
        .set_attribute(&SessionId(id), &name, value)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn handle_remove_attribute(
    Extension(store): Extension<Arc<SessionStore>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    store
        .remove_attribute(&SessionId(id), &name)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
