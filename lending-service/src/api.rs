use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method, StatusCode},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use shared::*;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::lending::Lending;
use crate::store::LendingStore;

/// Header carrying the caller id, set by the upstream identity layer.
pub const USER_ID_HEADER: &str = "x-user-id";

pub struct AppState<S> {
    pub lending: Arc<Lending<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            lending: self.lending.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub held: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SelectionResponse {
    pub item_id: ItemId,
    pub quantity: i32,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub item_id: ItemId,
    pub released: i32,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

/// Authenticated caller, read from [`USER_ID_HEADER`].
pub struct Caller(pub UserId);

#[async_trait]
impl<St: Send + Sync> FromRequestParts<St> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &St) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| unauthorized("missing x-user-id header"))?;
        let id = Uuid::parse_str(raw.trim()).map_err(|_| unauthorized("invalid x-user-id header"))?;
        Ok(Caller(UserId(id)))
    }
}

fn unauthorized(message: &str) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
            kind: "unauthorized",
            held: None,
        }),
    )
}

pub fn status_for(err: &LendingError) -> StatusCode {
    match err {
        LendingError::ItemNotFound(_) | LendingError::SelectionNotFound(_) => StatusCode::NOT_FOUND,
        LendingError::InsufficientStock { .. } => StatusCode::CONFLICT,
        LendingError::ItemUnavailable(_)
        | LendingError::InvalidQuantity(_)
        | LendingError::EmptyCart
        | LendingError::NothingToReturn(_)
        | LendingError::ExcessReturn { .. } => StatusCode::BAD_REQUEST,
        LendingError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn error_response(err: LendingError) -> ApiError {
    let held = match &err {
        LendingError::ExcessReturn { held, .. } => Some(*held),
        _ => None,
    };
    (
        status_for(&err),
        Json(ErrorResponse {
            error: err.to_string(),
            kind: err.kind(),
            held,
        }),
    )
}

pub fn cors_layer(allow_origin: &str) -> anyhow::Result<CorsLayer> {
    let origin = if allow_origin == "*" {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::exact(HeaderValue::from_str(allow_origin)?)
    };
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
        ]))
}

pub fn create_router<S: LendingStore>(state: AppState<S>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/cart", get(list_cart::<S>))
        .route("/cart/add/:item_id", post(add_to_cart::<S>))
        .route("/cart/decrease/:item_id", post(decrease_in_cart::<S>))
        .route("/cart/delete/:item_id", delete(remove_from_cart::<S>))
        .route("/cart/checkout", post(checkout::<S>))
        .route("/cart/return/:item_id", post(return_item::<S>))
        .route("/history", get(history::<S>))
        .route("/history/all", get(history_all::<S>))
        .route("/user/held-items", get(held_items::<S>))
        .route("/user/stats", get(stats::<S>))
        .route("/holdings/outstanding", get(outstanding::<S>))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(cors)
}

pub async fn list_cart<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
) -> ApiResult<Vec<SelectionWithItem>> {
    state.lending.list_selections(user).await.map(Json).map_err(error_response)
}

pub async fn add_to_cart<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
    Path(item_id): Path<Uuid>,
) -> ApiResult<SelectionResponse> {
    let selection = state
        .lending
        .add_selection(user, ItemId(item_id))
        .await
        .map_err(error_response)?;
    Ok(Json(SelectionResponse {
        item_id: selection.item_id,
        quantity: selection.quantity,
    }))
}

pub async fn decrease_in_cart<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
    Path(item_id): Path<Uuid>,
) -> ApiResult<SelectionResponse> {
    let item_id = ItemId(item_id);
    let remaining = state
        .lending
        .decrease_selection(user, item_id)
        .await
        .map_err(error_response)?;
    Ok(Json(SelectionResponse {
        item_id,
        quantity: remaining.map(|s| s.quantity).unwrap_or(0),
    }))
}

pub async fn remove_from_cart<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
    Path(item_id): Path<Uuid>,
) -> ApiResult<RemovedResponse> {
    let item_id = ItemId(item_id);
    let released = state
        .lending
        .remove_selection(user, item_id)
        .await
        .map_err(error_response)?;
    Ok(Json(RemovedResponse { item_id, released }))
}

pub async fn checkout<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
) -> ApiResult<CheckoutReceipt> {
    state.lending.checkout(user).await.map(Json).map_err(error_response)
}

/// The body is optional; anything that is not a JSON `{ "quantity": n }`
/// returns a single unit.
pub async fn return_item<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
    Path(item_id): Path<Uuid>,
    body: Option<Json<ReturnRequest>>,
) -> ApiResult<ReturnReceipt> {
    let quantity = body.and_then(|Json(request)| request.quantity);
    state
        .lending
        .return_item(user, ItemId(item_id), quantity)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn history<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
) -> ApiResult<Vec<LedgerEntry>> {
    state.lending.history(user).await.map(Json).map_err(error_response)
}

pub async fn history_all<S: LendingStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<Vec<LedgerEntry>> {
    state.lending.history_all().await.map(Json).map_err(error_response)
}

pub async fn held_items<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
) -> ApiResult<Vec<HeldItem>> {
    state.lending.held_by_user(user).await.map(Json).map_err(error_response)
}

pub async fn stats<S: LendingStore>(
    State(state): State<AppState<S>>,
    Caller(user): Caller,
) -> ApiResult<BorrowingStats> {
    state.lending.borrowing_stats(user).await.map(Json).map_err(error_response)
}

pub async fn outstanding<S: LendingStore>(
    State(state): State<AppState<S>>,
) -> ApiResult<OutstandingTotals> {
    state.lending.held_system_wide().await.map(Json).map_err(error_response)
}

pub async fn health_check() -> &'static str {
    "OK"
}
