use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    classifier::ErrorCategory,
    error::VaultError,
    models::*,
    orchestrator::TransactionOrchestrator,
    units::{format_units, parse_units},
    vault_monitor::{MonitoringStats, VaultMonitor},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TransactionOrchestrator>,
    pub monitor: Arc<VaultMonitor>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health and monitoring
        .route("/health", get(health_check))

        // Vault state
        .route("/vault", get(get_position))
        .route("/vault/refresh", post(refresh_position))

        // Vault operations
        .route("/vault/deposit", post(deposit))
        .route("/vault/borrow", post(borrow))
        .route("/vault/repay", post(repay))
        .route("/vault/withdraw", post(withdraw))

        // Transaction history
        .route("/vault/transactions", get(get_transactions))
        .route("/vault/transactions/active", get(get_active_transaction))

        .with_state(state)
}

// Request/Response DTOs

/// Amounts cross the API as decimal strings, e.g. `"1.25"`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AmountRequest {
    pub amount: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PositionResponse {
    pub collateral_amount: String,
    pub borrowed_amount: String,
    pub current_debt: String,
    /// Percent; null when there is no debt.
    pub collateral_ratio: Option<String>,
    pub health_factor: Option<String>,
    pub interest_rate: String,
    pub max_withdrawable: String,
    pub collateral_price: String,
    pub wallet_musd_balance: String,
    pub allowance: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub stale_fields: Vec<String>,
}

impl From<&VaultPosition> for PositionResponse {
    fn from(position: &VaultPosition) -> Self {
        Self {
            collateral_amount: format_units(position.collateral_amount),
            borrowed_amount: format_units(position.borrowed_amount),
            current_debt: format_units(position.current_debt),
            collateral_ratio: position.collateral_ratio.map(format_units),
            health_factor: position.health_factor.map(format_units),
            interest_rate: format_units(position.interest_rate),
            max_withdrawable: format_units(position.max_withdrawable),
            collateral_price: format_units(position.collateral_price),
            wallet_musd_balance: format_units(position.wallet_musd_balance),
            allowance: if position.allowance == U256::MAX {
                "unlimited".to_string()
            } else {
                format_units(position.allowance)
            },
            fetched_at: position.fetched_at,
            stale_fields: position.stale_fields.iter().map(|f| f.as_str().to_string()).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub amount: String,
    pub status: TransactionStatus,
    pub hash: Option<String>,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TransactionRequest> for TransactionResponse {
    fn from(request: TransactionRequest) -> Self {
        Self {
            id: request.id,
            kind: request.kind,
            amount: if request.amount == U256::MAX {
                "unlimited".to_string()
            } else {
                format_units(request.amount)
            },
            status: request.status,
            hash: request.hash.map(|hash| hash.0),
            error: request.error,
            category: request.category,
            created_at: request.created_at,
            updated_at: request.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub busy: bool,
    pub details: MonitoringStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub details: Option<String>,
}

// API Handlers

async fn health_check(State(state): State<AppState>) -> JsonResponse<HealthResponse> {
    let stats = state.monitor.get_stats().await;

    JsonResponse(HealthResponse {
        status: if stats.is_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        timestamp: Utc::now(),
        busy: state.orchestrator.is_busy(),
        details: stats,
    })
}

async fn get_position(State(state): State<AppState>) -> JsonResponse<PositionResponse> {
    let position = state.orchestrator.position().await;
    JsonResponse(PositionResponse::from(position.as_ref()))
}

async fn refresh_position(State(state): State<AppState>) -> Result<JsonResponse<PositionResponse>, VaultError> {
    let position = state.orchestrator.refresh_all().await?;
    Ok(JsonResponse(PositionResponse::from(position.as_ref())))
}

async fn deposit(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> Result<JsonResponse<TransactionResponse>, VaultError> {
    info!("Processing deposit request, amount: {}", request.amount);
    let amount = parse_units(&request.amount)?;
    let transaction = state.orchestrator.deposit_collateral(amount).await?;
    Ok(JsonResponse(transaction.into()))
}

async fn borrow(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> Result<JsonResponse<TransactionResponse>, VaultError> {
    info!("Processing borrow request, amount: {}", request.amount);
    let amount = parse_units(&request.amount)?;
    let transaction = state.orchestrator.borrow_musd(amount).await?;
    Ok(JsonResponse(transaction.into()))
}

async fn repay(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> Result<JsonResponse<TransactionResponse>, VaultError> {
    info!("Processing repay request, amount: {}", request.amount);
    let amount = parse_units(&request.amount)?;
    let transaction = state.orchestrator.repay_musd(amount).await?;
    Ok(JsonResponse(transaction.into()))
}

async fn withdraw(
    State(state): State<AppState>,
    Json(request): Json<AmountRequest>,
) -> Result<JsonResponse<TransactionResponse>, VaultError> {
    info!("Processing withdrawal request, amount: {}", request.amount);
    let amount = parse_units(&request.amount)?;
    let transaction = state.orchestrator.withdraw_collateral(amount).await?;
    Ok(JsonResponse(transaction.into()))
}

async fn get_transactions(State(state): State<AppState>) -> JsonResponse<Vec<TransactionResponse>> {
    let history = state.orchestrator.history();
    JsonResponse(history.into_iter().rev().map(TransactionResponse::from).collect())
}

async fn get_active_transaction(State(state): State<AppState>) -> JsonResponse<Option<TransactionResponse>> {
    JsonResponse(state.orchestrator.active_request().map(TransactionResponse::from))
}

// Error handling

fn status_for_category(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::GasOrNetwork => StatusCode::BAD_GATEWAY,
        ErrorCategory::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            VaultError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
            VaultError::Busy { .. } => (StatusCode::CONFLICT, "busy"),
            VaultError::InsufficientBalance { .. }
            | VaultError::InsufficientCollateral { .. }
            | VaultError::WithdrawalExceedsLimit { .. } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                self.category().map_or("rejected", |category| category.code()),
            ),
            VaultError::Ledger(classified) => (status_for_category(classified.category), classified.category.code()),
            VaultError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            VaultError::PartialRefresh { .. } => (StatusCode::BAD_GATEWAY, "partial_refresh"),
            VaultError::NetworkError(_) => (StatusCode::BAD_GATEWAY, "gas_or_network"),
            VaultError::InvalidTransition { .. }
            | VaultError::ConfigurationError(_)
            | VaultError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "unknown"),
        };

        let (message, details) = match &self {
            VaultError::Ledger(classified) => (classified.user_message(), Some(classified.message.clone())),
            other => (other.to_string(), None),
        };
        if status.is_server_error() {
            warn!("Request failed with {}: {}", status, self);
        }

        let error_response = ErrorResponse {
            error: error_code.to_string(),
            message,
            details,
        };

        (status, JsonResponse(error_response)).into_response()
    }
}
