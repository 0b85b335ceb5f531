use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse, Responder};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::api::schema::DateTimeUtc;
use crate::blockchain::session::SessionError;
use crate::blockchain::wallet::WalletError;
use crate::blockchain::{Address, Block, Blockchain, BlockchainError, MiningHandle, Transaction};

/// Shared state handed to every handler
pub struct AppState {
    pub blockchain: Arc<Blockchain>,
    pub miner: MiningHandle,
}

pub type AppData = web::Data<AppState>;

/// Generic failure body
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Response for the transaction endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MineRequest {
    /// Reward recipient. Defaults to the node's owner wallet.
    #[serde(default)]
    pub miner_address: Option<String>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub address: String,
    pub balance: u64,
    pub last_updated: DateTimeUtc,
}

/// Response for the create wallet endpoint
#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateWalletResponse {
    pub address: String,

    /// Hex private key. The node does not keep it.
    pub private_key: String,

    pub balance: u64,
    pub session_token: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub private_key: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WalletSummary {
    pub address: String,
    pub balance: u64,
    pub is_owner: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub session_token: String,
    pub wallet: WalletSummary,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ValidateChainResponse {
    pub valid: bool,
    pub length: usize,
}

/// Maps a core error onto a status code and `{error}` body
fn error_response(err: &BlockchainError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };

    match err {
        BlockchainError::TransactionError(_) => HttpResponse::BadRequest().json(body),
        BlockchainError::SessionError(SessionError::StorageError(_)) => {
            HttpResponse::InternalServerError().json(body)
        }
        BlockchainError::SessionError(_) => HttpResponse::Unauthorized().json(body),
        BlockchainError::WalletError(WalletError::NotFound(_))
        | BlockchainError::WalletError(WalletError::CryptoError(_)) => {
            HttpResponse::Unauthorized().json(body)
        }
        BlockchainError::WalletError(_) => HttpResponse::BadRequest().json(body),
        _ => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(body)
        }
    }
}

fn bad_request(message: String) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse { error: message })
}

/// Token from an `Authorization: Bearer <token>` header
fn bearer_token(req: &HttpRequest) -> Result<&str, BlockchainError> {
    req.headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(BlockchainError::SessionError(SessionError::InvalidSession))
}

/// Get the full chain
///
/// Returns every block, ordered by index
#[utoipa::path(
    get,
    path = "/blocks",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = Vec<Block>)
    )
)]
pub async fn get_blocks(state: AppData) -> impl Responder {
    match state.blockchain.get_chain() {
        Ok(chain) => HttpResponse::Ok().json(chain),
        Err(err) => error_response(&err),
    }
}

/// Get all pending transactions
///
/// Returns the mempool, oldest first
#[utoipa::path(
    get,
    path = "/mempool",
    responses(
        (status = 200, description = "Pending transactions retrieved successfully", body = Vec<Transaction>)
    )
)]
pub async fn get_mempool(state: AppData) -> impl Responder {
    match state.blockchain.get_pending_transactions() {
        Ok(transactions) => HttpResponse::Ok().json(transactions),
        Err(err) => error_response(&err),
    }
}

/// Get wallet balance
///
/// Returns the spendable balance of an address
#[utoipa::path(
    get,
    path = "/balance/{address}",
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid address", body = ErrorResponse)
    )
)]
pub async fn get_balance(state: AppData, address: web::Path<String>) -> impl Responder {
    let address: Address = match address.parse() {
        Ok(address) => address,
        Err(err) => return bad_request(format!("Invalid address: {}", err)),
    };

    match state.blockchain.get_balance(&address) {
        Ok((balance, last_updated)) => HttpResponse::Ok().json(BalanceResponse {
            address: address.0,
            balance,
            last_updated: last_updated.into(),
        }),
        Err(err) => error_response(&err),
    }
}

/// Submit a signed transaction
///
/// Validates it, debits the sender and adds it to the mempool
#[utoipa::path(
    post,
    path = "/transaction",
    request_body = Transaction,
    responses(
        (status = 200, description = "Transaction accepted", body = MessageResponse),
        (status = 400, description = "Transaction rejected", body = ErrorResponse)
    )
)]
pub async fn new_transaction(
    state: AppData,
    transaction: web::Json<Transaction>,
) -> impl Responder {
    match state.blockchain.add_transaction(transaction.into_inner()) {
        Ok(()) => HttpResponse::Ok().json(MessageResponse {
            message: "Transaction added to mempool".to_string(),
        }),
        Err(err) => {
            warn!("Rejected transaction: {}", err);
            error_response(&err)
        }
    }
}

/// Mine a new block
///
/// Queues a mining job on the background miner and waits for the block
#[utoipa::path(
    post,
    path = "/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "Invalid miner address", body = ErrorResponse),
        (status = 500, description = "Mining failed", body = ErrorResponse)
    )
)]
pub async fn mine_block(state: AppData, mine_req: web::Json<MineRequest>) -> impl Responder {
    let miner = match &mine_req.miner_address {
        Some(raw) => match raw.parse::<Address>() {
            Ok(address) => address,
            Err(err) => return bad_request(format!("Invalid miner address: {}", err)),
        },
        None => state.blockchain.owner_address().clone(),
    };

    match state.miner.mine(miner).await {
        Ok(block) => HttpResponse::Ok().json(MineResponse {
            message: "New block mined".to_string(),
            block,
        }),
        Err(err) => {
            error!("Failed to mine block: {}", err);
            HttpResponse::InternalServerError().json(ErrorResponse {
                error: err.to_string(),
            })
        }
    }
}

/// Create a new wallet
///
/// Generates a key pair, registers the wallet and opens a session.
/// The private key must be stored by the caller.
#[utoipa::path(
    post,
    path = "/create-wallet",
    responses(
        (status = 200, description = "Wallet created successfully", body = CreateWalletResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_wallet(state: AppData) -> impl Responder {
    match state.blockchain.create_wallet() {
        Ok((keys, session_token)) => HttpResponse::Ok().json(CreateWalletResponse {
            address: keys.address().0.clone(),
            private_key: keys.private_key_hex(),
            balance: 0,
            session_token,
        }),
        Err(err) => error_response(&err),
    }
}

/// Log in with a private key
#[utoipa::path(
    post,
    path = "/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in", body = LoginResponse),
        (status = 401, description = "Unknown key", body = ErrorResponse)
    )
)]
pub async fn login(state: AppData, login_req: web::Json<LoginRequest>) -> impl Responder {
    match state.blockchain.login(&login_req.private_key) {
        Ok((session_token, wallet)) => HttpResponse::Ok().json(LoginResponse {
            session_token,
            wallet: WalletSummary {
                address: wallet.address.0,
                balance: wallet.balance,
                is_owner: wallet.is_owner,
            },
        }),
        Err(err) => error_response(&err),
    }
}

/// End the session named by the bearer token
#[utoipa::path(
    post,
    path = "/logout",
    responses(
        (status = 200, description = "Logged out", body = SuccessResponse),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    )
)]
pub async fn logout(state: AppData, req: HttpRequest) -> impl Responder {
    let result = bearer_token(&req).and_then(|token| state.blockchain.logout(token));
    match result {
        Ok(()) => HttpResponse::Ok().json(SuccessResponse { success: true }),
        Err(err) => error_response(&err),
    }
}

/// Delete the wallet behind the bearer token
#[utoipa::path(
    post,
    path = "/delete-wallet",
    responses(
        (status = 200, description = "Wallet deleted", body = SuccessResponse),
        (status = 400, description = "Wallet cannot be deleted", body = ErrorResponse),
        (status = 401, description = "Invalid session", body = ErrorResponse)
    )
)]
pub async fn delete_wallet(state: AppData, req: HttpRequest) -> impl Responder {
    let result = bearer_token(&req).and_then(|token| state.blockchain.delete_wallet(token));
    match result {
        Ok(_) => HttpResponse::Ok().json(SuccessResponse { success: true }),
        Err(err) => error_response(&err),
    }
}

/// Check the bearer token and renew its session
#[utoipa::path(
    get,
    path = "/validate-session",
    responses(
        (status = 200, description = "Session is valid", body = WalletSummary),
        (status = 401, description = "Invalid or expired session", body = ErrorResponse)
    )
)]
pub async fn validate_session(state: AppData, req: HttpRequest) -> impl Responder {
    let result = bearer_token(&req).and_then(|token| state.blockchain.validate_session(token));
    match result {
        Ok(wallet) => HttpResponse::Ok().json(WalletSummary {
            address: wallet.address.0,
            balance: wallet.balance,
            is_owner: wallet.is_owner,
        }),
        Err(err) => error_response(&err),
    }
}

/// Check if the chain is valid
///
/// Audits linkage, hashes and difficulty of every block, then checks the
/// cached balances against a replay of the chain
#[utoipa::path(
    get,
    path = "/validate",
    responses(
        (status = 200, description = "Chain validation status", body = ValidateChainResponse)
    )
)]
pub async fn validate_chain(state: AppData) -> impl Responder {
    let audit = state
        .blockchain
        .validate_chain()
        .and_then(|()| state.blockchain.audit_balances());
    let valid = match audit {
        Ok(()) => true,
        Err(err) => {
            error!("Chain validation failed: {}", err);
            false
        }
    };

    match state.blockchain.chain_len() {
        Ok(length) => HttpResponse::Ok().json(ValidateChainResponse { valid, length }),
        Err(err) => error_response(&err),
    }
}
