use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/blocks", web::get().to(handlers::get_blocks))
        .route("/mempool", web::get().to(handlers::get_mempool))
        .route("/balance/{address}", web::get().to(handlers::get_balance))
        .route("/transaction", web::post().to(handlers::new_transaction))
        .route("/mine", web::post().to(handlers::mine_block))
        .route("/create-wallet", web::post().to(handlers::create_wallet))
        .route("/login", web::post().to(handlers::login))
        .route("/logout", web::post().to(handlers::logout))
        .route("/delete-wallet", web::post().to(handlers::delete_wallet))
        .route("/validate-session", web::get().to(handlers::validate_session))
        .route("/validate", web::get().to(handlers::validate_chain));
}
