use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;

use api::AppState;
use blockchain::{spawn_miner, spawn_ticker, Blockchain, Storage};
use config::NodeConfig;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_blocks,
        api::handlers::get_mempool,
        api::handlers::get_balance,
        api::handlers::new_transaction,
        api::handlers::mine_block,
        api::handlers::create_wallet,
        api::handlers::login,
        api::handlers::logout,
        api::handlers::delete_wallet,
        api::handlers::validate_session,
        api::handlers::validate_chain
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::Address,
            api::schema::DateTimeUtc,
            api::handlers::ErrorResponse,
            api::handlers::MessageResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::BalanceResponse,
            api::handlers::CreateWalletResponse,
            api::handlers::LoginRequest,
            api::handlers::LoginResponse,
            api::handlers::WalletSummary,
            api::handlers::SuccessResponse,
            api::handlers::ValidateChainResponse
        )
    ),
    tags(
        (name = "abbucoin", description = "Ledger, wallet and session endpoints")
    ),
    info(
        title = "Abbucoin API",
        version = "0.1.0",
        description = "Proof-of-work ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::load().context("failed to load configuration")?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data directory {}", config.data_dir))?;
    let storage = Storage::open(&config.data_dir)
        .with_context(|| format!("failed to open ledger at {}", config.data_dir))?;
    let blockchain = Arc::new(
        Blockchain::open(storage, config.chain_settings()).context("failed to load the ledger")?,
    );
    let head = blockchain.get_last_block()?;
    info!(
        "Ledger ready: head {} ({}), difficulty {}, owner wallet {}",
        head.index,
        head.hash,
        blockchain.settings().difficulty,
        blockchain.owner_address()
    );

    let (miner, _miner_thread) =
        spawn_miner(blockchain.clone()).context("failed to start the mining worker")?;
    let ticker = spawn_ticker(blockchain.clone(), miner.clone(), config.mine_interval());

    let state = web::Data::new(AppState {
        blockchain,
        miner: miner.clone(),
    });

    info!("Starting HTTP server at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", openapi.clone()),
            )
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await?;

    ticker.abort();
    miner.cancel();
    info!("Node stopped");
    Ok(())
}
