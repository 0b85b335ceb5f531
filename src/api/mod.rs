// HTTP surface of the node
//
// Thin actix-web handlers over `Blockchain` and the mining worker

pub mod handlers;
pub mod routes;
pub mod schema;

pub use handlers::AppState;
pub use routes::configure_routes;
