pub mod app;
pub mod routes;
pub mod server;

pub use app::HttpServer;
pub use routes::{master_routes, worker_routes};
pub use server::serve;
