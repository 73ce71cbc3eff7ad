mod app;
mod records;

pub use app::add_routes;
pub use records::AppState;
