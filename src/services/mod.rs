pub mod api_client;
pub mod evaluation;
pub mod orchestrator;
pub mod polling;
pub mod results;
pub mod session_store;
