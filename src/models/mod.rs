pub mod job;
pub mod request;
pub mod session;
