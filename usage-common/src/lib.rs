pub mod profile_store;
pub mod retry;
pub mod types;
