pub mod auth;
pub mod client;
pub mod conversation;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod message;
pub mod serialization;
pub mod session;
pub mod stream;
pub mod sync;
pub mod types;
