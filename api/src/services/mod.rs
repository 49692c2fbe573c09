pub mod context;
pub mod db;
pub mod error;
pub mod session;
