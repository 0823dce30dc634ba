//! Entity store.
//!
//! A transactional repository over SQLite. Entity structs live in
//! [`models`] and stay free of persistence methods; every mutation goes
//! through [`Store::with_tx`], which gives each inbound callback exactly one
//! transaction held open until its response is produced.

pub mod models;
mod sqlite;

pub use sqlite::{Store, Tx};
