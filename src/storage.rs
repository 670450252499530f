//! Storage subsystem
//!
//! Everything that touches the database goes through this module.
//!
//! Components:
//! - `database`: connection ownership, reentrant transactions, retry.
//! - `clock`: cache of the database clock, advanced by the monotonic clock.
//! - `worker`: the threads that own one `Database` each.
//! - `db_entities`: SeaORM entity models for the tables.

pub mod clock;
pub mod database;
pub mod db_entities;
pub mod worker;

pub use clock::DbClock;
pub use database::{Cursor, Database};
pub use worker::StoragePool;
