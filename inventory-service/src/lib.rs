//! Stock reservation and release for product variants.
//!
//! Reserve claims stock for every line item of an order or for none of them;
//! release and cancel return the stock behind the order's held rows exactly once.

pub mod catalog;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod release;
pub mod reservation;
pub mod schema;

use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub use engine::StockEngine;
pub use error::{ReleaseError, ReserveError, StorageError};
pub use models::{Reservation, ReservationStatus};
