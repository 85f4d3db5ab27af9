//! EduBill shared utilities
//!
//! Database pool construction, schema migrations and money arithmetic used by
//! both the billing engine and the background worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod money;

pub use db::{create_pool, run_migrations};
pub use money::{apply_basis_points, div_round_half_up, format_cents, scale_cents};
