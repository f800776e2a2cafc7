//! Database layer

mod pg;

pub use pg::PgStore;
