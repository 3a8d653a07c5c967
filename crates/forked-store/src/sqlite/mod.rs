//! `SQLite` backing: connection pool, migrations, row types, repositories.

pub mod connection;
pub mod migrations;
pub mod repositories;
pub mod row_types;
