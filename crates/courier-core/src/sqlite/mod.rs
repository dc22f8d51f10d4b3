pub mod migrations;
pub mod store;

pub use migrations::{SqliteMigration, current_schema_version, migration, migrations};
pub use store::{DEFAULT_ACTIVITY_CAP, SqliteStore};
