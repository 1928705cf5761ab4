use sea_orm::{Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;
use tempfile::NamedTempFile;

/// Test database with automatic cleanup
pub struct TestDb {
    connection: DatabaseConnection,
    _temp_file: NamedTempFile,
}

impl TestDb {
    /// Create a new test database with migrations applied
    pub async fn new() -> Self {
        // Create temporary SQLite database file
        let temp_file = NamedTempFile::new().expect("Failed to create temp file");
        let db_path = temp_file.path().to_str().expect("Invalid temp file path");
        let db_url = format!("sqlite://{}?mode=rwc", db_path);

        let connection = Database::connect(&db_url)
            .await
            .expect("Failed to connect to test database");

        migration::Migrator::up(&connection, None)
            .await
            .expect("Failed to run migrations");

        Self {
            connection,
            _temp_file: temp_file,
        }
    }

    /// Get database connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }
}

/// Seed the viewer < operator < admin chain used by most scenarios, with
/// `batch-read` granted to viewer and `batch-submit` to operator.
pub async fn seed_role_chain(db: &DatabaseConnection) {
    use super::{PermissionBuilder, RoleBuilder};
    use warden::storage;

    RoleBuilder::new("viewer").create(db).await;
    RoleBuilder::new("operator").parent("viewer").create(db).await;
    RoleBuilder::new("admin").parent("operator").system().create(db).await;

    PermissionBuilder::new("batch-read", "batch", "read")
        .create(db)
        .await;
    PermissionBuilder::new("batch-submit", "batch", "submit")
        .create(db)
        .await;

    storage::bind_permission(db, "viewer", "batch-read", warden::authz::types::Effect::Allow)
        .await
        .expect("Failed to bind batch-read");
    storage::bind_permission(db, "operator", "batch-submit", warden::authz::types::Effect::Allow)
        .await
        .expect("Failed to bind batch-submit");
}
