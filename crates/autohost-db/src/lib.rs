pub use sea_orm;

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

/// Opens the pool the hoster shares between admission, linking and
/// archival. Per-statement logging is off; callers log failures.
pub async fn connect(
    database_url: &str,
    max_connections: u32,
) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut opts = ConnectOptions::new(database_url.to_owned());
    opts.max_connections(max_connections.max(1))
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    Database::connect(opts).await
}
