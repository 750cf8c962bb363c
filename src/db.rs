use diesel::sqlite::SqliteConnection;
use diesel::Connection;
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;

use crate::error::{GarageBotError, Result};

pub fn open_connection_sync(database_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(database_url)
        .map_err(|e| GarageBotError::Storage(e.to_string()))?;
    apply_connection_pragmas_sync(&mut conn)?;
    Ok(conn)
}

pub fn apply_connection_pragmas_sync(conn: &mut SqliteConnection) -> Result<()> {
    for pragma in ["PRAGMA busy_timeout = 5000", "PRAGMA foreign_keys = ON"] {
        diesel::RunQueryDsl::execute(diesel::sql_query(pragma), conn)
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
    }
    Ok(())
}

pub async fn apply_connection_pragmas_async(
    conn: &mut SyncConnectionWrapper<SqliteConnection>,
) -> Result<()> {
    for pragma in ["PRAGMA busy_timeout = 5000", "PRAGMA foreign_keys = ON"] {
        diesel_async::RunQueryDsl::execute(diesel::sql_query(pragma), conn)
            .await
            .map_err(|e| GarageBotError::Storage(e.to_string()))?;
    }
    Ok(())
}
