use log::info;
use rusqlite::Connection;
use rusqlite_migration::{M, Migrations};

/// Route cache schema, oldest first. Never edit a shipped migration; append.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // v1: trip entries and their append-only points
        M::up(
            r#"
            CREATE TABLE trips (
                trip_id TEXT PRIMARY KEY,
                last_updated INTEGER NOT NULL      -- Unix ms of the last append
            );

            CREATE TABLE route_points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,   -- append order
                trip_id TEXT NOT NULL REFERENCES trips(trip_id) ON DELETE CASCADE,
                timestamp INTEGER NOT NULL,             -- Unix ms
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy REAL,
                speed REAL,
                heading REAL,
                altitude REAL,
                synced INTEGER NOT NULL DEFAULT 0,
                UNIQUE (trip_id, timestamp)
            );
            "#,
        ),
        // v2: pending-sync lookups
        M::up("CREATE INDEX idx_route_points_pending ON route_points(trip_id, synced);"),
    ])
}

/// Bring the schema to the latest version.
pub fn migrate(conn: &mut Connection) -> Result<(), rusqlite_migration::Error> {
    info!("[RouteCache] Running schema migrations");
    migrations().to_latest(conn)?;
    Ok(())
}
