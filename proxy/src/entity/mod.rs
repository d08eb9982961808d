pub mod ip;
pub mod user;
pub mod user_ip;

/// Schema for the persisted store, applied on every startup.
pub const CREATE_TABLES_SQL: [&str; 3] = [
    r#"
        CREATE TABLE IF NOT EXISTS ips (
            ip TEXT PRIMARY KEY NOT NULL,
            bandwidth INTEGER NOT NULL DEFAULT 0,
            updated_at DATETIME
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS users (
            email TEXT PRIMARY KEY NOT NULL,
            name TEXT,
            bandwidth INTEGER NOT NULL DEFAULT 0
        )
    "#,
    r#"
        CREATE TABLE IF NOT EXISTS user_ips (
            email TEXT NOT NULL,
            ip TEXT NOT NULL,
            PRIMARY KEY (email, ip)
        )
    "#,
];
