use super::BandwidthStore;
use crate::entity::{self, ip, user, user_ip};
use crate::error::Result;
use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::*;
use std::fs;
use std::path::Path;
use tracing::{info, instrument};

pub struct SqliteStore {
    db: DatabaseConnection,
}

impl SqliteStore {
    #[instrument(skip(database_path))]
    pub async fn open<P: AsRef<Path>>(database_path: P) -> Result<Self> {
        let database_path = database_path.as_ref();

        // Create parent directory for database if it doesn't exist
        if let Some(parent) = database_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", database_path.display());
        let db = Database::connect(&database_url).await?;

        for sql in entity::CREATE_TABLES_SQL {
            db.execute(Statement::from_string(
                db.get_database_backend(),
                sql.to_string(),
            ))
            .await?;
        }

        info!("Connected to SQLite database: {}", database_path.display());

        Ok(Self { db })
    }

    #[cfg(test)]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn to_column_value(kilobytes: u64) -> i64 {
    i64::try_from(kilobytes).unwrap_or(i64::MAX)
}

#[async_trait]
impl BandwidthStore for SqliteStore {
    async fn count_matching_ip(&self, ip: &str) -> Result<u64> {
        let count = ip::Entity::find()
            .filter(ip::Column::Ip.eq(ip))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn upsert_ip_bandwidth(&self, ip: &str, kilobytes: u64) -> Result<()> {
        let record = ip::ActiveModel {
            ip: Set(ip.to_string()),
            bandwidth: Set(to_column_value(kilobytes)),
            updated_at: Set(Some(chrono::Utc::now().naive_utc())),
        };

        ip::Entity::insert(record)
            .on_conflict(
                OnConflict::column(ip::Column::Ip)
                    .update_columns([ip::Column::Bandwidth, ip::Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn set_bandwidth_for_users_with_ip(&self, ip: &str, kilobytes: u64) -> Result<u64> {
        let emails: Vec<String> = user_ip::Entity::find()
            .filter(user_ip::Column::Ip.eq(ip))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|membership| membership.email)
            .collect();

        if emails.is_empty() {
            return Ok(0);
        }

        let result = user::Entity::update_many()
            .col_expr(
                user::Column::Bandwidth,
                sea_query::Expr::value(to_column_value(kilobytes)),
            )
            .filter(user::Column::Email.is_in(emails))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("nested/ipmeter.db"))
            .await
            .unwrap();
        (dir, store)
    }

    async fn insert_user(store: &SqliteStore, email: &str, ips: &[&str]) {
        user::Entity::insert(user::ActiveModel {
            email: Set(email.to_string()),
            name: Set(None),
            bandwidth: Set(0),
        })
        .exec_without_returning(store.connection())
        .await
        .unwrap();

        for ip in ips {
            user_ip::Entity::insert(user_ip::ActiveModel {
                email: Set(email.to_string()),
                ip: Set(ToString::to_string(ip)),
            })
            .exec_without_returning(store.connection())
            .await
            .unwrap();
        }
    }

    async fn user_bandwidth(store: &SqliteStore, email: &str) -> i64 {
        user::Entity::find_by_id(email.to_string())
            .one(store.connection())
            .await
            .unwrap()
            .unwrap()
            .bandwidth
    }

    #[tokio::test]
    async fn count_reflects_ip_records() {
        let (_dir, store) = open_store().await;
        assert_eq!(store.count_matching_ip("203.0.113.5").await.unwrap(), 0);

        store.upsert_ip_bandwidth("203.0.113.5", 0).await.unwrap();
        assert_eq!(store.count_matching_ip("203.0.113.5").await.unwrap(), 1);
        assert_eq!(store.count_matching_ip("198.51.100.7").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn upsert_overwrites_instead_of_incrementing() {
        let (_dir, store) = open_store().await;
        store.upsert_ip_bandwidth("203.0.113.5", 120).await.unwrap();
        store.upsert_ip_bandwidth("203.0.113.5", 200).await.unwrap();

        let record = ip::Entity::find_by_id("203.0.113.5".to_string())
            .one(store.connection())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.bandwidth, 200);
        assert!(record.updated_at.is_some());
        assert_eq!(store.count_matching_ip("203.0.113.5").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn users_listing_ip_are_updated() {
        let (_dir, store) = open_store().await;
        insert_user(&store, "a@example.com", &["203.0.113.5"]).await;
        insert_user(&store, "b@example.com", &["203.0.113.5", "10.0.0.1"]).await;
        insert_user(&store, "c@example.com", &["10.0.0.1"]).await;

        let updated = store
            .set_bandwidth_for_users_with_ip("203.0.113.5", 200)
            .await
            .unwrap();

        assert_eq!(updated, 2);
        assert_eq!(user_bandwidth(&store, "a@example.com").await, 200);
        assert_eq!(user_bandwidth(&store, "b@example.com").await, 200);
        assert_eq!(user_bandwidth(&store, "c@example.com").await, 0);
    }

    #[tokio::test]
    async fn unknown_ip_updates_no_users() {
        let (_dir, store) = open_store().await;
        insert_user(&store, "a@example.com", &["10.0.0.1"]).await;

        let updated = store
            .set_bandwidth_for_users_with_ip("203.0.113.5", 5)
            .await
            .unwrap();
        assert_eq!(updated, 0);
    }

    #[tokio::test]
    async fn reopening_keeps_schema_and_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ipmeter.db");
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.upsert_ip_bandwidth("203.0.113.5", 7).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        assert_eq!(store.count_matching_ip("203.0.113.5").await.unwrap(), 1);
    }
}
