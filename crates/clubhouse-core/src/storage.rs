use crate::error::ClubhouseError;
use crate::types::UserId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

/// Balance persistence backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Keep balances in process memory only.
    Memory,
    /// One row per user in a SQLite `credits` table.
    Sqlite {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

impl StorageConfig {
    pub fn sqlite(url: impl Into<String>, max_connections: u32) -> Self {
        Self::Sqlite {
            url: url.into(),
            max_connections,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite { .. } => "sqlite",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Memory
    }
}

/// Row-level balance storage.
///
/// Every successful call has been made durable by the backend before it returns.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    fn backend_label(&self) -> &'static str;

    /// Current balance, zero when no row exists.
    async fn get_balance(&self, user: UserId) -> Result<i64, ClubhouseError>;

    /// Add `amount` (creating the row if absent) and return the new balance.
    async fn credit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError>;

    /// Subtract `amount` if the balance covers it and return the new balance.
    async fn debit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError>;
}

/// Open the configured backend, creating its schema when needed.
pub async fn open_balance_store(
    config: &StorageConfig,
) -> Result<Arc<dyn BalanceStore>, ClubhouseError> {
    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryBalanceStore::new())),
        StorageConfig::Sqlite {
            url,
            max_connections,
        } => {
            let store = SqliteBalanceStore::connect(url, *max_connections).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

/// In-memory balance store for development and tests.
#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    balances: RwLock<HashMap<UserId, i64>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }

    async fn get_balance(&self, user: UserId) -> Result<i64, ClubhouseError> {
        let guard = self
            .balances
            .read()
            .map_err(|_| ClubhouseError::Persistence("balances lock poisoned".to_string()))?;
        Ok(guard.get(&user).copied().unwrap_or(0))
    }

    async fn credit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError> {
        let mut guard = self
            .balances
            .write()
            .map_err(|_| ClubhouseError::Persistence("balances lock poisoned".to_string()))?;
        let balance = guard.entry(user).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or(ClubhouseError::InvalidAmount(amount))?;
        Ok(*balance)
    }

    async fn debit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError> {
        let mut guard = self
            .balances
            .write()
            .map_err(|_| ClubhouseError::Persistence("balances lock poisoned".to_string()))?;
        let current = guard.get(&user).copied().unwrap_or(0);
        if current < amount {
            return Err(ClubhouseError::InsufficientBalance {
                balance: current,
                requested: amount,
            });
        }
        let next = current - amount;
        guard.insert(user, next);
        Ok(next)
    }
}

/// SQLite-backed balance store, one row per user.
#[derive(Debug, Clone)]
pub struct SqliteBalanceStore {
    pool: SqlitePool,
}

impl SqliteBalanceStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, ClubhouseError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| ClubhouseError::persistence("sqlite url invalid", e))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| ClubhouseError::persistence("sqlite connect failed", e))?;

        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), ClubhouseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credits (
                user_id INTEGER PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ClubhouseError::persistence("sqlite schema create failed", e))?;

        Ok(())
    }
}

fn row_key(user: UserId) -> Result<i64, ClubhouseError> {
    i64::try_from(user.get()).map_err(|_| {
        ClubhouseError::Persistence(format!("user id {user} exceeds sqlite INTEGER range"))
    })
}

#[async_trait]
impl BalanceStore for SqliteBalanceStore {
    fn backend_label(&self) -> &'static str {
        "sqlite"
    }

    async fn get_balance(&self, user: UserId) -> Result<i64, ClubhouseError> {
        let row = sqlx::query("SELECT balance FROM credits WHERE user_id = ?")
            .bind(row_key(user)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ClubhouseError::persistence("sqlite balance read failed", e))?;

        match row {
            Some(row) => row
                .try_get::<i64, _>("balance")
                .map_err(|e| ClubhouseError::persistence("sqlite decode balance failed", e)),
            None => Ok(0),
        }
    }

    async fn credit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError> {
        let row = sqlx::query(
            r#"
            INSERT INTO credits (user_id, balance) VALUES (?, ?)
            ON CONFLICT (user_id) DO UPDATE SET balance = balance + excluded.balance
            RETURNING balance
            "#,
        )
        .bind(row_key(user)?)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ClubhouseError::persistence("sqlite credit failed", e))?;

        row.try_get::<i64, _>("balance")
            .map_err(|e| ClubhouseError::persistence("sqlite decode balance failed", e))
    }

    async fn debit(&self, user: UserId, amount: i64) -> Result<i64, ClubhouseError> {
        let row = sqlx::query(
            r#"
            UPDATE credits SET balance = balance - ?
            WHERE user_id = ? AND balance >= ?
            RETURNING balance
            "#,
        )
        .bind(amount)
        .bind(row_key(user)?)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ClubhouseError::persistence("sqlite debit failed", e))?;

        match row {
            Some(row) => row
                .try_get::<i64, _>("balance")
                .map_err(|e| ClubhouseError::persistence("sqlite decode balance failed", e)),
            None => Err(ClubhouseError::InsufficientBalance {
                balance: self.get_balance(user).await?,
                requested: amount,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn memory_store_defaults_to_zero_and_refuses_overdraft() {
        let store = MemoryBalanceStore::new();
        let user = UserId(11);

        assert_eq!(store.get_balance(user).await.unwrap(), 0);
        assert_eq!(store.credit(user, 20).await.unwrap(), 20);

        let err = store.debit(user, 25).await.unwrap_err();
        assert!(matches!(
            err,
            ClubhouseError::InsufficientBalance {
                balance: 20,
                requested: 25
            }
        ));
        assert_eq!(store.get_balance(user).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn sqlite_store_survives_reconnect() {
        let path = std::env::temp_dir().join(format!("clubhouse-credits-{}.db", Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let config = StorageConfig::sqlite(url.clone(), 1);
        let user = UserId(1_342_389_265_216_311_329);

        {
            let store = open_balance_store(&config).await.unwrap();
            assert_eq!(store.backend_label(), "sqlite");
            assert_eq!(store.credit(user, 45).await.unwrap(), 45);
            assert_eq!(store.debit(user, 30).await.unwrap(), 15);
            assert!(matches!(
                store.debit(user, 20).await,
                Err(ClubhouseError::InsufficientBalance { balance: 15, .. })
            ));
        }

        let reopened = open_balance_store(&config).await.unwrap();
        assert_eq!(reopened.get_balance(user).await.unwrap(), 15);
        assert_eq!(reopened.get_balance(UserId(2)).await.unwrap(), 0);
    }

    #[test]
    fn storage_config_labels() {
        assert_eq!(StorageConfig::default().label(), "memory");
        assert_eq!(StorageConfig::sqlite("sqlite://x.db", 2).label(), "sqlite");
    }
}
