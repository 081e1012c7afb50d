//! User records: identity plus the stored password digest.

use sqlx::{postgres::PgPoolOptions, Connection, PgPool, Row};
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{Mutex, PoisonError},
    time::Duration,
};
use tracing::{info_span, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("username or email already registered")]
    Conflict,
    #[error("user store unavailable: {0}")]
    Unavailable(String),
}

pub type UserFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, UserStoreError>> + Send + 'a>>;

pub trait UserStore: Send + Sync {
    fn create(&self, user: NewUser) -> UserFuture<'_, User>;

    /// Find by username (case-insensitive) or email.
    fn find_by_login<'a>(&'a self, login: &'a str) -> UserFuture<'a, Option<User>>;

    fn find_by_id(&self, id: Uuid) -> UserFuture<'_, Option<User>>;

    fn ping(&self) -> UserFuture<'_, ()>;

    fn backend(&self) -> &'static str;
}

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_login(user: &User, login: &str) -> bool {
        user.username.eq_ignore_ascii_case(login) || user.email == normalize_email(login)
    }
}

impl UserStore for MemoryUserStore {
    fn create(&self, user: NewUser) -> UserFuture<'_, User> {
        Box::pin(async move {
            let email = normalize_email(&user.email);
            let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            let taken = users.values().any(|existing| {
                existing.username.eq_ignore_ascii_case(&user.username) || existing.email == email
            });
            if taken {
                return Err(UserStoreError::Conflict);
            }

            let created = User {
                id: Uuid::new_v4(),
                username: user.username,
                email,
                password_hash: user.password_hash,
            };
            users.insert(created.id, created.clone());
            Ok(created)
        })
    }

    fn find_by_login<'a>(&'a self, login: &'a str) -> UserFuture<'a, Option<User>> {
        Box::pin(async move {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(users
                .values()
                .find(|user| Self::matches_login(user, login))
                .cloned())
        })
    }

    fn find_by_id(&self, id: Uuid) -> UserFuture<'_, Option<User>> {
        Box::pin(async move {
            let users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(users.get(&id).cloned())
        })
    }

    fn ping(&self) -> UserFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Postgres user store. Schema lives in `db/sql/01_tessera.sql`.
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

fn db_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn unavailable(err: &sqlx::Error) -> UserStoreError {
    UserStoreError::Unavailable(err.to_string())
}

fn user_from_row(row: &sqlx::postgres::PgRow) -> Result<User, UserStoreError> {
    Ok(User {
        id: row.try_get("id").map_err(|err| unavailable(&err))?,
        username: row.try_get("username").map_err(|err| unavailable(&err))?,
        email: row.try_get("email").map_err(|err| unavailable(&err))?,
        password_hash: row
            .try_get("password_hash")
            .map_err(|err| unavailable(&err))?,
    })
}

impl PgUserStore {
    /// Connect to the database
    /// # Errors
    /// Return error if the pool cannot be created
    pub async fn connect(dsn: &str) -> Result<Self, UserStoreError> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .map_err(|err| unavailable(&err))?;

        Ok(Self { pool })
    }

    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl UserStore for PgUserStore {
    fn create(&self, user: NewUser) -> UserFuture<'_, User> {
        Box::pin(async move {
            let query = "INSERT INTO users (id, username, email, password_hash) \
                         VALUES ($1, $2, $3, $4) \
                         RETURNING id, username, email, password_hash";
            let row = sqlx::query(query)
                .bind(Uuid::new_v4())
                .bind(&user.username)
                .bind(normalize_email(&user.email))
                .bind(&user.password_hash)
                .fetch_one(&self.pool)
                .instrument(db_span("INSERT", query))
                .await;

            match row {
                Ok(row) => user_from_row(&row),
                Err(err) if is_unique_violation(&err) => Err(UserStoreError::Conflict),
                Err(err) => Err(unavailable(&err)),
            }
        })
    }

    fn find_by_login<'a>(&'a self, login: &'a str) -> UserFuture<'a, Option<User>> {
        Box::pin(async move {
            let query = "SELECT id, username, email, password_hash FROM users \
                         WHERE lower(username) = lower($1) OR email = $2 LIMIT 1";
            let row = sqlx::query(query)
                .bind(login.trim())
                .bind(normalize_email(login))
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(|err| unavailable(&err))?;

            row.as_ref().map(user_from_row).transpose()
        })
    }

    fn find_by_id(&self, id: Uuid) -> UserFuture<'_, Option<User>> {
        Box::pin(async move {
            let query = "SELECT id, username, email, password_hash FROM users WHERE id = $1";
            let row = sqlx::query(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .map_err(|err| unavailable(&err))?;

            row.as_ref().map(user_from_row).transpose()
        })
    }

    fn ping(&self) -> UserFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(|err| unavailable(&err))?;
            conn.ping().await.map_err(|err| unavailable(&err))
        })
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$stub".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_find() -> Result<()> {
        let store = MemoryUserStore::new();
        let user = store.create(new_user("alice", " Alice@Example.COM ")).await?;
        assert_eq!(user.email, "alice@example.com");

        assert_eq!(store.find_by_login("alice").await?, Some(user.clone()));
        assert_eq!(store.find_by_login("ALICE").await?, Some(user.clone()));
        assert_eq!(store.find_by_login("alice@example.com").await?, Some(user.clone()));
        assert_eq!(store.find_by_id(user.id).await?, Some(user));
        assert_eq!(store.find_by_login("bob").await?, None);
        assert_eq!(store.find_by_id(Uuid::new_v4()).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn duplicates_conflict() -> Result<()> {
        let store = MemoryUserStore::new();
        store.create(new_user("alice", "alice@example.com")).await?;
        assert!(matches!(
            store.create(new_user("Alice", "other@example.com")).await,
            Err(UserStoreError::Conflict)
        ));
        assert!(matches!(
            store.create(new_user("bob", "ALICE@example.com")).await,
            Err(UserStoreError::Conflict)
        ));
        Ok(())
    }

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Alice@Example.COM "), "alice@example.com");
    }

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
