use crate::db;
use crate::models::{Item, ItemCreate, User, UserCreate};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::path::PathBuf;

/// Failures of the user/item service layer
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("Email already registered")]
    EmailTaken,
    #[error("User {0} not found")]
    UserNotFound(i64),
    #[error("{0}")]
    Invalid(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, RecordError>;

// Service-level record operations, wrapping the DB layer
/// Register a new user; the email must not be taken
pub async fn create_user(pool: &SqlitePool, user: &UserCreate) -> Result<User> {
    let email = user.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(RecordError::Invalid(format!("Invalid email '{}'", user.email)));
    }
    if user.password.is_empty() {
        return Err(RecordError::Invalid("Password must not be empty".to_string()));
    }
    if db::get_user_by_email(pool, email).await?.is_some() {
        return Err(RecordError::EmailTaken);
    }
    // A concurrent registration can still win between the check and the insert
    let id = db::insert_user(pool, email, &hash_password(&user.password))
        .await
        .map_err(|e| {
            if e.as_database_error().is_some_and(|d| d.is_unique_violation()) {
                RecordError::EmailTaken
            } else {
                RecordError::Database(e)
            }
        })?;
    get_user(pool, id).await
}

/// Fetch one user together with the items it owns
pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<User> {
    let mut user = db::get_user(pool, id)
        .await?
        .ok_or(RecordError::UserNotFound(id))?;
    user.items = db::items_for_owner(pool, id).await?;
    Ok(user)
}

/// Page through users; each carries its items
pub async fn get_users(pool: &SqlitePool, skip: i64, limit: i64) -> Result<Vec<User>> {
    let mut users = db::list_users(pool, skip.max(0), limit.max(0)).await?;
    for user in &mut users {
        user.items = db::items_for_owner(pool, user.id).await?;
    }
    Ok(users)
}

/// Create an item owned by `user_id`
pub async fn create_user_item(pool: &SqlitePool, user_id: i64, item: &ItemCreate) -> Result<Item> {
    if item.title.trim().is_empty() {
        return Err(RecordError::Invalid("Item title must not be empty".to_string()));
    }
    if db::get_user(pool, user_id).await?.is_none() {
        return Err(RecordError::UserNotFound(user_id));
    }
    let id = db::insert_item(pool, user_id, &item.title, item.description.as_deref()).await?;
    let created = db::get_item(pool, id).await?.ok_or_else(|| {
        RecordError::Database(sqlx::Error::RowNotFound)
    })?;
    Ok(created)
}

pub async fn get_items(pool: &SqlitePool, skip: i64, limit: i64) -> Result<Vec<Item>> {
    Ok(db::list_items(pool, skip.max(0), limit.max(0)).await?)
}

fn hash_password(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

/// Configuration for database setup
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub force_recreate: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { db_path: cwd.join("mqrelay.db"), force_recreate: false }
    }
}

/// Initialize the pool, ensuring the database exists first.
pub async fn init_pool(cfg: &Config) -> anyhow::Result<SqlitePool> {
    db::create_db_if_needed_at(&cfg.db_path, cfg.force_recreate).await?;
    let pool = db::init_pool_at(&cfg.db_path).await?;
    Ok(pool)
}
