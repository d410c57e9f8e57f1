use crate::models::{Item, User};
use anyhow::Context;
use sqlx::{
    SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{fs, path::Path};

pub async fn get_user(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>("SELECT id, email, is_active FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>("SELECT id, email, is_active FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(pool)
        .await
}

/// List users ordered by id, paginated
pub async fn list_users(pool: &SqlitePool, skip: i64, limit: i64) -> sqlx::Result<Vec<User>> {
    sqlx::query_as::<_, User>(
        "SELECT id, email, is_active FROM users ORDER BY id LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(skip)
    .fetch_all(pool)
    .await
}

pub async fn insert_user(
    pool: &SqlitePool,
    email: &str,
    hashed_password: &str,
) -> sqlx::Result<i64> {
    let rec = sqlx::query("INSERT INTO users (email, hashed_password, is_active) VALUES (?, ?, 1)")
        .bind(email)
        .bind(hashed_password)
        .execute(pool)
        .await?;
    Ok(rec.last_insert_rowid())
}

pub async fn insert_item(
    pool: &SqlitePool,
    owner_id: i64,
    title: &str,
    description: Option<&str>,
) -> sqlx::Result<i64> {
    let rec = sqlx::query("INSERT INTO items (title, description, owner_id) VALUES (?, ?, ?)")
        .bind(title)
        .bind(description)
        .bind(owner_id)
        .execute(pool)
        .await?;
    Ok(rec.last_insert_rowid())
}

pub async fn get_item(pool: &SqlitePool, id: i64) -> sqlx::Result<Option<Item>> {
    sqlx::query_as::<_, Item>("SELECT id, title, description, owner_id FROM items WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// List items ordered by id, paginated
pub async fn list_items(pool: &SqlitePool, skip: i64, limit: i64) -> sqlx::Result<Vec<Item>> {
    sqlx::query_as::<_, Item>(
        "SELECT id, title, description, owner_id FROM items ORDER BY id LIMIT ? OFFSET ?",
    )
    .bind(limit)
    .bind(skip)
    .fetch_all(pool)
    .await
}

pub async fn items_for_owner(pool: &SqlitePool, owner_id: i64) -> sqlx::Result<Vec<Item>> {
    sqlx::query_as::<_, Item>(
        "SELECT id, title, description, owner_id FROM items WHERE owner_id = ? ORDER BY id",
    )
    .bind(owner_id)
    .fetch_all(pool)
    .await
}

// Embed migrations from the `migrations` directory
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Open a pool on the database file at `path`, applying pending migrations.
pub async fn init_pool_at(path: &Path) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to the database at {}", path.display()))?;
    MIGRATOR
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;
    Ok(pool)
}

/// Create the database file if missing. With `force_recreate`, an existing file is removed first.
pub async fn create_db_if_needed_at(path: &Path, force_recreate: bool) -> anyhow::Result<()> {
    if force_recreate && path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove DB file at {}", path.display()))?;
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    if !path.exists() {
        fs::File::create(path)
            .with_context(|| format!("Failed to create DB file at {}", path.display()))?;
    }
    Ok(())
}
