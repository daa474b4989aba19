use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db;
use crate::error::AppError;
use crate::models::Material;
use crate::transaction::{Bounded, TxScope, with_deadline};
use crate::validation::not_blank;

/// Raw storage for the content of locally hosted files.
#[rocket::async_trait]
pub trait FileStore: Send + Sync {
    async fn put(&self, key: &str, content: &[u8]) -> Result<(), AppError>;

    /// Removing a key that does not exist is not an error.
    async fn remove(&self, key: &str) -> Result<(), AppError>;
}

/// Stores each file under `root/<key>`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[rocket::async_trait]
impl FileStore for LocalFileStore {
    async fn put(&self, key: &str, content: &[u8]) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.path_for(key), content).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), AppError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewFile {
    #[validate(custom(function = "not_blank"))]
    pub name: String,
    /// Location of an externally hosted file. Ignored for local files.
    pub uri: Option<String>,
    pub uploader_id: i64,
    pub local: bool,
}

/// Metadata and content handling for course materials.
#[derive(Clone)]
pub struct MaterialRegistry {
    pool: Pool<Sqlite>,
    store: Arc<dyn FileStore>,
    transaction_timeout: Duration,
}

impl MaterialRegistry {
    pub fn new(
        pool: Pool<Sqlite>,
        store: Arc<dyn FileStore>,
        transaction_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            store,
            transaction_timeout,
        }
    }

    /// Stores local content when needed and returns the uri to record and the
    /// store key to clean up if the metadata write fails.
    async fn store_content(
        &self,
        file: &NewFile,
        content: Option<&[u8]>,
    ) -> Result<(String, Option<String>), AppError> {
        file.validate()?;

        if file.local {
            let content = content
                .ok_or_else(|| AppError::Validation("Local files require content".to_string()))?;
            let key = Uuid::new_v4().to_string();
            self.store.put(&key, content).await?;
            Ok((key.clone(), Some(key)))
        } else {
            match file.uri.as_deref().map(str::trim) {
                Some(uri) if !uri.is_empty() => Ok((uri.to_string(), None)),
                _ => Err(AppError::Validation("Remote files require a uri".to_string())),
            }
        }
    }

    async fn discard_content(&self, key: Option<String>) {
        if let Some(key) = key {
            if let Err(e) = self.store.remove(&key).await {
                warn!(key = %key, error = %e, "Failed to discard stored content");
            }
        }
    }

    #[instrument(skip(self, content))]
    pub async fn save_file(&self, file: NewFile, content: Option<&[u8]>) -> Result<i64, AppError> {
        info!("Saving file");
        let (uri, key) = self.store_content(&file, content).await?;
        let now = Utc::now().naive_utc();

        let inserted = with_deadline(
            self.transaction_timeout,
            "save_file",
            db::insert_file(&self.pool, &file.name, &uri, file.local, file.uploader_id, now),
        )
        .await;

        match inserted {
            Ok(file_id) => Ok(file_id),
            Err(e) => {
                self.discard_content(key).await;
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn attach_to_course(&self, course_id: i64, file_id: i64) -> Result<(), AppError> {
        with_deadline(self.transaction_timeout, "attach_to_course", async {
            let mut tx = TxScope::begin(&self.pool, "attach_to_course").await?;
            let result = async {
                db::find_course(tx.conn(), course_id).await?;
                db::attach_file(tx.conn(), course_id, file_id, Utc::now().naive_utc()).await
            }
            .await;
            tx.finish(result).await
        })
        .await
    }

    /// Saves a file and attaches it to an active course as one unit.
    #[instrument(skip(self, content))]
    pub async fn create_material(
        &self,
        course_id: i64,
        file: NewFile,
        content: Option<&[u8]>,
    ) -> Result<Material, AppError> {
        info!("Creating material");
        let (uri, key) = self.store_content(&file, content).await?;

        let result = with_deadline(self.transaction_timeout, "create_material", async {
            let mut tx = TxScope::begin(&self.pool, "create_material").await?;
            let result = async {
                let now = Utc::now().naive_utc();
                db::find_course(tx.conn(), course_id).await?;
                let file_id = db::insert_file(
                    tx.conn(),
                    &file.name,
                    &uri,
                    file.local,
                    file.uploader_id,
                    now,
                )
                .await?;
                db::attach_file(tx.conn(), course_id, file_id, now).await?;
                db::find_material(tx.conn(), course_id, file_id).await
            }
            .await;
            tx.finish(result).await
        })
        .await;

        if result.is_err() {
            self.discard_content(key).await;
        }
        result
    }

    /// Marks the course association as removed, and the file too once no
    /// other course still uses it.
    #[instrument(skip(self))]
    pub async fn deactivate_material(&self, course_id: i64, file_id: i64) -> Result<(), AppError> {
        info!("Deactivating material");
        with_deadline(self.transaction_timeout, "deactivate_material", async {
            let mut tx = TxScope::begin(&self.pool, "deactivate_material").await?;
            let result = async {
                db::find_material(tx.conn(), course_id, file_id).await?;
                unlink_in(tx.conn(), course_id, file_id, Utc::now().naive_utc()).await
            }
            .await;
            tx.finish(result).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn list_materials(&self, course_id: i64) -> Result<Vec<Material>, AppError> {
        info!("Listing materials");
        db::find_course(&self.pool, course_id).await?;
        db::materials_for_course(&self.pool, course_id, false).await
    }

    /// Removes every material of a course in its own transaction.
    #[instrument(skip(self))]
    pub async fn remove_all_materials_from_course(
        &self,
        course_id: i64,
        hard: bool,
    ) -> Result<(), AppError> {
        let purged = with_deadline(self.transaction_timeout, "remove_all_materials", async {
            let mut tx = TxScope::begin(&self.pool, "remove_all_materials").await?;
            let result =
                remove_all_in(tx.conn(), course_id, hard, Utc::now().naive_utc()).await;
            tx.finish(result).await
        })
        .await?;

        self.purge_content(purged).await;
        Ok(())
    }

    /// Best-effort removal of stored content whose metadata is already gone.
    pub async fn purge_content(&self, keys: Vec<String>) {
        for key in keys {
            if let Err(e) = self.store.remove(&key).await {
                warn!(key = %key, error = %e, "Failed to remove stored content");
            }
        }
    }
}

impl Bounded for MaterialRegistry {
    fn with_timeout(&self, deadline: Duration) -> Self {
        Self {
            transaction_timeout: deadline,
            ..self.clone()
        }
    }
}

/// Deletes each material association of `course_id` on the given connection,
/// physically when `hard`, otherwise by marking it. Returns the store keys of
/// local files whose metadata was physically removed.
#[instrument(skip(conn))]
pub async fn remove_all_in(
    conn: &mut SqliteConnection,
    course_id: i64,
    hard: bool,
    now: NaiveDateTime,
) -> Result<Vec<String>, AppError> {
    let materials = db::materials_for_course(&mut *conn, course_id, hard).await?;
    info!(count = materials.len(), hard, "Removing course materials");

    let mut purged = Vec::new();
    for material in materials {
        if hard {
            db::hard_delete_course_file(&mut *conn, course_id, material.file_id).await?;
            if db::count_file_links(&mut *conn, material.file_id).await? == 0 {
                db::hard_delete_file(&mut *conn, material.file_id).await?;
                if material.local {
                    purged.push(material.uri);
                }
            }
        } else {
            unlink_in(&mut *conn, course_id, material.file_id, now).await?;
        }
    }

    Ok(purged)
}

/// Marks one course/file association deleted. The file itself is marked only
/// when no other active association points at it.
async fn unlink_in(
    conn: &mut SqliteConnection,
    course_id: i64,
    file_id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError> {
    db::soft_delete_course_file(&mut *conn, course_id, file_id, now).await?;
    if db::count_active_file_links(&mut *conn, file_id).await? == 0 {
        db::soft_delete_file(&mut *conn, file_id, now).await?;
    }
    Ok(())
}
