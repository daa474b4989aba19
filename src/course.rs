use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument};
use validator::Validate;

use crate::db;
use crate::error::AppError;
use crate::material::{self, MaterialRegistry};
use crate::membership;
use crate::models::{Course, DeletionMode, Forum, MembershipRole};
use crate::transaction::{Bounded, TxScope, with_deadline};
use crate::validation::not_blank;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CourseInput {
    #[validate(custom(function = "not_blank"))]
    pub name: String,
    pub description: Option<String>,
    #[validate(custom(function = "not_blank"))]
    pub enroll_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CourseDeletion {
    pub course_id: i64,
    pub mode: DeletionMode,
}

/// Courses still inside `window` after creation are purged, older ones are
/// only marked deleted.
pub fn deletion_mode(
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> DeletionMode {
    let elapsed = now.signed_duration_since(created_at);
    match chrono::Duration::from_std(window) {
        Ok(window) if elapsed < window => DeletionMode::Hard,
        _ => DeletionMode::Soft,
    }
}

/// Owns the course + forum pair and the creator membership created with it.
#[derive(Clone)]
pub struct CourseManager {
    pool: Pool<Sqlite>,
    materials: MaterialRegistry,
    transaction_timeout: Duration,
    hard_delete_window: Duration,
}

impl CourseManager {
    pub fn new(
        pool: Pool<Sqlite>,
        materials: MaterialRegistry,
        transaction_timeout: Duration,
        hard_delete_window: Duration,
    ) -> Self {
        Self {
            pool,
            materials,
            transaction_timeout,
            hard_delete_window,
        }
    }

    #[instrument(skip(self))]
    pub async fn get_course(&self, id: i64) -> Result<Course, AppError> {
        db::find_course(&self.pool, id).await
    }

    /// Returns the course even after a soft delete.
    #[instrument(skip(self))]
    pub async fn get_course_record(&self, id: i64) -> Result<Course, AppError> {
        db::find_course_record(&self.pool, id).await
    }

    #[instrument(skip(self))]
    pub async fn get_forum(&self, course_id: i64) -> Result<Forum, AppError> {
        let course = db::find_course(&self.pool, course_id).await?;
        db::find_forum(&self.pool, course.forum_id).await
    }

    /// Course and forum rows for auditing, including soft deleted ones. The
    /// forum is `None` once it has been physically removed.
    #[instrument(skip(self))]
    pub async fn get_course_audit(&self, id: i64) -> Result<(Course, Option<Forum>), AppError> {
        let course = self.get_course_record(id).await?;
        let forum = db::find_forum_record(&self.pool, course.forum_id).await?;
        Ok((course, forum))
    }

    /// Creates the forum, the course and the creator's membership in one
    /// transaction.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_course(
        &self,
        input: CourseInput,
        creator_id: i64,
    ) -> Result<i64, AppError> {
        info!("Creating course");
        input.validate()?;

        with_deadline(self.transaction_timeout, "create_course", async {
            let mut tx = TxScope::begin(&self.pool, "create_course").await?;
            let result = async {
                let now = Utc::now().naive_utc();
                let forum_id = db::insert_forum(tx.conn(), &input.name, now).await?;
                let course_id = db::insert_course(
                    tx.conn(),
                    &input.name,
                    input.description.as_deref(),
                    &input.enroll_key,
                    forum_id,
                    now,
                )
                .await?;
                db::insert_membership(tx.conn(), creator_id, course_id, MembershipRole::Creator)
                    .await?;
                Ok::<_, AppError>(course_id)
            }
            .await;
            tx.finish(result).await
        })
        .await
    }

    /// Overwrites the course fields and renames its forum to match.
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn update_course(&self, id: i64, input: CourseInput) -> Result<i64, AppError> {
        info!("Updating course");
        input.validate()?;

        with_deadline(self.transaction_timeout, "update_course", async {
            let mut tx = TxScope::begin(&self.pool, "update_course").await?;
            let result = async {
                let course = db::find_course(tx.conn(), id).await?;
                db::update_course(
                    tx.conn(),
                    id,
                    &input.name,
                    input.description.as_deref(),
                    &input.enroll_key,
                )
                .await?;
                db::update_forum_name(tx.conn(), course.forum_id, &input.name).await?;
                Ok::<_, AppError>(course.id)
            }
            .await;
            tx.finish(result).await
        })
        .await
    }

    /// Deletes a course that nobody but its creator is enrolled in.
    ///
    /// The membership check, the creator's removal and the row deletion share
    /// one transaction, so an enrollment committed concurrently either lands
    /// before the check (and the delete fails) or after the commit (and fails
    /// with NotFound).
    #[instrument(skip(self))]
    pub async fn delete_course(&self, id: i64) -> Result<CourseDeletion, AppError> {
        info!("Deleting course");
        let window = self.hard_delete_window;

        let (deletion, purged) = with_deadline(self.transaction_timeout, "delete_course", async {
            let mut tx = TxScope::begin(&self.pool, "delete_course").await?;
            let result = delete_in(tx.conn(), id, window, Utc::now()).await;
            tx.finish(result).await
        })
        .await?;

        self.materials.purge_content(purged).await;
        Ok(deletion)
    }
}

impl Bounded for CourseManager {
    fn with_timeout(&self, deadline: Duration) -> Self {
        Self {
            materials: self.materials.with_timeout(deadline),
            transaction_timeout: deadline,
            ..self.clone()
        }
    }
}

/// Runs the whole course deletion on the given connection. Returns the
/// applied deletion and the store keys of local content to purge once the
/// surrounding transaction commits.
#[instrument(skip(conn))]
pub async fn delete_in(
    conn: &mut SqliteConnection,
    id: i64,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<(CourseDeletion, Vec<String>), AppError> {
    db::defer_foreign_keys(&mut *conn).await?;

    if db::count_memberships(&mut *conn, id).await? > 1 {
        return Err(AppError::Conflict(
            "there are still people enrolled in the course besides the creator".to_string(),
        ));
    }

    let members = db::memberships_for_course(&mut *conn, id).await?;
    if let Some(member) = members.first() {
        if member.role != MembershipRole::Creator {
            return Err(AppError::Conflict(format!(
                "user {} is still enrolled in course {}",
                member.user_id, id
            )));
        }
        membership::remove_in(&mut *conn, member.user_id, id).await?;
    }

    let course = db::find_course(&mut *conn, id).await?;
    let forum = db::find_forum(&mut *conn, course.forum_id).await?;

    let mode = deletion_mode(course.created_at, now, window);
    info!(course_id = id, mode = ?mode, "Applying course deletion");

    let purged = match mode {
        DeletionMode::Hard => {
            db::hard_delete_course(&mut *conn, course.id).await?;
            db::hard_delete_forum(&mut *conn, forum.id).await?;
            material::remove_all_in(&mut *conn, course.id, true, now.naive_utc()).await?
        }
        DeletionMode::Soft => {
            db::soft_delete_course(&mut *conn, course.id, now.naive_utc()).await?;
            db::soft_delete_forum(&mut *conn, forum.id, now.naive_utc()).await?;
            Vec::new()
        }
    };

    Ok((
        CourseDeletion {
            course_id: course.id,
            mode,
        },
        purged,
    ))
}
