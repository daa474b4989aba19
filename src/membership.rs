use std::time::Duration;

use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::{info, instrument, warn};

use crate::db;
use crate::error::AppError;
use crate::models::{Course, Membership, MembershipRole, User};
use crate::transaction::{Bounded, TxScope, with_deadline};

/// Enrollment, listing and removal of course members.
#[derive(Clone)]
pub struct MembershipManager {
    pool: Pool<Sqlite>,
    transaction_timeout: Duration,
}

impl MembershipManager {
    pub fn new(pool: Pool<Sqlite>, transaction_timeout: Duration) -> Self {
        Self {
            pool,
            transaction_timeout,
        }
    }

    /// Adds `user_id` to the course as a participant when `enroll_key` matches
    /// the course's key exactly. Returns the enrolled user.
    #[instrument(skip(self, enroll_key))]
    pub async fn enroll_user(
        &self,
        user_id: i64,
        course_id: i64,
        enroll_key: &str,
    ) -> Result<User, AppError> {
        info!("Enrolling user");
        with_deadline(self.transaction_timeout, "enroll_user", async {
            let mut tx = TxScope::begin(&self.pool, "enroll_user").await?;
            let result = async {
                let course = db::find_course(tx.conn(), course_id).await?;
                if course.enroll_key != enroll_key {
                    warn!(course_id, user_id, "Enrollment rejected");
                    return Err(AppError::Authorization("wrong enroll key".to_string()));
                }

                db::insert_membership(tx.conn(), user_id, course_id, MembershipRole::Participant)
                    .await?;
                db::find_user(tx.conn(), user_id).await
            }
            .await;
            tx.finish(result).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn remove_membership(&self, user_id: i64, course_id: i64) -> Result<(), AppError> {
        info!("Removing membership");
        with_deadline(self.transaction_timeout, "remove_membership", async {
            let mut tx = TxScope::begin(&self.pool, "remove_membership").await?;
            let result = remove_in(tx.conn(), user_id, course_id).await.map(|_| ());
            tx.finish(result).await
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn get_membership(
        &self,
        user_id: i64,
        course_id: i64,
    ) -> Result<Membership, AppError> {
        db::find_membership(&self.pool, user_id, course_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_members(&self, course_id: i64) -> Result<Vec<User>, AppError> {
        db::find_course(&self.pool, course_id).await?;
        db::users_in_course(&self.pool, course_id).await
    }

    #[instrument(skip(self))]
    pub async fn list_courses_for_user(&self, user_id: i64) -> Result<Vec<Course>, AppError> {
        db::find_user(&self.pool, user_id).await?;
        db::courses_for_user(&self.pool, user_id).await
    }
}

impl Bounded for MembershipManager {
    fn with_timeout(&self, deadline: Duration) -> Self {
        Self {
            transaction_timeout: deadline,
            ..self.clone()
        }
    }
}

/// Deletes one membership on the given connection. The creator can only leave
/// once nobody else is enrolled.
#[instrument(skip(conn))]
pub async fn remove_in(
    conn: &mut SqliteConnection,
    user_id: i64,
    course_id: i64,
) -> Result<Membership, AppError> {
    let membership = db::find_membership(&mut *conn, user_id, course_id).await?;

    if membership.role == MembershipRole::Creator
        && db::count_memberships(&mut *conn, course_id).await? > 1
    {
        return Err(AppError::Conflict(format!(
            "Creator of course {} cannot leave while other members are enrolled",
            course_id
        )));
    }

    db::delete_membership(&mut *conn, user_id, course_id).await?;
    Ok(membership)
}
