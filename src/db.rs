use chrono::NaiveDateTime;
use sqlx::{Executor, Sqlite};
use tracing::{info, instrument};

use crate::error::AppError;
use crate::models::{
    Course, DbCourse, DbForum, DbMaterial, DbMembership, DbUser, Forum, Material, Membership,
    MembershipRole, User,
};

/// Users are provisioned by the identity service; tests seed them here.
#[cfg(test)]
#[instrument(skip(executor))]
pub async fn insert_user<'e, E>(
    executor: E,
    username: &str,
    display_name: Option<&str>,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Creating new user");
    let res = sqlx::query("INSERT INTO users (username, display_name) VALUES (?, ?)")
        .bind(username)
        .bind(display_name)
        .execute(executor)
        .await
        .map_err(|e| {
            AppError::from_constraint(
                e,
                &format!("Username '{}' already exists", username),
                "referenced row does not exist",
            )
        })?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(executor))]
pub async fn find_user<'e, E>(executor: E, id: i64) -> Result<User, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Fetching user by ID");
    let row = sqlx::query_as::<_, DbUser>(
        "SELECT id, username, display_name FROM users WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(user) => Ok(User::from(user)),
        _ => Err(AppError::NotFound(format!(
            "User with id {} not found in database",
            id
        ))),
    }
}

#[instrument(skip(executor))]
pub async fn insert_forum<'e, E>(
    executor: E,
    name: &str,
    now: NaiveDateTime,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Creating forum");
    let res = sqlx::query("INSERT INTO forums (name, created_at) VALUES (?, ?)")
        .bind(name)
        .bind(now)
        .execute(executor)
        .await?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(executor))]
pub async fn find_forum<'e, E>(executor: E, id: i64) -> Result<Forum, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Fetching forum by ID");
    let row = sqlx::query_as::<_, DbForum>(
        "SELECT id, name, deleted_at FROM forums WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(forum) => Ok(Forum::from(forum)),
        _ => Err(AppError::NotFound(format!("Forum with id {} not found", id))),
    }
}

/// Looks a forum up regardless of its deletion marker.
#[instrument(skip(executor))]
pub async fn find_forum_record<'e, E>(executor: E, id: i64) -> Result<Option<Forum>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, DbForum>("SELECT id, name, deleted_at FROM forums WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(row.map(Forum::from))
}

#[instrument(skip(executor))]
pub async fn update_forum_name<'e, E>(executor: E, id: i64, name: &str) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Renaming forum");
    let res = sqlx::query("UPDATE forums SET name = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(name)
        .bind(id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Forum with id {} not found", id)));
    }

    Ok(())
}

#[instrument(skip(executor))]
pub async fn soft_delete_forum<'e, E>(
    executor: E,
    id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Soft deleting forum");
    let res = sqlx::query("UPDATE forums SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Forum with id {} not found", id)));
    }

    Ok(())
}

#[instrument(skip(executor))]
pub async fn hard_delete_forum<'e, E>(executor: E, id: i64) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Hard deleting forum");
    let res = sqlx::query("DELETE FROM forums WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Forum with id {} not found", id)));
    }

    Ok(())
}

#[instrument(skip(executor, enroll_key))]
pub async fn insert_course<'e, E>(
    executor: E,
    name: &str,
    description: Option<&str>,
    enroll_key: &str,
    forum_id: i64,
    now: NaiveDateTime,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Creating course");
    let res = sqlx::query(
        "INSERT INTO courses (name, description, enroll_key, forum_id, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(description)
    .bind(enroll_key)
    .bind(forum_id)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| {
        AppError::from_constraint(
            e,
            &format!("Forum {} already belongs to a course", forum_id),
            &format!("Forum with id {} not found", forum_id),
        )
    })?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(executor))]
pub async fn find_course<'e, E>(executor: E, id: i64) -> Result<Course, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Fetching course by ID");
    let row = sqlx::query_as::<_, DbCourse>(
        "SELECT id, name, description, enroll_key, forum_id, created_at, deleted_at
         FROM courses WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(course) => Ok(Course::from(course)),
        _ => Err(AppError::NotFound(format!(
            "Course with id {} not found in database",
            id
        ))),
    }
}

/// Audit lookup: returns the course even when it carries a deletion marker.
#[instrument(skip(executor))]
pub async fn find_course_record<'e, E>(executor: E, id: i64) -> Result<Course, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Fetching course record by ID");
    let row = sqlx::query_as::<_, DbCourse>(
        "SELECT id, name, description, enroll_key, forum_id, created_at, deleted_at
         FROM courses WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(course) => Ok(Course::from(course)),
        _ => Err(AppError::NotFound(format!(
            "Course with id {} not found in database",
            id
        ))),
    }
}

#[instrument(skip(executor, enroll_key))]
pub async fn update_course<'e, E>(
    executor: E,
    id: i64,
    name: &str,
    description: Option<&str>,
    enroll_key: &str,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Updating course");
    let res = sqlx::query(
        "UPDATE courses
         SET name = ?, description = ?, enroll_key = ?
         WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(name)
    .bind(description)
    .bind(enroll_key)
    .bind(id)
    .execute(executor)
    .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Course with id {} not found in database",
            id
        )));
    }

    Ok(())
}

#[instrument(skip(executor))]
pub async fn soft_delete_course<'e, E>(
    executor: E,
    id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Soft deleting course");
    let res = sqlx::query("UPDATE courses SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Course with id {} not found in database",
            id
        )));
    }

    Ok(())
}

#[instrument(skip(executor))]
pub async fn hard_delete_course<'e, E>(executor: E, id: i64) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Hard deleting course");
    let res = sqlx::query("DELETE FROM courses WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "Course with id {} not found in database",
            id
        )));
    }

    Ok(())
}

/// Postpones foreign-key checks to commit time for the current transaction.
#[instrument(skip(executor))]
pub async fn defer_foreign_keys<'e, E>(executor: E) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("PRAGMA defer_foreign_keys = TRUE")
        .execute(executor)
        .await?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn insert_membership<'e, E>(
    executor: E,
    user_id: i64,
    course_id: i64,
    role: MembershipRole,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!(role = %role, "Inserting membership");
    sqlx::query("INSERT INTO user_has_course (user_id, course_id, role_id) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(course_id)
        .bind(role.code())
        .execute(executor)
        .await
        .map_err(|e| {
            AppError::from_constraint(
                e,
                &format!(
                    "User {} is already enrolled in course {}",
                    user_id, course_id
                ),
                &format!("User {} or course {} does not exist", user_id, course_id),
            )
        })?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn find_membership<'e, E>(
    executor: E,
    user_id: i64,
    course_id: i64,
) -> Result<Membership, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Fetching membership");
    let row = sqlx::query_as::<_, DbMembership>(
        "SELECT user_id, course_id, role_id FROM user_has_course
         WHERE user_id = ? AND course_id = ?",
    )
    .bind(user_id)
    .bind(course_id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(membership) => Membership::try_from(membership),
        _ => Err(AppError::NotFound(format!(
            "User {} is not a member of course {}",
            user_id, course_id
        ))),
    }
}

#[instrument(skip(executor))]
pub async fn delete_membership<'e, E>(
    executor: E,
    user_id: i64,
    course_id: i64,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Deleting membership");
    let res = sqlx::query("DELETE FROM user_has_course WHERE user_id = ? AND course_id = ?")
        .bind(user_id)
        .bind(course_id)
        .execute(executor)
        .await?;

    if res.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "User {} is not a member of course {}",
            user_id, course_id
        )));
    }

    Ok(())
}

#[instrument(skip(executor))]
pub async fn count_memberships<'e, E>(executor: E, course_id: i64) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_has_course WHERE course_id = ?")
        .bind(course_id)
        .fetch_one(executor)
        .await?;

    Ok(count)
}

#[instrument(skip(executor))]
pub async fn memberships_for_course<'e, E>(
    executor: E,
    course_id: i64,
) -> Result<Vec<Membership>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query_as::<_, DbMembership>(
        "SELECT user_id, course_id, role_id FROM user_has_course
         WHERE course_id = ?
         ORDER BY user_id",
    )
    .bind(course_id)
    .fetch_all(executor)
    .await?;

    rows.into_iter().map(Membership::try_from).collect()
}

#[instrument(skip(executor))]
pub async fn users_in_course<'e, E>(executor: E, course_id: i64) -> Result<Vec<User>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Getting users in course");
    let rows = sqlx::query_as::<_, DbUser>(
        "SELECT u.id, u.username, u.display_name
         FROM users u
         JOIN user_has_course uhc ON uhc.user_id = u.id
         WHERE uhc.course_id = ?
         ORDER BY u.id",
    )
    .bind(course_id)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(User::from).collect())
}

#[instrument(skip(executor))]
pub async fn courses_for_user<'e, E>(executor: E, user_id: i64) -> Result<Vec<Course>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Getting courses for user");
    let rows = sqlx::query_as::<_, DbCourse>(
        "SELECT c.id, c.name, c.description, c.enroll_key, c.forum_id, c.created_at, c.deleted_at
         FROM courses c
         JOIN user_has_course uhc ON uhc.course_id = c.id
         WHERE uhc.user_id = ? AND c.deleted_at IS NULL
         ORDER BY c.id",
    )
    .bind(user_id)
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(Course::from).collect())
}

#[instrument(skip(executor))]
pub async fn insert_file<'e, E>(
    executor: E,
    name: &str,
    uri: &str,
    local: bool,
    uploader_id: i64,
    now: NaiveDateTime,
) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Saving file metadata");
    let res = sqlx::query(
        "INSERT INTO files (name, uri, local, uploader_id, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(uri)
    .bind(local)
    .bind(uploader_id)
    .bind(now)
    .execute(executor)
    .await
    .map_err(|e| {
        AppError::from_constraint(
            e,
            "File already exists",
            &format!("Uploader {} does not exist", uploader_id),
        )
    })?;

    Ok(res.last_insert_rowid())
}

#[instrument(skip(executor))]
pub async fn attach_file<'e, E>(
    executor: E,
    course_id: i64,
    file_id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    info!("Attaching file to course");
    sqlx::query("INSERT INTO course_has_file (course_id, file_id, created_at) VALUES (?, ?, ?)")
        .bind(course_id)
        .bind(file_id)
        .bind(now)
        .execute(executor)
        .await
        .map_err(|e| {
            AppError::from_constraint(
                e,
                &format!("File {} is already attached to course {}", file_id, course_id),
                &format!("Course {} or file {} does not exist", course_id, file_id),
            )
        })?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn find_material<'e, E>(
    executor: E,
    course_id: i64,
    file_id: i64,
) -> Result<Material, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, DbMaterial>(
        "SELECT f.id AS file_id, chf.course_id, f.name, f.uri, f.local, f.uploader_id, f.created_at
         FROM course_has_file chf
         JOIN files f ON f.id = chf.file_id
         WHERE chf.course_id = ? AND chf.file_id = ?
           AND chf.deleted_at IS NULL AND f.deleted_at IS NULL",
    )
    .bind(course_id)
    .bind(file_id)
    .fetch_optional(executor)
    .await?;

    match row {
        Some(material) => Ok(Material::from(material)),
        _ => Err(AppError::NotFound(format!(
            "File {} is not attached to course {}",
            file_id, course_id
        ))),
    }
}

/// Lists the files attached to a course. With `include_removed` the
/// associations and files already marked deleted are listed too.
#[instrument(skip(executor))]
pub async fn materials_for_course<'e, E>(
    executor: E,
    course_id: i64,
    include_removed: bool,
) -> Result<Vec<Material>, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let query = if include_removed {
        "SELECT f.id AS file_id, chf.course_id, f.name, f.uri, f.local, f.uploader_id, f.created_at
         FROM course_has_file chf
         JOIN files f ON f.id = chf.file_id
         WHERE chf.course_id = ?
         ORDER BY f.id"
    } else {
        "SELECT f.id AS file_id, chf.course_id, f.name, f.uri, f.local, f.uploader_id, f.created_at
         FROM course_has_file chf
         JOIN files f ON f.id = chf.file_id
         WHERE chf.course_id = ? AND chf.deleted_at IS NULL AND f.deleted_at IS NULL
         ORDER BY f.id"
    };

    let rows = sqlx::query_as::<_, DbMaterial>(query)
        .bind(course_id)
        .fetch_all(executor)
        .await?;

    Ok(rows.into_iter().map(Material::from).collect())
}

#[instrument(skip(executor))]
pub async fn soft_delete_course_file<'e, E>(
    executor: E,
    course_id: i64,
    file_id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "UPDATE course_has_file SET deleted_at = ?
         WHERE course_id = ? AND file_id = ? AND deleted_at IS NULL",
    )
    .bind(now)
    .bind(course_id)
    .bind(file_id)
    .execute(executor)
    .await?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn hard_delete_course_file<'e, E>(
    executor: E,
    course_id: i64,
    file_id: i64,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM course_has_file WHERE course_id = ? AND file_id = ?")
        .bind(course_id)
        .bind(file_id)
        .execute(executor)
        .await?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn soft_delete_file<'e, E>(
    executor: E,
    file_id: i64,
    now: NaiveDateTime,
) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("UPDATE files SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
        .bind(now)
        .bind(file_id)
        .execute(executor)
        .await?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn hard_delete_file<'e, E>(executor: E, file_id: i64) -> Result<(), AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM files WHERE id = ?")
        .bind(file_id)
        .execute(executor)
        .await?;

    Ok(())
}

#[instrument(skip(executor))]
pub async fn count_file_links<'e, E>(executor: E, file_id: i64) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM course_has_file WHERE file_id = ?")
        .bind(file_id)
        .fetch_one(executor)
        .await?;

    Ok(count)
}

/// Counts the associations of a file that are not marked deleted.
#[instrument(skip(executor))]
pub async fn count_active_file_links<'e, E>(executor: E, file_id: i64) -> Result<i64, AppError>
where
    E: Executor<'e, Database = Sqlite>,
{
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM course_has_file WHERE file_id = ? AND deleted_at IS NULL",
    )
    .bind(file_id)
    .fetch_one(executor)
    .await?;

    Ok(count)
}
