use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

fn to_utc(dt: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc)
}

/// Role a user holds within one course. Stored as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipRole {
    Tutor,
    Creator,
    Participant,
}

impl MembershipRole {
    pub fn code(&self) -> i64 {
        match self {
            MembershipRole::Tutor => 1,
            MembershipRole::Creator => 2,
            MembershipRole::Participant => 3,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, AppError> {
        match code {
            1 => Ok(MembershipRole::Tutor),
            2 => Ok(MembershipRole::Creator),
            3 => Ok(MembershipRole::Participant),
            _ => Err(AppError::Internal(format!("Unknown role code: {}", code))),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MembershipRole::Tutor => "tutor",
            MembershipRole::Creator => "creator",
            MembershipRole::Participant => "participant",
        }
    }
}

impl fmt::Display for MembershipRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Course {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(skip_serializing)]
    pub enroll_key: String,
    pub forum_id: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Course {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbCourse {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub enroll_key: Option<String>,
    pub forum_id: Option<i64>,
    pub created_at: Option<NaiveDateTime>,
    pub deleted_at: Option<NaiveDateTime>,
}

impl From<DbCourse> for Course {
    fn from(db: DbCourse) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            name: db.name.unwrap_or_default(),
            description: db.description,
            enroll_key: db.enroll_key.unwrap_or_default(),
            forum_id: db.forum_id.unwrap_or_default(),
            created_at: db.created_at.map(to_utc).unwrap_or_else(Utc::now),
            deleted_at: db.deleted_at.map(to_utc),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Forum {
    pub id: i64,
    pub name: String,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbForum {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub deleted_at: Option<NaiveDateTime>,
}

impl From<DbForum> for Forum {
    fn from(db: DbForum) -> Self {
        Self {
            id: db.id.unwrap_or_default(),
            name: db.name.unwrap_or_default(),
            deleted_at: db.deleted_at.map(to_utc),
        }
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Membership {
    pub user_id: i64,
    pub course_id: i64,
    pub role: MembershipRole,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbMembership {
    pub user_id: Option<i64>,
    pub course_id: Option<i64>,
    pub role_id: Option<i64>,
}

impl TryFrom<DbMembership> for Membership {
    type Error = AppError;

    fn try_from(db: DbMembership) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: db.user_id.unwrap_or_default(),
            course_id: db.course_id.unwrap_or_default(),
            role: MembershipRole::from_code(db.role_id.unwrap_or_default())?,
        })
    }
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub display_name: String,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbUser {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub display_name: Option<String>,
}

impl From<DbUser> for User {
    fn from(user: DbUser) -> Self {
        let username = user.username.unwrap_or_default();
        Self {
            id: user.id.unwrap_or_default(),
            display_name: user.display_name.unwrap_or_else(|| username.clone()),
            username,
        }
    }
}

/// A file attached to a course.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Material {
    pub file_id: i64,
    pub course_id: i64,
    pub name: String,
    pub uri: String,
    pub local: bool,
    pub uploader_id: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Clone, Default)]
pub struct DbMaterial {
    pub file_id: Option<i64>,
    pub course_id: Option<i64>,
    pub name: Option<String>,
    pub uri: Option<String>,
    pub local: Option<bool>,
    pub uploader_id: Option<i64>,
    pub created_at: Option<NaiveDateTime>,
}

impl From<DbMaterial> for Material {
    fn from(db: DbMaterial) -> Self {
        Self {
            file_id: db.file_id.unwrap_or_default(),
            course_id: db.course_id.unwrap_or_default(),
            name: db.name.unwrap_or_default(),
            uri: db.uri.unwrap_or_default(),
            local: db.local.unwrap_or_default(),
            uploader_id: db.uploader_id.unwrap_or_default(),
            created_at: db.created_at.map(to_utc).unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionMode {
    /// Rows physically removed.
    Hard,
    /// Rows kept with a deletion timestamp.
    Soft,
}
