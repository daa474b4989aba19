use std::time::Duration;

use rocket::State;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::{Deserialize, Serialize, json::Json};
use validator::Validate;

use crate::course::{CourseInput, CourseManager};
use crate::material::{MaterialRegistry, NewFile};
use crate::membership::MembershipManager;
use crate::models::{Course, Forum, Material, Membership, MembershipRole, User};
use crate::transaction::Bounded;
use crate::validation::{ApiError, ToValidationResponse, ValidationErrorWrapper, not_blank};

#[derive(Serialize, Deserialize, Debug)]
pub struct CourseResponse {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub forum_id: i64,
    pub created_at: String,
}

impl From<Course> for CourseResponse {
    fn from(course: Course) -> Self {
        Self {
            id: course.id,
            name: course.name,
            description: course.description,
            forum_id: course.forum_id,
            created_at: course.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CourseIdResponse {
    pub id: i64,
}

pub const DEADLINE_HEADER: &str = "X-Request-Timeout-Ms";

/// Optional per-request transaction deadline, in milliseconds.
pub struct RequestDeadline(Option<Duration>);

impl RequestDeadline {
    /// The manager to use for this request.
    pub fn apply<M: Bounded>(&self, manager: &M) -> M {
        match self.0 {
            Some(deadline) => manager.with_timeout(deadline),
            None => manager.clone(),
        }
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for RequestDeadline {
    type Error = ();

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match request.headers().get_one(DEADLINE_HEADER) {
            None => Outcome::Success(RequestDeadline(None)),
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    Outcome::Success(RequestDeadline(Some(Duration::from_millis(ms))))
                }
                _ => {
                    tracing::warn!(value = raw, "Rejected request deadline");
                    Outcome::Error((Status::BadRequest, ()))
                }
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CourseRecordResponse {
    pub id: i64,
    pub name: String,
    pub forum_id: i64,
    pub created_at: String,
    pub deleted: bool,
    pub deleted_at: Option<String>,
    pub forum_deleted: bool,
}

impl From<(Course, Option<Forum>)> for CourseRecordResponse {
    fn from((course, forum): (Course, Option<Forum>)) -> Self {
        Self {
            id: course.id,
            name: course.name.clone(),
            forum_id: course.forum_id,
            created_at: course.created_at.to_rfc3339(),
            deleted: course.is_deleted(),
            deleted_at: course.deleted_at.map(|at| at.to_rfc3339()),
            // A missing forum row was purged with the course.
            forum_deleted: forum.is_none_or(|f| f.deleted_at.is_some()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ForumResponse {
    pub id: i64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MembershipResponse {
    pub user_id: i64,
    pub course_id: i64,
    pub role: MembershipRole,
}

impl From<Membership> for MembershipResponse {
    fn from(membership: Membership) -> Self {
        Self {
            user_id: membership.user_id,
            course_id: membership.course_id,
            role: membership.role,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct FileIdResponse {
    pub id: i64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct UserData {
    pub id: i64,
    pub username: String,
    pub display_name: String,
}

impl From<User> for UserData {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            display_name: user.display_name,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
pub struct MaterialResponse {
    pub file_id: i64,
    pub course_id: i64,
    pub name: String,
    pub uri: String,
    pub local: bool,
    pub uploader_id: i64,
}

impl From<Material> for MaterialResponse {
    fn from(material: Material) -> Self {
        Self {
            file_id: material.file_id,
            course_id: material.course_id,
            name: material.name,
            uri: material.uri,
            local: material.local,
            uploader_id: material.uploader_id,
        }
    }
}

#[derive(Deserialize, Validate)]
pub struct CreateCourseRequest {
    #[validate(custom(function = "not_blank"))]
    name: String,
    description: Option<String>,
    #[validate(custom(function = "not_blank"))]
    enroll_key: String,
    user_id: i64,
}

#[derive(Deserialize, Validate)]
pub struct UpdateCourseRequest {
    #[validate(custom(function = "not_blank"))]
    name: String,
    description: Option<String>,
    #[validate(custom(function = "not_blank"))]
    enroll_key: String,
}

#[derive(Deserialize)]
pub struct EnrollRequest {
    enroll_key: String,
}

#[derive(Deserialize, Validate)]
pub struct CreateMaterialRequest {
    #[validate(custom(function = "not_blank"))]
    name: String,
    #[validate(custom(function = "not_blank"))]
    uri: String,
    uploader_id: i64,
}

#[get("/courses/<id>")]
pub async fn api_get_course(
    id: i64,
    courses: &State<CourseManager>,
) -> Result<Json<CourseResponse>, ApiError> {
    let course = courses.get_course(id).await?;
    Ok(Json(CourseResponse::from(course)))
}

#[post("/courses", data = "<request>")]
pub async fn api_create_course(
    request: Json<CreateCourseRequest>,
    courses: &State<CourseManager>,
    deadline: RequestDeadline,
) -> Result<Json<CourseIdResponse>, ApiError> {
    request.validate().map_err(ValidationErrorWrapper)?;
    let request = request.into_inner();

    let input = CourseInput {
        name: request.name,
        description: request.description,
        enroll_key: request.enroll_key,
    };
    let id = deadline
        .apply(courses.inner())
        .create_course(input, request.user_id)
        .await?;

    Ok(Json(CourseIdResponse { id }))
}

#[put("/courses/<id>", data = "<request>")]
pub async fn api_update_course(
    id: i64,
    request: Json<UpdateCourseRequest>,
    courses: &State<CourseManager>,
    deadline: RequestDeadline,
) -> Result<Json<CourseIdResponse>, ApiError> {
    request.validate().map_err(ValidationErrorWrapper)?;
    let request = request.into_inner();

    let input = CourseInput {
        name: request.name,
        description: request.description,
        enroll_key: request.enroll_key,
    };
    let id = deadline.apply(courses.inner()).update_course(id, input).await?;

    Ok(Json(CourseIdResponse { id }))
}

#[delete("/courses/<id>")]
pub async fn api_delete_course(
    id: i64,
    courses: &State<CourseManager>,
    deadline: RequestDeadline,
) -> Result<Json<CourseIdResponse>, ApiError> {
    let deletion = deadline.apply(courses.inner()).delete_course(id).await?;
    Ok(Json(CourseIdResponse {
        id: deletion.course_id,
    }))
}

#[get("/courses/<id>/users")]
pub async fn api_get_users_in_course(
    id: i64,
    members: &State<MembershipManager>,
) -> Result<Json<Vec<UserData>>, ApiError> {
    let users = members.list_members(id).await?;
    Ok(Json(users.into_iter().map(UserData::from).collect()))
}

#[post("/courses/<id>/users/<user_id>", data = "<request>")]
pub async fn api_enroll_user(
    id: i64,
    user_id: i64,
    request: Json<EnrollRequest>,
    members: &State<MembershipManager>,
    deadline: RequestDeadline,
) -> Result<Json<UserData>, ApiError> {
    let user = deadline
        .apply(members.inner())
        .enroll_user(user_id, id, &request.enroll_key)
        .await?;
    Ok(Json(UserData::from(user)))
}

#[delete("/courses/<id>/users/<user_id>")]
pub async fn api_remove_user_from_course(
    id: i64,
    user_id: i64,
    members: &State<MembershipManager>,
    deadline: RequestDeadline,
) -> Result<Status, ApiError> {
    deadline
        .apply(members.inner())
        .remove_membership(user_id, id)
        .await?;
    Ok(Status::NoContent)
}

#[get("/users/<user_id>/courses")]
pub async fn api_get_courses_for_user(
    user_id: i64,
    members: &State<MembershipManager>,
) -> Result<Json<Vec<CourseResponse>>, ApiError> {
    let courses = members.list_courses_for_user(user_id).await?;
    Ok(Json(courses.into_iter().map(CourseResponse::from).collect()))
}

#[get("/courses/<id>/materials")]
pub async fn api_get_materials(
    id: i64,
    materials: &State<MaterialRegistry>,
) -> Result<Json<Vec<MaterialResponse>>, ApiError> {
    let list = materials.list_materials(id).await?;
    Ok(Json(list.into_iter().map(MaterialResponse::from).collect()))
}

#[post("/courses/<id>/materials", data = "<request>")]
pub async fn api_create_material(
    id: i64,
    request: Json<CreateMaterialRequest>,
    materials: &State<MaterialRegistry>,
    deadline: RequestDeadline,
) -> Result<Json<MaterialResponse>, ApiError> {
    request.validate().map_err(ValidationErrorWrapper)?;
    let request = request.into_inner();

    let file = NewFile {
        name: request.name,
        uri: Some(request.uri),
        uploader_id: request.uploader_id,
        local: false,
    };
    let material = deadline
        .apply(materials.inner())
        .create_material(id, file, None)
        .await?;

    Ok(Json(MaterialResponse::from(material)))
}

#[delete("/courses/<id>/materials/<file_id>")]
pub async fn api_deactivate_material(
    id: i64,
    file_id: i64,
    materials: &State<MaterialRegistry>,
    deadline: RequestDeadline,
) -> Result<Status, ApiError> {
    deadline
        .apply(materials.inner())
        .deactivate_material(id, file_id)
        .await?;
    Ok(Status::NoContent)
}

#[get("/courses/<id>/record")]
pub async fn api_get_course_record(
    id: i64,
    courses: &State<CourseManager>,
) -> Result<Json<CourseRecordResponse>, ApiError> {
    let record = courses.get_course_audit(id).await?;
    Ok(Json(CourseRecordResponse::from(record)))
}

#[get("/courses/<id>/forum")]
pub async fn api_get_forum(
    id: i64,
    courses: &State<CourseManager>,
) -> Result<Json<ForumResponse>, ApiError> {
    let forum = courses.get_forum(id).await?;
    Ok(Json(ForumResponse {
        id: forum.id,
        name: forum.name,
    }))
}

#[get("/courses/<id>/users/<user_id>")]
pub async fn api_get_membership(
    id: i64,
    user_id: i64,
    members: &State<MembershipManager>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let membership = members.get_membership(user_id, id).await?;
    Ok(Json(MembershipResponse::from(membership)))
}

#[post("/files", data = "<request>")]
pub async fn api_save_file(
    request: Json<CreateMaterialRequest>,
    materials: &State<MaterialRegistry>,
    deadline: RequestDeadline,
) -> Result<Json<FileIdResponse>, ApiError> {
    request.validate().map_err(ValidationErrorWrapper)?;
    let request = request.into_inner();

    let file = NewFile {
        name: request.name,
        uri: Some(request.uri),
        uploader_id: request.uploader_id,
        local: false,
    };
    let id = deadline.apply(materials.inner()).save_file(file, None).await?;

    Ok(Json(FileIdResponse { id }))
}

#[put("/courses/<id>/materials/<file_id>")]
pub async fn api_attach_material(
    id: i64,
    file_id: i64,
    materials: &State<MaterialRegistry>,
    deadline: RequestDeadline,
) -> Result<Status, ApiError> {
    deadline
        .apply(materials.inner())
        .attach_to_course(id, file_id)
        .await?;
    Ok(Status::NoContent)
}

#[delete("/courses/<id>/materials?<hard>")]
pub async fn api_remove_all_materials(
    id: i64,
    hard: Option<bool>,
    materials: &State<MaterialRegistry>,
    deadline: RequestDeadline,
) -> Result<Status, ApiError> {
    deadline
        .apply(materials.inner())
        .remove_all_materials_from_course(id, hard.unwrap_or(false))
        .await?;
    Ok(Status::NoContent)
}

#[get("/health")]
pub fn health() -> &'static str {
    "OK"
}

#[catch(default)]
pub fn api_catcher(status: Status, _req: &rocket::Request) -> ApiError {
    status.to_validation_response()
}
