#[macro_use]
extern crate rocket;

mod api;
mod course;
mod db;
mod env;
mod error;
mod material;
mod membership;
mod models;
mod telemetry;
#[cfg(test)]
mod test;
mod transaction;
mod validation;

use std::sync::Arc;

use api::{
    api_attach_material, api_catcher, api_create_course, api_create_material,
    api_deactivate_material, api_delete_course, api_enroll_user, api_get_course,
    api_get_course_record, api_get_courses_for_user, api_get_forum, api_get_materials,
    api_get_membership, api_get_users_in_course, api_remove_all_materials,
    api_remove_user_from_course, api_save_file, api_update_course, health,
};
use course::CourseManager;
use env::{Settings, load_environment};
use error::AppError;
use material::{FileStore, LocalFileStore, MaterialRegistry};
use membership::MembershipManager;
use rocket::{Build, Rocket};
use telemetry::{TelemetryFairing, init_tracing, shutdown_telemetry};
use thiserror::Error;

use sqlx::SqlitePool;
use tracing::info;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Anyhow(anyhow::Error),
    #[error("{0}")]
    Figment(rocket::figment::Error),
    #[error("{0}")]
    Rocket(Box<rocket::Error>),
    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Application error: {0}")]
    App(#[from] AppError),
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Anyhow(value)
    }
}

impl From<rocket::figment::Error> for Error {
    fn from(value: rocket::figment::Error) -> Self {
        Error::Figment(value)
    }
}

impl From<rocket::Error> for Error {
    fn from(value: rocket::Error) -> Self {
        Error::Rocket(Box::new(value))
    }
}

#[rocket::main]
async fn main() -> Result<(), Error> {
    if let Err(e) = load_environment() {
        eprintln!("Failed to load environment files: {}", e);
    }
    init_tracing();

    let settings = Settings::from_env()?;

    let pool = SqlitePool::connect(&settings.database_url).await?;

    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(AppError::from)?;
    info!("Migrations completed successfully");

    let store: Arc<dyn FileStore> = Arc::new(LocalFileStore::new(&settings.file_store_dir));

    let result = init_rocket(pool, &settings, store).launch().await;

    shutdown_telemetry();
    result?;

    Ok(())
}

pub fn init_managers(
    pool: SqlitePool,
    settings: &Settings,
    store: Arc<dyn FileStore>,
) -> (CourseManager, MembershipManager, MaterialRegistry) {
    let materials = MaterialRegistry::new(pool.clone(), store, settings.transaction_timeout);
    let members = MembershipManager::new(pool.clone(), settings.transaction_timeout);
    let courses = CourseManager::new(
        pool,
        materials.clone(),
        settings.transaction_timeout,
        settings.hard_delete_window,
    );

    (courses, members, materials)
}

pub fn init_rocket(
    pool: SqlitePool,
    settings: &Settings,
    store: Arc<dyn FileStore>,
) -> Rocket<Build> {
    info!("Starting learningbay course service");

    let (courses, members, materials) = init_managers(pool, settings, store);

    rocket::build()
        .manage(courses)
        .manage(members)
        .manage(materials)
        .mount(
            "/api",
            routes![
                api_get_course,
                api_create_course,
                api_update_course,
                api_delete_course,
                api_get_users_in_course,
                api_enroll_user,
                api_remove_user_from_course,
                api_get_courses_for_user,
                api_get_materials,
                api_create_material,
                api_deactivate_material,
                api_get_course_record,
                api_get_forum,
                api_get_membership,
                api_save_file,
                api_attach_material,
                api_remove_all_materials,
                health,
            ],
        )
        .register("/api", catchers![api_catcher])
        .attach(TelemetryFairing)
}
