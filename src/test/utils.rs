#[cfg(test)]
pub mod test_utils {
    use crate::course::{CourseInput, CourseManager};
    use crate::db::insert_user;
    use crate::env::Settings;
    use crate::error::AppError;
    use crate::material::{FileStore, LocalFileStore, MaterialRegistry};
    use crate::membership::MembershipManager;
    use crate::init_managers;
    use chrono::{TimeDelta, Utc};
    use rocket::local::asynchronous::Client;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use sqlx::{Pool, Sqlite};
    use std::collections::HashMap;
    use std::sync::{Arc, Once};
    use std::time::Duration;
    use tempfile::TempDir;

    static INIT: Once = Once::new();

    pub struct TestCourse {
        pub name: String,
        pub enroll_key: String,
        pub creator_username: String,
    }

    pub struct TestEnrollment {
        pub username: String,
        pub course_name: String,
    }

    pub struct TestDbBuilder {
        users: Vec<String>,
        courses: Vec<TestCourse>,
        enrollments: Vec<TestEnrollment>,
        transaction_timeout: Duration,
        file_backed: bool,
    }

    impl Default for TestDbBuilder {
        fn default() -> Self {
            Self {
                users: Vec::new(),
                courses: Vec::new(),
                enrollments: Vec::new(),
                transaction_timeout: Duration::from_secs(5),
                file_backed: false,
            }
        }
    }

    impl TestDbBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn user(mut self, username: &str) -> Self {
            self.users.push(username.to_string());
            self
        }

        pub fn course(mut self, name: &str, enroll_key: &str, creator_username: &str) -> Self {
            self.courses.push(TestCourse {
                name: name.to_string(),
                enroll_key: enroll_key.to_string(),
                creator_username: creator_username.to_string(),
            });
            self
        }

        pub fn enroll(mut self, username: &str, course_name: &str) -> Self {
            self.enrollments.push(TestEnrollment {
                username: username.to_string(),
                course_name: course_name.to_string(),
            });
            self
        }

        pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
            self.transaction_timeout = timeout;
            self
        }

        /// Uses a WAL database file with two connections so that concurrent
        /// transactions can interleave.
        pub fn file_backed(mut self) -> Self {
            self.file_backed = true;
            self
        }

        pub async fn build(self) -> Result<TestDb, AppError> {
            INIT.call_once(|| {
                let _ = env_logger::builder()
                    .parse_filters("debug,sqlx=warn")
                    .is_test(true)
                    .try_init();
            });

            let (pool, db_dir) = if self.file_backed {
                let db_dir = TempDir::new()?;
                let options = SqliteConnectOptions::new()
                    .filename(db_dir.path().join("learningbay.db"))
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .busy_timeout(Duration::from_millis(500));
                let pool = SqlitePoolOptions::new()
                    .max_connections(2)
                    .connect_with(options)
                    .await?;
                (pool, Some(db_dir))
            } else {
                // A single connection keeps every statement on the same in-memory database.
                let pool = SqlitePoolOptions::new()
                    .max_connections(1)
                    .connect("sqlite::memory:")
                    .await?;
                (pool, None)
            };

            sqlx::migrate!("./migrations").run(&pool).await?;

            let store_dir = TempDir::new()?;
            let settings = Settings {
                database_url: "sqlite::memory:".to_string(),
                transaction_timeout: self.transaction_timeout,
                hard_delete_window: Duration::from_secs(600),
                file_store_dir: store_dir.path().to_path_buf(),
            };
            let store: Arc<dyn FileStore> =
                Arc::new(LocalFileStore::new(&settings.file_store_dir));
            let (courses, members, materials) = init_managers(pool.clone(), &settings, store);

            let mut user_id_map: HashMap<String, i64> = HashMap::new();
            let mut course_id_map: HashMap<String, i64> = HashMap::new();

            for username in &self.users {
                let user_id = insert_user(&pool, username, None).await?;
                user_id_map.insert(username.clone(), user_id);
            }

            for course in &self.courses {
                let creator_id = user_id_map
                    .get(&course.creator_username)
                    .copied()
                    .ok_or_else(|| AppError::NotFound(course.creator_username.clone()))?;

                let course_id = courses
                    .create_course(
                        CourseInput {
                            name: course.name.clone(),
                            description: None,
                            enroll_key: course.enroll_key.clone(),
                        },
                        creator_id,
                    )
                    .await?;
                course_id_map.insert(course.name.clone(), course_id);
            }

            for enrollment in &self.enrollments {
                let user_id = user_id_map[&enrollment.username];
                let course_id = course_id_map[&enrollment.course_name];
                let key = &self
                    .courses
                    .iter()
                    .find(|c| c.name == enrollment.course_name)
                    .map(|c| c.enroll_key.clone())
                    .unwrap_or_default();
                members.enroll_user(user_id, course_id, key).await?;
            }

            Ok(TestDb {
                pool,
                settings,
                store_dir,
                db_dir,
                user_id_map,
                course_id_map,
                courses,
                members,
                materials,
            })
        }
    }

    pub struct TestDb {
        pub pool: Pool<Sqlite>,
        pub settings: Settings,
        pub store_dir: TempDir,
        pub db_dir: Option<TempDir>,
        pub user_id_map: HashMap<String, i64>,
        pub course_id_map: HashMap<String, i64>,
        pub courses: CourseManager,
        pub members: MembershipManager,
        pub materials: MaterialRegistry,
    }

    impl TestDb {
        pub fn user_id(&self, username: &str) -> i64 {
            self.user_id_map[username]
        }

        pub fn course_id(&self, name: &str) -> i64 {
            self.course_id_map[name]
        }

        pub async fn count_rows(&self, table: &str) -> i64 {
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&self.pool)
                .await
                .expect("Failed to count rows")
        }

        /// Moves a course's creation time into the past.
        pub async fn backdate_course(&self, course_id: i64, minutes: i64) {
            let created_at = (Utc::now() - TimeDelta::minutes(minutes)).naive_utc();
            sqlx::query("UPDATE courses SET created_at = ? WHERE id = ?")
                .bind(created_at)
                .bind(course_id)
                .execute(&self.pool)
                .await
                .expect("Failed to backdate course");
        }

        /// Makes every statement of `event` on `table` abort, simulating a
        /// store failure at that step.
        pub async fn fail_on(&self, event: &str, table: &str) {
            let trigger = format!(
                "CREATE TRIGGER fail_{event}_{table} BEFORE {event} ON {table}
                 BEGIN SELECT RAISE(ABORT, 'injected failure'); END;",
                event = event.to_lowercase(),
                table = table
            );
            sqlx::raw_sql(&trigger)
                .execute(&self.pool)
                .await
                .expect("Failed to install failure trigger");
        }
    }

    pub async fn create_standard_test_db() -> TestDb {
        TestDbBuilder::new()
            .user("creator")
            .user("student")
            .user("other_student")
            .course("Algebra 101", "k1", "creator")
            .build()
            .await
            .expect("Failed to build test database")
    }

    pub async fn setup_test_client(test_db: TestDb) -> (Client, TestDb) {
        let store: Arc<dyn FileStore> =
            Arc::new(LocalFileStore::new(&test_db.settings.file_store_dir));
        let rocket = crate::init_rocket(test_db.pool.clone(), &test_db.settings, store);
        let client = Client::tracked(rocket)
            .await
            .expect("valid rocket instance");
        (client, test_db)
    }
}
