#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use crate::course::{CourseInput, delete_in};
    use crate::db;
    use crate::error::AppError;
    use crate::models::{DeletionMode, MembershipRole};
    use crate::test::test_utils::{TestDbBuilder, create_standard_test_db};
    use crate::transaction::TxScope;

    fn input(name: &str, key: &str) -> CourseInput {
        CourseInput {
            name: name.to_string(),
            description: Some("An introduction".to_string()),
            enroll_key: key.to_string(),
        }
    }

    #[rocket::async_test]
    async fn test_create_course_creates_forum_and_creator_membership() {
        let test_db = TestDbBuilder::new()
            .user("creator")
            .build()
            .await
            .expect("Failed to build test database");
        let creator_id = test_db.user_id("creator");

        let course_id = test_db
            .courses
            .create_course(input("Algebra 101", "k1"), creator_id)
            .await
            .expect("Failed to create course");

        let course = test_db.courses.get_course(course_id).await.unwrap();
        assert_eq!(course.name, "Algebra 101");
        assert_eq!(course.description.as_deref(), Some("An introduction"));
        assert_eq!(course.enroll_key, "k1");

        let forum = test_db.courses.get_forum(course_id).await.unwrap();
        assert_eq!(forum.id, course.forum_id);
        assert_eq!(forum.name, "Algebra 101");

        let membership = test_db
            .members
            .get_membership(creator_id, course_id)
            .await
            .expect("Creator membership missing");
        assert_eq!(membership.role, MembershipRole::Creator);
    }

    #[rocket::async_test]
    async fn test_create_course_rejects_blank_name() {
        let test_db = TestDbBuilder::new().user("creator").build().await.unwrap();

        let result = test_db
            .courses
            .create_course(input("   ", "k1"), test_db.user_id("creator"))
            .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
        assert_eq!(test_db.count_rows("courses").await, 0);
        assert_eq!(test_db.count_rows("forums").await, 0);
    }

    #[rocket::async_test]
    async fn test_create_course_rejects_blank_enroll_key() {
        let test_db = TestDbBuilder::new().user("creator").build().await.unwrap();

        let result = test_db
            .courses
            .create_course(input("Algebra 101", " "), test_db.user_id("creator"))
            .await;

        match result {
            Err(AppError::Validation(msg)) => assert!(msg.contains("enroll_key"), "{}", msg),
            other => panic!("Expected validation error, got {:?}", other),
        }
        assert_eq!(test_db.count_rows("courses").await, 0);
    }

    #[rocket::async_test]
    async fn test_create_course_unknown_creator_leaves_nothing() {
        let test_db = TestDbBuilder::new().build().await.unwrap();

        let result = test_db.courses.create_course(input("Algebra 101", "k1"), 42).await;

        assert!(matches!(result, Err(AppError::NotFound(_))), "{:?}", result);
        assert_eq!(test_db.count_rows("forums").await, 0);
        assert_eq!(test_db.count_rows("courses").await, 0);
        assert_eq!(test_db.count_rows("user_has_course").await, 0);
    }

    #[rocket::async_test]
    async fn test_create_course_is_atomic_at_every_step() {
        for table in ["forums", "courses", "user_has_course"] {
            let test_db = TestDbBuilder::new().user("creator").build().await.unwrap();
            test_db.fail_on("INSERT", table).await;

            let result = test_db
                .courses
                .create_course(input("Algebra 101", "k1"), test_db.user_id("creator"))
                .await;

            assert!(result.is_err(), "Insert into {} should fail", table);
            assert_eq!(test_db.count_rows("forums").await, 0, "failing {}", table);
            assert_eq!(test_db.count_rows("courses").await, 0, "failing {}", table);
            assert_eq!(
                test_db.count_rows("user_has_course").await,
                0,
                "failing {}",
                table
            );
        }
    }

    #[rocket::async_test]
    async fn test_update_course_renames_forum() {
        let test_db = create_standard_test_db().await;
        let course_id = test_db.course_id("Algebra 101");

        let updated = test_db
            .courses
            .update_course(course_id, input("N", "K"))
            .await
            .expect("Failed to update course");
        assert_eq!(updated, course_id);

        let course = test_db.courses.get_course(course_id).await.unwrap();
        assert_eq!(course.name, "N");
        assert_eq!(course.enroll_key, "K");
        assert_eq!(course.description.as_deref(), Some("An introduction"));

        let forum = test_db.courses.get_forum(course_id).await.unwrap();
        assert_eq!(forum.name, "N");
    }

    #[rocket::async_test]
    async fn test_update_course_forum_failure_rolls_back_course() {
        let test_db = create_standard_test_db().await;
        let course_id = test_db.course_id("Algebra 101");
        test_db.fail_on("UPDATE", "forums").await;

        let result = test_db
            .courses
            .update_course(course_id, input("Geometry", "k2"))
            .await;
        assert!(matches!(result, Err(AppError::Database(_))));

        let course = test_db.courses.get_course(course_id).await.unwrap();
        assert_eq!(course.name, "Algebra 101");
        assert_eq!(course.enroll_key, "k1");
    }

    #[rocket::async_test]
    async fn test_update_missing_course_is_not_found() {
        let test_db = create_standard_test_db().await;

        let result = test_db.courses.update_course(999, input("N", "K")).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[rocket::async_test]
    async fn test_delete_inside_grace_window_is_hard() {
        let test_db = create_standard_test_db().await;
        let course_id = test_db.course_id("Algebra 101");
        test_db.backdate_course(course_id, 5).await;

        let deletion = test_db
            .courses
            .delete_course(course_id)
            .await
            .expect("Failed to delete course");

        assert_eq!(deletion.course_id, course_id);
        assert_eq!(deletion.mode, DeletionMode::Hard);
        assert!(matches!(
            test_db.courses.get_course(course_id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            test_db.courses.get_course_record(course_id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(test_db.count_rows("forums").await, 0);
        assert_eq!(test_db.count_rows("user_has_course").await, 0);
    }

    #[rocket::async_test]
    async fn test_delete_after_grace_window_is_soft() {
        let test_db = create_standard_test_db().await;
        let course_id = test_db.course_id("Algebra 101");
        test_db.backdate_course(course_id, 15).await;

        let deletion = test_db.courses.delete_course(course_id).await.unwrap();
        assert_eq!(deletion.mode, DeletionMode::Soft);

        assert!(matches!(
            test_db.courses.get_course(course_id).await,
            Err(AppError::NotFound(_))
        ));

        let (record, forum) = test_db
            .courses
            .get_course_audit(course_id)
            .await
            .expect("Soft deleted course should stay retrievable");
        assert!(record.is_deleted());
        assert_eq!(record.name, "Algebra 101");

        let forum = forum.expect("Forum row should be retained");
        assert!(forum.deleted_at.is_some());
        assert_eq!(test_db.count_rows("user_has_course").await, 0);
    }

    #[rocket::async_test]
    async fn test_delete_with_participants_is_conflict() {
        let test_db = TestDbBuilder::new()
            .user("creator")
            .user("student")
            .course("Algebra 101", "k1", "creator")
            .enroll("student", "Algebra 101")
            .build()
            .await
            .unwrap();
        let course_id = test_db.course_id("Algebra 101");

        let result = test_db.courses.delete_course(course_id).await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert!(test_db.courses.get_course(course_id).await.is_ok());
        assert_eq!(test_db.count_rows("user_has_course").await, 2);
        assert_eq!(test_db.count_rows("forums").await, 1);
    }

    #[rocket::async_test]
    async fn test_delete_failure_keeps_creator_membership() {
        let test_db = create_standard_test_db().await;
        let course_id = test_db.course_id("Algebra 101");
        test_db.fail_on("DELETE", "forums").await;

        let result = test_db.courses.delete_course(course_id).await;

        assert!(result.is_err());
        assert!(test_db.courses.get_course(course_id).await.is_ok());
        assert_eq!(test_db.count_rows("user_has_course").await, 1);
    }

    #[rocket::async_test]
    async fn test_delete_missing_course_is_not_found() {
        let test_db = create_standard_test_db().await;

        let result = test_db.courses.delete_course(999).await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[rocket::async_test]
    async fn test_enrollment_and_deletion_scenario() {
        let test_db = TestDbBuilder::new()
            .user("u7")
            .user("u8")
            .build()
            .await
            .unwrap();
        let creator = test_db.user_id("u7");
        let student = test_db.user_id("u8");

        let course_id = test_db
            .courses
            .create_course(input("Algebra 101", "k1"), creator)
            .await
            .unwrap();
        assert_eq!(course_id, 1);

        test_db
            .members
            .enroll_user(student, course_id, "k1")
            .await
            .expect("Enrollment with the right key should succeed");
        let membership = test_db.members.get_membership(student, course_id).await.unwrap();
        assert_eq!(membership.role, MembershipRole::Participant);

        let result = test_db.courses.delete_course(course_id).await;
        match result {
            Err(AppError::Conflict(msg)) => assert!(msg.contains("still")),
            other => panic!("Expected conflict, got {:?}", other),
        }

        test_db
            .members
            .remove_membership(student, course_id)
            .await
            .unwrap();

        let deletion = test_db.courses.delete_course(course_id).await.unwrap();
        assert_eq!(deletion.course_id, course_id);
        assert_eq!(deletion.mode, DeletionMode::Hard);
    }

    #[rocket::async_test]
    async fn test_enrollment_committed_before_delete_blocks_it() {
        let test_db = TestDbBuilder::new()
            .user("creator")
            .user("student")
            .course("Algebra 101", "k1", "creator")
            .file_backed()
            .build()
            .await
            .unwrap();
        let course_id = test_db.course_id("Algebra 101");

        test_db
            .members
            .enroll_user(test_db.user_id("student"), course_id, "k1")
            .await
            .unwrap();
        let result = test_db.courses.delete_course(course_id).await;

        assert!(matches!(result, Err(AppError::Conflict(_))));
        assert!(test_db.courses.get_course(course_id).await.is_ok());
        assert_eq!(test_db.count_rows("user_has_course").await, 2);
    }

    #[rocket::async_test]
    async fn test_enrollment_committed_during_delete_aborts_it() {
        let test_db = TestDbBuilder::new()
            .user("creator")
            .user("student")
            .course("Algebra 101", "k1", "creator")
            .file_backed()
            .build()
            .await
            .unwrap();
        let course_id = test_db.course_id("Algebra 101");

        let mut tx = TxScope::begin(&test_db.pool, "delete_course").await.unwrap();
        // The first read pins the deleting transaction's snapshot.
        assert_eq!(db::count_memberships(tx.conn(), course_id).await.unwrap(), 1);

        test_db
            .members
            .enroll_user(test_db.user_id("student"), course_id, "k1")
            .await
            .expect("Enrollment on the second connection should commit");

        let result = delete_in(tx.conn(), course_id, Duration::from_secs(600), Utc::now()).await;
        let finished = tx.finish(result).await;

        match finished {
            Err(AppError::Conflict(_)) | Err(AppError::Database(_)) => {}
            other => panic!("Delete should not survive the enrollment: {:?}", other),
        }
        assert!(test_db.courses.get_course(course_id).await.is_ok());
        assert_eq!(test_db.count_rows("forums").await, 1);
        assert_eq!(test_db.count_rows("user_has_course").await, 2);
        let creator = test_db
            .members
            .get_membership(test_db.user_id("creator"), course_id)
            .await
            .unwrap();
        assert_eq!(creator.role, MembershipRole::Creator);
    }

    #[rocket::async_test]
    async fn test_enrollment_after_delete_is_not_found() {
        let test_db = TestDbBuilder::new()
            .user("creator")
            .user("student")
            .course("Algebra 101", "k1", "creator")
            .file_backed()
            .build()
            .await
            .unwrap();
        let course_id = test_db.course_id("Algebra 101");

        test_db.courses.delete_course(course_id).await.unwrap();
        let result = test_db
            .members
            .enroll_user(test_db.user_id("student"), course_id, "k1")
            .await;

        assert!(matches!(result, Err(AppError::NotFound(_))));
        assert_eq!(test_db.count_rows("user_has_course").await, 0);
    }
}
