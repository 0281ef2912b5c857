use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::ScoreUpdate;
use crate::course_store::{CourseStore, GradeRecord};
use crate::error::LtiError;

/// Maximum score assumed for activities that predate grading
pub const DEFAULT_SCORE_MAXIMUM: f64 = 100.0;

/// AGS line-item descriptor returned to the tool
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub id: String,
    pub label: String,
    pub score_maximum: f64,
    pub resource_link_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grades_released: Option<bool>,
}

/// Translates AGS calls from the tool backend into gradebook operations.
///
/// Failed grade writes for unknown or unenrolled users are a permission
/// boundary and reported as `false`, never as an error.
#[derive(Clone)]
pub struct GradingService {
    courses: CourseStore,
}

impl GradingService {
    pub fn new(courses: CourseStore) -> Self {
        Self { courses }
    }

    /// Describe the line item of a module instance.
    ///
    /// `request_url` becomes the line item's `id` so the tool can address
    /// this exact line item later.
    pub async fn line_item(
        &self,
        course_id: i64,
        cm_id: i64,
        resource_link_id: &str,
        request_url: &str,
    ) -> Result<LineItem, LtiError> {
        let module = self
            .courses
            .module(cm_id)
            .await?
            .filter(|m| m.course_id == course_id)
            .ok_or_else(|| LtiError::NotFound(format!("module {cm_id} in course {course_id}")))?;

        Ok(LineItem {
            id: request_url.to_string(),
            label: module.name,
            score_maximum: module.grade_max.unwrap_or(DEFAULT_SCORE_MAXIMUM),
            resource_link_id: resource_link_id.to_string(),
            tag: Some("kialo".to_string()),
            start_date_time: None,
            end_date_time: None,
            grades_released: module.grades_released,
        })
    }

    /// Apply a score postback to the gradebook.
    ///
    /// A null `scoreGiven` clears the grade; the timestamp defaults to now.
    pub async fn update_grade(
        &self,
        course_id: i64,
        cm_id: i64,
        data: &ScoreUpdate,
    ) -> Result<bool, LtiError> {
        if self.courses.user(data.user_id).await?.is_none() {
            warn!("Refusing grade update for unknown user {}", data.user_id);
            return Ok(false);
        }
        if !self.courses.is_enrolled(course_id, data.user_id).await? {
            warn!(
                "Refusing grade update for user {} not enrolled in course {}",
                data.user_id, course_id
            );
            return Ok(false);
        }
        let module = self.courses.module(cm_id).await?;
        if !module.is_some_and(|m| m.course_id == course_id) {
            warn!("Refusing grade update for unknown module {}", cm_id);
            return Ok(false);
        }

        let graded_at = match &data.timestamp {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(parsed) => parsed.with_timezone(&Utc).to_rfc3339(),
                Err(e) => {
                    warn!("Refusing grade update with invalid timestamp {:?}: {}", raw, e);
                    return Ok(false);
                }
            },
            None => Utc::now().to_rfc3339(),
        };

        self.courses
            .write_grade(
                course_id,
                cm_id,
                data.user_id,
                data.score_given,
                data.comment.as_deref(),
                &graded_at,
            )
            .await?;

        info!(
            "Updated grade for user {} in module {}: {:?}",
            data.user_id, cm_id, data.score_given
        );
        Ok(true)
    }

    /// Read a stored grade back
    pub async fn grade(
        &self,
        course_id: i64,
        cm_id: i64,
        user_id: i64,
    ) -> Result<Option<GradeRecord>, LtiError> {
        Ok(self.courses.grade(course_id, cm_id, user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::course_store::{
        CourseModule, DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID,
    };

    async fn test_service() -> GradingService {
        let courses = CourseStore::in_memory().await.unwrap();
        courses.seed_demo().await.unwrap();
        GradingService::new(courses)
    }

    fn score(user_id: i64, score_given: Option<f64>) -> ScoreUpdate {
        ScoreUpdate {
            user_id,
            score_given,
            comment: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_line_item_uses_request_url_and_gradebook_maximum() {
        let service = test_service().await;

        let url = "http://platform.example/lti/lineitem?course_id=7&cmid=501&resource_link_id=501";
        let item = service
            .line_item(DEMO_COURSE_ID, DEMO_MODULE_ID, "501", url)
            .await
            .unwrap();

        assert_eq!(item.id, url);
        assert_eq!(item.label, "Climate debate");
        assert_eq!(item.score_maximum, 100.0);
        assert_eq!(item.resource_link_id, "501");
        assert_eq!(item.grades_released, Some(true));
    }

    #[tokio::test]
    async fn test_line_item_defaults_maximum_when_gradebook_has_none() {
        let service = test_service().await;
        service
            .courses
            .add_module(&CourseModule {
                id: 502,
                course_id: DEMO_COURSE_ID,
                name: "Ungraded debate".to_string(),
                deployment_id: "deployment-2".to_string(),
                discussion_url: None,
                discussion_title: None,
                grade_max: None,
                grades_released: None,
            })
            .await
            .unwrap();

        let item = service
            .line_item(DEMO_COURSE_ID, 502, "502", "http://platform.example/x")
            .await
            .unwrap();
        assert_eq!(item.score_maximum, DEFAULT_SCORE_MAXIMUM);
    }

    #[tokio::test]
    async fn test_update_grade_round_trip() {
        let service = test_service().await;

        let accepted = service
            .update_grade(
                DEMO_COURSE_ID,
                DEMO_MODULE_ID,
                &score(DEMO_STUDENT_ID, Some(72.0)),
            )
            .await
            .unwrap();
        assert!(accepted);

        let grade = service
            .grade(DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grade.score, Some(72.0));
    }

    #[tokio::test]
    async fn test_update_grade_rejects_unknown_or_unenrolled_users() {
        let service = test_service().await;

        // Nonexistent user
        let accepted = service
            .update_grade(DEMO_COURSE_ID, DEMO_MODULE_ID, &score(9999, Some(50.0)))
            .await
            .unwrap();
        assert!(!accepted);

        // Existing user who is not enrolled in the course
        service
            .courses
            .add_user(&crate::course_store::UserIdentity {
                id: 200,
                username: "drew.outsider".to_string(),
                given_name: "Drew".to_string(),
                family_name: "Larsen".to_string(),
                middle_name: None,
                email: "drew@school.example".to_string(),
                locale: "en".to_string(),
                timezone: "UTC".to_string(),
                picture_url: None,
            })
            .await
            .unwrap();
        let accepted = service
            .update_grade(DEMO_COURSE_ID, DEMO_MODULE_ID, &score(200, Some(50.0)))
            .await
            .unwrap();
        assert!(!accepted);
    }

    #[tokio::test]
    async fn test_update_grade_clears_with_null_score() {
        let service = test_service().await;

        service
            .update_grade(
                DEMO_COURSE_ID,
                DEMO_MODULE_ID,
                &score(DEMO_STUDENT_ID, Some(88.0)),
            )
            .await
            .unwrap();
        service
            .update_grade(DEMO_COURSE_ID, DEMO_MODULE_ID, &score(DEMO_STUDENT_ID, None))
            .await
            .unwrap();

        let grade = service
            .grade(DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grade.score, None);
    }

    #[tokio::test]
    async fn test_update_grade_honors_explicit_timestamp() {
        let service = test_service().await;

        let update = ScoreUpdate {
            user_id: DEMO_STUDENT_ID,
            score_given: Some(64.0),
            comment: Some("Solid rebuttals".to_string()),
            timestamp: Some("2024-05-01T10:00:00+02:00".to_string()),
        };
        assert!(
            service
                .update_grade(DEMO_COURSE_ID, DEMO_MODULE_ID, &update)
                .await
                .unwrap()
        );

        let grade = service
            .grade(DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grade.comment.as_deref(), Some("Solid rebuttals"));
        assert!(grade.graded_at.starts_with("2024-05-01T08:00:00"));

        // Malformed timestamps are a data error, not a crash
        let update = ScoreUpdate {
            user_id: DEMO_STUDENT_ID,
            score_given: Some(64.0),
            comment: None,
            timestamp: Some("yesterday".to_string()),
        };
        assert!(
            !service
                .update_grade(DEMO_COURSE_ID, DEMO_MODULE_ID, &update)
                .await
                .unwrap()
        );
    }
}
