use std::sync::Arc;

use sqlx::{Row, sqlite::{SqlitePool, SqlitePoolOptions}};
use tracing::{debug, info};

use crate::claims::GroupClaim;
use crate::launch::{AuthorizationContext, CAP_KIALO_ADMIN};

/// Course roles the host knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Teacher,
    Student,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Teacher => "teacher",
            Role::Student => "student",
        }
    }

    fn from_db(value: &str) -> Option<Self> {
        match value {
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    fn has_capability(&self, capability: &str) -> bool {
        match self {
            Role::Teacher => capability == CAP_KIALO_ADMIN,
            Role::Student => false,
        }
    }
}

/// Capability view of one user's enrolment in one course.
///
/// The launch flow only sees this interface, never the enrolment rows.
#[derive(Debug, Clone)]
pub struct EnrolmentAuthorization {
    role: Option<Role>,
}

impl EnrolmentAuthorization {
    pub fn with_role(role: Option<Role>) -> Self {
        Self { role }
    }
}

impl AuthorizationContext for EnrolmentAuthorization {
    fn has_capability(&self, capability: &str) -> bool {
        self.role.is_some_and(|role| role.has_capability(capability))
    }
}

/// Identity of the authenticated user as the host session reports it.
///
/// Built fresh at authentication time and folded into the signed ID token;
/// never persisted by the launch flow itself.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub id: i64,
    pub username: String,
    pub given_name: String,
    pub family_name: String,
    pub middle_name: Option<String>,
    pub email: String,
    pub locale: String,
    pub timezone: String,
    pub picture_url: Option<String>,
}

impl UserIdentity {
    /// Stable subject identifier used as the `sub` claim
    pub fn subject_id(&self) -> String {
        self.id.to_string()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.given_name, self.family_name)
    }
}

/// A course
#[derive(Debug, Clone)]
pub struct Course {
    pub id: i64,
    pub name: String,
}

/// A course module embedding one Kialo discussion
#[derive(Debug, Clone)]
pub struct CourseModule {
    pub id: i64,
    pub course_id: i64,
    pub name: String,
    pub deployment_id: String,
    pub discussion_url: Option<String>,
    pub discussion_title: Option<String>,
    pub grade_max: Option<f64>,
    pub grades_released: Option<bool>,
}

/// A stored grade
#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub score: Option<f64>,
    pub comment: Option<String>,
    pub graded_at: String,
}

// Demo fixture identifiers, shared by the platform seed and the tool script
pub const DEMO_COURSE_ID: i64 = 7;
pub const DEMO_TEACHER_ID: i64 = 101;
pub const DEMO_STUDENT_ID: i64 = 102;
pub const DEMO_GROUPED_STUDENT_ID: i64 = 103;
pub const DEMO_MODULE_ID: i64 = 501;
pub const DEMO_DEPLOYMENT_ID: &str = "deployment-1";

/// SQLite-backed store for the host's courses, enrolments, modules and grades.
///
/// Plays the part of the LMS data layer the launch flow and grading adapter
/// are embedded in.
#[derive(Debug, Clone)]
pub struct CourseStore {
    pool: Arc<SqlitePool>,
}

impl CourseStore {
    pub async fn new(db_url: &str) -> Result<Self, sqlx::Error> {
        let pool = SqlitePool::connect(db_url).await?;
        Self::from_pool(pool).await
    }

    /// In-memory store for tests and local experiments
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                given_name TEXT NOT NULL,
                family_name TEXT NOT NULL,
                middle_name TEXT,
                email TEXT NOT NULL,
                locale TEXT NOT NULL DEFAULT 'en',
                timezone TEXT NOT NULL DEFAULT 'UTC',
                picture_url TEXT
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS courses (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS enrolments (
                course_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (course_id, user_id)
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS course_groups (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL,
                name TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS group_members (
                group_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                joined_at TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS course_modules (
                id INTEGER PRIMARY KEY,
                course_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                deployment_id TEXT NOT NULL,
                discussion_url TEXT,
                discussion_title TEXT,
                grade_max REAL,
                grades_released INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS grades (
                course_id INTEGER NOT NULL,
                cm_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                score REAL,
                comment TEXT,
                graded_at TEXT NOT NULL,
                PRIMARY KEY (course_id, cm_id, user_id)
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn add_user(&self, user: &UserIdentity) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO users
             (id, username, given_name, family_name, middle_name, email, locale, timezone, picture_url)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(&user.given_name)
        .bind(&user.family_name)
        .bind(&user.middle_name)
        .bind(&user.email)
        .bind(&user.locale)
        .bind(&user.timezone)
        .bind(&user.picture_url)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn user(&self, id: i64) -> Result<Option<UserIdentity>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(|row| UserIdentity {
            id: row.get("id"),
            username: row.get("username"),
            given_name: row.get("given_name"),
            family_name: row.get("family_name"),
            middle_name: row.get("middle_name"),
            email: row.get("email"),
            locale: row.get("locale"),
            timezone: row.get("timezone"),
            picture_url: row.get("picture_url"),
        }))
    }

    pub async fn add_course(&self, id: i64, name: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO courses (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn course(&self, id: i64) -> Result<Option<Course>, sqlx::Error> {
        let row = sqlx::query("SELECT id, name FROM courses WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(|row| Course {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }

    pub async fn enrol(
        &self,
        course_id: i64,
        user_id: i64,
        role: Role,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO enrolments (course_id, user_id, role) VALUES (?, ?, ?)",
        )
        .bind(course_id)
        .bind(user_id)
        .bind(role.as_str())
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn enrolment_role(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<Role>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT role FROM enrolments WHERE course_id = ? AND user_id = ?",
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.and_then(|row| Role::from_db(row.get::<String, _>("role").as_str())))
    }

    pub async fn is_enrolled(&self, course_id: i64, user_id: i64) -> Result<bool, sqlx::Error> {
        Ok(self.enrolment_role(course_id, user_id).await?.is_some())
    }

    /// Capability view of a user's enrolment, consumed by the launch flow
    pub async fn authorization(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<EnrolmentAuthorization, sqlx::Error> {
        let role = self.enrolment_role(course_id, user_id).await?;
        Ok(EnrolmentAuthorization::with_role(role))
    }

    pub async fn add_group(
        &self,
        id: i64,
        course_id: i64,
        name: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT OR REPLACE INTO course_groups (id, course_id, name) VALUES (?, ?, ?)")
            .bind(id)
            .bind(course_id)
            .bind(name)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_group_member(
        &self,
        group_id: i64,
        user_id: i64,
        joined_at: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO group_members (group_id, user_id, joined_at) VALUES (?, ?, ?)",
        )
        .bind(group_id)
        .bind(user_id)
        .bind(joined_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// The group a launch is scoped to for this user.
    ///
    /// With a single membership that group wins; with several, the most
    /// recently joined one does.
    pub async fn latest_group(
        &self,
        course_id: i64,
        user_id: i64,
    ) -> Result<Option<GroupClaim>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT g.id, g.name FROM course_groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE g.course_id = ? AND m.user_id = ?
             ORDER BY m.joined_at DESC
             LIMIT 1",
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|row| GroupClaim {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }

    pub async fn add_module(&self, module: &CourseModule) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT OR REPLACE INTO course_modules
             (id, course_id, name, deployment_id, discussion_url, discussion_title, grade_max, grades_released)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(module.id)
        .bind(module.course_id)
        .bind(&module.name)
        .bind(&module.deployment_id)
        .bind(&module.discussion_url)
        .bind(&module.discussion_title)
        .bind(module.grade_max)
        .bind(module.grades_released)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    pub async fn module(&self, cm_id: i64) -> Result<Option<CourseModule>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM course_modules WHERE id = ?")
            .bind(cm_id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(row.map(|row| CourseModule {
            id: row.get("id"),
            course_id: row.get("course_id"),
            name: row.get("name"),
            deployment_id: row.get("deployment_id"),
            discussion_url: row.get("discussion_url"),
            discussion_title: row.get("discussion_title"),
            grade_max: row.get("grade_max"),
            grades_released: row.get("grades_released"),
        }))
    }

    /// Find the module a deployment belongs to
    pub async fn module_by_deployment(
        &self,
        deployment_id: &str,
    ) -> Result<Option<CourseModule>, sqlx::Error> {
        let row = sqlx::query("SELECT id FROM course_modules WHERE deployment_id = ?")
            .bind(deployment_id)
            .fetch_optional(&*self.pool)
            .await?;

        match row {
            Some(row) => self.module(row.get("id")).await,
            None => Ok(None),
        }
    }

    /// Store the discussion a module points at, as selected via deep linking
    pub async fn set_discussion(
        &self,
        cm_id: i64,
        discussion_url: &str,
        discussion_title: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE course_modules SET discussion_url = ?, discussion_title = ? WHERE id = ?",
        )
        .bind(discussion_url)
        .bind(discussion_title)
        .bind(cm_id)
        .execute(&*self.pool)
        .await?;

        let updated = result.rows_affected() > 0;
        if updated {
            info!("Updated discussion URL for module {}: {}", cm_id, discussion_url);
        }
        Ok(updated)
    }

    pub async fn write_grade(
        &self,
        course_id: i64,
        cm_id: i64,
        user_id: i64,
        score: Option<f64>,
        comment: Option<&str>,
        graded_at: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO grades (course_id, cm_id, user_id, score, comment, graded_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(course_id, cm_id, user_id) DO UPDATE SET
                score = excluded.score,
                comment = excluded.comment,
                graded_at = excluded.graded_at",
        )
        .bind(course_id)
        .bind(cm_id)
        .bind(user_id)
        .bind(score)
        .bind(comment)
        .bind(graded_at)
        .execute(&*self.pool)
        .await?;

        debug!("Wrote grade for user {} in module {}: {:?}", user_id, cm_id, score);
        Ok(())
    }

    pub async fn grade(
        &self,
        course_id: i64,
        cm_id: i64,
        user_id: i64,
    ) -> Result<Option<GradeRecord>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT score, comment, graded_at FROM grades
             WHERE course_id = ? AND cm_id = ? AND user_id = ?",
        )
        .bind(course_id)
        .bind(cm_id)
        .bind(user_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(|row| GradeRecord {
            score: row.get("score"),
            comment: row.get("comment"),
            graded_at: row.get("graded_at"),
        }))
    }

    /// Seed the demo course used by the platform and tool binaries
    pub async fn seed_demo(&self) -> Result<(), sqlx::Error> {
        self.add_course(DEMO_COURSE_ID, "Argumentation 101").await?;

        self.add_user(&UserIdentity {
            id: DEMO_TEACHER_ID,
            username: "ana.instructor".to_string(),
            given_name: "Ana".to_string(),
            family_name: "Silva".to_string(),
            middle_name: None,
            email: "ana@school.example".to_string(),
            locale: "en".to_string(),
            timezone: "Europe/Berlin".to_string(),
            picture_url: None,
        })
        .await?;
        self.add_user(&UserIdentity {
            id: DEMO_STUDENT_ID,
            username: "ben.learner".to_string(),
            given_name: "Ben".to_string(),
            family_name: "Okafor".to_string(),
            middle_name: Some("Chidi".to_string()),
            email: "ben@school.example".to_string(),
            locale: "en".to_string(),
            timezone: "UTC".to_string(),
            picture_url: None,
        })
        .await?;
        self.add_user(&UserIdentity {
            id: DEMO_GROUPED_STUDENT_ID,
            username: "cara.learner".to_string(),
            given_name: "Cara".to_string(),
            family_name: "Nguyen".to_string(),
            middle_name: None,
            email: "cara@school.example".to_string(),
            locale: "de".to_string(),
            timezone: "UTC".to_string(),
            picture_url: None,
        })
        .await?;

        self.enrol(DEMO_COURSE_ID, DEMO_TEACHER_ID, Role::Teacher).await?;
        self.enrol(DEMO_COURSE_ID, DEMO_STUDENT_ID, Role::Student).await?;
        self.enrol(DEMO_COURSE_ID, DEMO_GROUPED_STUDENT_ID, Role::Student).await?;

        self.add_group(21, DEMO_COURSE_ID, "Red team").await?;
        self.add_group_member(21, DEMO_GROUPED_STUDENT_ID, "2024-01-10T08:00:00Z")
            .await?;

        self.add_module(&CourseModule {
            id: DEMO_MODULE_ID,
            course_id: DEMO_COURSE_ID,
            name: "Climate debate".to_string(),
            deployment_id: DEMO_DEPLOYMENT_ID.to_string(),
            discussion_url: None,
            discussion_title: None,
            grade_max: Some(100.0),
            grades_released: Some(true),
        })
        .await?;

        info!("Seeded demo course {}", DEMO_COURSE_ID);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enrolment_roles_and_capabilities() {
        let store = CourseStore::in_memory().await.unwrap();
        store.seed_demo().await.unwrap();

        let teacher = store
            .enrolment_role(DEMO_COURSE_ID, DEMO_TEACHER_ID)
            .await
            .unwrap();
        assert_eq!(teacher, Some(Role::Teacher));

        let authz = store
            .authorization(DEMO_COURSE_ID, DEMO_TEACHER_ID)
            .await
            .unwrap();
        assert!(authz.has_capability(CAP_KIALO_ADMIN));

        let authz = store
            .authorization(DEMO_COURSE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap();
        assert!(!authz.has_capability(CAP_KIALO_ADMIN));

        // Unenrolled users hold no capabilities at all
        let authz = store.authorization(DEMO_COURSE_ID, 9999).await.unwrap();
        assert!(!authz.has_capability(CAP_KIALO_ADMIN));
    }

    #[tokio::test]
    async fn test_latest_group_wins_on_multiple_memberships() {
        let store = CourseStore::in_memory().await.unwrap();
        store.seed_demo().await.unwrap();

        assert_eq!(
            store
                .latest_group(DEMO_COURSE_ID, DEMO_STUDENT_ID)
                .await
                .unwrap(),
            None
        );

        store.add_group(22, DEMO_COURSE_ID, "Blue team").await.unwrap();
        store
            .add_group_member(21, DEMO_STUDENT_ID, "2024-01-10T08:00:00Z")
            .await
            .unwrap();
        store
            .add_group_member(22, DEMO_STUDENT_ID, "2024-03-02T12:30:00Z")
            .await
            .unwrap();

        let group = store
            .latest_group(DEMO_COURSE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(group.id, 22);
        assert_eq!(group.name, "Blue team");
    }

    #[tokio::test]
    async fn test_grade_write_read_and_clear() {
        let store = CourseStore::in_memory().await.unwrap();
        store.seed_demo().await.unwrap();

        store
            .write_grade(
                DEMO_COURSE_ID,
                DEMO_MODULE_ID,
                DEMO_STUDENT_ID,
                Some(72.0),
                Some("Good arguments"),
                "2024-05-01T10:00:00Z",
            )
            .await
            .unwrap();

        let grade = store
            .grade(DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grade.score, Some(72.0));
        assert_eq!(grade.comment.as_deref(), Some("Good arguments"));

        // A null score clears the grade
        store
            .write_grade(
                DEMO_COURSE_ID,
                DEMO_MODULE_ID,
                DEMO_STUDENT_ID,
                None,
                None,
                "2024-05-02T10:00:00Z",
            )
            .await
            .unwrap();
        let grade = store
            .grade(DEMO_COURSE_ID, DEMO_MODULE_ID, DEMO_STUDENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grade.score, None);
    }

    #[tokio::test]
    async fn test_set_discussion() {
        let store = CourseStore::in_memory().await.unwrap();
        store.seed_demo().await.unwrap();

        let updated = store
            .set_discussion(DEMO_MODULE_ID, "https://kialo.example/p/42", Some("Climate"))
            .await
            .unwrap();
        assert!(updated);

        let module = store.module(DEMO_MODULE_ID).await.unwrap().unwrap();
        assert_eq!(module.discussion_url.as_deref(), Some("https://kialo.example/p/42"));
        assert_eq!(module.discussion_title.as_deref(), Some("Climate"));

        // Unknown module is reported, not an error
        assert!(!store.set_discussion(9999, "https://x", None).await.unwrap());
    }
}
