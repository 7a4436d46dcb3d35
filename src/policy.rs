use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
    Student,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "parent" => Some(Role::Parent),
            "student" => Some(Role::Student),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Parent => "parent",
            Role::Student => "student",
        }
    }
}

/// Every operation that needs a logged-in caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    ManageUsers,
    ManageSettings,
    ManageBackups,
    ManageClasses,
    ManageSubjects,
    ManageStudents,
    ManageAssignments,
    ManageTimetable,
    ViewDirectory,
    ViewStudents,
    ViewTimetable,
    RecordGrades,
    DeleteGrades,
    ViewStudentGrades,
    ViewClassReports,
    ViewTeacherReports,
    ViewPerformanceSummary,
    ViewDashboard,
    /// Read any student record without being linked to it.
    ViewAnyStudent,
    /// Change or delete grades recorded by someone else.
    EditAnyGrade,
    /// Read a subject's grade sheet without teaching it.
    ViewAnyTeacherReport,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::ManageUsers => "manage users",
            Action::ManageSettings => "manage settings",
            Action::ManageBackups => "manage backups",
            Action::ManageClasses => "manage classes",
            Action::ManageSubjects => "manage subjects",
            Action::ManageStudents => "manage students",
            Action::ManageAssignments => "manage teaching assignments",
            Action::ManageTimetable => "manage the timetable",
            Action::ViewDirectory => "view classes and subjects",
            Action::ViewStudents => "view students",
            Action::ViewTimetable => "view the timetable",
            Action::RecordGrades => "record grades",
            Action::DeleteGrades => "delete grades",
            Action::ViewStudentGrades => "view student grades",
            Action::ViewClassReports => "view class reports",
            Action::ViewTeacherReports => "view teacher grade reports",
            Action::ViewPerformanceSummary => "view the performance summary",
            Action::ViewDashboard => "view the dashboard",
            Action::ViewAnyStudent => "view any student",
            Action::EditAnyGrade => "edit another teacher's grades",
            Action::ViewAnyTeacherReport => "view any teacher's grade sheet",
        }
    }

    fn allowed_roles(self) -> &'static [Role] {
        use Role::*;
        match self {
            Action::ManageUsers
            | Action::ManageSettings
            | Action::ManageBackups
            | Action::ManageClasses
            | Action::ManageSubjects
            | Action::ManageStudents
            | Action::ManageAssignments
            | Action::ManageTimetable
            | Action::ViewPerformanceSummary
            | Action::ViewDashboard
            | Action::EditAnyGrade
            | Action::ViewAnyTeacherReport => &[Admin],
            Action::RecordGrades => &[Teacher],
            Action::DeleteGrades
            | Action::ViewStudents
            | Action::ViewClassReports
            | Action::ViewTeacherReports
            | Action::ViewAnyStudent => &[Admin, Teacher],
            Action::ViewDirectory | Action::ViewTimetable | Action::ViewStudentGrades => {
                &[Admin, Teacher, Parent, Student]
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,
    #[error("invalid or expired session token")]
    InvalidToken,
    #[error("invalid credentials")]
    BadCredentials,
    #[error("{role} may not {action}")]
    Forbidden {
        role: &'static str,
        action: &'static str,
    },
    #[error("access denied")]
    NotOwner,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingToken | AuthError::InvalidToken | AuthError::BadCredentials => {
                "unauthenticated"
            }
            AuthError::Forbidden { .. } | AuthError::NotOwner => "forbidden",
            AuthError::Db(_) => "db_query_failed",
        }
    }
}

/// How a caller without `ViewAnyStudent` can still be tied to a student row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StudentLink {
    /// `students.user_id` is the caller's own login.
    OwnLogin,
    /// `students.parent_user_id` is the caller.
    Guardian,
}

pub fn student_link(role: Role) -> Option<StudentLink> {
    match role {
        Role::Student => Some(StudentLink::OwnLogin),
        Role::Parent => Some(StudentLink::Guardian),
        Role::Admin | Role::Teacher => None,
    }
}

pub fn permits(role: Role, action: Action) -> bool {
    action.allowed_roles().contains(&role)
}

/// The single role gate. Ownership rules that depend on stored rows are
/// checked by the caller afterwards.
pub fn authorize(role: Role, action: Action) -> Result<(), AuthError> {
    if permits(role, action) {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            role: role.as_str(),
            action: action.as_str(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_manages_but_does_not_record_grades() {
        assert!(authorize(Role::Admin, Action::ManageUsers).is_ok());
        assert!(authorize(Role::Admin, Action::ManageTimetable).is_ok());
        assert!(authorize(Role::Admin, Action::DeleteGrades).is_ok());
        let e = authorize(Role::Admin, Action::RecordGrades).expect_err("admins do not grade");
        assert_eq!(e.code(), "forbidden");
        assert_eq!(e.to_string(), "admin may not record grades");
    }

    #[test]
    fn teachers_grade_and_read_class_reports() {
        assert!(authorize(Role::Teacher, Action::RecordGrades).is_ok());
        assert!(authorize(Role::Teacher, Action::ViewClassReports).is_ok());
        assert!(authorize(Role::Teacher, Action::ViewTeacherReports).is_ok());
        assert!(authorize(Role::Teacher, Action::ManageTimetable).is_err());
        assert!(authorize(Role::Teacher, Action::ViewPerformanceSummary).is_err());
    }

    #[test]
    fn students_and_parents_are_read_only() {
        for role in [Role::Student, Role::Parent] {
            assert!(authorize(role, Action::ViewTimetable).is_ok());
            assert!(authorize(role, Action::ViewStudentGrades).is_ok());
            assert!(authorize(role, Action::ViewDirectory).is_ok());
            assert!(authorize(role, Action::ViewStudents).is_err());
            assert!(authorize(role, Action::RecordGrades).is_err());
            assert!(authorize(role, Action::ViewClassReports).is_err());
        }
    }

    #[test]
    fn only_admins_bypass_grade_and_sheet_ownership() {
        assert!(permits(Role::Admin, Action::EditAnyGrade));
        assert!(permits(Role::Admin, Action::ViewAnyTeacherReport));
        assert!(permits(Role::Admin, Action::ViewDashboard));
        for role in [Role::Teacher, Role::Parent, Role::Student] {
            assert!(!permits(role, Action::EditAnyGrade));
            assert!(!permits(role, Action::ViewAnyTeacherReport));
            assert!(!permits(role, Action::ViewDashboard));
        }
        let e = authorize(Role::Teacher, Action::EditAnyGrade).expect_err("teacher");
        assert_eq!(e.to_string(), "teacher may not edit another teacher's grades");
    }

    #[test]
    fn staff_see_any_student_others_need_a_link() {
        for role in [Role::Admin, Role::Teacher] {
            assert!(permits(role, Action::ViewAnyStudent));
            assert_eq!(student_link(role), None);
        }
        assert!(!permits(Role::Student, Action::ViewAnyStudent));
        assert!(!permits(Role::Parent, Action::ViewAnyStudent));
        assert_eq!(student_link(Role::Student), Some(StudentLink::OwnLogin));
        assert_eq!(student_link(Role::Parent), Some(StudentLink::Guardian));
    }

    #[test]
    fn role_parsing() {
        assert_eq!(Role::parse("Admin"), Some(Role::Admin));
        assert_eq!(Role::parse(" teacher "), Some(Role::Teacher));
        assert_eq!(Role::parse("janitor"), None);
        assert_eq!(Role::Parent.as_str(), "parent");
    }
}
