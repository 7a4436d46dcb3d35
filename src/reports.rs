use crate::grading::{self, KcseGrade, StudentScores};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }
}

/// Term/year narrowing shared by every report. `None` means "all".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFilters {
    pub term: Option<String>,
    pub year: Option<i64>,
}

impl ReportFilters {
    fn matches(&self, term: Option<&str>, year: Option<i64>) -> bool {
        let term_ok = self
            .term
            .as_deref()
            .map(|want| term.map(|t| t.eq_ignore_ascii_case(want)).unwrap_or(false))
            .unwrap_or(true);
        let year_ok = self.year.map(|want| year == Some(want)).unwrap_or(true);
        term_ok && year_ok
    }
}

pub fn parse_report_filters(params: &serde_json::Value) -> Result<ReportFilters, ReportError> {
    let term = match params.get("term") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(s) = v.as_str() else {
                return Err(ReportError::new(
                    "bad_params",
                    "term must be a string or null",
                ));
            };
            let t = s.trim();
            if t.is_empty() || t.eq_ignore_ascii_case("ALL") {
                None
            } else {
                Some(t.to_string())
            }
        }
    };

    let year = match params.get("year") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            let Some(n) = v.as_i64() else {
                return Err(ReportError::new("bad_params", "year must be an integer"));
            };
            Some(n)
        }
    };

    Ok(ReportFilters { term, year })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSummary {
    pub id: String,
    pub name: String,
    pub form_level: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingRow {
    pub student_id: String,
    pub admission_number: String,
    pub display_name: String,
    pub average: f64,
    pub grade: KcseGrade,
    pub position: usize,
    pub position_label: String,
    pub score_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRankingModel {
    pub class: ClassSummary,
    pub filters: ReportFilters,
    pub student_count: usize,
    pub rows: Vec<RankingRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentSummary {
    pub id: String,
    pub admission_number: String,
    pub display_name: String,
    pub class_id: Option<String>,
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentGradeLine {
    pub grade_id: String,
    pub subject_id: String,
    pub subject: String,
    pub teacher: String,
    pub exam: Option<String>,
    pub term: Option<String>,
    pub year: Option<i64>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReportModel {
    pub student: StudentSummary,
    pub filters: ReportFilters,
    pub average_score: f64,
    pub grade: Option<KcseGrade>,
    pub position: Option<usize>,
    pub position_label: Option<String>,
    pub ranked_in_class: usize,
    pub grades: Vec<StudentGradeLine>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject_id: String,
    pub subject: String,
    pub average_score: f64,
    pub grade: KcseGrade,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReportModel {
    pub class: ClassSummary,
    pub filters: ReportFilters,
    pub subjects: Vec<SubjectAverage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamScore {
    pub exam: Option<String>,
    pub score: f64,
    pub term: Option<String>,
    pub year: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherGradeRow {
    pub student_id: String,
    pub display_name: String,
    pub average_score: f64,
    pub grade: KcseGrade,
    pub exams: Vec<ExamScore>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherGradesModel {
    pub class: ClassSummary,
    pub subject_id: String,
    pub subject: String,
    pub filters: ReportFilters,
    pub rows: Vec<TeacherGradeRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupAverage {
    pub id: String,
    pub name: String,
    pub average_score: f64,
    pub entries: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub filters: ReportFilters,
    pub class_performance: Vec<GroupAverage>,
    pub subject_performance: Vec<GroupAverage>,
}

#[derive(Debug, Clone)]
struct ClassStudent {
    id: String,
    admission_number: String,
    display_name: String,
}

fn display_name(first: &str, last: &str) -> String {
    format!("{} {}", first, last)
}

pub fn class_summary(conn: &Connection, class_id: &str) -> Result<ClassSummary, ReportError> {
    conn.query_row(
        "SELECT id, name, form_level FROM classrooms WHERE id = ?",
        [class_id],
        |r| {
            Ok(ClassSummary {
                id: r.get(0)?,
                name: r.get(1)?,
                form_level: r.get(2)?,
            })
        },
    )
    .optional()
    .map_err(ReportError::db)?
    .ok_or_else(|| ReportError::new("not_found", "class not found"))
}

fn class_students(conn: &Connection, class_id: &str) -> Result<Vec<ClassStudent>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, admission_number, first_name, last_name
             FROM students
             WHERE class_id = ?
             ORDER BY last_name, first_name, admission_number",
        )
        .map_err(ReportError::db)?;
    let rows = stmt
        .query_map([class_id], |r| {
            let first: String = r.get(2)?;
            let last: String = r.get(3)?;
            Ok(ClassStudent {
                id: r.get(0)?,
                admission_number: r.get(1)?,
                display_name: display_name(&first, &last),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;
    Ok(rows)
}

/// Ranks the students currently in a class by all of their grades, so a
/// student who changed class keeps the same average here as on their own
/// report. Students without matching grades are counted but not ranked.
pub fn compute_class_ranking(
    conn: &Connection,
    class_id: &str,
    filters: &ReportFilters,
) -> Result<ClassRankingModel, ReportError> {
    let class = class_summary(conn, class_id)?;
    let students = class_students(conn, class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT g.student_id, g.score, g.term, g.year
             FROM grades g
             JOIN students s ON s.id = g.student_id
             WHERE s.class_id = ?",
        )
        .map_err(ReportError::db)?;
    let grade_rows: Vec<(String, f64, Option<String>, Option<i64>)> = stmt
        .query_map([class_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;

    let mut scores_by_student: HashMap<String, Vec<f64>> = HashMap::new();
    for (student_id, score, term, year) in grade_rows {
        if filters.matches(term.as_deref(), year) {
            scores_by_student.entry(student_id).or_default().push(score);
        }
    }

    let input: Vec<StudentScores> = students
        .iter()
        .map(|s| StudentScores {
            student_id: s.id.clone(),
            scores: scores_by_student.remove(&s.id).unwrap_or_default(),
        })
        .collect();
    let score_counts: HashMap<&str, usize> = input
        .iter()
        .map(|s| (s.student_id.as_str(), s.scores.len()))
        .collect();
    let by_id: HashMap<&str, &ClassStudent> =
        students.iter().map(|s| (s.id.as_str(), s)).collect();

    let rows = grading::rank_class(&input)
        .into_iter()
        .filter_map(|r| {
            let s = by_id.get(r.student_id.as_str())?;
            Some(RankingRow {
                admission_number: s.admission_number.clone(),
                display_name: s.display_name.clone(),
                average: r.average,
                grade: r.grade,
                position: r.position,
                position_label: grading::ordinal(r.position),
                score_count: score_counts.get(r.student_id.as_str()).copied().unwrap_or(0),
                student_id: r.student_id,
            })
        })
        .collect();

    Ok(ClassRankingModel {
        class,
        filters: filters.clone(),
        student_count: students.len(),
        rows,
    })
}

pub fn compute_student_report(
    conn: &Connection,
    student_id: &str,
    filters: &ReportFilters,
) -> Result<StudentReportModel, ReportError> {
    let student: Option<StudentSummary> = conn
        .query_row(
            "SELECT s.id, s.admission_number, s.first_name, s.last_name, s.class_id, c.name
             FROM students s
             LEFT JOIN classrooms c ON c.id = s.class_id
             WHERE s.id = ?",
            [student_id],
            |r| {
                let first: String = r.get(2)?;
                let last: String = r.get(3)?;
                Ok(StudentSummary {
                    id: r.get(0)?,
                    admission_number: r.get(1)?,
                    display_name: display_name(&first, &last),
                    class_id: r.get(4)?,
                    class_name: r.get(5)?,
                })
            },
        )
        .optional()
        .map_err(ReportError::db)?;
    let Some(student) = student else {
        return Err(ReportError::new("not_found", "student not found"));
    };

    let mut stmt = conn
        .prepare(
            "SELECT g.id, g.subject_id, sub.name, u.name, g.exam, g.term, g.year, g.score
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             JOIN users u ON u.id = g.teacher_id
             WHERE g.student_id = ?
             ORDER BY g.year, g.term, sub.name, g.recorded_at",
        )
        .map_err(ReportError::db)?;
    let grades: Vec<StudentGradeLine> = stmt
        .query_map([student_id], |r| {
            Ok(StudentGradeLine {
                grade_id: r.get(0)?,
                subject_id: r.get(1)?,
                subject: r.get(2)?,
                teacher: r.get(3)?,
                exam: r.get(4)?,
                term: r.get(5)?,
                year: r.get(6)?,
                score: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?
        .into_iter()
        .filter(|g| filters.matches(g.term.as_deref(), g.year))
        .collect();

    let scores: Vec<f64> = grades.iter().map(|g| g.score).collect();
    let average = grading::mean(&scores).map(grading::round_2_decimals);

    let (position, ranked_in_class) = match student.class_id.as_deref() {
        Some(class_id) => {
            let ranking = compute_class_ranking(conn, class_id, filters)?;
            let position = ranking
                .rows
                .iter()
                .find(|r| r.student_id == student.id)
                .map(|r| r.position);
            (position, ranking.rows.len())
        }
        None => (None, 0),
    };

    Ok(StudentReportModel {
        student,
        filters: filters.clone(),
        average_score: average.unwrap_or(0.0),
        grade: average.map(grading::kcse_grade),
        position,
        position_label: position.map(grading::ordinal),
        ranked_in_class,
        grades,
    })
}

pub fn compute_class_report(
    conn: &Connection,
    class_id: &str,
    filters: &ReportFilters,
) -> Result<ClassReportModel, ReportError> {
    let class = class_summary(conn, class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT g.subject_id, sub.name, g.score, g.term, g.year
             FROM grades g
             JOIN subjects sub ON sub.id = g.subject_id
             WHERE g.class_id = ?
             ORDER BY sub.name",
        )
        .map_err(ReportError::db)?;
    let rows: Vec<(String, String, f64, Option<String>, Option<i64>)> = stmt
        .query_map([class_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;

    let mut order: Vec<(String, String)> = Vec::new();
    let mut scores: HashMap<String, Vec<f64>> = HashMap::new();
    for (subject_id, subject_name, score, term, year) in rows {
        if !filters.matches(term.as_deref(), year) {
            continue;
        }
        let bucket = scores.entry(subject_id.clone()).or_default();
        if bucket.is_empty() {
            order.push((subject_id, subject_name));
        }
        bucket.push(score);
    }

    let subjects = order
        .into_iter()
        .filter_map(|(subject_id, subject)| {
            let values = scores.get(&subject_id)?;
            let average_score = grading::round_2_decimals(grading::mean(values)?);
            Some(SubjectAverage {
                entries: values.len(),
                grade: grading::kcse_grade(average_score),
                average_score,
                subject_id,
                subject,
            })
        })
        .collect();

    Ok(ClassReportModel {
        class,
        filters: filters.clone(),
        subjects,
    })
}

pub fn compute_teacher_grades(
    conn: &Connection,
    class_id: &str,
    subject_id: &str,
    filters: &ReportFilters,
) -> Result<TeacherGradesModel, ReportError> {
    let class = class_summary(conn, class_id)?;
    let subject: Option<String> = conn
        .query_row(
            "SELECT name FROM subjects WHERE id = ?",
            [subject_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(ReportError::db)?;
    let Some(subject) = subject else {
        return Err(ReportError::new("not_found", "subject not found"));
    };

    let students = class_students(conn, class_id)?;

    let mut stmt = conn
        .prepare(
            "SELECT student_id, exam, score, term, year
             FROM grades
             WHERE class_id = ? AND subject_id = ?
             ORDER BY year, term, recorded_at",
        )
        .map_err(ReportError::db)?;
    let grade_rows: Vec<(String, Option<String>, f64, Option<String>, Option<i64>)> = stmt
        .query_map((class_id, subject_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;

    let mut exams_by_student: HashMap<String, Vec<ExamScore>> = HashMap::new();
    for (student_id, exam, score, term, year) in grade_rows {
        if !filters.matches(term.as_deref(), year) {
            continue;
        }
        exams_by_student
            .entry(student_id)
            .or_default()
            .push(ExamScore {
                exam,
                score,
                term,
                year,
            });
    }

    let rows = students
        .into_iter()
        .filter_map(|s| {
            let exams = exams_by_student.remove(&s.id)?;
            let values: Vec<f64> = exams.iter().map(|e| e.score).collect();
            let average_score = grading::round_2_decimals(grading::mean(&values)?);
            Some(TeacherGradeRow {
                student_id: s.id,
                display_name: s.display_name,
                average_score,
                grade: grading::kcse_grade(average_score),
                exams,
            })
        })
        .collect();

    Ok(TeacherGradesModel {
        class,
        subject_id: subject_id.to_string(),
        subject,
        filters: filters.clone(),
        rows,
    })
}

fn group_averages(
    conn: &Connection,
    sql: &str,
    filters: &ReportFilters,
) -> Result<Vec<GroupAverage>, ReportError> {
    let mut stmt = conn.prepare(sql).map_err(ReportError::db)?;
    let rows: Vec<(String, String, f64, Option<String>, Option<i64>)> = stmt
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(ReportError::db)?;

    let mut order: Vec<(String, String)> = Vec::new();
    let mut scores: HashMap<String, Vec<f64>> = HashMap::new();
    for (id, name, score, term, year) in rows {
        if !filters.matches(term.as_deref(), year) {
            continue;
        }
        let bucket = scores.entry(id.clone()).or_default();
        if bucket.is_empty() {
            order.push((id, name));
        }
        bucket.push(score);
    }

    Ok(order
        .into_iter()
        .filter_map(|(id, name)| {
            let values = scores.get(&id)?;
            Some(GroupAverage {
                average_score: grading::round_2_decimals(grading::mean(values)?),
                entries: values.len(),
                id,
                name,
            })
        })
        .collect())
}

pub fn compute_performance_summary(
    conn: &Connection,
    filters: &ReportFilters,
) -> Result<PerformanceSummary, ReportError> {
    let class_performance = group_averages(
        conn,
        "SELECT c.id, c.name, g.score, g.term, g.year
         FROM grades g
         JOIN classrooms c ON c.id = g.class_id
         ORDER BY c.name",
        filters,
    )?;
    let subject_performance = group_averages(
        conn,
        "SELECT sub.id, sub.name, g.score, g.term, g.year
         FROM grades g
         JOIN subjects sub ON sub.id = g.subject_id
         ORDER BY sub.name",
        filters,
    )?;
    Ok(PerformanceSummary {
        filters: filters.clone(),
        class_performance,
        subject_performance,
    })
}
