use serde::{Serialize, Serializer};
use std::fmt;

/// KCSE letter grades, best first. The derived `Ord` follows declaration
/// order, so `A < AMinus < ... < F`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KcseGrade {
    A,
    AMinus,
    BPlus,
    B,
    BMinus,
    CPlus,
    C,
    CMinus,
    DPlus,
    D,
    DMinus,
    F,
}

/// Inclusive lower bounds, highest first. Anything below the last bound is F.
const THRESHOLDS: [(f64, KcseGrade); 11] = [
    (80.0, KcseGrade::A),
    (75.0, KcseGrade::AMinus),
    (70.0, KcseGrade::BPlus),
    (65.0, KcseGrade::B),
    (60.0, KcseGrade::BMinus),
    (55.0, KcseGrade::CPlus),
    (50.0, KcseGrade::C),
    (45.0, KcseGrade::CMinus),
    (40.0, KcseGrade::DPlus),
    (35.0, KcseGrade::D),
    (30.0, KcseGrade::DMinus),
];

impl KcseGrade {
    #[cfg(test)]
    pub const ALL: [KcseGrade; 12] = [
        KcseGrade::A,
        KcseGrade::AMinus,
        KcseGrade::BPlus,
        KcseGrade::B,
        KcseGrade::BMinus,
        KcseGrade::CPlus,
        KcseGrade::C,
        KcseGrade::CMinus,
        KcseGrade::DPlus,
        KcseGrade::D,
        KcseGrade::DMinus,
        KcseGrade::F,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KcseGrade::A => "A",
            KcseGrade::AMinus => "A-",
            KcseGrade::BPlus => "B+",
            KcseGrade::B => "B",
            KcseGrade::BMinus => "B-",
            KcseGrade::CPlus => "C+",
            KcseGrade::C => "C",
            KcseGrade::CMinus => "C-",
            KcseGrade::DPlus => "D+",
            KcseGrade::D => "D",
            KcseGrade::DMinus => "D-",
            KcseGrade::F => "F",
        }
    }
}

impl fmt::Display for KcseGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for KcseGrade {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Maps a numeric average to its KCSE grade. Total: out-of-range values
/// clamp to A or F, and NaN falls through to F.
pub fn kcse_grade(score: f64) -> KcseGrade {
    THRESHOLDS
        .iter()
        .find(|(lower, _)| score >= *lower)
        .map(|(_, grade)| *grade)
        .unwrap_or(KcseGrade::F)
}

pub fn round_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Arithmetic mean, or `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn ordinal_suffix(n: usize) -> &'static str {
    if (11..=13).contains(&(n % 100)) {
        return "th";
    }
    match n % 10 {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

pub fn ordinal(n: usize) -> String {
    format!("{}{}", n, ordinal_suffix(n))
}

#[derive(Debug, Clone, PartialEq)]
pub struct StudentScores {
    pub student_id: String,
    pub scores: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedStudent {
    pub student_id: String,
    pub average: f64,
    pub grade: KcseGrade,
    pub position: usize,
}

/// Ranks a class by mean score, highest first.
///
/// Averages are rounded to two decimals before grading and sorting. Students
/// without scores are left out. Equal averages keep their input order.
pub fn rank_class(students: &[StudentScores]) -> Vec<RankedStudent> {
    let mut rows: Vec<(&str, f64)> = students
        .iter()
        .filter_map(|s| mean(&s.scores).map(|avg| (s.student_id.as_str(), round_2_decimals(avg))))
        .collect();

    rows.sort_by(|a, b| b.1.total_cmp(&a.1));

    rows.into_iter()
        .enumerate()
        .map(|(i, (student_id, average))| RankedStudent {
            student_id: student_id.to_string(),
            average,
            grade: kcse_grade(average),
            position: i + 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scores(id: &str, values: &[f64]) -> StudentScores {
        StudentScores {
            student_id: id.to_string(),
            scores: values.to_vec(),
        }
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(kcse_grade(80.0), KcseGrade::A);
        assert_eq!(kcse_grade(79.99), KcseGrade::AMinus);
        assert_eq!(kcse_grade(30.0), KcseGrade::DMinus);
        assert_eq!(kcse_grade(29.99), KcseGrade::F);
    }

    #[test]
    fn every_lower_bound_maps_to_its_grade() {
        for (lower, grade) in THRESHOLDS {
            assert_eq!(kcse_grade(lower), grade, "at {}", lower);
            assert!(kcse_grade(lower - 0.01) > grade, "below {}", lower);
        }
    }

    #[test]
    fn out_of_range_inputs_clamp() {
        assert_eq!(kcse_grade(100.0), KcseGrade::A);
        assert_eq!(kcse_grade(250.0), KcseGrade::A);
        assert_eq!(kcse_grade(0.0), KcseGrade::F);
        assert_eq!(kcse_grade(-5.0), KcseGrade::F);
        assert_eq!(kcse_grade(f64::NAN), KcseGrade::F);
    }

    #[test]
    fn grade_labels_and_serialization() {
        let labels: Vec<&str> = KcseGrade::ALL.iter().map(|g| g.as_str()).collect();
        assert_eq!(
            labels,
            vec!["A", "A-", "B+", "B", "B-", "C+", "C", "C-", "D+", "D", "D-", "F"]
        );
        assert_eq!(
            serde_json::to_value(KcseGrade::BPlus).expect("serialize"),
            serde_json::json!("B+")
        );
    }

    #[test]
    fn rank_empty_class() {
        assert!(rank_class(&[]).is_empty());
    }

    #[test]
    fn rank_omits_students_without_scores() {
        let ranked = rank_class(&[scores("a", &[]), scores("b", &[50.0]), scores("c", &[])]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].student_id, "b");
        assert_eq!(ranked[0].position, 1);
    }

    #[test]
    fn rank_orders_by_average_descending() {
        let ranked = rank_class(&[
            scores("low", &[30.0, 40.0]),
            scores("top", &[90.0, 82.0]),
            scores("mid", &[60.0, 65.0, 70.0]),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["top", "mid", "low"]);
        assert_eq!(ranked[0].average, 86.0);
        assert_eq!(ranked[0].grade, KcseGrade::A);
        assert_eq!(ranked[1].average, 65.0);
        assert_eq!(ranked[1].grade, KcseGrade::B);
        assert_eq!(ranked[2].grade, KcseGrade::D);
        let positions: Vec<usize> = ranked.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
    }

    #[test]
    fn rank_keeps_input_order_for_ties() {
        let ranked = rank_class(&[
            scores("first", &[70.0]),
            scores("second", &[60.0, 80.0]),
            scores("third", &[75.0]),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|r| r.student_id.as_str()).collect();
        assert_eq!(ids, vec!["third", "first", "second"]);
        assert_eq!(ranked[1].position, 2);
        assert_eq!(ranked[2].position, 3);
    }

    #[test]
    fn averages_round_to_two_decimals_before_grading() {
        let ranked = rank_class(&[scores("s", &[79.996, 79.996, 79.996])]);
        assert_eq!(ranked[0].average, 80.0);
        assert_eq!(ranked[0].grade, KcseGrade::A);

        let ranked = rank_class(&[scores("s", &[70.0, 71.0, 71.0])]);
        assert_eq!(ranked[0].average, 70.67);
    }

    #[test]
    fn ordinals() {
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(13), "13th");
        assert_eq!(ordinal(21), "21st");
        assert_eq!(ordinal(112), "112th");
        assert_eq!(ordinal(123), "123rd");
    }

    proptest! {
        #[test]
        fn higher_score_never_gets_a_worse_grade(a in -50.0f64..150.0, b in -50.0f64..150.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(kcse_grade(hi) <= kcse_grade(lo));
        }

        #[test]
        fn ranking_positions_are_consecutive_and_averages_non_increasing(
            classes in proptest::collection::vec(
                proptest::collection::vec(0.0f64..=100.0, 0..6),
                0..25,
            )
        ) {
            let students: Vec<StudentScores> = classes
                .iter()
                .enumerate()
                .map(|(i, s)| scores(&format!("s{}", i), s))
                .collect();
            let expected_len = students.iter().filter(|s| !s.scores.is_empty()).count();

            let ranked = rank_class(&students);
            prop_assert_eq!(ranked.len(), expected_len);
            for (i, row) in ranked.iter().enumerate() {
                prop_assert_eq!(row.position, i + 1);
                prop_assert_eq!(row.grade, kcse_grade(row.average));
            }
            for pair in ranked.windows(2) {
                prop_assert!(pair[0].average >= pair[1].average);
            }
        }
    }
}
