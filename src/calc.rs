use serde::{Deserialize, Serialize};

/// Score component of a record: two continuous-assessment slots plus the exam.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Ca1,
    Ca2,
    Exam,
}

impl Component {
    pub fn parse(s: &str) -> Option<Component> {
        match s.to_ascii_lowercase().as_str() {
            "ca1" => Some(Component::Ca1),
            "ca2" => Some(Component::Ca2),
            "exam" | "examscore" => Some(Component::Exam),
            _ => None,
        }
    }
}

/// Exam period type. Each cycle fixes the component ceilings and the
/// denominator used for percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamCycle {
    Midterm,
    Terminal,
}

impl ExamCycle {
    pub fn parse(s: &str) -> Option<ExamCycle> {
        match s.to_ascii_lowercase().as_str() {
            "midterm" => Some(ExamCycle::Midterm),
            "terminal" => Some(ExamCycle::Terminal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExamCycle::Midterm => "midterm",
            ExamCycle::Terminal => "terminal",
        }
    }
}

// Rubric tables. Defined once here; every caller (sheet save, single-cell
// edit, reports) goes through these rather than restating the numbers.
const MIDTERM_CEILINGS: [f64; 3] = [10.0, 10.0, 20.0];
const TERMINAL_CEILINGS: [f64; 3] = [20.0, 20.0, 60.0];

const GRADE_BANDS: [(i64, Grade); 5] = [
    (80, Grade::A),
    (70, Grade::B),
    (60, Grade::C),
    (50, Grade::D),
    (40, Grade::E),
];

pub fn component_ceiling(cycle: ExamCycle, component: Component) -> f64 {
    let table = match cycle {
        ExamCycle::Midterm => &MIDTERM_CEILINGS,
        ExamCycle::Terminal => &TERMINAL_CEILINGS,
    };
    match component {
        Component::Ca1 => table[0],
        Component::Ca2 => table[1],
        Component::Exam => table[2],
    }
}

pub fn max_total(cycle: ExamCycle) -> f64 {
    match cycle {
        ExamCycle::Midterm => 40.0,
        ExamCycle::Terminal => 100.0,
    }
}

/// Clamp a raw component value into `[0, ceiling]`. Out-of-range and
/// non-finite input is coerced, never rejected: clamping is the policy.
pub fn clamp_component(cycle: ExamCycle, component: Component, raw: f64) -> f64 {
    if !raw.is_finite() {
        return 0.0;
    }
    raw.clamp(0.0, component_ceiling(cycle, component))
}

/// Round half away from zero. Inputs are non-negative, so `floor(x + 0.5)`.
pub fn round_half_up(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Grade {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl Grade {
    pub fn from_percentage(percentage: i64) -> Grade {
        for (floor, grade) in GRADE_BANDS {
            if percentage >= floor {
                return grade;
            }
        }
        Grade::F
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::D => "D",
            Grade::E => "E",
            Grade::F => "F",
        }
    }

    pub fn remark(&self) -> &'static str {
        match self {
            Grade::A => "Excellent",
            Grade::B => "Very Good",
            Grade::C => "Good",
            Grade::D => "Pass",
            Grade::E => "Fair",
            Grade::F => "Fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComputedScore {
    pub total: f64,
    pub percentage: i64,
    pub grade: Grade,
}

/// Total, percentage, and letter grade for already-clamped components.
/// Pure: identical inputs always yield identical output.
pub fn compute_score(cycle: ExamCycle, ca1: f64, ca2: f64, exam_score: f64) -> ComputedScore {
    let total = ca1 + ca2 + exam_score;
    let percentage = round_half_up(total / max_total(cycle) * 100.0);
    ComputedScore {
        total,
        percentage,
        grade: Grade::from_percentage(percentage),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TerminalSeed {
    pub ca1: f64,
    pub ca2: f64,
    pub exam_score: f64,
}

/// Starting values for a terminal record from a completed midterm record:
/// both midterm CA slots fold into terminal CA1, the midterm exam becomes
/// terminal CA2, and the terminal exam is left for direct entry.
pub fn derive_terminal_seed(mid_ca1: f64, mid_ca2: f64, mid_exam: f64) -> TerminalSeed {
    TerminalSeed {
        ca1: mid_ca1 + mid_ca2,
        ca2: mid_exam,
        exam_score: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_is_identity_on_valid_domain() {
        assert_eq!(clamp_component(ExamCycle::Midterm, Component::Ca1, 7.5), 7.5);
        assert_eq!(clamp_component(ExamCycle::Midterm, Component::Exam, 20.0), 20.0);
        assert_eq!(clamp_component(ExamCycle::Terminal, Component::Exam, 0.0), 0.0);
    }

    #[test]
    fn clamp_pins_out_of_range_to_boundaries() {
        assert_eq!(clamp_component(ExamCycle::Midterm, Component::Ca1, 15.0), 10.0);
        assert_eq!(clamp_component(ExamCycle::Midterm, Component::Ca1, -3.0), 0.0);
        assert_eq!(clamp_component(ExamCycle::Terminal, Component::Exam, 75.0), 60.0);
    }

    #[test]
    fn clamp_coerces_non_finite_input() {
        assert_eq!(clamp_component(ExamCycle::Midterm, Component::Ca2, f64::NAN), 0.0);
        assert_eq!(
            clamp_component(ExamCycle::Terminal, Component::Ca1, f64::INFINITY),
            0.0
        );
    }

    #[test]
    fn percentage_rounds_half_away_from_zero() {
        // 19/40 = 47.5% rounds up to 48.
        let r = compute_score(ExamCycle::Midterm, 5.0, 5.0, 9.0);
        assert_eq!(r.percentage, 48);
        // 13/40 = 32.5% rounds up to 33.
        let r = compute_score(ExamCycle::Midterm, 4.0, 4.0, 5.0);
        assert_eq!(r.percentage, 33);
    }

    #[test]
    fn grade_boundaries_are_inclusive_at_lower_bound() {
        assert_eq!(Grade::from_percentage(80), Grade::A);
        assert_eq!(Grade::from_percentage(79), Grade::B);
        assert_eq!(Grade::from_percentage(70), Grade::B);
        assert_eq!(Grade::from_percentage(60), Grade::C);
        assert_eq!(Grade::from_percentage(50), Grade::D);
        assert_eq!(Grade::from_percentage(49), Grade::E);
        assert_eq!(Grade::from_percentage(40), Grade::E);
        assert_eq!(Grade::from_percentage(39), Grade::F);
        assert_eq!(Grade::from_percentage(100), Grade::A);
        assert_eq!(Grade::from_percentage(0), Grade::F);
    }

    #[test]
    fn midterm_full_marks() {
        let r = compute_score(ExamCycle::Midterm, 10.0, 10.0, 20.0);
        assert_eq!(r.total, 40.0);
        assert_eq!(r.percentage, 100);
        assert_eq!(r.grade, Grade::A);
    }

    #[test]
    fn midterm_half_marks() {
        let r = compute_score(ExamCycle::Midterm, 5.0, 3.0, 12.0);
        assert_eq!(r.total, 20.0);
        assert_eq!(r.percentage, 50);
        assert_eq!(r.grade, Grade::D);
    }

    #[test]
    fn terminal_full_marks() {
        let r = compute_score(ExamCycle::Terminal, 20.0, 20.0, 60.0);
        assert_eq!(r.total, 100.0);
        assert_eq!(r.percentage, 100);
        assert_eq!(r.grade, Grade::A);
    }

    #[test]
    fn terminal_seed_maps_midterm_components() {
        let seed = derive_terminal_seed(8.0, 7.0, 18.0);
        assert_eq!(seed.ca1, 15.0);
        assert_eq!(seed.ca2, 18.0);
        assert_eq!(seed.exam_score, 0.0);

        // Before the terminal exam is entered the seed alone scores an F.
        let r = compute_score(ExamCycle::Terminal, seed.ca1, seed.ca2, seed.exam_score);
        assert_eq!(r.total, 33.0);
        assert_eq!(r.percentage, 33);
        assert_eq!(r.grade, Grade::F);
    }

    #[test]
    fn seed_stays_within_terminal_ceilings() {
        // Midterm ceilings sum to the terminal CA ceilings, so a clamped
        // midterm record can never seed an out-of-range terminal CA.
        let seed = derive_terminal_seed(10.0, 10.0, 20.0);
        assert!(seed.ca1 <= component_ceiling(ExamCycle::Terminal, Component::Ca1));
        assert!(seed.ca2 <= component_ceiling(ExamCycle::Terminal, Component::Ca2));
    }

    #[test]
    fn compute_score_is_idempotent() {
        let a = compute_score(ExamCycle::Terminal, 15.0, 18.0, 42.0);
        let b = compute_score(ExamCycle::Terminal, 15.0, 18.0, 42.0);
        assert_eq!(a, b);
    }

    #[test]
    fn cycle_and_component_parse_round_trip() {
        assert_eq!(ExamCycle::parse("Midterm"), Some(ExamCycle::Midterm));
        assert_eq!(ExamCycle::parse("TERMINAL"), Some(ExamCycle::Terminal));
        assert_eq!(ExamCycle::parse("weekly"), None);
        assert_eq!(Component::parse("examScore"), Some(Component::Exam));
        assert_eq!(Component::parse("ca3"), None);
    }
}
