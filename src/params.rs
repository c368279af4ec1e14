//! Derivation of the combinatorial parameters shared by both optimization phases, the GRASP heuristic and the
//! conflict analysis.
//!
//! Groups, students and faculty members are interned as integer ids once loaded. Their display names live in side
//! tables. Pairwise tables are sparse: most pairs of groups share no students, so `shared_students[g]` only holds the
//! groups that actually share someone with `g`.

use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};

use crate::calendar::ExamCalendar;
use crate::data::{
    CourseRecord, Crn, MAX_ENROLLMENTS, NO_EXAM_GROUP, SemesterConfig, Slot, StudentRecord, UNUSED_CRN,
};
use crate::error::DataError;

pub type GroupId = usize;
pub type FacultyId = usize;

/// A (partial or total) placement of course groups into slots.
pub type Assignment = BTreeMap<GroupId, Slot>;

/// Instructor placeholder that never takes part in faculty conflicts.
const TBD_INSTRUCTOR: &str = "TBD";

#[derive(Debug, Clone)]
pub struct CourseInfo {
    pub crn: Crn,
    pub course_id: String,
    pub section: String,
    pub title: String,
    /// Normalized instructor name, empty if unknown.
    pub instructor: String,
    /// `None` for CRNs without a final exam.
    pub group: Option<GroupId>,
}

#[derive(Debug, Clone)]
pub struct StudentInfo {
    pub name: String,
    /// Enrolled CRNs that take an exam, in the order they were listed.
    pub exam_crns: Vec<Crn>,
    /// Distinct groups the student has an exam in.
    pub groups: Vec<GroupId>,
}

impl StudentInfo {
    pub fn num_exams(&self) -> u32 {
        self.exam_crns.len() as u32
    }
}

#[derive(Debug, Clone)]
pub struct ProblemParams {
    pub calendar: ExamCalendar,
    group_names: Vec<String>,
    group_index: HashMap<String, GroupId>,
    group_crns: Vec<Vec<Crn>>,
    group_size: Vec<u32>,
    courses: HashMap<Crn, CourseInfo>,
    students: Vec<StudentInfo>,
    dropped_students: usize,
    forced_overlaps: u32,
    faculty_names: Vec<String>,
    faculty_index: HashMap<String, FacultyId>,
    faculty_groups: Vec<Vec<GroupId>>,
    shared_students: Vec<HashMap<GroupId, u32>>,
    shared_faculty: Vec<HashMap<GroupId, u32>>,
}

/// Strip whitespace and map accented characters to their ASCII equivalent, so that differently spelled records of
/// the same person join on one key. The mapping table only covers `á`.
pub fn normalize_faculty_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| word.replace('á', "a"))
        .collect()
}

impl ProblemParams {
    /// Build all sets and tables from the raw enrollment and course tables.
    pub fn derive(
        semester: &SemesterConfig,
        students: &[StudentRecord],
        courses: &[CourseRecord],
    ) -> Result<Self, DataError> {
        let calendar = ExamCalendar::new(semester)?;

        let mut params = ProblemParams {
            calendar,
            group_names: Vec::new(),
            group_index: HashMap::new(),
            group_crns: Vec::new(),
            group_size: Vec::new(),
            courses: HashMap::with_capacity(courses.len()),
            students: Vec::new(),
            dropped_students: 0,
            forced_overlaps: 0,
            faculty_names: Vec::new(),
            faculty_index: HashMap::new(),
            faculty_groups: Vec::new(),
            shared_students: Vec::new(),
            shared_faculty: Vec::new(),
        };

        params.load_courses(courses)?;
        params.load_students(students)?;
        params.compute_faculty_pairs();
        params.warn_ambiguous_faculty_names();

        info!(
            "Derived parameters: {} students ({} without exams dropped), {} groups, {} exam CRNs, {} faculty, {} slots ({} available), {} forced overlaps",
            params.students.len(),
            params.dropped_students,
            params.group_names.len(),
            params.courses.values().filter(|c| c.group.is_some()).count(),
            params.faculty_names.len(),
            params.calendar.num_slots(),
            params.calendar.available_slots().count(),
            params.forced_overlaps
        );
        Ok(params)
    }

    fn load_courses(&mut self, courses: &[CourseRecord]) -> Result<(), DataError> {
        for record in courses {
            let group_name = record.course_group.trim();
            if group_name.is_empty() {
                return Err(DataError::MissingField {
                    crn: record.crn,
                    field: "courseGroup",
                });
            }
            if self.courses.contains_key(&record.crn) {
                return Err(DataError::DuplicateCrn(record.crn));
            }

            let instructor = record
                .instructor
                .as_deref()
                .map(normalize_faculty_name)
                .unwrap_or_default();
            let group = if record.has_exam && group_name != NO_EXAM_GROUP {
                let g = self.intern_group(group_name);
                self.group_crns[g].push(record.crn);
                if !instructor.is_empty() && instructor != TBD_INSTRUCTOR {
                    let f = self.intern_faculty(&instructor);
                    if !self.faculty_groups[f].contains(&g) {
                        self.faculty_groups[f].push(g);
                    }
                }
                Some(g)
            } else {
                None
            };

            self.courses.insert(
                record.crn,
                CourseInfo {
                    crn: record.crn,
                    course_id: record.course_id.clone(),
                    section: record.section.clone(),
                    title: record.title.clone(),
                    instructor,
                    group,
                },
            );
        }
        Ok(())
    }

    fn load_students(&mut self, students: &[StudentRecord]) -> Result<(), DataError> {
        let mut seen = HashMap::with_capacity(students.len());
        for record in students {
            if seen.insert(record.id.as_str(), ()).is_some() {
                return Err(DataError::DuplicateStudent(record.id.clone()));
            }
            let listed: Vec<Crn> = record
                .crns
                .iter()
                .copied()
                .take_while(|crn| *crn != UNUSED_CRN)
                .collect();
            if listed.len() > MAX_ENROLLMENTS {
                return Err(DataError::TooManyCrns {
                    student: record.id.clone(),
                    count: listed.len(),
                    max: MAX_ENROLLMENTS,
                });
            }

            let mut exam_crns = Vec::new();
            let mut groups: Vec<GroupId> = Vec::new();
            for crn in listed {
                let course = self.courses.get(&crn).ok_or_else(|| DataError::UnknownCrn {
                    student: record.id.clone(),
                    crn,
                })?;
                let Some(g) = course.group else { continue };
                if exam_crns.contains(&crn) {
                    continue;
                }
                exam_crns.push(crn);
                if groups.contains(&g) {
                    // two exams of one student in the same group can never be separated
                    self.forced_overlaps += 1;
                    debug!("Forced overlap for student {} in group {}", record.id, self.group_names[g]);
                } else {
                    groups.push(g);
                }
            }

            if exam_crns.is_empty() {
                self.dropped_students += 1;
                continue;
            }

            for (i, &g1) in groups.iter().enumerate() {
                self.group_size[g1] += 1;
                for &g2 in &groups[i + 1..] {
                    *self.shared_students[g1].entry(g2).or_insert(0) += 1;
                    *self.shared_students[g2].entry(g1).or_insert(0) += 1;
                }
            }
            self.students.push(StudentInfo {
                name: record.id.clone(),
                exam_crns,
                groups,
            });
        }
        if self.dropped_students > 0 {
            info!("Removing {} students that have no exams.", self.dropped_students);
        }
        Ok(())
    }

    fn compute_faculty_pairs(&mut self) {
        for groups in &self.faculty_groups {
            for (i, &g1) in groups.iter().enumerate() {
                for &g2 in &groups[i + 1..] {
                    *self.shared_faculty[g1].entry(g2).or_insert(0) += 1;
                    *self.shared_faculty[g2].entry(g1).or_insert(0) += 1;
                }
            }
        }
    }

    /// Names that only differ in case or in unmapped non-ASCII characters probably denote the same person. They are
    /// kept apart (so faculty conflicts between them are not counted) and reported.
    fn warn_ambiguous_faculty_names(&self) {
        let mut by_key: BTreeMap<String, Vec<&str>> = BTreeMap::new();
        for name in &self.faculty_names {
            let key: String = name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .map(|c| c.to_ascii_lowercase())
                .collect();
            by_key.entry(key).or_default().push(name);
        }
        for names in by_key.values().filter(|names| names.len() > 1) {
            warn!(
                "Faculty names {:?} may denote the same person; they are treated as different instructors",
                names
            );
        }
    }

    fn intern_group(&mut self, name: &str) -> GroupId {
        if let Some(&g) = self.group_index.get(name) {
            return g;
        }
        let g = self.group_names.len();
        self.group_names.push(name.to_string());
        self.group_index.insert(name.to_string(), g);
        self.group_crns.push(Vec::new());
        self.group_size.push(0);
        self.shared_students.push(HashMap::new());
        self.shared_faculty.push(HashMap::new());
        g
    }

    fn intern_faculty(&mut self, name: &str) -> FacultyId {
        if let Some(&f) = self.faculty_index.get(name) {
            return f;
        }
        let f = self.faculty_names.len();
        self.faculty_names.push(name.to_string());
        self.faculty_index.insert(name.to_string(), f);
        self.faculty_groups.push(Vec::new());
        f
    }

    pub fn num_groups(&self) -> usize {
        self.group_names.len()
    }

    pub fn groups(&self) -> impl Iterator<Item = GroupId> {
        0..self.group_names.len()
    }

    pub fn group_name(&self, group: GroupId) -> &str {
        &self.group_names[group]
    }

    pub fn group_id(&self, name: &str) -> Option<GroupId> {
        self.group_index.get(name).copied()
    }

    pub fn group_crns(&self, group: GroupId) -> &[Crn] {
        &self.group_crns[group]
    }

    /// Number of distinct students with an exam in the group.
    pub fn group_size(&self, group: GroupId) -> u32 {
        self.group_size[group]
    }

    pub fn max_group_size(&self) -> u32 {
        self.group_size.iter().copied().max().unwrap_or(0)
    }

    pub fn course(&self, crn: Crn) -> Option<&CourseInfo> {
        self.courses.get(&crn)
    }

    pub fn students(&self) -> &[StudentInfo] {
        &self.students
    }

    pub fn dropped_students(&self) -> usize {
        self.dropped_students
    }

    /// Count of enrollments where a student has two exams in one group. Independent of any slot mapping.
    pub fn forced_overlaps(&self) -> u32 {
        self.forced_overlaps
    }

    pub fn faculty(&self) -> impl Iterator<Item = FacultyId> {
        0..self.faculty_names.len()
    }

    pub fn faculty_name(&self, faculty: FacultyId) -> &str {
        &self.faculty_names[faculty]
    }

    pub fn faculty_id(&self, name: &str) -> Option<FacultyId> {
        self.faculty_index.get(name).copied()
    }

    /// Groups the faculty member teaches at least one CRN in.
    pub fn faculty_groups(&self, faculty: FacultyId) -> &[GroupId] {
        &self.faculty_groups[faculty]
    }

    pub fn shared_students(&self, g1: GroupId, g2: GroupId) -> u32 {
        self.shared_students[g1].get(&g2).copied().unwrap_or(0)
    }

    pub fn shared_faculty(&self, g1: GroupId, g2: GroupId) -> u32 {
        self.shared_faculty[g1].get(&g2).copied().unwrap_or(0)
    }

    /// Groups sharing at least one student with `group`, with the shared count.
    pub fn student_neighbors(&self, group: GroupId) -> impl Iterator<Item = (GroupId, u32)> + '_ {
        self.shared_students[group].iter().map(|(g, n)| (*g, *n))
    }

    /// A pair matters to the optimization only if it shares a student or a faculty member.
    pub fn is_relevant_pair(&self, g1: GroupId, g2: GroupId) -> bool {
        self.shared_students(g1, g2) > 0 || self.shared_faculty(g1, g2) > 0
    }

    /// Translate an assignment to group names.
    pub fn named(&self, assignment: &Assignment) -> BTreeMap<String, Slot> {
        assignment
            .iter()
            .map(|(g, t)| (self.group_names[*g].clone(), *t))
            .collect()
    }

    /// Translate a mapping keyed by group name. Names of groups without exams are skipped with a warning.
    pub fn resolve_mapping(&self, mapping: &BTreeMap<String, Slot>) -> Result<Assignment, DataError> {
        let mut assignment = Assignment::new();
        for (name, &slot) in mapping {
            let Some(g) = self.group_id(name) else {
                warn!("Ignoring group `{}` of the mapping: it has no exams", name);
                continue;
            };
            if slot >= self.calendar.num_slots() {
                return Err(DataError::InvalidSlot {
                    group: name.clone(),
                    slot,
                });
            }
            assignment.insert(g, slot);
        }
        Ok(assignment)
    }
}
