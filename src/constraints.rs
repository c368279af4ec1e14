//! Hard placement constraints: fixed slots, forbidden slots and the group policies that expand into forbidden slots.

use chrono::Weekday;
use log::{debug, info};
use std::collections::{BTreeMap, BTreeSet};

use crate::calendar::ExamCalendar;
use crate::data::{GroupPolicies, PlacementConstraints, Slot};
use crate::error::DataError;
use crate::params::{GroupId, ProblemParams};

/// Validated placement constraints keyed by interned group id.
#[derive(Debug, Clone, Default)]
pub struct Placement {
    fixed: BTreeMap<GroupId, Slot>,
    forbidden: BTreeMap<GroupId, BTreeSet<Slot>>,
}

impl Placement {
    /// Resolve names, merge policy expansions into the forbidden sets and validate the result.
    pub fn resolve(
        constraints: &PlacementConstraints,
        policies: &GroupPolicies,
        params: &ProblemParams,
    ) -> Result<Self, DataError> {
        let calendar = &params.calendar;
        let group = |name: &str| params.group_id(name).ok_or_else(|| DataError::UnknownGroup(name.to_string()));
        let mut placement = Placement::default();

        for (name, &slot) in &constraints.fixed {
            let g = group(name.as_str())?;
            if !calendar.is_available(slot) {
                return Err(DataError::InvalidSlot {
                    group: name.clone(),
                    slot,
                });
            }
            placement.fixed.insert(g, slot);
        }

        for (name, slots) in &constraints.forbidden {
            let g = group(name.as_str())?;
            for &slot in slots {
                if slot >= calendar.num_slots() {
                    return Err(DataError::InvalidSlot {
                        group: name.clone(),
                        slot,
                    });
                }
            }
            placement.forbidden.entry(g).or_default().extend(slots.iter().copied());
        }

        for (name, slots) in expand_policies(policies, calendar) {
            let g = group(name.as_str())?;
            placement.forbidden.entry(g).or_default().extend(slots);
        }

        for (&g, &slot) in &placement.fixed {
            if placement.is_forbidden(g, slot) {
                return Err(DataError::ConflictingConstraint {
                    group: params.group_name(g).to_string(),
                    slot,
                });
            }
        }

        if !placement.fixed.is_empty() || !placement.forbidden.is_empty() {
            info!(
                "Placement constraints: {} fixed groups, {} groups with forbidden slots",
                placement.fixed.len(),
                placement.forbidden.len()
            );
        }
        Ok(placement)
    }

    pub fn fixed_slot(&self, group: GroupId) -> Option<Slot> {
        self.fixed.get(&group).copied()
    }

    pub fn is_forbidden(&self, group: GroupId, slot: Slot) -> bool {
        self.forbidden.get(&group).is_some_and(|slots| slots.contains(&slot))
    }

    /// Whether `group` may be placed in `slot`: the slot is available, not forbidden, and is the fixed slot if any.
    pub fn allows(&self, calendar: &ExamCalendar, group: GroupId, slot: Slot) -> bool {
        calendar.is_available(slot)
            && !self.is_forbidden(group, slot)
            && self.fixed_slot(group).is_none_or(|fixed| fixed == slot)
    }

    pub fn allowed_slots<'a>(&'a self, calendar: &'a ExamCalendar, group: GroupId) -> impl Iterator<Item = Slot> + 'a {
        calendar.available_slots().filter(move |t| self.allows(calendar, group, *t))
    }

    /// Groups with any constraint: fixed groups first, then groups that only have forbidden slots.
    pub fn constrained_groups(&self) -> Vec<GroupId> {
        let mut groups: Vec<GroupId> = self.fixed.keys().copied().collect();
        groups.extend(self.forbidden.keys().filter(|g| !self.fixed.contains_key(g)));
        groups
    }

    /// The first group that no slot is left for, if any. Such an instance has no feasible timetable.
    pub fn first_unplaceable(&self, params: &ProblemParams) -> Option<GroupId> {
        params
            .groups()
            .find(|g| self.allowed_slots(&params.calendar, *g).next().is_none())
    }
}

/// Expand group policies into forbidden slots per group name.
pub fn expand_policies(policies: &GroupPolicies, calendar: &ExamCalendar) -> BTreeMap<String, Vec<Slot>> {
    let rules: [(&[String], Vec<Slot>); 4] = [
        (policies.no_last_day.as_slice(), calendar.last_days_slots(1)),
        (policies.no_last_two_days.as_slice(), calendar.last_days_slots(2)),
        (policies.no_night.as_slice(), calendar.night_slots()),
        (
            policies.no_friday_monday.as_slice(),
            calendar.weekday_slots(&[Weekday::Mon, Weekday::Fri]),
        ),
    ];

    let mut forbidden: BTreeMap<String, Vec<Slot>> = BTreeMap::new();
    for (groups, slots) in rules {
        for name in groups {
            debug!("Policy forbids {} slots for group {}", slots.len(), name);
            forbidden.entry(name.clone()).or_default().extend(slots.iter().copied());
        }
    }
    forbidden
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::grouped_params;

    fn constraints(fixed: &[(&str, Slot)], forbidden: &[(&str, &[Slot])]) -> PlacementConstraints {
        PlacementConstraints {
            fixed: fixed.iter().map(|(g, t)| (g.to_string(), *t)).collect(),
            forbidden: forbidden.iter().map(|(g, ts)| (g.to_string(), ts.to_vec())).collect(),
        }
    }

    #[test]
    fn resolves_fixed_and_forbidden() {
        let params = grouped_params(3, &[&[0, 1]]);
        let placement = Placement::resolve(
            &constraints(&[("G1", 4)], &[("G2", &[0, 1]), ("G1", &[5])]),
            &GroupPolicies::default(),
            &params,
        )
        .unwrap();

        assert_eq!(placement.fixed_slot(1), Some(4));
        assert_eq!(placement.fixed_slot(0), None);
        assert!(placement.is_forbidden(2, 0));
        assert!(!placement.is_forbidden(2, 2));
        assert_eq!(placement.constrained_groups(), vec![1, 2]);

        let cal = &params.calendar;
        assert!(placement.allows(cal, 1, 4));
        assert!(!placement.allows(cal, 1, 6));
        assert!(!placement.allows(cal, 2, 1));
        assert!(!placement.allows(cal, 0, 19));
        assert_eq!(placement.allowed_slots(cal, 1).collect::<Vec<_>>(), vec![4]);
        assert_eq!(placement.first_unplaceable(&params), None);
    }

    #[test]
    fn fixed_slot_that_is_forbidden_is_rejected() {
        let params = grouped_params(2, &[&[0, 1]]);
        let err = Placement::resolve(
            &constraints(&[("G0", 0)], &[("G0", &[0])]),
            &GroupPolicies::default(),
            &params,
        )
        .unwrap_err();
        assert_eq!(
            err,
            DataError::ConflictingConstraint {
                group: "G0".into(),
                slot: 0
            }
        );
    }

    #[test]
    fn rejects_unknown_groups_and_bad_slots() {
        let params = grouped_params(2, &[&[0, 1]]);
        let none = GroupPolicies::default();
        assert_eq!(
            Placement::resolve(&constraints(&[("G9", 0)], &[]), &none, &params).unwrap_err(),
            DataError::UnknownGroup("G9".into())
        );
        // slot 19 is Friday night
        assert!(matches!(
            Placement::resolve(&constraints(&[("G0", 19)], &[]), &none, &params),
            Err(DataError::InvalidSlot { slot: 19, .. })
        ));
        assert!(matches!(
            Placement::resolve(&constraints(&[], &[("G0", &[20])]), &none, &params),
            Err(DataError::InvalidSlot { slot: 20, .. })
        ));
    }

    #[test]
    fn policies_expand_into_forbidden_slots() {
        let params = grouped_params(3, &[&[0, 1, 2]]);
        let policies = GroupPolicies {
            no_last_day: vec!["G0".into()],
            no_night: vec!["G0".into()],
            no_friday_monday: vec!["G1".into()],
            ..Default::default()
        };
        let placement = Placement::resolve(&PlacementConstraints::default(), &policies, &params).unwrap();

        let cal = &params.calendar;
        // G0: no Friday (16..19), no nights
        let g0: Vec<_> = placement.allowed_slots(cal, 0).collect();
        assert_eq!(g0, vec![0, 1, 2, 4, 5, 6, 8, 9, 10, 12, 13, 14]);
        // G1: Tuesday through Thursday only
        let g1: Vec<_> = placement.allowed_slots(cal, 1).collect();
        assert_eq!(g1, (4..16).collect::<Vec<_>>());
        assert_eq!(placement.allowed_slots(cal, 2).count(), 19);

        let conflicting = constraints(&[("G1", 0)], &[]);
        assert!(matches!(
            Placement::resolve(&conflicting, &policies, &params),
            Err(DataError::ConflictingConstraint { slot: 0, .. })
        ));
    }

    #[test]
    fn detects_groups_without_any_slot() {
        let params = grouped_params(2, &[&[0, 1]]);
        let all: Vec<Slot> = (0..20).collect();
        let placement = Placement::resolve(
            &constraints(&[], &[("G1", &all)]),
            &GroupPolicies::default(),
            &params,
        )
        .unwrap();
        assert_eq!(placement.first_unplaceable(&params), Some(1));
    }
}
