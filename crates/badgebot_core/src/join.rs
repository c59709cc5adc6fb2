use std::collections::HashMap;

use crate::model::{BadgeIds, BadgeKind, MasterRecord, RedirectFact, TagAssignment};

/// Outer-joins the redirect facts of one project with its badge assignments.
///
/// The first join attaches sitelink-to-redirect badges, the second one intentional
/// sitelink-to-redirect badges, both keyed on the redirect's item identifier. Duplicate
/// keys fan out into one row per matching pair. Badge rows without a matching redirect
/// are kept with an empty redirect side; for the second join only rows that carry a
/// redirect can match. Assignments of any other badge are ignored.
pub fn join_master_records(
    facts: &[RedirectFact],
    assignments: &[TagAssignment],
    badges: &BadgeIds,
) -> Vec<MasterRecord> {
    let kind_a = assignments_of_kind(assignments, badges, BadgeKind::SitelinkToRedirect);
    let kind_b = assignments_of_kind(assignments, badges, BadgeKind::IntentionalSitelinkToRedirect);

    let left = facts
        .iter()
        .map(|fact| MasterRecord {
            redirect: Some(fact.clone()),
            kind_a: None,
            kind_b: None,
        })
        .collect::<Vec<_>>();

    let joined = outer_join(left, &kind_a, |record, tag| record.kind_a = Some(tag.clone()));
    outer_join(joined, &kind_b, |record, tag| record.kind_b = Some(tag.clone()))
}

fn assignments_of_kind<'a>(
    assignments: &'a [TagAssignment],
    badges: &BadgeIds,
    kind: BadgeKind,
) -> Vec<&'a TagAssignment> {
    assignments
        .iter()
        .filter(|assignment| badges.kind_of(&assignment.badge) == Some(kind))
        .collect()
}

fn outer_join<F>(left: Vec<MasterRecord>, right: &[&TagAssignment], attach: F) -> Vec<MasterRecord>
where
    F: Fn(&mut MasterRecord, &TagAssignment),
{
    let mut by_identifier: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, tag) in right.iter().enumerate() {
        by_identifier
            .entry(tag.identifier.as_str())
            .or_default()
            .push(index);
    }

    let mut matched = vec![false; right.len()];
    let mut out = Vec::with_capacity(left.len() + right.len());
    for record in left {
        let key = record.redirect.as_ref().map(|fact| fact.redirect_qid.as_str());
        let hits = key.and_then(|key| by_identifier.get(key));
        match hits {
            Some(indexes) => {
                for &index in indexes {
                    matched[index] = true;
                    let mut row = record.clone();
                    attach(&mut row, right[index]);
                    out.push(row);
                }
            }
            None => out.push(record),
        }
    }

    for (index, tag) in right.iter().enumerate() {
        if matched[index] {
            continue;
        }
        let mut row = MasterRecord::default();
        attach(&mut row, *tag);
        out.push(row);
    }
    out
}
