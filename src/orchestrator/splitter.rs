//! Splitting a crashed batch around its culprit.
//!
//! gtest runs a filter in order, so a crash at test *k* says nothing about
//! the tests after it and little about the ones before it. The split keeps
//! the earlier tests together, isolates the culprit, and breaks up the rest
//! of the culprit's suite because a suite-level fixture may be what crashed.
//!
//! ```text
//!   batch:   A.1 A.2 | B.1 B.2 [B.3] B.4 B.5 | C.1 D.1
//!
//!   pre:     A.1 A.2 B.1 B.2
//!   culprit: B.3
//!   post:    B.4 | B.5            (one batch each)
//!   rest:    C.1 D.1
//! ```

use crate::framework::{Batch, SuiteGroup, TestId};

/// Splits `batch` around `culprit`, omitting empty parts.
///
/// Order of the returned batches: pre, culprit, each remaining leaf of the
/// culprit's suite, then the later suites as one batch. If `culprit` is not
/// in the batch every test is returned as its own batch.
pub fn smart_split(batch: &Batch, culprit: &TestId) -> Vec<Batch> {
    let Some(suite_idx) = batch.groups().iter().position(|g| {
        g.suite == culprit.suite() && g.names.iter().any(|n| n == culprit.name())
    }) else {
        return batch.tests().into_iter().map(Batch::single).collect();
    };

    let groups = batch.groups();
    let culprit_group = &groups[suite_idx];
    let leaf_idx = culprit_group
        .names
        .iter()
        .position(|n| n == culprit.name())
        .unwrap_or(0);

    let mut parts = Vec::new();

    let mut pre = Batch::from_groups(groups[..suite_idx].iter().cloned());
    pre.push_group(SuiteGroup {
        suite: culprit_group.suite.clone(),
        names: culprit_group.names[..leaf_idx].to_vec(),
    });
    if !pre.is_empty() {
        parts.push(pre);
    }

    parts.push(Batch::single(culprit.clone()));

    for name in &culprit_group.names[leaf_idx + 1..] {
        parts.push(Batch::single(TestId::new(
            culprit_group.suite.clone(),
            name.clone(),
        )));
    }

    let rest = Batch::from_groups(groups[suite_idx + 1..].iter().cloned());
    if !rest.is_empty() {
        parts.push(rest);
    }

    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TestId {
        TestId::parse(s).unwrap()
    }

    fn tests(batch: &Batch) -> Vec<String> {
        batch.tests().iter().map(ToString::to_string).collect()
    }

    fn sample() -> Batch {
        Batch::from_groups([
            SuiteGroup::new("A", ["1", "2"]),
            SuiteGroup::new("B", ["1", "2", "3", "4", "5"]),
            SuiteGroup::new("C", ["1"]),
            SuiteGroup::new("D", ["1"]),
        ])
    }

    #[test]
    fn test_split_middle_of_suite() {
        let parts = smart_split(&sample(), &id("B.3"));
        let rendered: Vec<_> = parts.iter().map(tests).collect();

        assert_eq!(
            rendered,
            vec![
                vec!["A.1", "A.2", "B.1", "B.2"],
                vec!["B.3"],
                vec!["B.4"],
                vec!["B.5"],
                vec!["C.1", "D.1"],
            ]
        );
    }

    #[test]
    fn test_split_keeps_later_suite_together() {
        let batch = Batch::from_groups([
            SuiteGroup::new("S1", ["A", "B", "C"]),
            SuiteGroup::new("S2", ["D", "E"]),
        ]);
        let parts = smart_split(&batch, &id("S1.B"));
        let rendered: Vec<_> = parts.iter().map(tests).collect();
        assert_eq!(
            rendered,
            vec![
                vec!["S1.A"],
                vec!["S1.B"],
                vec!["S1.C"],
                vec!["S2.D", "S2.E"],
            ]
        );
    }

    #[test]
    fn test_split_first_test() {
        let parts = smart_split(&sample(), &id("A.1"));
        let rendered: Vec<_> = parts.iter().map(tests).collect();
        assert_eq!(
            rendered,
            vec![
                vec!["A.1"],
                vec!["A.2"],
                vec!["B.1", "B.2", "B.3", "B.4", "B.5", "C.1", "D.1"],
            ]
        );
    }

    #[test]
    fn test_split_last_test() {
        let parts = smart_split(&sample(), &id("D.1"));
        let rendered: Vec<_> = parts.iter().map(tests).collect();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[1], vec!["D.1"]);
        assert_eq!(rendered[0].len(), 8);
    }

    #[test]
    fn test_split_partitions_batch() {
        let batch = sample();
        for culprit in batch.tests() {
            let parts = smart_split(&batch, &culprit);
            let mut seen: Vec<TestId> = parts.iter().flat_map(Batch::tests).collect();
            seen.sort();
            let mut all = batch.tests();
            all.sort();
            assert_eq!(seen, all, "culprit {}", culprit);
            assert!(parts.iter().any(|p| p.is_singleton() && p.contains(&culprit)));
        }
    }

    #[test]
    fn test_split_singleton() {
        let batch = Batch::single(id("S.A"));
        let parts = smart_split(&batch, &id("S.A"));
        assert_eq!(parts, vec![batch]);
    }

    #[test]
    fn test_unknown_culprit_splits_everything() {
        let batch = Batch::from_tests(&[id("S.A"), id("S.B")]);
        let parts = smart_split(&batch, &id("X.Y"));
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(Batch::is_singleton));
    }
}
