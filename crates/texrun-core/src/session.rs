//! Grouping of records into execution units.

use std::collections::BTreeMap;
use std::collections::hash_map::Entry;

use rustc_hash::FxHashMap;

use crate::change::UpdatePlan;
use crate::record::{CodeRecord, HookPosition};

/// Collapse records whose (run key, instance) appears more than once.
///
/// Multi-pass compilation can write the same instance more than once; the
/// occurrence appearing last wins and takes the position of the first.
pub fn collapse_duplicates(records: Vec<CodeRecord>) -> Vec<CodeRecord> {
    let before = records.len();
    let mut slot: FxHashMap<(String, i64), usize> = FxHashMap::default();
    let mut kept: Vec<CodeRecord> = Vec::with_capacity(before);
    for rec in records {
        match slot.entry((rec.run_id(), rec.instance_int)) {
            Entry::Occupied(e) => kept[*e.get()] = rec,
            Entry::Vacant(e) => {
                e.insert(kept.len());
                kept.push(rec);
            }
        }
    }
    if kept.len() != before {
        tracing::debug!("collapsed {} duplicate records", before - kept.len());
    }
    kept
}

/// Records grouped by what has to be done with them this run.
#[derive(Debug, Default)]
pub struct SessionGroups<'a> {
    /// Code sessions to execute, by run id.
    pub code: BTreeMap<String, Vec<&'a CodeRecord>>,
    /// Console sessions to execute, by run id.
    pub cons: BTreeMap<String, Vec<&'a CodeRecord>>,
    /// Custom begin-hooks, by family.
    pub cc_begin: FxHashMap<String, Vec<&'a CodeRecord>>,
    /// Custom end-hooks, by family.
    pub cc_end: FxHashMap<String, Vec<&'a CodeRecord>>,
    /// Typeset records that need highlighting without executing anything.
    pub highlight: Vec<&'a CodeRecord>,
}

impl<'a> SessionGroups<'a> {
    pub fn hooks(&self, family: &str, position: HookPosition) -> &[&'a CodeRecord] {
        let map = match position {
            HookPosition::Begin => &self.cc_begin,
            HookPosition::End => &self.cc_end,
        };
        map.get(family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty() && self.cons.is_empty() && self.highlight.is_empty()
    }
}

/// Sort records into sessions according to `plan`.
///
/// Records of each session are ordered by instance. Console records of a
/// session that runs are highlighted by the console unit itself, so they are
/// not queued for highlighting.
pub fn group_sessions<'a>(records: &'a [CodeRecord], plan: &UpdatePlan) -> SessionGroups<'a> {
    let mut groups = SessionGroups::default();

    for rec in records {
        let run_id = rec.run_id();
        let typeset_update = rec.is_typeset && plan.typeset_update(rec.typeset_id());
        if rec.is_code {
            if plan.code.get(&run_id).copied().unwrap_or(false) {
                groups.code.entry(run_id).or_default().push(rec);
            }
            if typeset_update {
                groups.highlight.push(rec);
            }
        } else if rec.is_cons {
            if plan.cons.get(&run_id).copied().unwrap_or(false) {
                groups.cons.entry(run_id).or_default().push(rec);
            } else if typeset_update {
                groups.highlight.push(rec);
            }
        } else if let Some((family, position)) = &rec.cc {
            let map = match position {
                HookPosition::Begin => &mut groups.cc_begin,
                HookPosition::End => &mut groups.cc_end,
            };
            map.entry(family.clone()).or_default().push(rec);
        } else if (rec.is_pyg || rec.is_verb) && plan.typeset_update(rec.typeset_id()) {
            groups.highlight.push(rec);
        }
    }

    for session in groups.code.values_mut().chain(groups.cons.values_mut()) {
        session.sort_by_key(|r| r.instance_int);
    }

    tracing::debug!(
        "grouped {} code sessions, {} console sessions, {} highlight records",
        groups.code.len(),
        groups.cons.len(),
        groups.highlight.len()
    );
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::settings::Gobble;

    fn records(chunks: &[&str]) -> Vec<CodeRecord> {
        let engines = EngineRegistry::builtin().expect("Failed to build registry");
        chunks
            .iter()
            .map(|c| CodeRecord::parse(c, &engines, Gobble::None).expect("Failed to parse"))
            .collect()
    }

    fn plan_all(records: &[CodeRecord]) -> UpdatePlan {
        let mut plan = UpdatePlan::default();
        for r in records {
            if r.is_code {
                plan.code.insert(r.run_id(), true);
            } else if r.is_cons {
                plan.cons.insert(r.run_id(), true);
            }
            if r.is_typeset {
                plan.typeset.insert(r.typeset_id().to_string(), true);
            }
        }
        plan
    }

    #[test]
    fn test_duplicates_keep_last_occurrence() {
        let recs = collapse_duplicates(records(&[
            "py#a#default#0#block####doc.tex#1#\nold = 1\n",
            "py#a#default#1#block####doc.tex#5#\ny = 2\n",
            "py#a#default#0#block####doc.tex#1#\nnew = 1\n",
        ]));
        assert_eq!(recs.len(), 2);
        let plan = plan_all(&recs);
        let groups = group_sessions(&recs, &plan);
        let session = &groups.code["py#a#default"];
        assert_eq!(session.len(), 2);
        assert_eq!(session[0].code, "new = 1\n");
        assert_eq!(session.iter().filter(|r| r.instance_int == 0).count(), 1);
    }

    #[test]
    fn test_sessions_ordered_by_instance() {
        let recs = collapse_duplicates(records(&[
            "py#a#default#1#block####doc.tex#5#\ny = 2\n",
            "py#b#default#0#code####doc.tex#6#\nz = 3\n",
            "py#a#default#0#block####doc.tex#1#\nx = 1\n",
        ]));
        let plan = plan_all(&recs);
        let groups = group_sessions(&recs, &plan);
        let instances: Vec<i64> = groups.code["py#a#default"].iter().map(|r| r.instance_int).collect();
        assert_eq!(instances, vec![0, 1]);
        assert_eq!(groups.code["py#b#default"].len(), 1);
    }

    #[test]
    fn test_groups_by_kind() {
        let recs = records(&[
            "CC:py:begin#none#none#0#code####doc.tex#1#\nimport os\n",
            "py#a#default#0#block####doc.tex#2#\nx = 1\n",
            "py#b#default#0#code####doc.tex#4#\ny = 1\n",
            "pycon#default#default#0#console####doc.tex#6#\n>>> 1\n",
            "PYGpython#default#default#0#block####doc.tex#8#\nz\n",
            "CC:py:end#none#none#0#code####doc.tex#9#\nprint()\n",
        ]);
        let plan = plan_all(&recs);
        let groups = group_sessions(&recs, &plan);
        assert_eq!(groups.code.len(), 2);
        assert_eq!(groups.cons.len(), 1);
        assert_eq!(groups.hooks("py", HookPosition::Begin).len(), 1);
        assert_eq!(groups.hooks("py", HookPosition::End).len(), 1);
        assert!(groups.hooks("ruby", HookPosition::Begin).is_empty());
        let highlighted: Vec<&str> = groups.highlight.iter().map(|r| r.typeset_id()).collect();
        assert_eq!(highlighted, vec!["py#a#default#0", "PYGpython#default#default#0"]);
    }

    #[test]
    fn test_unchanged_sessions_only_highlight() {
        let recs = records(&[
            "py#a#default#0#block####doc.tex#2#\nx = 1\n",
            "pycon#default#default#0#console####doc.tex#6#\n>>> 1\n",
        ]);
        let mut plan = plan_all(&recs);
        plan.code.insert("py#a#default".into(), false);
        plan.cons.insert("pycon#default#default".into(), false);
        let groups = group_sessions(&recs, &plan);
        assert!(groups.code.is_empty());
        assert!(groups.cons.is_empty());
        assert_eq!(groups.highlight.len(), 2);

        plan.typeset.clear();
        assert!(group_sessions(&recs, &plan).is_empty());
    }
}
