//! Folding one company's window snapshots into a canonical record per problem.

use std::collections::BTreeMap;

use qbank_adapters::WindowRecords;
use qbank_core::{ProblemRecord, TimeframeTag, Window};
use serde::Serialize;

/// Windows a problem was seen in during the current run. Only the windows that
/// can tag an association are tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceFlags {
    pub thirty_days: bool,
    pub three_months: bool,
    pub six_months: bool,
}

impl PresenceFlags {
    pub fn mark(&mut self, window: Window) {
        match window.timeframe() {
            Some(TimeframeTag::ThirtyDays) => self.thirty_days = true,
            Some(TimeframeTag::ThreeMonths) => self.three_months = true,
            Some(TimeframeTag::SixMonths) => self.six_months = true,
            None => {}
        }
    }

    pub fn contains(&self, tag: TimeframeTag) -> bool {
        match tag {
            TimeframeTag::ThirtyDays => self.thirty_days,
            TimeframeTag::ThreeMonths => self.three_months,
            TimeframeTag::SixMonths => self.six_months,
        }
    }
}

/// Narrowest observed window wins: thirty-days, then three-months, then six-months.
pub fn resolve_timeframe(flags: PresenceFlags) -> Option<TimeframeTag> {
    TimeframeTag::PRIORITY
        .into_iter()
        .find(|tag| flags.contains(*tag))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedProblem {
    pub record: ProblemRecord,
    pub timeframe: Option<TimeframeTag>,
    /// Last window file in merge order that contained the problem.
    pub source_window: Window,
}

pub type MergedSnapshot = BTreeMap<i64, MergedProblem>;

struct Staged {
    record: ProblemRecord,
    flags: PresenceFlags,
    source_window: Window,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotMerger;

impl SnapshotMerger {
    /// Merge the given window sets. Sets are always folded in
    /// [`Window::MERGE_ORDER`], whatever order they arrive in.
    pub fn merge<'a, I>(sets: I) -> MergedSnapshot
    where
        I: IntoIterator<Item = (Window, &'a WindowRecords)>,
    {
        let ordered = sets.into_iter().collect::<BTreeMap<_, _>>();
        let mut staged: BTreeMap<i64, Staged> = BTreeMap::new();

        for (window, records) in ordered {
            for (id, record) in records {
                let entry = staged.entry(*id).or_insert_with(|| Staged {
                    record: record.clone(),
                    flags: PresenceFlags::default(),
                    source_window: window,
                });
                // `all` is the authoritative metadata source; any other window
                // only fills a problem the first time it is seen.
                if window == Window::All {
                    entry.record = record.clone();
                }
                entry.flags.mark(window);
                entry.source_window = window;
            }
        }

        staged
            .into_iter()
            .map(|(id, staged)| {
                (
                    id,
                    MergedProblem {
                        record: staged.record,
                        timeframe: resolve_timeframe(staged.flags),
                        source_window: staged.source_window,
                    },
                )
            })
            .collect()
    }
}
