use crate::membership::source_filter::{FilterMode, SourceFilter};
use crate::packet::membership::{GroupRecord, GroupRecordType};
use crate::timer::reschedulable_task::ReschedulableTimerTask;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Sources accumulated from one or more group specific queries that are waiting for a single
///  coalesced response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuerySourceSet {
    /// at least one of the queries was not source specific
    AllSources,
    Sources(BTreeSet<IpAddr>),
}

impl QuerySourceSet {
    pub fn from_query(sources: &[IpAddr]) -> QuerySourceSet {
        if sources.is_empty() {
            QuerySourceSet::AllSources
        }
        else {
            QuerySourceSet::Sources(sources.iter().cloned().collect())
        }
    }

    pub fn merge(&mut self, sources: &[IpAddr]) {
        match self {
            QuerySourceSet::AllSources => {}
            QuerySourceSet::Sources(pending) => {
                if sources.is_empty() {
                    *self = QuerySourceSet::AllSources;
                }
                else {
                    pending.extend(sources.iter().cloned());
                }
            }
        }
    }
}

/// An unsolicited state change report that is (re)transmitted until its retransmission count
///  is used up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    /// CHANGE_TO_INCLUDE / CHANGE_TO_EXCLUDE with the sources that are current when the report
    ///  is sent
    FilterMode,
    /// ALLOW / BLOCK deltas accumulated while the filter mode stayed the same
    SourceSet {
        allow: BTreeSet<IpAddr>,
        block: BTreeSet<IpAddr>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingStateChange {
    pub change: StateChange,
    pub transmissions_left: u8,
}

impl PendingStateChange {
    /// Folds a filter change into the pending report. A change of the filter mode supersedes
    ///  any pending source deltas, and pending mode changes are refreshed from the current
    ///  filter when sent.
    pub fn record(pending: &mut Option<PendingStateChange>, old: &SourceFilter, new: &SourceFilter, robustness: u8) {
        if old.mode() != new.mode() {
            *pending = Some(PendingStateChange {
                change: StateChange::FilterMode,
                transmissions_left: robustness,
            });
            return;
        }

        let added: BTreeSet<IpAddr> = new.sources().difference(old.sources()).cloned().collect();
        let removed: BTreeSet<IpAddr> = old.sources().difference(new.sources()).cloned().collect();
        let (newly_allowed, newly_blocked) = match new.mode() {
            FilterMode::Include => (added, removed),
            FilterMode::Exclude => (removed, added),
        };

        match pending {
            Some(PendingStateChange { change: StateChange::FilterMode, transmissions_left }) => {
                *transmissions_left = robustness;
            }
            Some(PendingStateChange { change: StateChange::SourceSet { allow, block }, transmissions_left }) => {
                for s in &newly_allowed {
                    block.remove(s);
                }
                for s in &newly_blocked {
                    allow.remove(s);
                }
                allow.extend(newly_allowed);
                block.extend(newly_blocked);
                *transmissions_left = robustness;
            }
            None => {
                *pending = Some(PendingStateChange {
                    change: StateChange::SourceSet { allow: newly_allowed, block: newly_blocked },
                    transmissions_left: robustness,
                });
            }
        }
    }

    /// The records of the next transmission, based on the group's current filter
    pub fn records(&self, group: IpAddr, current: &SourceFilter) -> Vec<GroupRecord> {
        match &self.change {
            StateChange::FilterMode => {
                let record_type = match current.mode() {
                    FilterMode::Include => GroupRecordType::ChangeToIncludeMode,
                    FilterMode::Exclude => GroupRecordType::ChangeToExcludeMode,
                };
                vec![GroupRecord::new(record_type, group, current.sources().iter().cloned())]
            }
            StateChange::SourceSet { allow, block } => {
                let mut result = Vec::new();
                if !allow.is_empty() {
                    result.push(GroupRecord::new(GroupRecordType::AllowNewSources, group, allow.iter().cloned()));
                }
                if !block.is_empty() {
                    result.push(GroupRecord::new(GroupRecordType::BlockOldSources, group, block.iter().cloned()));
                }
                result
            }
        }
    }
}

/// Everything the membership manager tracks for a single group
pub struct GroupMembershipRecord {
    pub group: IpAddr,
    pub filter: SourceFilter,
    pub pending_query: Option<QuerySourceSet>,
    pub query_report_task: Option<ReschedulableTimerTask>,
    pub pending_state_change: Option<PendingStateChange>,
    pub state_change_task: Option<ReschedulableTimerTask>,
}

impl GroupMembershipRecord {
    pub fn new(group: IpAddr) -> GroupMembershipRecord {
        GroupMembershipRecord {
            group,
            filter: SourceFilter::no_interest(),
            pending_query: None,
            query_report_task: None,
            pending_state_change: None,
            state_change_task: None,
        }
    }

    /// A record can be dropped when it neither expresses interest nor has reports pending
    pub fn is_evictable(&self) -> bool {
        self.filter.is_empty() && self.pending_query.is_none() && self.pending_state_change.is_none()
    }

    /// number of response timers currently armed for this record
    pub fn num_scheduled_query_reports(&self) -> usize {
        self.query_report_task.as_ref()
            .map(|t| if t.is_scheduled() { 1 } else { 0 })
            .unwrap_or(0)
    }

    /// The current state record answering a query, `None` if there is no interest
    pub fn current_state_record(&self) -> Option<GroupRecord> {
        if self.filter.is_empty() {
            return None;
        }
        let record_type = match self.filter.mode() {
            FilterMode::Include => GroupRecordType::ModeIsInclude,
            FilterMode::Exclude => GroupRecordType::ModeIsExclude,
        };
        Some(GroupRecord::new(record_type, self.group, self.filter.sources().iter().cloned()))
    }

    /// The response to a group specific or group-and-source specific query, `None` if the
    ///  response would be empty
    pub fn query_response_record(&self, queried: &QuerySourceSet) -> Option<GroupRecord> {
        let queried = match queried {
            QuerySourceSet::AllSources => return self.current_state_record(),
            QuerySourceSet::Sources(s) => s,
        };

        let sources: Vec<IpAddr> = match self.filter.mode() {
            FilterMode::Include => self.filter.sources().intersection(queried).cloned().collect(),
            FilterMode::Exclude => queried.difference(self.filter.sources()).cloned().collect(),
        };
        if sources.is_empty() {
            return None;
        }
        Some(GroupRecord::new(GroupRecordType::ModeIsInclude, self.group, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }
    fn set(s: &[&str]) -> BTreeSet<IpAddr> {
        s.iter().map(|s| ip(s)).collect()
    }

    #[test]
    fn test_query_source_set_merge() {
        let mut pending = QuerySourceSet::from_query(&[ip("10.0.0.1")]);
        pending.merge(&[ip("10.0.0.2"), ip("10.0.0.1")]);
        assert_eq!(pending, QuerySourceSet::Sources(set(&["10.0.0.1", "10.0.0.2"])));

        pending.merge(&[]);
        assert_eq!(pending, QuerySourceSet::AllSources);

        pending.merge(&[ip("10.0.0.3")]);
        assert_eq!(pending, QuerySourceSet::AllSources);
    }

    #[rstest]
    #[case::include_added(SourceFilter::include([]), SourceFilter::include([ip("10.0.0.1")]), &["10.0.0.1"], &[])]
    #[case::include_removed(SourceFilter::include([ip("10.0.0.1"), ip("10.0.0.2")]), SourceFilter::include([ip("10.0.0.2")]), &[], &["10.0.0.1"])]
    #[case::exclude_added(SourceFilter::exclude([]), SourceFilter::exclude([ip("10.0.0.1")]), &[], &["10.0.0.1"])]
    #[case::exclude_removed(SourceFilter::exclude([ip("10.0.0.1")]), SourceFilter::exclude([]), &["10.0.0.1"], &[])]
    fn test_record_source_change(#[case] old: SourceFilter, #[case] new: SourceFilter, #[case] allow: &[&str], #[case] block: &[&str]) {
        let mut pending = None;
        PendingStateChange::record(&mut pending, &old, &new, 2);
        assert_eq!(pending, Some(PendingStateChange {
            change: StateChange::SourceSet { allow: set(allow), block: set(block) },
            transmissions_left: 2,
        }));
    }

    #[test]
    fn test_record_accumulates_deltas() {
        let s1 = ip("10.0.0.1");
        let s2 = ip("10.0.0.2");
        let mut pending = None;

        PendingStateChange::record(&mut pending, &SourceFilter::include([s1]), &SourceFilter::include([s1, s2]), 2);
        PendingStateChange::record(&mut pending, &SourceFilter::include([s1, s2]), &SourceFilter::include([s2]), 2);
        assert_eq!(pending.as_ref().unwrap().change, StateChange::SourceSet { allow: set(&["10.0.0.2"]), block: set(&["10.0.0.1"]) });

        // s1 comes back: no longer blocked
        PendingStateChange::record(&mut pending, &SourceFilter::include([s2]), &SourceFilter::include([s1, s2]), 2);
        assert_eq!(pending.unwrap().change, StateChange::SourceSet { allow: set(&["10.0.0.1", "10.0.0.2"]), block: set(&[]) });
    }

    #[test]
    fn test_record_mode_change_supersedes() {
        let s1 = ip("10.0.0.1");
        let mut pending = None;
        PendingStateChange::record(&mut pending, &SourceFilter::include([]), &SourceFilter::include([s1]), 2);
        PendingStateChange::record(&mut pending, &SourceFilter::include([s1]), &SourceFilter::exclude([]), 3);
        assert_eq!(pending, Some(PendingStateChange { change: StateChange::FilterMode, transmissions_left: 3 }));

        // source changes while a mode change is pending are picked up from the current filter
        PendingStateChange::record(&mut pending, &SourceFilter::exclude([]), &SourceFilter::exclude([s1]), 3);
        let pending = pending.unwrap();
        assert_eq!(pending.change, StateChange::FilterMode);
        assert_eq!(
            pending.records(ip("239.1.1.1"), &SourceFilter::exclude([s1])),
            vec![GroupRecord::new(GroupRecordType::ChangeToExcludeMode, ip("239.1.1.1"), [s1])]
        );
    }

    #[rstest]
    #[case::all_sources_include(SourceFilter::include([ip("10.0.0.1")]), QuerySourceSet::AllSources, Some((GroupRecordType::ModeIsInclude, vec!["10.0.0.1"])))]
    #[case::all_sources_exclude(SourceFilter::exclude([ip("10.0.0.1")]), QuerySourceSet::AllSources, Some((GroupRecordType::ModeIsExclude, vec!["10.0.0.1"])))]
    #[case::all_sources_no_interest(SourceFilter::no_interest(), QuerySourceSet::AllSources, None)]
    #[case::include_intersection(SourceFilter::include([ip("10.0.0.1"), ip("10.0.0.2")]), QuerySourceSet::Sources(set(&["10.0.0.2", "10.0.0.3"])), Some((GroupRecordType::ModeIsInclude, vec!["10.0.0.2"])))]
    #[case::include_disjoint(SourceFilter::include([ip("10.0.0.1")]), QuerySourceSet::Sources(set(&["10.0.0.3"])), None)]
    #[case::exclude_difference(SourceFilter::exclude([ip("10.0.0.1")]), QuerySourceSet::Sources(set(&["10.0.0.1", "10.0.0.3"])), Some((GroupRecordType::ModeIsInclude, vec!["10.0.0.3"])))]
    #[case::exclude_all_excluded(SourceFilter::exclude([ip("10.0.0.1")]), QuerySourceSet::Sources(set(&["10.0.0.1"])), None)]
    fn test_query_response_record(#[case] filter: SourceFilter, #[case] queried: QuerySourceSet, #[case] expected: Option<(GroupRecordType, Vec<&str>)>) {
        let group = ip("239.1.1.1");
        let mut record = GroupMembershipRecord::new(group);
        record.filter = filter;

        let expected = expected.map(|(t, sources)| GroupRecord::new(t, group, sources.into_iter().map(ip)));
        assert_eq!(record.query_response_record(&queried), expected);
    }

    #[test]
    fn test_is_evictable() {
        let mut record = GroupMembershipRecord::new(ip("239.1.1.1"));
        assert!(record.is_evictable());

        record.pending_query = Some(QuerySourceSet::AllSources);
        assert!(!record.is_evictable());
        record.pending_query = None;

        record.filter = SourceFilter::all_sources();
        assert!(!record.is_evictable());
    }
}
