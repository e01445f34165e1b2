//! Timer actions that send membership reports. They hold weak references to the manager's
//!  shared state. When they fire, they build their reports from the current state under the
//!  manager's lock and send them after releasing it.

use crate::error::GatewayError;
use crate::membership::interface_manager::ManagerShared;
use crate::packet::membership::MembershipReport;
use crate::timer::reschedulable_task::TimerAction;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Fires the coalesced response to group specific queries for one group
pub struct GroupQueryReportTask {
    manager: Weak<ManagerShared>,
    group: IpAddr,
}
impl GroupQueryReportTask {
    pub(crate) fn new(manager: Weak<ManagerShared>, group: IpAddr) -> GroupQueryReportTask {
        GroupQueryReportTask { manager, group }
    }
}

#[async_trait]
impl TimerAction for GroupQueryReportTask {
    async fn on_timer(&self) -> Option<Duration> {
        if let Some(manager) = self.manager.upgrade() {
            manager.send_group_query_response(self.group).await;
        }
        None
    }
}

pub struct GeneralQueryReportTimer {
    manager: Weak<ManagerShared>,
}
impl GeneralQueryReportTimer {
    pub(crate) fn new(manager: Weak<ManagerShared>) -> GeneralQueryReportTimer {
        GeneralQueryReportTimer { manager }
    }
}

#[async_trait]
impl TimerAction for GeneralQueryReportTimer {
    async fn on_timer(&self) -> Option<Duration> {
        if let Some(manager) = self.manager.upgrade() {
            manager.send_general_query_response().await;
        }
        None
    }
}

/// (Re)transmits a group's pending state change report until its transmission count is used up
pub struct StateChangeReportTask {
    manager: Weak<ManagerShared>,
    group: IpAddr,
}
impl StateChangeReportTask {
    pub(crate) fn new(manager: Weak<ManagerShared>, group: IpAddr) -> StateChangeReportTask {
        StateChangeReportTask { manager, group }
    }
}

#[async_trait]
impl TimerAction for StateChangeReportTask {
    async fn on_timer(&self) -> Option<Duration> {
        match self.manager.upgrade() {
            Some(manager) => manager.send_state_change_report(self.group).await,
            None => None,
        }
    }
}

impl ManagerShared {
    pub(crate) async fn send_group_query_response(&self, group: IpAddr) {
        let reports = self.group_query_response(group).await;
        self.send_all(reports).await;
    }

    async fn group_query_response(&self, group: IpAddr) -> Vec<MembershipReport> {
        let mut state = self.state.lock().await;
        if state.closed {
            return vec![];
        }
        let Some(record) = state.records.get_mut(&group) else {
            return vec![];
        };
        let Some(queried) = record.pending_query.take() else {
            trace!("no pending query for group {} - skipping response", group);
            return vec![];
        };

        let reports = match record.query_response_record(&queried) {
            Some(response) => {
                debug!("responding to query for group {}: {:?}", group, response);
                MembershipReport::new(vec![response]).split_to_fit(self.config.max_report_payload)
            }
            None => {
                debug!("nothing to report for query {:?} on group {}", queried, group);
                vec![]
            }
        };

        if record.is_evictable() {
            state.records.remove(&group);
        }
        reports
    }

    pub(crate) async fn send_general_query_response(&self) {
        let reports = self.general_query_response().await;
        self.send_all(reports).await;
    }

    async fn general_query_response(&self) -> Vec<MembershipReport> {
        let state = self.state.lock().await;
        if state.closed {
            return vec![];
        }

        let (v4, v6): (Vec<_>, Vec<_>) = state.records.values()
            .filter_map(|r| r.current_state_record())
            .partition(|r| r.group.is_ipv4());

        if v4.is_empty() && v6.is_empty() {
            debug!("general query: no groups to report");
            return vec![];
        }
        debug!("responding to general query with {} IPv4 and {} IPv6 group records", v4.len(), v6.len());

        [v4, v6].into_iter()
            .filter(|records| !records.is_empty())
            .flat_map(|records| MembershipReport::new(records).split_to_fit(self.config.max_report_payload))
            .collect()
    }

    /// returns the delay until the next retransmission, if any
    pub(crate) async fn send_state_change_report(&self, group: IpAddr) -> Option<Duration> {
        let (reports, next) = self.state_change_report(group).await?;
        self.send_all(reports).await;
        next
    }

    async fn state_change_report(&self, group: IpAddr) -> Option<(Vec<MembershipReport>, Option<Duration>)> {
        let mut state = self.state.lock().await;
        if state.closed {
            return None;
        }
        let record = state.records.get_mut(&group)?;
        let pending = record.pending_state_change.as_mut()?;

        let records = pending.records(group, &record.filter);
        pending.transmissions_left = pending.transmissions_left.saturating_sub(1);
        let done = pending.transmissions_left == 0;
        if done {
            record.pending_state_change = None;
        }

        let reports = if records.is_empty() {
            trace!("state change for group {} cancelled out", group);
            vec![]
        }
        else {
            debug!("sending state change report for group {}: {:?}", group, records);
            MembershipReport::new(records).split_to_fit(self.config.max_report_payload)
        };

        if !done {
            return Some((reports, Some(self.config.unsolicited_report_interval)));
        }
        if record.is_evictable() {
            debug!("group {} has no interest and no pending reports - removing it", group);
            state.records.remove(&group);
        }
        Some((reports, None))
    }

    /// must not be called while holding the state lock
    async fn send_all(&self, reports: Vec<MembershipReport>) {
        for report in reports {
            match self.report_sender.send_report(report).await {
                Ok(()) => {}
                Err(GatewayError::NotConnected) => debug!("no active tunnel - dropping membership report"),
                Err(e) => warn!("error sending membership report: {}", e),
            }
        }
    }
}
