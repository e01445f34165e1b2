use crate::error::GatewayError;
use crate::gateway::gateway_config::GatewayConfig;
use crate::membership::group_record::{GroupMembershipRecord, PendingStateChange, QuerySourceSet};
use crate::membership::report_tasks::{GeneralQueryReportTimer, GroupQueryReportTask, StateChangeReportTask};
use crate::membership::source_filter::SourceFilter;
use crate::packet::membership::{MembershipQuery, MembershipReport};
use crate::timer::reschedulable_task::ReschedulableTimerTask;
use crate::timer::timer_service::TimerService;
use crate::util::random::{jittered_delay, Random, RngRandom};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// The path through which the membership manager sends reports to the relay. The manager never
///  touches the relay socket itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReportSender: Send + Sync + 'static {
    async fn send_report(&self, report: MembershipReport) -> Result<(), GatewayError>;
}

/// The authoritative record of the groups and sources this host wants to receive, and the logic
///  deciding which reports are sent when.
///
/// All state is guarded by a single lock per manager. Report timers take the same lock when
///  they fire, so every report reflects the state at the time it is sent, and queries arriving
///  while a response is being built wait for it to complete.
pub struct InterfaceMembershipManager<R: Random = RngRandom> {
    shared: Arc<ManagerShared>,
    _random: PhantomData<R>,
}

impl <R: Random> Clone for InterfaceMembershipManager<R> {
    fn clone(&self) -> Self {
        InterfaceMembershipManager {
            shared: self.shared.clone(),
            _random: PhantomData,
        }
    }
}

pub(crate) struct ManagerShared {
    pub(crate) config: Arc<GatewayConfig>,
    pub(crate) timer_service: TimerService,
    pub(crate) report_sender: Arc<dyn ReportSender>,
    pub(crate) state: Mutex<ManagerState>,
}

pub(crate) struct ManagerState {
    pub(crate) records: BTreeMap<IpAddr, GroupMembershipRecord>,
    pub(crate) general_query_task: Option<ReschedulableTimerTask>,
    pub(crate) closed: bool,
}

impl InterfaceMembershipManager<RngRandom> {
    pub fn new(config: Arc<GatewayConfig>, timer_service: TimerService, report_sender: Arc<dyn ReportSender>) -> Self {
        Self::new_with_random(config, timer_service, report_sender)
    }
}

impl <R: Random> InterfaceMembershipManager<R> {
    pub fn new_with_random(config: Arc<GatewayConfig>, timer_service: TimerService, report_sender: Arc<dyn ReportSender>) -> Self {
        InterfaceMembershipManager {
            shared: Arc::new(ManagerShared {
                config,
                timer_service,
                report_sender,
                state: Mutex::new(ManagerState {
                    records: Default::default(),
                    general_query_task: None,
                    closed: false,
                }),
            }),
            _random: PhantomData,
        }
    }

    async fn lock_open(&self) -> Result<MutexGuard<'_, ManagerState>, GatewayError> {
        let state = self.shared.state.lock().await;
        if state.closed {
            return Err(GatewayError::Closed);
        }
        Ok(state)
    }

    /// Adds interest in `group` as described by `filter`, combining it with existing interest
    ///  for the group.
    pub async fn join(&self, group: IpAddr, filter: SourceFilter) -> Result<(), GatewayError> {
        filter.validate_for_group(&group)?;

        let mut state = self.lock_open().await?;
        let merged = match state.records.get(&group) {
            Some(record) => record.filter.union(&filter),
            None => filter,
        };
        self.shared.apply_filter(&mut state, group, merged);
        Ok(())
    }

    /// Removes all interest in `group`
    pub async fn leave(&self, group: IpAddr) -> Result<(), GatewayError> {
        SourceFilter::no_interest().validate_for_group(&group)?;

        let mut state = self.lock_open().await?;
        if !state.records.contains_key(&group) {
            debug!("leaving group {} that was never joined", group);
            return Ok(());
        }
        self.shared.apply_filter(&mut state, group, SourceFilter::no_interest());
        Ok(())
    }

    /// Replaces the filter for `group`. An empty filter is equivalent to leaving the group.
    pub async fn update_filter(&self, group: IpAddr, filter: SourceFilter) -> Result<(), GatewayError> {
        filter.validate_for_group(&group)?;

        let mut state = self.lock_open().await?;
        if filter.is_empty() && !state.records.contains_key(&group) {
            return Ok(());
        }
        self.shared.apply_filter(&mut state, group, filter);
        Ok(())
    }

    pub async fn handle_query(&self, query: &MembershipQuery) {
        match query.group {
            None => self.handle_general_query(query.max_response_delay).await,
            Some(group) => self.handle_group_query(group, &query.sources, query.max_response_delay).await,
        }
    }

    /// Schedules a report of all groups' current state after a random delay in the response
    ///  window. A response that is already pending is kept if it fires no later than the new
    ///  delay.
    pub async fn handle_general_query(&self, max_response_delay: Duration) {
        let delay = jittered_delay::<R>(self.shared.config.response_window(max_response_delay));

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return;
        }

        let shared = &self.shared;
        let task = state.general_query_task.get_or_insert_with(|| ReschedulableTimerTask::new(
            &shared.timer_service,
            "general query report",
            Arc::new(GeneralQueryReportTimer::new(Arc::downgrade(shared))),
        ));
        match task.time_remaining() {
            Some(remaining) if remaining <= delay => {
                debug!("general query response already pending in {:?} - keeping it", remaining);
            }
            _ => {
                debug!("scheduling general query response in {:?}", delay);
                task.schedule(delay);
            }
        }
    }

    /// Schedules a response to a group specific (`sources` empty) or group-and-source specific
    ///  query. If a response for the group is pending already, the query's sources are merged
    ///  into it without changing its fire time.
    pub async fn handle_group_query(&self, group: IpAddr, sources: &[IpAddr], max_response_delay: Duration) {
        let delay = jittered_delay::<R>(self.shared.config.response_window(max_response_delay));

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return;
        }

        let general_response_sooner = state.general_query_task.as_ref()
            .and_then(|t| t.time_remaining())
            .map(|remaining| remaining <= delay)
            .unwrap_or(false);

        let Some(record) = state.records.get_mut(&group) else {
            debug!("query for group {} that is not tracked - ignoring", group);
            return;
        };
        if record.filter.is_empty() {
            debug!("query for group {} without interest - ignoring", group);
            return;
        }
        if let Some(pending) = &mut record.pending_query {
            pending.merge(sources);
            debug!("response for group {} pending, coalesced query sources into {:?}", group, pending);
            return;
        }
        if general_response_sooner {
            debug!("general query response is pending sooner than {:?} - no separate response for group {}", delay, group);
            return;
        }

        record.pending_query = Some(QuerySourceSet::from_query(sources));
        let shared = &self.shared;
        let task = record.query_report_task.get_or_insert_with(|| ReschedulableTimerTask::new(
            &shared.timer_service,
            "group query report",
            Arc::new(GroupQueryReportTask::new(Arc::downgrade(shared), group)),
        ));
        debug!("scheduling response for group {} in {:?}", group, delay);
        task.schedule(delay);
    }

    /// Drops all pending responses and state change reports without sending them. This is
    ///  called when the tunnel stops being active: the relay's next query after the tunnel is
    ///  re-established triggers a full report.
    pub async fn cancel_pending_reports(&self) {
        let mut state = self.shared.state.lock().await;
        ManagerShared::cancel_all(&mut state);
    }

    /// Cancels all timers synchronously and rejects all further operations
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        state.closed = true;
        ManagerShared::cancel_all(&mut state);
        state.records.clear();
        state.general_query_task = None;
    }

    pub async fn filter(&self, group: &IpAddr) -> Option<SourceFilter> {
        self.shared.state.lock().await
            .records.get(group)
            .map(|r| r.filter.clone())
    }

    /// all groups for which the manager holds a record, including groups that were left and
    ///  still have reports pending
    pub async fn groups(&self) -> Vec<IpAddr> {
        self.shared.state.lock().await
            .records.keys()
            .cloned()
            .collect()
    }

    pub async fn num_scheduled_query_reports(&self, group: &IpAddr) -> usize {
        self.shared.state.lock().await
            .records.get(group)
            .map(|r| r.num_scheduled_query_reports())
            .unwrap_or(0)
    }

    pub async fn pending_query_report_delay(&self, group: &IpAddr) -> Option<Duration> {
        self.shared.state.lock().await
            .records.get(group)
            .and_then(|r| r.query_report_task.as_ref())
            .and_then(|t| t.time_remaining())
    }

    pub async fn pending_general_report_delay(&self) -> Option<Duration> {
        self.shared.state.lock().await
            .general_query_task.as_ref()
            .and_then(|t| t.time_remaining())
    }
}

impl ManagerShared {
    fn apply_filter(self: &Arc<Self>, state: &mut ManagerState, group: IpAddr, new_filter: SourceFilter) {
        let record = state.records.entry(group)
            .or_insert_with(|| GroupMembershipRecord::new(group));

        if record.filter == new_filter {
            debug!("filter for group {} unchanged: {:?}", group, new_filter);
            if record.is_evictable() {
                state.records.remove(&group);
            }
            return;
        }

        debug!("filter for group {}: {:?} -> {:?}", group, record.filter, new_filter);
        let old_filter = std::mem::replace(&mut record.filter, new_filter);
        PendingStateChange::record(&mut record.pending_state_change, &old_filter, &record.filter, self.config.robustness);

        let task = record.state_change_task.get_or_insert_with(|| ReschedulableTimerTask::new(
            &self.timer_service,
            "state change report",
            Arc::new(StateChangeReportTask::new(Arc::downgrade(self), group)),
        ));
        let delay = self.config.state_change_report_delay;
        if task.time_remaining().map(|remaining| remaining > delay).unwrap_or(true) {
            task.schedule(delay);
        }
    }

    fn cancel_all(state: &mut ManagerState) {
        if let Some(task) = &state.general_query_task {
            task.cancel();
        }
        for record in state.records.values_mut() {
            record.pending_query = None;
            if let Some(task) = &record.query_report_task {
                task.cancel();
            }
            record.pending_state_change = None;
            if let Some(task) = &record.state_change_task {
                task.cancel();
            }
        }
        state.records.retain(|_, r| !r.is_evictable());
    }
}
