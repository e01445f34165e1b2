use crate::error::GatewayError;
use crate::gateway::gateway_config::GatewayConfig;
use crate::membership::interface_manager::ReportSender;
use crate::packet::membership::MembershipReport;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A configuration with a one second response window, 50ms state change delay and 1s
///  retransmission interval
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::new("127.0.0.1:2268".parse().expect("valid literal"));
    config.max_response_delay = Duration::from_secs(1);
    config.state_change_report_delay = Duration::from_millis(50);
    config.unsolicited_report_interval = Duration::from_secs(1);
    config.robustness = 2;
    config
}

/// Records all reports it is asked to send, in order
#[derive(Default)]
pub struct RecordingReportSender {
    reports: Mutex<Vec<MembershipReport>>,
}

impl RecordingReportSender {
    pub fn reports(&self) -> Vec<MembershipReport> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// returns the reports recorded so far, clearing the record
    pub fn take(&self) -> Vec<MembershipReport> {
        std::mem::take(&mut *self.reports.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ReportSender for RecordingReportSender {
    async fn send_report(&self, report: MembershipReport) -> Result<(), GatewayError> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).push(report);
        Ok(())
    }
}
