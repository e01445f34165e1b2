pub mod channel_manager;
pub mod group_record;
pub mod interface_manager;
pub mod report_tasks;
pub mod source_filter;
