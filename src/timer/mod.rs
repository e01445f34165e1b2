pub mod reschedulable_task;
pub mod timer_service;
