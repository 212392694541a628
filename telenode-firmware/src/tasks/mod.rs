//! Embassy async tasks
//!
//! Each timer task owns a [`crate::board::Board`] handle and reaches the
//! node through the shared lock.

pub mod check_msgs;
pub mod measure;
pub mod reboot;

pub use check_msgs::check_msgs_task;
pub use measure::measure_task;
pub use reboot::reboot_task;
