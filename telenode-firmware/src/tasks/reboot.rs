//! Scheduled restart after a fixed uptime

use defmt::*;
use embassy_time::{Duration, Timer};

use telenode_core::scheduler::reboot;

use crate::board::Board;
use crate::NodeMutex;

#[embassy_executor::task]
pub async fn reboot_task(node: &'static NodeMutex, after_s: u32) {
    info!("Scheduled restart in {=u32} s", after_s);
    Timer::after(Duration::from_secs(u64::from(after_s))).await;

    let mut board = Board;
    reboot(node, &mut board).await;
}
