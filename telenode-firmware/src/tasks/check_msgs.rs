//! Control-channel timer: status, inbound commands, keepalive

use defmt::*;
use embassy_time::{Duration, Ticker};

use telenode_core::scheduler::{check_messages, SchedulerError};

use crate::board::Board;
use crate::NodeMutex;

#[embassy_executor::task]
pub async fn check_msgs_task(node: &'static NodeMutex, interval_ms: u32) {
    info!("Message check task started, every {=u32} ms", interval_ms);

    let mut board = Board;
    let mut ticker = Ticker::every(Duration::from_millis(u64::from(interval_ms)));

    loop {
        ticker.next().await;

        match check_messages(node, &mut board).await {
            Ok(()) | Err(SchedulerError::LockBusy) => {}
            Err(e) => warn!("message check failed: {:?}", e),
        }
    }
}
