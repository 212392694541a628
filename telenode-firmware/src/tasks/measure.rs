//! Telemetry timer
//!
//! Ticks at `measure_interval_ms`. A tick that finds the node busy is
//! skipped, not queued.

use defmt::*;
use embassy_time::{Duration, Ticker};

use telenode_core::policy::SendTrigger;
use telenode_core::scheduler::{tick, SchedulerError};

use crate::board::Board;
use crate::NodeMutex;

#[embassy_executor::task]
pub async fn measure_task(node: &'static NodeMutex, interval_ms: u32, trigger: SendTrigger) {
    info!("Measure task started, every {=u32} ms", interval_ms);

    let mut board = Board;
    let mut ticker = Ticker::every(Duration::from_millis(u64::from(interval_ms)));
    let arg = trigger.to_arg();

    loop {
        ticker.next().await;

        match tick(node, &mut board, arg).await {
            Ok(report) => debug!(
                "tick: sampled={=u8} sent={=u8} failed={=u8}",
                report.sampled, report.sent, report.failed
            ),
            Err(SchedulerError::LockBusy) => {}
            Err(SchedulerError::Restarting) => {
                warn!("tick: restart pending");
            }
            Err(e) => warn!("tick failed: {:?}", e),
        }
    }
}
