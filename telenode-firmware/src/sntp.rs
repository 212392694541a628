//! One-shot SNTP wall-clock sync

use defmt::*;
use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Stack};
use embassy_time::{with_timeout, Duration, Timer};

use telenode_core::time::{parse_sntp_reply, sntp_request, SNTP_PACKET_LEN};

use crate::board;

const NTP_PORT: u16 = 123;
const LOCAL_PORT: u16 = 12_300;
const FALLBACK_SERVER: &str = "pool.ntp.org";
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);
const RETRY_INTERVAL: Duration = Duration::from_secs(30);
const RESYNC_INTERVAL: Duration = Duration::from_secs(6 * 3600);

async fn query(stack: Stack<'static>, server: IpAddress) -> Option<i64> {
    let mut rx_meta = [PacketMetadata::EMPTY; 1];
    let mut tx_meta = [PacketMetadata::EMPTY; 1];
    let mut rx_buf = [0u8; 128];
    let mut tx_buf = [0u8; 128];
    let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
    socket.bind(LOCAL_PORT).ok()?;

    let endpoint = IpEndpoint::new(server, NTP_PORT);
    socket.send_to(&sntp_request(), endpoint).await.ok()?;

    let mut reply = [0u8; SNTP_PACKET_LEN];
    match with_timeout(REPLY_TIMEOUT, socket.recv_from(&mut reply)).await {
        Ok(Ok((len, _))) => parse_sntp_reply(&reply[..len]),
        _ => None,
    }
}

/// Gateway first, then the public pool
async fn sync(stack: Stack<'static>) -> Option<i64> {
    if let Some(gateway) = stack.config_v4().and_then(|c| c.gateway) {
        if let Some(unix) = query(stack, IpAddress::Ipv4(gateway)).await {
            return Some(unix);
        }
        debug!("sntp: no answer from gateway");
    }
    let addrs = stack.dns_query(FALLBACK_SERVER, DnsQueryType::A).await.ok()?;
    query(stack, *addrs.first()?).await
}

/// Keep the board's wall clock set
#[embassy_executor::task]
pub async fn sntp_task(stack: Stack<'static>) -> ! {
    loop {
        stack.wait_config_up().await;
        match sync(stack).await {
            Some(unix) => {
                board::set_unix_time(unix);
                info!("sntp: clock set to {=i64}", unix);
                Timer::after(RESYNC_INTERVAL).await;
            }
            None => {
                warn!("sntp: sync failed");
                Timer::after(RETRY_INTERVAL).await;
            }
        }
    }
}
