//! Flow-controlled image streaming.
//!
//! Packets are written without response; the peer acknowledges every
//! `prn_interval` packets with a receipt notification carrying the number of
//! bytes received so far. The final window is acknowledged by the receipt
//! report, whose CRC16 must match the locally computed one.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, trace};

use super::error::{DfuResult, StreamError};
use super::firmware_reader::FirmwarePart;
use super::packet::{packet_count, packets};
use super::protocol::DfuProtocol;
use super::transport::BleTransport;

/// Progress of the part being transferred.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    /// Acknowledged share of the current part, 0-100.
    pub percent: u8,
    /// Bytes per millisecond since the previous callback.
    pub speed: f32,
    /// Bytes per millisecond since the part started.
    pub avg_speed: f32,
    /// 1-based index of the current part.
    pub current_part: usize,
    pub total_parts: usize,
}

/// Outcome of a completed part transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamResult {
    pub bytes_sent: u32,
    /// CRC16 the peer reported for the received image.
    pub crc: u16,
}

/// Computes speed figures between acknowledgements.
struct SpeedMeter {
    total: usize,
    started: Instant,
    last_at: Instant,
    last_bytes: usize,
}

impl SpeedMeter {
    fn new(total: usize) -> Self {
        let now = Instant::now();
        Self {
            total,
            started: now,
            last_at: now,
            last_bytes: 0,
        }
    }

    /// Percent plus instantaneous and average speed for `acked` bytes.
    fn sample(&mut self, acked: usize) -> (u8, f32, f32) {
        let now = Instant::now();
        let speed = bytes_per_ms(acked - self.last_bytes, now - self.last_at);
        let avg_speed = bytes_per_ms(acked, now - self.started);
        self.last_at = now;
        self.last_bytes = acked;

        let percent = if self.total == 0 {
            100
        } else {
            (acked * 100 / self.total) as u8
        };
        (percent, speed, avg_speed)
    }
}

fn bytes_per_ms(bytes: usize, elapsed: std::time::Duration) -> f32 {
    let ms = elapsed.as_secs_f32() * 1000.0;
    if ms <= 0.0 {
        0.0
    } else {
        bytes as f32 / ms
    }
}

/// Stream the image of `part` through `protocol`.
///
/// Never more than `prn_interval` packets are unacknowledged. `on_progress`
/// is called after every acknowledgement; the last call carries 100 percent.
pub fn stream<T, F>(
    protocol: &mut DfuProtocol<T>,
    part: &FirmwarePart,
    prn_interval: u16,
    part_index: usize,
    total_parts: usize,
    mut on_progress: F,
) -> DfuResult<StreamResult>
where
    T: BleTransport,
    F: FnMut(TransferProgress),
{
    let prn = prn_interval.max(1) as usize;
    let packet_size = protocol.session().packet_size();
    let total = part.payload.len();
    let count = packet_count(total, packet_size);

    debug!(
        kind = ?part.kind,
        bytes = total,
        packets = count,
        packet_size,
        prn,
        "Streaming firmware part"
    );

    let mut meter = SpeedMeter::new(total);
    let mut report = |acked: usize| {
        let (percent, speed, avg_speed) = meter.sample(acked);
        on_progress(TransferProgress {
            percent,
            speed,
            avg_speed,
            current_part: part_index + 1,
            total_parts,
        });
    };

    let mut sent = 0usize;
    for (index, chunk) in packets(&part.payload, packet_size).enumerate() {
        protocol.write_packet(chunk)?;
        sent += chunk.len();

        let written = index + 1;
        if written % prn == 0 && written < count {
            let received = protocol.wait_prn()?;
            trace!(sent, received, "Packet receipt");
            if received as usize != sent {
                return Err(StreamError::ReceiptMismatch {
                    expected: sent as u32,
                    actual: received,
                }
                .into());
            }
            report(sent);
        }
    }

    let (offset, crc) = protocol.report_receipt()?;
    if offset as usize != total {
        return Err(StreamError::ReceiptMismatch {
            expected: total as u32,
            actual: offset,
        }
        .into());
    }

    let expected = crc16::State::<crc16::CCITT_FALSE>::calculate(&part.payload);
    if crc != expected {
        return Err(StreamError::CrcMismatch {
            expected,
            actual: crc,
        }
        .into());
    }

    report(total);
    debug!(bytes = total, crc = format_args!("0x{:04X}", crc), "Part transferred");

    Ok(StreamResult {
        bytes_sent: total as u32,
        crc,
    })
}
