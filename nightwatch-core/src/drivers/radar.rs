//! mmWave radar driver (UART).
//!
//! ## Framing
//!
//! The LD2450 reports up to three tracked targets per ~100 ms frame:
//!
//! ```text
//! AA FF 03 00 | 3 × (x u16 | y u16 | speed u16 | resolution u16) | 55 CC
//! ```
//!
//! Coordinates are signed-magnitude little-endian (MSB set = positive).
//! The LD2410 variant carries a presence/distance report inside an
//! F4 F3 F2 F1 … F8 F7 F6 F5 envelope and maps onto a single pseudo-target.
//!
//! Byte loss is expected on jittery UARTs: the decoder seeks the preamble,
//! discards malformed runs, and counts each resynchronization. Malformed
//! length/tail drops the frame, never the stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use futures_util::StreamExt;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::{Decoder, Framed};

use crate::clock::SharedClock;
use crate::drivers::{DriverError, RadarFrame, RadarTarget, SensorDriver};
use crate::events::DetectorId;

/// Slowest frame period is ~100 ms; 1 s is > 3 frame periods of slack.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

const LD2450_PREAMBLE: [u8; 4] = [0xAA, 0xFF, 0x03, 0x00];
const LD2450_TAIL: [u8; 2] = [0x55, 0xCC];
const LD2450_FRAME_LEN: usize = 30;

const LD2410_PREAMBLE: [u8; 4] = [0xF4, 0xF3, 0xF2, 0xF1];
const LD2410_TAIL: [u8; 4] = [0xF8, 0xF7, 0xF6, 0xF5];

/// Supported radar modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadarModel {
    Ld2450,
    Ld2410,
}

/// Frame decoder with preamble resynchronization.
#[derive(Debug)]
pub struct RadarCodec {
    model: RadarModel,
    resyncs: u64,
}

impl RadarCodec {
    pub fn new(model: RadarModel) -> Self {
        Self { model, resyncs: 0 }
    }

    /// Resynchronizations since the last call.
    pub fn take_resyncs(&mut self) -> u64 {
        std::mem::take(&mut self.resyncs)
    }

    fn preamble(&self) -> &'static [u8] {
        match self.model {
            RadarModel::Ld2450 => &LD2450_PREAMBLE,
            RadarModel::Ld2410 => &LD2410_PREAMBLE,
        }
    }

    /// Skip to the next preamble. Returns false when more bytes are needed.
    fn seek_preamble(&mut self, src: &mut BytesMut) -> bool {
        let preamble = self.preamble();
        if let Some(pos) = find_subsequence(src, preamble) {
            if pos > 0 {
                src.advance(pos);
                self.resyncs += 1;
            }
            true
        } else {
            // Keep a potential preamble prefix at the buffer end.
            let keep = preamble.len() - 1;
            if src.len() > keep {
                let discard = src.len() - keep;
                src.advance(discard);
                self.resyncs += 1;
            }
            false
        }
    }

    fn decode_ld2450(&mut self, src: &mut BytesMut) -> Option<Vec<RadarTarget>> {
        loop {
            if !self.seek_preamble(src) || src.len() < LD2450_FRAME_LEN {
                return None;
            }
            if src[LD2450_FRAME_LEN - 2..LD2450_FRAME_LEN] != LD2450_TAIL {
                // Malformed frame: drop the preamble byte and reseek.
                src.advance(1);
                self.resyncs += 1;
                continue;
            }
            let body = &src[4..LD2450_FRAME_LEN - 2];
            let mut targets = Vec::with_capacity(3);
            for chunk in body.chunks_exact(8) {
                if chunk.iter().all(|&b| b == 0) {
                    continue;
                }
                targets.push(RadarTarget {
                    x_mm: signed_magnitude(u16::from_le_bytes([chunk[0], chunk[1]])),
                    y_mm: signed_magnitude(u16::from_le_bytes([chunk[2], chunk[3]])),
                    speed_cm_s: signed_magnitude(u16::from_le_bytes([chunk[4], chunk[5]])),
                });
            }
            src.advance(LD2450_FRAME_LEN);
            return Some(targets);
        }
    }

    fn decode_ld2410(&mut self, src: &mut BytesMut) -> Option<Vec<RadarTarget>> {
        loop {
            if !self.seek_preamble(src) || src.len() < 6 {
                return None;
            }
            let body_len = u16::from_le_bytes([src[4], src[5]]) as usize;
            let frame_len = 4 + 2 + body_len + LD2410_TAIL.len();
            if frame_len > 128 {
                src.advance(1);
                self.resyncs += 1;
                continue;
            }
            if src.len() < frame_len {
                return None;
            }
            if src[frame_len - 4..frame_len] != LD2410_TAIL {
                src.advance(1);
                self.resyncs += 1;
                continue;
            }
            // Body: 02 AA | state u8 | move dist u16 | move energy u8 |
            // still dist u16 | still energy u8 | detect dist u16 | 55 00
            let body = &src[6..6 + body_len];
            let targets = if body.len() >= 11 && body[0] == 0x02 && body[2] != 0 {
                let distance_cm = u16::from_le_bytes([body[9], body[10]]);
                vec![RadarTarget {
                    x_mm: 0,
                    y_mm: distance_cm as i32 * 10,
                    speed_cm_s: 0,
                }]
            } else {
                Vec::new()
            };
            src.advance(frame_len);
            return Some(targets);
        }
    }
}

impl Decoder for RadarCodec {
    type Item = Vec<RadarTarget>;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Self::Item>> {
        let targets = match self.model {
            RadarModel::Ld2450 => self.decode_ld2450(src),
            RadarModel::Ld2410 => self.decode_ld2410(src),
        };
        Ok(targets)
    }
}

/// Sign bit set means positive in the LD2450 wire format.
fn signed_magnitude(raw: u16) -> i32 {
    if raw & 0x8000 != 0 {
        (raw & 0x7FFF) as i32
    } else {
        -(raw as i32)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// The UART driver.
pub struct RadarDriver {
    device: String,
    baud_rate: u32,
    model: RadarModel,
    clock: SharedClock,
    framed: Option<Framed<tokio_serial::SerialStream, RadarCodec>>,
}

impl RadarDriver {
    pub fn new(device: impl Into<String>, baud_rate: u32, model: RadarModel, clock: SharedClock) -> Self {
        Self {
            device: device.into(),
            baud_rate,
            model,
            clock,
            framed: None,
        }
    }

}

#[async_trait]
impl SensorDriver for RadarDriver {
    type Frame = RadarFrame;

    fn id(&self) -> DetectorId {
        DetectorId::Radar
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        let stream = tokio_serial::new(&self.device, self.baud_rate)
            .open_native_async()
            .map_err(|e| DriverError::Fatal(format!("open {}: {e}", self.device)))?;
        tracing::info!(device = %self.device, baud = self.baud_rate, model = ?self.model, "radar connected");
        self.framed = Some(Framed::new(stream, RadarCodec::new(self.model)));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.framed = None;
    }

    async fn read(&mut self) -> Result<RadarFrame, DriverError> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| DriverError::Fatal("radar not connected".into()))?;

        let next = tokio::time::timeout(READ_TIMEOUT, framed.next())
            .await
            .map_err(|_| DriverError::Transient("radar read timeout".into()))?;

        match next {
            Some(Ok(targets)) => Ok(RadarFrame {
                timestamp: self.clock.now_monotonic(),
                targets,
            }),
            Some(Err(e)) => Err(DriverError::Transient(format!("radar decode: {e}"))),
            None => {
                self.framed = None;
                Err(DriverError::Fatal("radar port closed".into()))
            }
        }
    }

    fn take_resyncs(&mut self) -> u64 {
        self.framed
            .as_mut()
            .map(|f| f.codec_mut().take_resyncs())
            .unwrap_or(0)
    }
}
