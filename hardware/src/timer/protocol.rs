//! DLE-framed packets exchanged with the timer unit
//!
//! Every packet on the wire is
//!
//! ```text
//! DLE TYPE ERROR PAYLOAD* DLE ETX
//! ```
//!
//! where any DLE byte inside PAYLOAD is sent twice. The TYPE and ERROR bytes
//! are sent as-is.

use strum::{Display, EnumIter};
use thiserror::Error;

/// Data link escape
pub const DLE: u8 = 0x10;
/// End of text
pub const ETX: u8 = 0x03;
/// Longest payload either side will send
pub const MAX_PAYLOAD_LENGTH: usize = 256;

/// Consecutive malformed runs after which the stream is reported as
/// persistently broken
pub const REPEATED_FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum PacketType {
    #[strum(serialize = "CURRENT_TIME")]
    CurrentTime,
    #[strum(serialize = "DOWNLOAD_TIME")]
    DownloadTime,
    #[strum(serialize = "DEBUG_STRING")]
    DebugString,
    #[strum(serialize = "DEBUG_RAW")]
    DebugRaw,
    #[strum(serialize = "START_EXPOSURE")]
    StartExposure,
    #[strum(serialize = "STOP_EXPOSURE")]
    StopExposure,
    #[strum(serialize = "RESET")]
    Reset,
}

impl PacketType {
    pub fn code(&self) -> u8 {
        match self {
            PacketType::CurrentTime => 0xA1,
            PacketType::DownloadTime => 0xA2,
            PacketType::DebugString => 0xA3,
            PacketType::DebugRaw => 0xA5,
            PacketType::StartExposure => 0xA6,
            PacketType::StopExposure => 0xA7,
            PacketType::Reset => 0xA8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0xA1 => Some(PacketType::CurrentTime),
            0xA2 => Some(PacketType::DownloadTime),
            0xA3 => Some(PacketType::DebugString),
            0xA5 => Some(PacketType::DebugRaw),
            0xA6 => Some(PacketType::StartExposure),
            0xA7 => Some(PacketType::StopExposure),
            0xA8 => Some(PacketType::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LENGTH} byte limit")]
    PayloadTooLong(usize),
}

/// A decoded packet with stuffing removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub error: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, error: u8, payload: Vec<u8>) -> Self {
        Self {
            kind,
            error,
            payload,
        }
    }

    /// Frame the packet for transmission, doubling payload DLE bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(ProtocolError::PayloadTooLong(self.payload.len()));
        }

        let mut out = Vec::with_capacity(self.payload.len() + 8);
        out.extend_from_slice(&[DLE, self.kind.code(), self.error]);
        for &byte in &self.payload {
            out.push(byte);
            if byte == DLE {
                out.push(DLE);
            }
        }
        out.extend_from_slice(&[DLE, ETX]);
        Ok(out)
    }
}

/// Why bytes were thrown away while looking for a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Bytes before anything resembling a frame header
    NoFrameStart,
    /// DLE followed by a byte that is not a packet type
    UnknownType(u8),
    /// Lone DLE inside a payload followed by this byte
    BadEscape(u8),
    /// Payload grew past [`MAX_PAYLOAD_LENGTH`]
    Oversize,
}

/// One contiguous run of discarded bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Malformed {
    /// First problem seen in the run
    pub reason: MalformedReason,
    pub discarded: usize,
    /// Runs since the last good packet, including this one
    pub consecutive: u32,
}

impl Malformed {
    pub fn is_repeated(&self) -> bool {
        self.consecutive >= REPEATED_FAILURE_THRESHOLD
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramerEvent {
    Packet(Packet),
    Malformed(Malformed),
}

enum Step {
    NeedMore,
    Packet { packet: Packet, consumed: usize },
    Discard { count: usize, reason: MalformedReason },
}

/// Streaming decoder that turns arbitrary byte chunks into packets.
///
/// Bytes that cannot belong to a packet are discarded until the next
/// plausible `DLE TYPE ERROR` header; each contiguous discarded run is
/// reported once as [`FramerEvent::Malformed`].
#[derive(Debug, Default)]
pub struct PacketFramer {
    buffer: Vec<u8>,
    synchronised: bool,
    consecutive_failures: u32,
    packets: u64,
    discarded_bytes: u64,
}

impl PacketFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once at least one packet has parsed
    pub fn is_synchronised(&self) -> bool {
        self.synchronised
    }

    pub fn packets_received(&self) -> u64 {
        self.packets
    }

    pub fn bytes_discarded(&self) -> u64 {
        self.discarded_bytes
    }

    /// Bytes held waiting for the rest of a packet
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed received bytes and collect everything they complete.
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<FramerEvent> {
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();
        let mut pending: Option<(MalformedReason, usize)> = None;

        loop {
            match self.step() {
                Step::NeedMore => break,
                Step::Discard { count, reason } => {
                    self.buffer.drain(..count);
                    self.discarded_bytes += count as u64;
                    let run = pending.get_or_insert((reason, 0));
                    run.1 += count;
                }
                Step::Packet { packet, consumed } => {
                    if let Some(run) = pending.take() {
                        events.push(self.malformed(run));
                    }
                    self.buffer.drain(..consumed);
                    self.synchronised = true;
                    self.consecutive_failures = 0;
                    self.packets += 1;
                    events.push(FramerEvent::Packet(packet));
                }
            }
        }

        if let Some(run) = pending {
            events.push(self.malformed(run));
        }
        events
    }

    fn malformed(&mut self, (reason, discarded): (MalformedReason, usize)) -> FramerEvent {
        self.consecutive_failures += 1;
        FramerEvent::Malformed(Malformed {
            reason,
            discarded,
            consecutive: self.consecutive_failures,
        })
    }

    fn step(&self) -> Step {
        let buf = &self.buffer;
        if buf.is_empty() {
            return Step::NeedMore;
        }

        if buf[0] != DLE {
            let count = buf.iter().position(|&b| b == DLE).unwrap_or(buf.len());
            return Step::Discard {
                count,
                reason: MalformedReason::NoFrameStart,
            };
        }
        if buf.len() < 2 {
            return Step::NeedMore;
        }
        let Some(kind) = PacketType::from_code(buf[1]) else {
            return Step::Discard {
                count: 1,
                reason: MalformedReason::UnknownType(buf[1]),
            };
        };
        if buf.len() < 3 {
            return Step::NeedMore;
        }
        let error = buf[2];

        let mut payload = Vec::new();
        let mut i = 3;
        while i < buf.len() {
            if buf[i] == DLE {
                let Some(&next) = buf.get(i + 1) else {
                    return Step::NeedMore;
                };
                match next {
                    ETX => {
                        return Step::Packet {
                            packet: Packet::new(kind, error, payload),
                            consumed: i + 2,
                        };
                    }
                    DLE => {
                        payload.push(DLE);
                        i += 2;
                    }
                    other => {
                        // Resync on this DLE; it may start the next frame
                        return Step::Discard {
                            count: i,
                            reason: MalformedReason::BadEscape(other),
                        };
                    }
                }
            } else {
                payload.push(buf[i]);
                i += 1;
            }

            if payload.len() > MAX_PAYLOAD_LENGTH {
                return Step::Discard {
                    count: i,
                    reason: MalformedReason::Oversize,
                };
            }
        }
        Step::NeedMore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use strum::IntoEnumIterator;

    fn packets(events: &[FramerEvent]) -> Vec<&Packet> {
        events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::Packet(p) => Some(p),
                FramerEvent::Malformed(_) => None,
            })
            .collect()
    }

    fn malformed(events: &[FramerEvent]) -> Vec<&Malformed> {
        events
            .iter()
            .filter_map(|e| match e {
                FramerEvent::Malformed(m) => Some(m),
                FramerEvent::Packet(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_type_codes_round_trip() {
        for kind in PacketType::iter() {
            assert_eq!(PacketType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(PacketType::from_code(0xA4), None);
        assert_eq!(PacketType::CurrentTime.to_string(), "CURRENT_TIME");
    }

    #[test]
    fn test_encode_doubles_payload_dle() {
        let packet = Packet::new(PacketType::DebugRaw, 0, vec![0x01, DLE, 0x02]);
        assert_eq!(
            packet.encode().unwrap(),
            vec![DLE, 0xA5, 0x00, 0x01, DLE, DLE, 0x02, DLE, ETX]
        );
    }

    #[test]
    fn test_encode_rejects_oversize_payload() {
        let packet = Packet::new(PacketType::DebugRaw, 0, vec![0; MAX_PAYLOAD_LENGTH + 1]);
        assert_eq!(
            packet.encode(),
            Err(ProtocolError::PayloadTooLong(MAX_PAYLOAD_LENGTH + 1))
        );
    }

    #[test]
    fn test_stream_of_stuffed_packets_parses_exactly() {
        let mut rng = StdRng::seed_from_u64(0x10_03);
        let kinds: Vec<PacketType> = PacketType::iter().collect();
        let sent: Vec<Packet> = (0..200)
            .map(|_| {
                let kind = kinds[rng.random_range(0..kinds.len())];
                let length = rng.random_range(0..=MAX_PAYLOAD_LENGTH);
                let dle_density = rng.random_range(0.0..0.5);
                let payload = (0..length)
                    .map(|_| {
                        if rng.random_bool(dle_density) {
                            DLE
                        } else {
                            rng.random()
                        }
                    })
                    .collect();
                Packet::new(kind, rng.random_range(0..2), payload)
            })
            .collect();
        let wire: Vec<u8> = sent.iter().flat_map(|p| p.encode().unwrap()).collect();

        let mut framer = PacketFramer::new();
        let mut received = Vec::new();
        // Awkward chunk sizes so escapes straddle reads
        let mut rest = wire.as_slice();
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rng.random_range(1..=rest.len().min(13)));
            received.extend(framer.push_bytes(chunk));
            rest = tail;
        }

        assert!(malformed(&received).is_empty());
        let parsed: Vec<Packet> = packets(&received).into_iter().cloned().collect();
        assert_eq!(parsed.len(), sent.len());
        assert_eq!(parsed, sent);
        assert_eq!(framer.buffered(), 0);
    }

    #[test]
    fn test_leading_garbage_single_event() {
        let mut wire = vec![0xFF, 0xFF];
        wire.extend(
            Packet::new(PacketType::CurrentTime, 0, b"2012:01:01:00:00:00:000".to_vec())
                .encode()
                .unwrap(),
        );

        let mut framer = PacketFramer::new();
        let events = framer.push_bytes(&wire);

        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            FramerEvent::Malformed(Malformed {
                reason: MalformedReason::NoFrameStart,
                discarded: 2,
                consecutive: 1,
            })
        );
        assert_eq!(packets(&events)[0].kind, PacketType::CurrentTime);
        assert!(framer.is_synchronised());
    }

    #[test]
    fn test_unknown_type_resyncs() {
        let mut wire = vec![DLE, 0x55, 0x00, 0x01];
        wire.extend(Packet::new(PacketType::Reset, 0, vec![]).encode().unwrap());

        let events = PacketFramer::new().push_bytes(&wire);
        let bad = malformed(&events);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].reason, MalformedReason::UnknownType(0x55));
        assert_eq!(bad[0].discarded, 4);
        assert_eq!(packets(&events).len(), 1);
    }

    #[test]
    fn test_bad_escape_restarts_at_dle() {
        // Truncated packet whose DLE begins a valid one
        let mut wire = vec![DLE, 0xA3, 0x00, b'h', b'i'];
        wire.extend(Packet::new(PacketType::StopExposure, 0, vec![]).encode().unwrap());

        let events = PacketFramer::new().push_bytes(&wire);
        let bad = malformed(&events);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].reason, MalformedReason::BadEscape(0xA7));
        assert_eq!(bad[0].discarded, 5);
        assert_eq!(packets(&events)[0].kind, PacketType::StopExposure);
    }

    #[test]
    fn test_oversize_packet_discarded() {
        let mut wire = vec![DLE, 0xA3, 0x00];
        wire.extend(std::iter::repeat(b'x').take(MAX_PAYLOAD_LENGTH + 10));
        wire.extend([DLE, ETX]);
        wire.extend(Packet::new(PacketType::Reset, 0, vec![]).encode().unwrap());

        let events = PacketFramer::new().push_bytes(&wire);
        let bad = malformed(&events);
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].reason, MalformedReason::Oversize);
        let good = packets(&events);
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].kind, PacketType::Reset);
    }

    #[test]
    fn test_repeated_failures_counted_until_good_packet() {
        let mut framer = PacketFramer::new();
        for expected in 1..=3 {
            let events = framer.push_bytes(&[0x00, 0x01]);
            let bad = malformed(&events);
            assert_eq!(bad[0].consecutive, expected);
            assert_eq!(bad[0].is_repeated(), expected >= 3);
        }

        framer.push_bytes(&Packet::new(PacketType::Reset, 0, vec![]).encode().unwrap());
        let events = framer.push_bytes(&[0x00]);
        assert_eq!(malformed(&events)[0].consecutive, 1);
    }

    #[test]
    fn test_partial_packet_waits() {
        let wire = Packet::new(PacketType::DownloadTime, 0, b"2012:01:01:00:00:05:000".to_vec())
            .encode()
            .unwrap();
        let mut framer = PacketFramer::new();
        assert!(framer.push_bytes(&wire[..wire.len() - 1]).is_empty());
        assert!(!framer.is_synchronised());
        let events = framer.push_bytes(&wire[wire.len() - 1..]);
        assert_eq!(packets(&events).len(), 1);
    }
}
