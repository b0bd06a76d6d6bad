//! Typed timer messages layered over [`Packet`]s.

use super::protocol::{Packet, PacketType};
use shared::timestamp::{Timestamp, TimestampError};
use thiserror::Error;

/// ERROR byte value for a time taken while the GPS had a fix
pub const ERROR_NONE: u8 = 0x00;
/// ERROR byte value for a time taken without a GPS fix
pub const ERROR_NOT_LOCKED: u8 = 0x01;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{0} packets are not sent by the timer")]
    UnexpectedType(PacketType),
    #[error("{0} packets are not commands")]
    NotACommand(PacketType),
    #[error("bad timestamp: {0}")]
    Timestamp(#[from] TimestampError),
    #[error("{kind} payload has {got} bytes, expected {expected}")]
    PayloadLength {
        kind: PacketType,
        expected: usize,
        got: usize,
    },
}

/// Reports sent by the timer to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerMessage {
    /// Live GPS time, roughly once per second
    CurrentTime(Timestamp),
    /// Time at which the latest camera trigger fired
    DownloadTime(Timestamp),
    Debug(String),
    DebugRaw(Vec<u8>),
}

impl TimerMessage {
    pub fn decode(packet: &Packet) -> Result<Self, DecodeError> {
        let locked = packet.error == ERROR_NONE;
        match packet.kind {
            PacketType::CurrentTime => Ok(TimerMessage::CurrentTime(Timestamp::parse_wire(
                &packet.payload,
                locked,
            )?)),
            PacketType::DownloadTime => {
                let mut timestamp = Timestamp::parse_wire(&packet.payload, locked)?;
                timestamp.remaining_exposure = 0;
                Ok(TimerMessage::DownloadTime(timestamp))
            }
            PacketType::DebugString => Ok(TimerMessage::Debug(
                String::from_utf8_lossy(&packet.payload)
                    .trim_end_matches('\0')
                    .to_string(),
            )),
            PacketType::DebugRaw => Ok(TimerMessage::DebugRaw(packet.payload.clone())),
            other => Err(DecodeError::UnexpectedType(other)),
        }
    }

    /// Packet the timer would send for this message
    pub fn to_packet(&self) -> Packet {
        match self {
            TimerMessage::CurrentTime(ts) => {
                let mut text = ts.to_wire();
                if ts.remaining_exposure > 0 {
                    text.push_str(&format!(":{}", ts.remaining_exposure));
                }
                Packet::new(PacketType::CurrentTime, lock_error(ts), text.into_bytes())
            }
            TimerMessage::DownloadTime(ts) => Packet::new(
                PacketType::DownloadTime,
                lock_error(ts),
                ts.to_wire().into_bytes(),
            ),
            TimerMessage::Debug(text) => {
                Packet::new(PacketType::DebugString, ERROR_NONE, text.as_bytes().to_vec())
            }
            TimerMessage::DebugRaw(data) => {
                Packet::new(PacketType::DebugRaw, ERROR_NONE, data.clone())
            }
        }
    }
}

fn lock_error(ts: &Timestamp) -> u8 {
    if ts.locked {
        ERROR_NONE
    } else {
        ERROR_NOT_LOCKED
    }
}

/// Commands sent by the host to the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Begin pulsing the camera trigger every `seconds`
    StartExposure { seconds: u16, use_monitor: bool },
    StopExposure,
    Reset,
}

impl TimerCommand {
    pub fn to_packet(&self) -> Packet {
        match *self {
            TimerCommand::StartExposure {
                seconds,
                use_monitor,
            } => {
                let [hi, lo] = seconds.to_be_bytes();
                Packet::new(
                    PacketType::StartExposure,
                    ERROR_NONE,
                    vec![hi, lo, use_monitor as u8],
                )
            }
            TimerCommand::StopExposure => Packet::new(PacketType::StopExposure, ERROR_NONE, vec![]),
            TimerCommand::Reset => Packet::new(PacketType::Reset, ERROR_NONE, vec![]),
        }
    }

    pub fn from_packet(packet: &Packet) -> Result<Self, DecodeError> {
        match packet.kind {
            PacketType::StartExposure => match packet.payload.as_slice() {
                [hi, lo, monitor] => Ok(TimerCommand::StartExposure {
                    seconds: u16::from_be_bytes([*hi, *lo]),
                    use_monitor: *monitor != 0,
                }),
                other => Err(DecodeError::PayloadLength {
                    kind: packet.kind,
                    expected: 3,
                    got: other.len(),
                }),
            },
            PacketType::StopExposure => Ok(TimerCommand::StopExposure),
            PacketType::Reset => Ok(TimerCommand::Reset),
            other => Err(DecodeError::NotACommand(other)),
        }
    }

    /// Wire bytes for this command
    pub fn encode(&self) -> Vec<u8> {
        let packet = self.to_packet();
        // Command payloads are at most three bytes
        packet.encode().unwrap_or_default()
    }
}

/// Render a raw debug payload as space separated hex
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::protocol::{DLE, ETX};

    #[test]
    fn test_start_exposure_layout() {
        let bytes = TimerCommand::StartExposure {
            seconds: 0x0110,
            use_monitor: true,
        }
        .encode();
        // The low byte is DLE and must be doubled
        assert_eq!(bytes, vec![DLE, 0xA6, 0x00, 0x01, DLE, DLE, 0x01, DLE, ETX]);
    }

    #[test]
    fn test_command_decode() {
        let packet = TimerCommand::StartExposure {
            seconds: 65535,
            use_monitor: false,
        }
        .to_packet();
        assert_eq!(
            TimerCommand::from_packet(&packet),
            Ok(TimerCommand::StartExposure {
                seconds: 65535,
                use_monitor: false
            })
        );

        let short = Packet::new(PacketType::StartExposure, 0, vec![0]);
        assert!(matches!(
            TimerCommand::from_packet(&short),
            Err(DecodeError::PayloadLength { got: 1, .. })
        ));
        let status = Packet::new(PacketType::CurrentTime, 0, vec![]);
        assert_eq!(
            TimerCommand::from_packet(&status),
            Err(DecodeError::NotACommand(PacketType::CurrentTime))
        );
    }

    #[test]
    fn test_decode_download_time() {
        let packet = Packet::new(
            PacketType::DownloadTime,
            ERROR_NONE,
            b"2012:01:01:00:00:02:000".to_vec(),
        );
        match TimerMessage::decode(&packet).unwrap() {
            TimerMessage::DownloadTime(ts) => {
                assert!(ts.locked);
                assert!(ts.valid);
                assert_eq!(ts.seconds, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unlocked_current_time() {
        let packet = Packet::new(
            PacketType::CurrentTime,
            ERROR_NOT_LOCKED,
            b"2012:01:01:00:00:02:000:3".to_vec(),
        );
        let TimerMessage::CurrentTime(ts) = TimerMessage::decode(&packet).unwrap() else {
            panic!("expected current time");
        };
        assert!(!ts.locked);
        assert_eq!(ts.remaining_exposure, 3);
        assert_eq!(TimerMessage::CurrentTime(ts).to_packet(), packet);
    }

    #[test]
    fn test_debug_string_and_raw() {
        let text = Packet::new(PacketType::DebugString, 0, b"Exposure started\0".to_vec());
        assert_eq!(
            TimerMessage::decode(&text),
            Ok(TimerMessage::Debug("Exposure started".to_string()))
        );
        let raw = Packet::new(PacketType::DebugRaw, 0, vec![0xde, 0xad]);
        assert_eq!(
            TimerMessage::decode(&raw),
            Ok(TimerMessage::DebugRaw(vec![0xde, 0xad]))
        );
        assert_eq!(hex_dump(&[0xde, 0xad, 0x01]), "de ad 01");
    }

    #[test]
    fn test_commands_are_not_messages() {
        let packet = TimerCommand::Reset.to_packet();
        assert_eq!(
            TimerMessage::decode(&packet),
            Err(DecodeError::UnexpectedType(PacketType::Reset))
        );
    }
}
