//! Timer unit attached through an FTDI FT232 USB serial adapter.

use super::{GpsStatus, LinkError, TimerLink};
use serialport::{DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use tracing::{debug, info};

pub const TIMER_BAUD_RATE: u32 = 250_000;

/// FTDI USB vendor id
pub const FTDI_VENDOR_ID: u16 = 0x0403;
/// FT232 product id
pub const FT232_PRODUCT_ID: u16 = 0x6001;

/// Upper bound on any single blocking read
pub const MAX_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Locate the timer's serial device by its USB ids.
pub fn find_timer_port() -> Result<String, LinkError> {
    let ports = serialport::available_ports()?;
    let matches: Vec<String> = ports
        .into_iter()
        .filter(|port| match &port.port_type {
            SerialPortType::UsbPort(usb) => {
                usb.vid == FTDI_VENDOR_ID && usb.pid == FT232_PRODUCT_ID
            }
            _ => false,
        })
        .map(|port| port.port_name)
        .collect();

    match matches.as_slice() {
        [] => Err(LinkError::NotFound(format!(
            "no USB device {FTDI_VENDOR_ID:04x}:{FT232_PRODUCT_ID:04x} attached"
        ))),
        [only] => Ok(only.clone()),
        [first, ..] => {
            info!(
                "Found {} FT232 adapters, using {}",
                matches.len(),
                first
            );
            Ok(first.clone())
        }
    }
}

pub struct SerialTimerLink {
    path: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialTimerLink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: TIMER_BAUD_RATE,
            port: None,
        }
    }

    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::NotConnected)
    }
}

impl TimerLink for SerialTimerLink {
    fn name(&self) -> &str {
        &self.path
    }

    fn connect(&mut self) -> Result<(), LinkError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(MAX_READ_TIMEOUT)
            .open()?;
        info!("Opened timer on {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), LinkError> {
        if self.port.take().is_some() {
            debug!("Closed timer port {}", self.path);
        }
        Ok(())
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), LinkError> {
        let port = self.port()?;
        port.write_all(frame)?;
        port.flush()?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, LinkError> {
        let port = self.port()?;
        port.set_timeout(timeout.min(MAX_READ_TIMEOUT))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn gps_status(&self) -> GpsStatus {
        if self.port.is_some() {
            GpsStatus::Active
        } else {
            GpsStatus::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconnected_link_refuses_io() {
        let mut link = SerialTimerLink::new("/dev/null-timer");
        let mut buf = [0u8; 8];
        assert!(matches!(
            link.receive(&mut buf, Duration::from_millis(1)),
            Err(LinkError::NotConnected)
        ));
        assert!(matches!(link.send_frame(&[0x10]), Err(LinkError::NotConnected)));
        assert_eq!(link.gps_status(), GpsStatus::Unavailable);
        assert!(link.disconnect().is_ok());
    }

    #[test]
    fn test_missing_device_fails_to_connect() {
        let mut link = SerialTimerLink::new("/dev/this-timer-does-not-exist");
        assert!(link.connect().is_err());
    }

    #[cfg(feature = "hardware-tests")]
    #[test]
    fn test_attached_timer_reports_time() {
        use crate::timer::{PacketFramer, FramerEvent};
        use std::time::Instant;

        let path = find_timer_port().expect("timer attached");
        let mut link = SerialTimerLink::new(path);
        link.connect().unwrap();

        let mut framer = PacketFramer::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut packets = 0;
        while Instant::now() < deadline && packets == 0 {
            let n = link.receive(&mut buf, MAX_READ_TIMEOUT).unwrap();
            packets += framer
                .push_bytes(&buf[..n])
                .iter()
                .filter(|e| matches!(e, FramerEvent::Packet(_)))
                .count();
        }
        assert!(packets > 0, "timer sent no packets within 3s");
    }
}
