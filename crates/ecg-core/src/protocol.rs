//! Line-oriented text protocol used to control the acquisition device

use serde::{Deserialize, Serialize};
use std::fmt;

/// Commands sent from the receiver to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceCommand {
    Start,
    Stop,
    Ping,
}

impl DeviceCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCommand::Start => "START",
            DeviceCommand::Stop => "STOP",
            DeviceCommand::Ping => "PING",
        }
    }

    /// Newline-terminated bytes as written to the transport
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = self.as_str().as_bytes().to_vec();
        line.push(b'\n');
        line
    }

    /// Parse a received command line (case-insensitive, surrounding whitespace ignored)
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_uppercase().as_str() {
            "START" => Some(DeviceCommand::Start),
            "STOP" => Some(DeviceCommand::Stop),
            "PING" => Some(DeviceCommand::Ping),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replies sent by the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    Ack,
    Pong,
    /// Sent once after boot
    Ready,
    Other(String),
}

impl DeviceReply {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "ACK" => DeviceReply::Ack,
            "PONG" => DeviceReply::Pong,
            "READY" => DeviceReply::Ready,
            _ => DeviceReply::Other(trimmed.to_string()),
        }
    }

    pub fn to_line(&self) -> Vec<u8> {
        let text = match self {
            DeviceReply::Ack => "ACK",
            DeviceReply::Pong => "PONG",
            DeviceReply::Ready => "READY",
            DeviceReply::Other(text) => text.as_str(),
        };
        let mut line = text.as_bytes().to_vec();
        line.push(b'\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_lines() {
        assert_eq!(DeviceCommand::Start.to_line(), b"START\n".to_vec());
        assert_eq!(DeviceCommand::parse(" stop\r\n"), Some(DeviceCommand::Stop));
        assert_eq!(DeviceCommand::parse("PING"), Some(DeviceCommand::Ping));
        assert_eq!(DeviceCommand::parse("RESET"), None);
    }

    #[test]
    fn test_reply_parsing() {
        assert_eq!(DeviceReply::parse("ACK\r\n"), DeviceReply::Ack);
        assert_eq!(DeviceReply::parse("pong"), DeviceReply::Pong);
        assert_eq!(DeviceReply::parse("READY"), DeviceReply::Ready);
        assert_eq!(DeviceReply::parse(" busy "), DeviceReply::Other("busy".to_string()));
        assert_eq!(DeviceReply::Ready.to_line(), b"READY\n".to_vec());
    }
}
