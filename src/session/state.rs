//! Session lifecycle states and terminal error codes

use std::fmt;

/// Connection state of a call session
///
/// State transitions:
/// ```text
/// Created --> WaitInit: connect()
/// WaitInit --> WaitInitAck: init sent
/// WaitInitAck --> Established: compatible init-ack (after establish delay)
/// WaitInit/WaitInitAck --> Failed: init timeout, incompatible peer
/// Established --> Reconnecting: receive silence
/// Reconnecting --> Established: any valid packet
/// Established/Reconnecting --> Failed: silence on a relay path
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Created = 0,
    WaitInit = 1,
    WaitInitAck = 2,
    Established = 3,
    Failed = 4,
    Reconnecting = 5,
}

impl ConnectionState {
    /// Convert from the value stored in the published atomic
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitInit,
            2 => Self::WaitInitAck,
            3 => Self::Established,
            4 => Self::Failed,
            5 => Self::Reconnecting,
            _ => Self::Created,
        }
    }

    /// Media may flow
    pub fn can_transmit(&self) -> bool {
        matches!(self, Self::Established | Self::Reconnecting)
    }

    /// Still negotiating the handshake
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::WaitInit | Self::WaitInitAck)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::WaitInit => "wait_init",
            Self::WaitInitAck => "wait_init_ack",
            Self::Established => "established",
            Self::Failed => "failed",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCode {
    #[default]
    Unknown,
    /// Peer protocol range does not overlap ours
    Incompatible,
    /// No init-ack, or no traffic on a relay path
    Timeout,
    /// Audio source or sink failed
    AudioIO,
    /// SOCKS5 setup failed with no other usable path
    Proxy,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Incompatible => "incompatible",
            Self::Timeout => "timeout",
            Self::AudioIO => "audio_io",
            Self::Proxy => "proxy",
        };
        f.write_str(s)
    }
}

/// Kind of network the device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkType {
    #[default]
    Unknown,
    Gprs,
    Edge,
    Umts,
    Hspa,
    Lte,
    Wifi,
    Ethernet,
    OtherHighSpeed,
    OtherLowSpeed,
    Dialup,
    OtherMobile,
}

impl NetworkType {
    /// Networks too slow for the regular audio bitrate
    pub fn is_low_data(&self) -> bool {
        matches!(self, Self::Gprs | Self::Edge | Self::Dialup | Self::OtherLowSpeed)
    }

    pub fn is_mobile(&self) -> bool {
        matches!(
            self,
            Self::Gprs | Self::Edge | Self::Umts | Self::Hspa | Self::Lte | Self::OtherMobile
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip_through_u8() {
        for state in [
            ConnectionState::Created,
            ConnectionState::WaitInit,
            ConnectionState::WaitInitAck,
            ConnectionState::Established,
            ConnectionState::Failed,
            ConnectionState::Reconnecting,
        ] {
            assert_eq!(ConnectionState::from_u8(state as u8), state);
        }
        assert_eq!(ConnectionState::from_u8(200), ConnectionState::Created);
    }

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Reconnecting.can_transmit());
        assert!(!ConnectionState::WaitInitAck.can_transmit());
        assert!(ConnectionState::WaitInit.is_connecting());
        assert!(ConnectionState::Failed.is_terminal());
    }

    #[test]
    fn test_low_data_networks() {
        assert!(NetworkType::Edge.is_low_data());
        assert!(NetworkType::Gprs.is_low_data());
        assert!(!NetworkType::Lte.is_low_data());
        assert!(NetworkType::Lte.is_mobile());
        assert!(!NetworkType::Wifi.is_mobile());
    }
}
