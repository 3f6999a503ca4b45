//! Wire-level configuration, the Rust realization of `netron/config.hpp`
//! (`#pragma pack(push, 1) struct config { ... }`) and `protocol_version.hpp`.

use byteorder::{ByteOrder, NativeEndian};

/// `10_MB` in `netron/size_literals.hpp` terms — a named constant instead,
/// since Rust has no user-defined numeric literal suffixes outside nightly.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_CONNECTIONS: u32 = u32::max_value();
pub const DEFAULT_VERSION: ProtocolVersion = ProtocolVersion::new(1, 0);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Endian {
    Little = 0,
    Big = 1,
}

impl Endian {
    pub const fn native() -> Endian {
        if cfg!(target_endian = "little") {
            Endian::Little
        } else {
            Endian::Big
        }
    }

    fn from_u8(value: u8) -> Option<Endian> {
        match value {
            0 => Some(Endian::Little),
            1 => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Total ordering restored from `protocol_version.hpp`'s comparison
/// operators — dropped by the distillation, reinstated here since the
/// spec's Non-goals don't exclude it and a consumer wanting "at least
/// version X" negotiation gets it for free.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const fn new(major: u8, minor: u8) -> ProtocolVersion {
        ProtocolVersion { major, minor }
    }
}

/// Exchanged verbatim by both peers during the config stage of the
/// handshake; a mismatch on `endian` or `version` closes the connection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub endian: Endian,
    pub version: ProtocolVersion,
    pub max_connections: u32,
    pub max_message_size: u64,
}

impl Config {
    /// `endian`(1) + `version.major`(1) + `version.minor`(1) +
    /// `max_connections`(4) + `max_message_size`(8), laid out back to back
    /// with no padding, matching `pack(push, 1)` on the original struct.
    pub const WIRE_SIZE: usize = 15;

    pub fn to_bytes(self) -> [u8; Config::WIRE_SIZE] {
        let mut bytes = [0u8; Config::WIRE_SIZE];
        bytes[0] = self.endian as u8;
        bytes[1] = self.version.major;
        bytes[2] = self.version.minor;
        NativeEndian::write_u32(&mut bytes[3..7], self.max_connections);
        NativeEndian::write_u64(&mut bytes[7..15], self.max_message_size);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Config {
        Config {
            endian: Endian::from_u8(bytes[0]).unwrap_or_else(Endian::native),
            version: ProtocolVersion::new(bytes[1], bytes[2]),
            max_connections: NativeEndian::read_u32(&bytes[3..7]),
            max_message_size: NativeEndian::read_u64(&bytes[7..15]),
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            endian: Endian::native(),
            version: DEFAULT_VERSION,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrips_through_wire_bytes() {
        let config = Config {
            endian: Endian::native(),
            version: ProtocolVersion::new(1, 2),
            max_connections: 64,
            max_message_size: 1024,
        };
        let bytes = config.to_bytes();
        assert_eq!(bytes.len(), Config::WIRE_SIZE);
        assert_eq!(Config::from_bytes(&bytes), config);
    }

    #[test]
    fn protocol_version_orders_by_major_then_minor() {
        assert!(ProtocolVersion::new(1, 9) < ProtocolVersion::new(2, 0));
        assert!(ProtocolVersion::new(1, 1) < ProtocolVersion::new(1, 2));
        assert_eq!(ProtocolVersion::new(1, 0), ProtocolVersion::new(1, 0));
    }
}
