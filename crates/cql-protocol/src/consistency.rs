//! Consistency level wire codes, used in QUERY/EXECUTE/BATCH
//! frame bodies as a 2-byte big-endian short.

use crate::error::CodecError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Any,
    One,
    Two,
    Three,
    Quorum,
    All,
    LocalQuorum,
    EachQuorum,
    LocalOne,
}

impl Consistency {
    pub fn to_u16(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::LocalOne => 0x000A,
        }
    }

    pub fn from_u16(v: u16) -> Result<Consistency, CodecError> {
        Ok(match v {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x000A => Consistency::LocalOne,
            other => return Err(CodecError::UnknownType(format!("consistency level 0x{:04x}", other))),
        })
    }
}

/// The serial consistency used for the Paxos rounds of a lightweight
/// transaction; a restricted subset of [`Consistency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialConsistency {
    Serial,
    LocalSerial,
}

impl SerialConsistency {
    pub fn to_u16(self) -> u16 {
        match self {
            SerialConsistency::Serial => 0x0008,
            SerialConsistency::LocalSerial => 0x0009,
        }
    }

    pub fn from_u16(v: u16) -> Result<SerialConsistency, CodecError> {
        Ok(match v {
            0x0008 => SerialConsistency::Serial,
            0x0009 => SerialConsistency::LocalSerial,
            other => return Err(CodecError::UnknownType(format!("serial consistency 0x{:04x}", other))),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consistency_round_trips_through_wire_code() {
        for c in [
            Consistency::Any,
            Consistency::One,
            Consistency::Two,
            Consistency::Three,
            Consistency::Quorum,
            Consistency::All,
            Consistency::LocalQuorum,
            Consistency::EachQuorum,
            Consistency::LocalOne,
        ] {
            assert_eq!(Consistency::from_u16(c.to_u16()).unwrap(), c);
        }
    }

    #[test]
    fn serial_consistency_round_trips() {
        assert_eq!(
            SerialConsistency::from_u16(SerialConsistency::Serial.to_u16()).unwrap(),
            SerialConsistency::Serial
        );
        assert_eq!(
            SerialConsistency::from_u16(SerialConsistency::LocalSerial.to_u16()).unwrap(),
            SerialConsistency::LocalSerial
        );
    }
}
