//! The 128-bit identifier used all over the ETW ABI
//!
//! Provider ids, activity ids and session ids are all [`Guid`]s. Their textual form is the
//! canonical bracketed one, e.g. `{EDD08927-9CC4-4E65-B970-C2560FB5C289}`.
use std::fmt;
use std::str::FromStr;

use crate::encoding::{self, ByteOrder, EncodeError};

/// Length of `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}`
const CANONICAL_LEN: usize = 38;
const GROUP_WIDTHS: [usize; 5] = [8, 4, 4, 4, 12];

/// GUID module errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuidError {
    /// The text is not a canonical bracketed GUID
    MalformedIdentifier(String),
    /// The tail of the GUID could not be packed
    Encoding(EncodeError),
}

impl fmt::Display for GuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuidError::MalformedIdentifier(text) => write!(f, "malformed identifier {:?}", text),
            GuidError::Encoding(err) => write!(f, "unable to pack identifier: {}", err),
        }
    }
}

impl std::error::Error for GuidError {}

impl From<EncodeError> for GuidError {
    fn from(err: EncodeError) -> Self {
        GuidError::Encoding(err)
    }
}

crate::encodable_struct! {
    /// Bit-exact mirror of the native `GUID`
    #[repr(C)]
    #[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Guid {
        pub data1: u32,
        pub data2: u16,
        pub data3: u16,
        pub data4: [u8; 8],
    }
}

impl Guid {
    pub const fn from_values(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub const fn zeroed() -> Self {
        Self::from_values(0, 0, 0, [0; 8])
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zeroed()
    }

    /// Parse the canonical `{8-4-4-4-12}` form (case-insensitive)
    ///
    /// The last two groups are read as a single 64-bit value, whose big-endian bytes make up
    /// [`Guid::data4`].
    pub fn parse(text: &str) -> Result<Self, GuidError> {
        let malformed = || GuidError::MalformedIdentifier(text.to_string());

        if text.len() != CANONICAL_LEN
            || !text.is_ascii()
            || !text.starts_with('{')
            || !text.ends_with('}')
        {
            return Err(malformed());
        }

        let groups: Vec<&str> = text[1..CANONICAL_LEN - 1].split('-').collect();
        if groups.len() != GROUP_WIDTHS.len() {
            return Err(malformed());
        }
        let well_formed = groups.iter().zip(GROUP_WIDTHS).all(|(group, width)| {
            group.len() == width && group.bytes().all(|b| b.is_ascii_hexdigit())
        });
        if !well_formed {
            return Err(malformed());
        }

        let data1 = u32::from_str_radix(groups[0], 16).map_err(|_| malformed())?;
        let data2 = u16::from_str_radix(groups[1], 16).map_err(|_| malformed())?;
        let data3 = u16::from_str_radix(groups[2], 16).map_err(|_| malformed())?;
        let tail = u64::from_str_radix(&[groups[3], groups[4]].concat(), 16)
            .map_err(|_| malformed())?;

        let packed = encoding::encode(Some(&tail), ByteOrder::Big)?;
        let data4 = <[u8; 8]>::try_from(packed.as_slice()).map_err(|_| malformed())?;

        Ok(Self::from_values(data1, data2, data3, data4))
    }

    /// Generate a version 4 (random) GUID
    ///
    /// The value goes through its own canonical text, so that it always round-trips through
    /// [`Guid::parse`].
    pub fn random() -> Result<Self, GuidError> {
        let mut bytes: [u8; 16] = rand::random();
        bytes[6] = (bytes[6] & 0x0f) | 0x40; // version 4
        bytes[8] = (bytes[8] & 0x3f) | 0x80; // RFC 4122 variant

        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&bytes[8..]);
        let draft = Self::from_values(
            u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            u16::from_be_bytes([bytes[4], bytes[5]]),
            u16::from_be_bytes([bytes[6], bytes[7]]),
            data4,
        );

        Self::parse(&draft.to_string())
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}}}",
            self.data1,
            self.data2,
            self.data3,
            self.data4[0],
            self.data4[1],
            self.data4[2],
            self.data4[3],
            self.data4[4],
            self.data4[5],
            self.data4[6],
            self.data4[7],
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<windows::core::GUID> for Guid {
    fn from(guid: windows::core::GUID) -> Self {
        Self::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}

impl From<Guid> for windows::core::GUID {
    fn from(guid: Guid) -> Self {
        windows::core::GUID::from_values(guid.data1, guid.data2, guid.data3, guid.data4)
    }
}

impl FromStr for Guid {
    type Err = GuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Guid::parse(s)
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Guid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Guid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        Guid::parse(&text).map_err(serde::de::Error::custom)
    }
}
