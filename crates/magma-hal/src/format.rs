//! # Runlist Entry Formats
//!
//! Per-generation runlist entry encodings, selected once at initialization.
//!
//! ```text
//! Compact (8 bytes, one per channel)
//!   [31]     type = 0 (channel)
//!   [23:12]  group id
//!   [11:0]   channel id
//!   word1    instance pointer >> 12
//!
//! Extended (16 bytes, one per channel)
//!   u32 channel id | u32 group id | u64 instance pointer
//!
//! Grouped (16 bytes, one per group)
//!   u32 group id | u32 timeslice_us | u16 channels | u8 priority | u8 type = 1 | u32 0
//! ```
//!
//! All fields are little endian.

use magma_core::{ChannelId, Error, GpuGeneration, GroupId, Result};

use crate::port::{EntryGranularity, RunlistEntry};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Largest id representable in a compact entry field
const COMPACT_ID_MASK: u64 = 0xFFF;
/// Group field shift in compact word0
const COMPACT_GROUP_SHIFT: u32 = 12;
/// Entry type byte for group entries in the grouped format
const GROUPED_TYPE_GROUP: u8 = 1;

// =============================================================================
// DECODED ENTRY
// =============================================================================

/// Identity of an encoded entry, for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEntry {
    /// Channel entry
    Channel {
        /// Channel id
        channel: ChannelId,
        /// Owning group
        group: GroupId,
    },
    /// Group entry
    Group {
        /// Group id
        group: GroupId,
        /// Channel count
        channels: u32,
        /// Time slice in microseconds
        timeslice_us: u32,
    },
}

impl DecodedEntry {
    /// Group this entry schedules
    pub fn group(&self) -> GroupId {
        match *self {
            Self::Channel { group, .. } | Self::Group { group, .. } => group,
        }
    }
}

// =============================================================================
// RUNLIST FORMAT
// =============================================================================

/// Runlist entry layout of one hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunlistFormat {
    /// 8-byte channel entries with 12-bit ids
    Compact,
    /// 16-byte channel entries with 64-bit instance pointers
    Extended,
    /// 16-byte group entries for firmware-scheduled engines
    Grouped,
}

impl RunlistFormat {
    /// Pick the layout for a generation
    pub const fn for_generation(generation: GpuGeneration) -> Self {
        if generation.has_wide_runlist_entries() {
            Self::Extended
        } else {
            Self::Compact
        }
    }

    /// Entry size in bytes
    pub const fn entry_size(self) -> u32 {
        match self {
            Self::Compact => 8,
            Self::Extended | Self::Grouped => 16,
        }
    }

    /// Entry granularity
    pub const fn granularity(self) -> EntryGranularity {
        match self {
            Self::Compact | Self::Extended => EntryGranularity::PerChannel,
            Self::Grouped => EntryGranularity::PerGroup,
        }
    }

    /// Encode one entry into `out`
    pub fn encode(self, entry: &RunlistEntry, out: &mut [u8]) -> Result<()> {
        let size = self.entry_size() as usize;
        if out.len() < size {
            return Err(Error::InvalidParameter);
        }
        let out = &mut out[..size];

        match (self, *entry) {
            (Self::Compact, RunlistEntry::Channel { channel, group, context, .. }) => {
                let (chid, tsgid) = (channel.id(), group.id());
                if chid > COMPACT_ID_MASK || tsgid > COMPACT_ID_MASK {
                    return Err(Error::InvalidParameter);
                }
                let word0 = (chid | (tsgid << COMPACT_GROUP_SHIFT)) as u32;
                let word1 = (context.0 >> 12) as u32;
                out[0..4].copy_from_slice(&word0.to_le_bytes());
                out[4..8].copy_from_slice(&word1.to_le_bytes());
                Ok(())
            },
            (Self::Extended, RunlistEntry::Channel { channel, group, context, .. }) => {
                let chid = u32::try_from(channel.id()).map_err(|_| Error::InvalidParameter)?;
                let tsgid = u32::try_from(group.id()).map_err(|_| Error::InvalidParameter)?;
                out[0..4].copy_from_slice(&chid.to_le_bytes());
                out[4..8].copy_from_slice(&tsgid.to_le_bytes());
                out[8..16].copy_from_slice(&context.0.to_le_bytes());
                Ok(())
            },
            (
                Self::Grouped,
                RunlistEntry::Group {
                    group,
                    timeslice_us,
                    channels,
                    priority,
                },
            ) => {
                let tsgid = u32::try_from(group.id()).map_err(|_| Error::InvalidParameter)?;
                let channels = u16::try_from(channels).map_err(|_| Error::InvalidParameter)?;
                out[0..4].copy_from_slice(&tsgid.to_le_bytes());
                out[4..8].copy_from_slice(&timeslice_us.to_le_bytes());
                out[8..10].copy_from_slice(&channels.to_le_bytes());
                out[10] = priority as u8;
                out[11] = GROUPED_TYPE_GROUP;
                out[12..16].fill(0);
                Ok(())
            },
            // Entry kind does not match the granularity of this format
            _ => Err(Error::InvalidParameter),
        }
    }

    /// Decode the identity of one encoded entry
    pub fn decode(self, bytes: &[u8]) -> Result<DecodedEntry> {
        if bytes.len() < self.entry_size() as usize {
            return Err(Error::InvalidParameter);
        }

        match self {
            Self::Compact => {
                let word0 = u32::from_le_bytes(read4(bytes, 0));
                let raw = u64::from(word0);
                Ok(DecodedEntry::Channel {
                    channel: ChannelId::new(raw & COMPACT_ID_MASK),
                    group: GroupId::new((raw >> COMPACT_GROUP_SHIFT) & COMPACT_ID_MASK),
                })
            },
            Self::Extended => Ok(DecodedEntry::Channel {
                channel: ChannelId::new(u64::from(u32::from_le_bytes(read4(bytes, 0)))),
                group: GroupId::new(u64::from(u32::from_le_bytes(read4(bytes, 4)))),
            }),
            Self::Grouped => {
                if bytes[11] != GROUPED_TYPE_GROUP {
                    return Err(Error::HardwareError);
                }
                Ok(DecodedEntry::Group {
                    group: GroupId::new(u64::from(u32::from_le_bytes(read4(bytes, 0)))),
                    timeslice_us: u32::from_le_bytes(read4(bytes, 4)),
                    channels: u32::from(u16::from_le_bytes([bytes[8], bytes[9]])),
                })
            },
        }
    }
}

fn read4(bytes: &[u8], at: usize) -> [u8; 4] {
    [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use magma_core::{ContextId, GpuAddr, Priority};

    use super::*;

    fn channel_entry(ch: u64, tsg: u64) -> RunlistEntry {
        RunlistEntry::Channel {
            channel: ChannelId::new(ch),
            group: GroupId::new(tsg),
            context: ContextId(0x4000),
            ring: GpuAddr::new(0x10_0000),
        }
    }

    #[test]
    fn test_generation_selects_format() {
        assert_eq!(RunlistFormat::for_generation(GpuGeneration::Maxwell), RunlistFormat::Compact);
        assert_eq!(RunlistFormat::for_generation(GpuGeneration::Ampere), RunlistFormat::Extended);
        assert_eq!(RunlistFormat::Compact.granularity(), EntryGranularity::PerChannel);
        assert_eq!(RunlistFormat::Grouped.granularity(), EntryGranularity::PerGroup);
    }

    #[test]
    fn test_compact_encoding_identifies_channel() {
        let mut buf = [0u8; 8];
        RunlistFormat::Compact.encode(&channel_entry(5, 9), &mut buf).unwrap();
        assert_eq!(
            RunlistFormat::Compact.decode(&buf).unwrap(),
            DecodedEntry::Channel {
                channel: ChannelId::new(5),
                group: GroupId::new(9),
            }
        );
        assert_eq!(u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]), 0x4);
    }

    #[test]
    fn test_compact_rejects_wide_ids() {
        let mut buf = [0u8; 8];
        let result = RunlistFormat::Compact.encode(&channel_entry(0x1000, 1), &mut buf);
        assert_eq!(result, Err(Error::InvalidParameter));
    }

    #[test]
    fn test_grouped_rejects_channel_entries() {
        let mut buf = [0u8; 16];
        let result = RunlistFormat::Grouped.encode(&channel_entry(1, 1), &mut buf);
        assert_eq!(result, Err(Error::InvalidParameter));

        let group = RunlistEntry::Group {
            group: GroupId::new(3),
            timeslice_us: 2000,
            channels: 2,
            priority: Priority::High,
        };
        RunlistFormat::Grouped.encode(&group, &mut buf).unwrap();
        assert_eq!(
            RunlistFormat::Grouped.decode(&buf).unwrap(),
            DecodedEntry::Group {
                group: GroupId::new(3),
                channels: 2,
                timeslice_us: 2000,
            }
        );
    }

    #[test]
    fn test_short_buffer_rejected() {
        let mut buf = [0u8; 4];
        let result = RunlistFormat::Extended.encode(&channel_entry(1, 1), &mut buf);
        assert_eq!(result, Err(Error::InvalidParameter));
    }
}
