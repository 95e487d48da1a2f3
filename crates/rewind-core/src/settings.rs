//! Construction-time configuration for the tiered history.
//!
//! Settings are immutable once a history is built; a host that wants a
//! different geometry constructs a new history. Buffer sizes are expressed
//! in whole megabytes, applied uniformly to every tier's arena.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Largest permitted tier arena, in megabytes.
pub const MAX_BUFFER_MB: u32 = 4096;

/// Settings for a [`StateHistory`](crate::history::StateHistory).
///
/// The three tiers share one admission/eviction algorithm and differ only
/// by the byte budget and target spacing configured here. `use_compression`
/// applies the deflate transform to every stored payload, trading capture
/// latency for a deeper effective history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySettings {
    /// Byte budget of the dense, most-recent tier, in megabytes.
    pub current_buffer_mb: u32,
    /// Spacing heuristic parameter for the current tier.
    pub current_target_frame_length: u32,
    /// Byte budget of the coarser middle tier, in megabytes.
    pub recent_buffer_mb: u32,
    /// Spacing heuristic parameter for the recent tier.
    pub recent_target_frame_length: u32,
    /// Byte budget of the long-range tier, in megabytes.
    pub ancient_buffer_mb: u32,
    /// Only frames that are multiples of this interval survive into the
    /// ancient tier.
    pub ancient_state_interval: u32,
    /// Apply the deflate transform to stored payloads.
    pub use_compression: bool,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            current_buffer_mb: 256,
            current_target_frame_length: 500,
            recent_buffer_mb: 128,
            recent_target_frame_length: 2000,
            ancient_buffer_mb: 64,
            ancient_state_interval: 5000,
            use_compression: false,
        }
    }
}

/// Rejection reasons for a [`HistorySettings`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    /// A field that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// A buffer size exceeded [`MAX_BUFFER_MB`].
    #[error("{0} exceeds the maximum of {MAX_BUFFER_MB} MiB")]
    TooLarge(&'static str),
}

impl HistorySettings {
    /// Check every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let buffers = [
            (self.current_buffer_mb, "current buffer size"),
            (self.recent_buffer_mb, "recent buffer size"),
            (self.ancient_buffer_mb, "ancient buffer size"),
        ];
        for (value, name) in buffers {
            if value == 0 {
                return Err(SettingsError::Zero(name));
            }
            if value > MAX_BUFFER_MB {
                return Err(SettingsError::TooLarge(name));
            }
        }
        if self.current_target_frame_length == 0 {
            return Err(SettingsError::Zero("current target frame length"));
        }
        if self.recent_target_frame_length == 0 {
            return Err(SettingsError::Zero("recent target frame length"));
        }
        if self.ancient_state_interval == 0 {
            return Err(SettingsError::Zero("ancient state interval"));
        }
        Ok(())
    }

    /// Serialize as fixed-width little-endian fields.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    pub fn write_to(&self, writer: &mut dyn Write) -> io::Result<()> {
        writer.write_all(&self.current_buffer_mb.to_le_bytes())?;
        writer.write_all(&self.current_target_frame_length.to_le_bytes())?;
        writer.write_all(&self.recent_buffer_mb.to_le_bytes())?;
        writer.write_all(&self.recent_target_frame_length.to_le_bytes())?;
        writer.write_all(&self.ancient_buffer_mb.to_le_bytes())?;
        writer.write_all(&self.ancient_state_interval.to_le_bytes())?;
        writer.write_all(&[u8::from(self.use_compression)])?;
        Ok(())
    }

    /// Deserialize fields written by [`write_to`](Self::write_to).
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying reader, including
    /// `UnexpectedEof` on a truncated stream.
    pub fn read_from(reader: &mut dyn Read) -> io::Result<Self> {
        let mut words = [0u8; 24];
        reader.read_exact(&mut words)?;
        let mut flag = [0u8; 1];
        reader.read_exact(&mut flag)?;
        let field = |i: usize| {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(&words[i * 4..i * 4 + 4]);
            u32::from_le_bytes(buf)
        };
        Ok(Self {
            current_buffer_mb: field(0),
            current_target_frame_length: field(1),
            recent_buffer_mb: field(2),
            recent_target_frame_length: field(3),
            ancient_buffer_mb: field(4),
            ancient_state_interval: field(5),
            use_compression: flag[0] != 0,
        })
    }
}
