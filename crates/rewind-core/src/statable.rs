//! The state-serializable collaborator contract.
//!
//! The history engine never inspects snapshot contents; it only needs a
//! collaborator that can stream its entire runtime state out and later
//! reinitialize itself from such a stream.

use std::io::{self, Read, Write};

/// Something that can serialize its complete runtime state to an opaque
/// byte stream and later reinitialize itself from one.
///
/// The produced bytes are treated as opaque by the history engine: whatever
/// `save_state` writes is exactly what a later `load_state` will be handed.
///
/// # Dyn Compatibility
///
/// The trait is dyn-compatible so hosts can hand the engine a
/// `&dyn Statable` without generics leaking into their own signatures.
pub trait Statable {
    /// Write the complete runtime state into `writer`.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying writer.
    fn save_state(&self, writer: &mut dyn Write) -> io::Result<()>;

    /// Reinitialize the runtime state from `reader`.
    ///
    /// The stream must have been produced by a prior `save_state` on a
    /// compatible instance.
    ///
    /// # Errors
    ///
    /// Returns any error from the underlying reader.
    fn load_state(&mut self, reader: &mut dyn Read) -> io::Result<()>;
}
