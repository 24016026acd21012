//! Conversion between Markdown and the cloud's proprietary note JSON format.
//!
//! Full fidelity translation of the note format is out of scope; this module
//! only defines the seam so `upload_as_note` has somewhere to plug in a real
//! implementation later.

use anyhow::Result;

pub trait NoteConverter: Send + Sync {
    fn markdown_to_note(&self, markdown: &str) -> Result<String>;
    fn note_to_markdown(&self, note_json: &str) -> Result<String>;
}

/// Placeholder converter: refuses both directions. Wiring `upload_as_note` to
/// a real note format requires swapping this out for a converter that speaks
/// the proprietary node-tree JSON schema.
pub struct UnsupportedConverter;

impl NoteConverter for UnsupportedConverter {
    fn markdown_to_note(&self, _markdown: &str) -> Result<String> {
        anyhow::bail!("note format conversion is not implemented; upload as markdown instead")
    }

    fn note_to_markdown(&self, _note_json: &str) -> Result<String> {
        anyhow::bail!("note format conversion is not implemented; download as markdown instead")
    }
}
