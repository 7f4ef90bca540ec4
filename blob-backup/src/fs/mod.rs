//! Local file system access: discovery, fingerprints and content types.

pub mod content_type;
pub mod fingerprint;
pub mod walker;
