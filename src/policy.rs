//! Which stored files must be encrypted, decided by extension.

use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Audio,
    Transcript,
    Extraction,
    Form,
}

impl FileCategory {
    pub const ALL: [FileCategory; 4] = [
        FileCategory::Audio,
        FileCategory::Transcript,
        FileCategory::Extraction,
        FileCategory::Form,
    ];

    /// Lowercase extensions, without the dot.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            FileCategory::Audio => &["wav", "mp3", "m4a", "flac"],
            FileCategory::Transcript => &["txt", "doc", "docx"],
            FileCategory::Extraction => &["json", "xml"],
            FileCategory::Form => &["pdf"],
        }
    }

    /// Category for a path, matched case-insensitively on its extension.
    pub fn of(path: &Path) -> Option<FileCategory> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.extensions().contains(&ext.as_str()))
    }
}

/// Whether a file at `path` has to be stored encrypted.
pub fn requires_encryption(path: &Path) -> bool {
    FileCategory::of(path).is_some()
}
