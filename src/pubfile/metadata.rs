/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The JSON metadata stored in every base sector.
//!
//! Unknown fields are ignored on decode, so uploaders may add fields of their own without breaking
//! readers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::PubfileError;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubfileMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub length: u64,
    #[serde(default, skip_serializing_if = "is_zero_mode")]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subfiles: BTreeMap<String, SubfileMetadata>,
    /// What to serve when a directory pubfile is fetched without a path.
    #[serde(rename = "defaultpath", default, skip_serializing_if = "String::is_empty")]
    pub default_path: String,
    #[serde(rename = "disabledefaultpath", default, skip_serializing_if = "is_false")]
    pub disable_default_path: bool,
}

/// One file inside a pubfile, at `offset` of the pubfile's data.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubfileMetadata {
    #[serde(default, skip_serializing_if = "is_zero_mode")]
    pub mode: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(rename = "contenttype", default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub len: u64,
}

fn is_zero(int: &u64) -> bool {
    *int == 0
}

fn is_zero_mode(mode: &u32) -> bool {
    *mode == 0
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

impl PubfileMetadata {
    /// Metadata of a pubfile holding a single file.
    pub fn for_file(filename: &str, mode: u32, length: u64) -> PubfileMetadata {
        PubfileMetadata {
            filename: filename.to_string(),
            length,
            mode,
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, PubfileError> {
        serde_json::to_vec(self).map_err(|err| PubfileError::InvalidMetadata(err.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<PubfileMetadata, PubfileError> {
        serde_json::from_slice(bytes).map_err(|err| PubfileError::InvalidMetadata(err.to_string()))
    }

    /// The part of this pubfile at `path`, which names either a subfile or a directory of subfiles.
    /// Returns the narrowed metadata with offsets relative to its first subfile, whether `path` named a
    /// single file, and the offset and length of the range of the pubfile's data it covers.
    pub fn for_path(&self, path: &str) -> (PubfileMetadata, bool, u64, u64) {
        let path = ensure_leading_slash(path);
        let mut metadata = PubfileMetadata {
            filename: path.clone(),
            ..Default::default()
        };

        let exact = self
            .subfiles
            .values()
            .find(|subfile| ensure_leading_slash(&subfile.filename) == path);
        let is_file = exact.is_some();
        match exact {
            Some(subfile) => {
                metadata.subfiles.insert(subfile.filename.clone(), subfile.clone());
            }
            None => {
                let dir = if path.ends_with('/') { path.clone() } else { format!("{}/", path) };
                for subfile in self.subfiles.values() {
                    if ensure_leading_slash(&subfile.filename).starts_with(&dir) {
                        metadata.subfiles.insert(subfile.filename.clone(), subfile.clone());
                    }
                }
            }
        }

        let offset = metadata.subfiles.values().map(|subfile| subfile.offset).min().unwrap_or(0);
        for subfile in metadata.subfiles.values_mut() {
            subfile.offset -= offset;
        }
        metadata.length = metadata.size();
        let size = metadata.length;
        (metadata, is_file, offset, size)
    }

    /// The content type, known only when the pubfile holds exactly one subfile.
    pub fn content_type(&self) -> Option<&str> {
        match self.subfiles.len() {
            1 => self
                .subfiles
                .values()
                .next()
                .map(|subfile| subfile.content_type.as_str())
                .filter(|content_type| !content_type.is_empty()),
            _ => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        match self.subfiles.len() {
            0 => false,
            1 => self.subfiles.values().all(|subfile| subfile.filename != self.filename),
            _ => true,
        }
    }

    /// Sum of the lengths of all subfiles.
    pub fn size(&self) -> u64 {
        self.subfiles.values().map(|subfile| subfile.len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subfile(filename: &str, offset: u64, len: u64) -> SubfileMetadata {
        SubfileMetadata {
            mode: 0o644,
            filename: filename.to_string(),
            content_type: "text/plain".to_string(),
            offset,
            len,
        }
    }

    fn directory() -> PubfileMetadata {
        let mut metadata = PubfileMetadata::for_file("site", 0o755, 30);
        for subfile in [subfile("index.html", 0, 10), subfile("a/b.txt", 10, 5), subfile("a/c.txt", 15, 15)] {
            metadata.subfiles.insert(subfile.filename.clone(), subfile);
        }
        metadata
    }

    #[test]
    fn json_uses_the_wire_names_and_omits_empty_fields() {
        let json = String::from_utf8(PubfileMetadata::for_file("hello skynet", 0o644, 13).to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"filename":"hello skynet","length":13,"mode":420}"#);

        let parsed = PubfileMetadata::from_json(br#"{"filename":"x","defaultpath":"/i.html","extra":1}"#).unwrap();
        assert_eq!(parsed.filename, "x");
        assert_eq!(parsed.default_path, "/i.html");
        assert!(PubfileMetadata::from_json(b"not json").is_err());
    }

    #[test]
    fn for_path_narrows_to_a_file_or_a_directory() {
        let metadata = directory();

        let (file, is_file, offset, size) = metadata.for_path("a/b.txt");
        assert!(is_file);
        assert_eq!((offset, size), (10, 5));
        assert_eq!(file.subfiles["a/b.txt"].offset, 0);

        let (dir, is_file, offset, size) = metadata.for_path("/a");
        assert!(!is_file);
        assert_eq!((offset, size), (10, 20));
        assert_eq!(dir.subfiles.len(), 2);
        assert_eq!(dir.subfiles["a/c.txt"].offset, 5);
        assert!(dir.is_directory());

        let (missing, is_file, _, size) = metadata.for_path("nope");
        assert!(!is_file);
        assert_eq!(size, 0);
        assert!(missing.subfiles.is_empty());
    }

    #[test]
    fn content_type_needs_exactly_one_subfile() {
        assert_eq!(directory().content_type(), None);
        let (single, _, _, _) = directory().for_path("index.html");
        assert_eq!(single.content_type(), Some("text/plain"));
        assert!(!PubfileMetadata::for_file("x", 0o644, 1).is_directory());
    }
}
