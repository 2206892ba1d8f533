// Chunkload - Resumable Encrypted Chunked Transfers
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Artifact file names
//!
//! Every artifact name is derived from the location, so a fresh operation for
//! the same object finds the files a previous run left behind.
//!
//! # Naming
//! - temp data: `{base}.temp`
//! - final: `{base}{ext}` or the caller-supplied name
//! - IV state: `{base}_64.iv` (whole-file cipher only)
//! - ranges: `{base}_64.pt` (random-order saving only)
//! - preload: `{base}_64.preload` (preview-capable video only)
//! - at-rest key: `{final}.key`, with `.enc` appended to temp, final and IV
//!   names and no range or preload file

use crate::location::Location;
use std::path::{Path, PathBuf};

/// Which optional artifacts a transfer uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactFlags {
    pub ranges: bool,
    pub whole_file_cipher: bool,
    pub preload: bool,
    pub encrypt_at_rest: bool,
}

/// Paths of every artifact of one transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub temp: PathBuf,
    pub final_path: PathBuf,
    pub iv: Option<PathBuf>,
    pub parts: Option<PathBuf>,
    pub preload: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

impl ArtifactPaths {
    /// Derive artifact paths for `location`
    ///
    /// # Arguments
    /// * `temp_dir` - directory for temp and auxiliary files
    /// * `store_dir` - directory of the final file
    /// * `extension` - final extension including the dot, may be empty
    /// * `final_name` - overrides the derived final file name
    pub fn derive(
        location: &Location,
        temp_dir: &Path,
        store_dir: &Path,
        extension: &str,
        final_name: Option<&str>,
        flags: ArtifactFlags,
    ) -> Self {
        let base = location.artifact_base_name();
        let enc = if flags.encrypt_at_rest { ".enc" } else { "" };

        let final_name = match final_name {
            Some(name) => sanitize_filename(name),
            None => format!("{}{}", base, extension),
        };
        let final_path = store_dir.join(format!("{}{}", final_name, enc));
        let temp = temp_dir.join(format!("{}.temp{}", base, enc));

        let iv = flags
            .whole_file_cipher
            .then(|| temp_dir.join(format!("{}_64.iv{}", base, enc)));
        let parts = (flags.ranges && !flags.encrypt_at_rest).then(|| temp_dir.join(format!("{}_64.pt", base)));
        let preload = (flags.preload && !flags.encrypt_at_rest)
            .then(|| temp_dir.join(format!("{}_64.preload", base)));
        let key = flags.encrypt_at_rest.then(|| {
            let mut name = final_path.as_os_str().to_owned();
            name.push(".key");
            PathBuf::from(name)
        });

        Self {
            temp,
            final_path,
            iv,
            parts,
            preload,
            key,
        }
    }

    /// Auxiliary files deleted once the transfer completes
    pub fn auxiliary(&self) -> impl Iterator<Item = &PathBuf> {
        self.iv.iter().chain(self.parts.iter()).chain(self.preload.iter())
    }

    /// Every artifact, for cancellation with file deletion
    pub fn all(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.temp)
            .chain(std::iter::once(&self.final_path))
            .chain(self.auxiliary())
            .chain(self.key.iter())
    }
}

/// Strip characters that would escape the target directory
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Avoid filename collisions by appending (1), (2), etc.
pub fn avoid_collision(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    for i in 1..1000 {
        let new_filename = if extension.is_empty() {
            format!("{} ({})", stem, i)
        } else {
            format!("{} ({}).{}", stem, i, extension)
        };

        let new_path = parent.join(new_filename);
        if !new_path.exists() {
            return new_path;
        }
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location() -> Location {
        Location::Plain {
            datacenter_id: 2,
            id: 55,
            access_hash: 0,
            file_reference: Vec::new(),
            volume_id: 0,
            local_id: 0,
        }
    }

    #[test]
    fn test_derive_plain_with_ranges() {
        let flags = ArtifactFlags {
            ranges: true,
            ..ArtifactFlags::default()
        };
        let paths = ArtifactPaths::derive(&location(), Path::new("/tmp/t"), Path::new("/media"), ".mp4", None, flags);
        assert_eq!(paths.temp, PathBuf::from("/tmp/t/2_55.temp"));
        assert_eq!(paths.final_path, PathBuf::from("/media/2_55.mp4"));
        assert_eq!(paths.parts, Some(PathBuf::from("/tmp/t/2_55_64.pt")));
        assert!(paths.iv.is_none());
        assert!(paths.key.is_none());
        assert_eq!(paths.auxiliary().count(), 1);
    }

    #[test]
    fn test_derive_encrypt_at_rest() {
        let flags = ArtifactFlags {
            ranges: true,
            preload: true,
            encrypt_at_rest: true,
            ..ArtifactFlags::default()
        };
        let paths = ArtifactPaths::derive(
            &location(),
            Path::new("/tmp"),
            Path::new("/store"),
            "",
            Some("clip.mp4"),
            flags,
        );
        assert_eq!(paths.temp, PathBuf::from("/tmp/2_55.temp.enc"));
        assert_eq!(paths.final_path, PathBuf::from("/store/clip.mp4.enc"));
        assert_eq!(paths.key, Some(PathBuf::from("/store/clip.mp4.enc.key")));
        assert!(paths.parts.is_none());
        assert!(paths.preload.is_none());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("  "), "file");
        assert_eq!(sanitize_filename("movie.mp4"), "movie.mp4");
    }

    #[test]
    fn test_avoid_collision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        assert_eq!(avoid_collision(path.clone()), path);

        std::fs::write(&path, b"x").unwrap();
        std::fs::write(dir.path().join("clip (1).mp4"), b"x").unwrap();
        assert_eq!(avoid_collision(path), dir.path().join("clip (2).mp4"));
    }
}
