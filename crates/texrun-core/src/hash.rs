//! Content digests using blake3.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};

/// Incremental digest over a sequence of text fragments.
///
/// Each fragment is length-prefixed, so moving text across a fragment
/// boundary changes the digest.
#[derive(Debug, Clone, Default)]
pub struct DigestAccumulator {
    hasher: blake3::Hasher,
}

impl DigestAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, text: &str) {
        self.hasher.update(&(text.len() as u64).to_le_bytes());
        self.hasher.update(text.as_bytes());
    }

    /// Hex digest of everything fed so far.
    pub fn finish(&self) -> String {
        hex::encode(self.hasher.finalize().as_bytes())
    }
}

/// Hex digest of a single string.
pub fn hex_digest(text: &str) -> String {
    hex::encode(blake3::hash(text.as_bytes()).as_bytes())
}

/// Digest of an empty input, used for families without custom code.
pub fn empty_digest() -> String {
    hex_digest("")
}

/// Hex digest of a file's bytes.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// The digests that decide whether a run key is unchanged.
///
/// The default value matches no real digest and is stored to force a
/// re-run on the next pass.
#[derive(Archive, Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct HashTriple {
    /// All records of the run key.
    pub code: String,
    /// Custom code of the key's family.
    pub custom: String,
    /// Engine definition.
    pub engine: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_accumulator_frames_fragments() {
        let digest = |parts: &[&str]| {
            let mut acc = DigestAccumulator::new();
            parts.iter().for_each(|p| acc.update(p));
            acc.finish()
        };
        assert_eq!(digest(&["abc", "def"]), digest(&["abc", "def"]));
        assert_ne!(digest(&["abc", "def"]), digest(&["abcd", "ef"]));
        assert_ne!(digest(&["abc", ""]), digest(&["abc"]));
        assert_eq!(digest(&["abc"]).len(), 64);
    }

    #[test]
    fn test_single_character_changes_digest() {
        assert_ne!(hex_digest("print(1)\n"), hex_digest("print(2)\n"));
    }

    #[test]
    fn test_file_digest() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let path = temp.path().join("data.csv");
        std::fs::write(&path, "1,2,3\n").expect("Failed to write file");
        assert_eq!(file_digest(&path).expect("Failed to hash"), hex_digest("1,2,3\n"));
        assert!(file_digest(&temp.path().join("missing")).is_err());
    }
}
