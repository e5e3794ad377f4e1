//! Payload corpora for the compression case families
//!
//! Compression cases echo slices of real-world documents so the deflate
//! codec sees realistic input. [`DirCorpus`] reads them from a test data
//! directory; [`SyntheticCorpus`] produces deterministic stand-ins with a
//! similar texture when no directory is configured.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, Error, Result};

/// The documents compression cases draw from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorpusKey {
    JsonData1,
    Lena512,
    GutenbergFaust,
    HtmlData1,
    Ooms,
}

impl CorpusKey {
    /// Registration order of the 12.x sub-categories
    pub const ALL: [CorpusKey; 5] = [
        CorpusKey::JsonData1,
        CorpusKey::Lena512,
        CorpusKey::GutenbergFaust,
        CorpusKey::HtmlData1,
        CorpusKey::Ooms,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CorpusKey::JsonData1 => "json_data1",
            CorpusKey::Lena512 => "lena512",
            CorpusKey::GutenbergFaust => "gutenberg_faust",
            CorpusKey::HtmlData1 => "html_data1",
            CorpusKey::Ooms => "ooms",
        }
    }

    /// File name inside a test data directory
    pub fn file_name(&self) -> &'static str {
        match self {
            CorpusKey::JsonData1 => "data1.json",
            CorpusKey::Lena512 => "lena512.bmp",
            CorpusKey::GutenbergFaust => "pg2229.txt",
            CorpusKey::HtmlData1 => "data1.html",
            CorpusKey::Ooms => "10.1.1.105.5439.pdf",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CorpusKey::JsonData1 => "Large JSON data file",
            CorpusKey::Lena512 => "Lena Picture, Bitmap 512x512 bw",
            CorpusKey::GutenbergFaust => "Human readable text, Goethe's Faust I (German)",
            CorpusKey::HtmlData1 => "Large HTML file",
            CorpusKey::Ooms => "A larger PDF",
        }
    }

    /// Binary corpora are sent as binary messages, the rest as text
    pub fn is_binary(&self) -> bool {
        !matches!(self, CorpusKey::JsonData1 | CorpusKey::HtmlData1)
    }
}

/// Source of corpus documents
pub trait Corpus: Send + Sync {
    /// Full document for `key`; text documents must be valid UTF-8
    fn load(&self, key: CorpusKey) -> Result<Bytes>;
}

/// Documents read from a directory of test data files
#[derive(Debug, Clone)]
pub struct DirCorpus {
    dir: PathBuf,
}

impl DirCorpus {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Corpus for DirCorpus {
    fn load(&self, key: CorpusKey) -> Result<Bytes> {
        let path = self.dir.join(key.file_name());
        let data = std::fs::read(&path).map_err(|e| {
            Error::from(ConfigurationError::InvalidValue {
                field: "testdata".into(),
                reason: format!("cannot read {}: {}", path.display(), e),
            })
        })?;
        if data.is_empty() {
            return Err(Error::CaseInternal(format!("corpus {} is empty", key.name())));
        }
        if !key.is_binary() && !crate::utf8::validate_utf8(&data) {
            return Err(Error::CaseInternal(format!(
                "text corpus {} is not valid UTF-8",
                key.name()
            )));
        }
        Ok(Bytes::from(data))
    }
}

/// Size of every synthetic document
pub const SYNTHETIC_CORPUS_LEN: usize = 256 * 1024;

/// Deterministic generated documents
#[derive(Debug, Clone, Copy, Default)]
pub struct SyntheticCorpus;

const FAUST_WORDS: &[&str] = &[
    "Habe", "nun,", "ach!", "Philosophie,", "Juristerei", "und", "Medizin,", "Und", "leider",
    "auch", "Theologie", "Durchaus", "studiert,", "mit", "heißem", "Bemühn.", "Da", "steh",
    "ich", "nun,", "ich", "armer", "Tor!", "Und", "bin", "so", "klug", "als", "wie", "zuvor;",
];

fn synthetic_text(seed: u64, render: impl Fn(&mut fastrand::Rng, &mut String)) -> Bytes {
    let mut rng = fastrand::Rng::with_seed(seed);
    let mut out = String::with_capacity(SYNTHETIC_CORPUS_LEN + 256);
    while out.len() < SYNTHETIC_CORPUS_LEN {
        render(&mut rng, &mut out);
    }
    Bytes::from(out)
}

impl Corpus for SyntheticCorpus {
    fn load(&self, key: CorpusKey) -> Result<Bytes> {
        Ok(match key {
            CorpusKey::JsonData1 => synthetic_text(1, |rng, out| {
                let id = rng.u32(..);
                let score = rng.u16(..1000);
                let name = FAUST_WORDS[rng.usize(..FAUST_WORDS.len())];
                out.push_str(&format!(
                    "{{\"id\": {}, \"name\": \"{}\", \"score\": {}, \"tags\": [\"a\", \"b\"]}},\n",
                    id, name, score
                ));
            }),
            CorpusKey::HtmlData1 => synthetic_text(2, |rng, out| {
                let word = FAUST_WORDS[rng.usize(..FAUST_WORDS.len())];
                out.push_str(&format!(
                    "<div class=\"row\"><span id=\"c{}\">{}</span></div>\n",
                    rng.u16(..),
                    word
                ));
            }),
            CorpusKey::GutenbergFaust => synthetic_text(3, |rng, out| {
                out.push_str(FAUST_WORDS[rng.usize(..FAUST_WORDS.len())]);
                out.push(if rng.u8(..16) == 0 { '\n' } else { ' ' });
            }),
            CorpusKey::Lena512 => {
                // smooth gradients with a little noise, like a grayscale bitmap
                let mut rng = fastrand::Rng::with_seed(4);
                let data: Vec<u8> = (0..SYNTHETIC_CORPUS_LEN)
                    .map(|i| {
                        let (x, y) = (i % 512, i / 512);
                        ((x + y) / 4) as u8 ^ (rng.u8(..4))
                    })
                    .collect();
                Bytes::from(data)
            }
            CorpusKey::Ooms => {
                let mut rng = fastrand::Rng::with_seed(5);
                let mut data = vec![0u8; SYNTHETIC_CORPUS_LEN];
                // half compressible runs, half noise
                for chunk in data.chunks_mut(64) {
                    if rng.bool() {
                        rng.fill(chunk);
                    } else {
                        chunk.fill(rng.u8(..));
                    }
                }
                Bytes::from(data)
            }
        })
    }
}

/// Cyclic reader over a corpus document
///
/// Binary documents are sliced by octets, text documents by characters so
/// every slice stays valid UTF-8.
#[derive(Debug, Clone)]
pub struct CorpusCursor {
    data: Bytes,
    /// Byte offset of every character start, text documents only
    char_starts: Option<Vec<usize>>,
    pos: usize,
}

impl CorpusCursor {
    pub fn new(data: Bytes, binary: bool) -> Result<Self> {
        let char_starts = if binary {
            None
        } else {
            let text = std::str::from_utf8(&data)
                .map_err(|_| Error::CaseInternal("text corpus is not valid UTF-8".into()))?;
            Some(text.char_indices().map(|(i, _)| i).collect())
        };
        Ok(Self {
            data,
            char_starts,
            pos: 0,
        })
    }

    fn units(&self) -> usize {
        self.char_starts
            .as_ref()
            .map_or(self.data.len(), Vec::len)
    }

    fn byte_offset(&self, unit: usize) -> usize {
        match &self.char_starts {
            Some(starts) => starts.get(unit).copied().unwrap_or(self.data.len()),
            None => unit,
        }
    }

    /// Next `len` units, wrapping around the end of the document
    pub fn next_slice(&mut self, len: usize) -> Bytes {
        let units = self.units();
        if len == 0 || units == 0 {
            return Bytes::new();
        }
        let mut out = Vec::new();
        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(units - self.pos);
            let from = self.byte_offset(self.pos);
            let to = self.byte_offset(self.pos + take);
            out.extend_from_slice(&self.data[from..to]);
            remaining -= take;
            self.pos = (self.pos + take) % units;
        }
        Bytes::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_corpus_is_deterministic() {
        for key in CorpusKey::ALL {
            let a = SyntheticCorpus.load(key).unwrap();
            let b = SyntheticCorpus.load(key).unwrap();
            assert_eq!(a, b, "{}", key.name());
            assert!(a.len() >= SYNTHETIC_CORPUS_LEN);
            if !key.is_binary() {
                assert!(std::str::from_utf8(&a).is_ok());
            }
        }
    }

    #[test]
    fn test_dir_corpus_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data1.json"), b"{\"k\": 1}").unwrap();
        let corpus = DirCorpus::new(dir.path());
        assert_eq!(&corpus.load(CorpusKey::JsonData1).unwrap()[..], b"{\"k\": 1}");
        assert!(corpus.load(CorpusKey::Ooms).is_err());

        std::fs::write(dir.path().join("data1.html"), b"\xff\xfe").unwrap();
        assert!(corpus.load(CorpusKey::HtmlData1).is_err());
    }

    #[test]
    fn test_cursor_wraps_binary() {
        let mut cur = CorpusCursor::new(Bytes::from_static(b"abcde"), true).unwrap();
        assert_eq!(&cur.next_slice(3)[..], b"abc");
        assert_eq!(&cur.next_slice(4)[..], b"deab");
        assert_eq!(&cur.next_slice(12)[..], b"cdeabcdeabcd");
        assert!(cur.next_slice(0).is_empty());
    }

    #[test]
    fn test_cursor_slices_text_by_chars() {
        let mut cur = CorpusCursor::new(Bytes::from("aßc"), false).unwrap();
        let first = cur.next_slice(2);
        assert_eq!(std::str::from_utf8(&first).unwrap(), "aß");
        let second = cur.next_slice(2);
        assert_eq!(std::str::from_utf8(&second).unwrap(), "ca");
        assert!(CorpusCursor::new(Bytes::from_static(b"\xff"), false).is_err());
    }

    #[test]
    fn test_corpus_kinds() {
        assert!(!CorpusKey::JsonData1.is_binary());
        assert!(CorpusKey::GutenbergFaust.is_binary());
        assert_eq!(
            serde_json::to_string(&CorpusKey::GutenbergFaust).unwrap(),
            "\"gutenberg_faust\""
        );
    }
}
