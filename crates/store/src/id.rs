//! Short download identifiers.
//!
//! An ID is six symbols drawn from the first letters of the T9 keypad groups
//! (`a d g j m p t w`), chosen so the whole ID can be typed on a numeric
//! keypad with one press per symbol. The same symbol never appears twice in a
//! row, which keeps repeated-keypress ambiguity out of the namespace. That
//! leaves 8 * 7^5 = 134,456 distinct IDs.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;

/// Symbols an ID may contain: first letter of each T9 key group.
pub const ID_ALPHABET: [u8; 8] = *b"adgjmptw";

/// Length of every ID.
pub const ID_LEN: usize = 6;

/// A 6-symbol download identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId([u8; ID_LEN]);

impl FileId {
    /// Generate a fresh ID that collides with nothing in `live`.
    ///
    /// Symbols are drawn uniformly from [`ID_ALPHABET`] using the OS entropy
    /// source; a symbol equal to its predecessor is redrawn, and a finished
    /// draw that collides with a live ID is retried from scratch. With the
    /// live set bounded well below the namespace this terminates quickly.
    pub fn generate(live: &HashSet<FileId>) -> FileId {
        let mut byte = [0u8; 1];
        loop {
            let mut symbols = [0u8; ID_LEN];
            let mut len = 0;
            while len < ID_LEN {
                OsRng.fill_bytes(&mut byte);
                let symbol = ID_ALPHABET[(byte[0] % 8) as usize];
                if len > 0 && symbols[len - 1] == symbol {
                    continue;
                }
                symbols[len] = symbol;
                len += 1;
            }

            let id = FileId(symbols);
            if !live.contains(&id) {
                return id;
            }
        }
    }

    /// View the ID as a string slice.
    pub fn as_str(&self) -> &str {
        // Every symbol comes from ID_ALPHABET, so the bytes are ASCII.
        std::str::from_utf8(&self.0).expect("ID symbols are ASCII")
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an ID string fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFileIdError {
    #[error("ID must be 6 characters, got {0}")]
    BadLength(usize),
    #[error("ID contains a symbol outside the keypad alphabet")]
    BadSymbol,
    #[error("ID repeats a symbol in two consecutive positions")]
    RepeatedSymbol,
}

impl FromStr for FileId {
    type Err = ParseFileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != ID_LEN {
            return Err(ParseFileIdError::BadLength(s.chars().count()));
        }

        let mut symbols = [0u8; ID_LEN];
        for (i, &b) in bytes.iter().enumerate() {
            if !ID_ALPHABET.contains(&b) {
                return Err(ParseFileIdError::BadSymbol);
            }
            if i > 0 && symbols[i - 1] == b {
                return Err(ParseFileIdError::RepeatedSymbol);
            }
            symbols[i] = b;
        }

        Ok(FileId(symbols))
    }
}
