use super::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use bytes::{BufMut, Bytes, BytesMut};

/// Request options in their original order and casing.
///
/// RFC 2347 option names are matched case-insensitively, but the accepted
/// set must echo the requester's spelling and ordering, so the entries are
/// kept as an insertion-ordered list rather than a map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options {
    entries: Vec<(String, String)>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    /// Parses a `(name \0 value \0)*` tail. A dangling name without a value
    /// is dropped.
    pub fn parse(raw: &[u8]) -> Options {
        let mut options = Options::new();

        let mut parameters = raw.split(|&b| b == 0);
        loop {
            let name = match parameters.next() {
                Some(name) if !name.is_empty() => name,
                _ => break,
            };

            let value = match parameters.next() {
                Some(value) => value,
                _ => break,
            };

            options.entries.push((
                String::from_utf8_lossy(name).to_string(),
                String::from_utf8_lossy(value).to_string(),
            ));
        }

        options
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replaces the value in place when the option is already present
    /// (keeping its position and casing), appends otherwise.
    pub fn set(&mut self, name: &str, value: String) {
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, v)) => *v = value,
            _ => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn blksize(&self) -> usize {
        self.get("blksize")
            .and_then(|v| v.parse::<u32>().ok())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    pub fn timeout(&self) -> Option<u64> {
        self.get("timeout").and_then(|v| v.parse::<u64>().ok())
    }

    pub fn as_bytes(&self) -> Bytes {
        let mut bytes = BytesMut::new();

        for (name, value) in &self.entries {
            bytes.put(name.as_bytes());
            bytes.put_u8(0);
            bytes.put(value.as_bytes());
            bytes.put_u8(0);
        }

        bytes.freeze()
    }

    /// Filters the requested options down to the accepted set, in request
    /// order:
    ///
    /// - `blksize`: rejected below 8, clamped to 65464 and to the limit's
    ///   `blksize` when one is configured;
    /// - `timeout`: accepted in 1..=255 seconds;
    /// - anything else, and any non-integer value, is omitted.
    pub fn negotiate(&self, limits: &Options) -> Options {
        let mut accepted = Options::new();

        for (name, value) in self.iter() {
            if name.eq_ignore_ascii_case("blksize") {
                let Ok(blksize) = value.parse::<u32>() else {
                    continue;
                };
                if blksize < MIN_BLOCK_SIZE {
                    continue;
                }
                let mut blksize = blksize.min(MAX_BLOCK_SIZE);
                if let Some(limit) = limits.get("blksize").and_then(|v| v.parse::<u32>().ok()) {
                    blksize = blksize.min(limit);
                }
                accepted.entries.push((name.to_string(), blksize.to_string()));
            } else if name.eq_ignore_ascii_case("timeout") {
                let Ok(timeout) = value.parse::<u32>() else {
                    continue;
                };
                if (1..=255).contains(&timeout) {
                    accepted.entries.push((name.to_string(), value.to_string()));
                }
            }
        }

        accepted
    }
}

/// Builds the option set a client sends with its request.
#[derive(Default)]
pub struct OptionBuilder {
    options: Options,
}

impl OptionBuilder {
    pub fn blksize(mut self, blksize: u16) -> Self {
        self.options.set("blksize", blksize.to_string());
        self
    }

    pub fn timeout(mut self, timeout: u8) -> Self {
        self.options.set("timeout", timeout.to_string());
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}
