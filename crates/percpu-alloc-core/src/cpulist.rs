//! CPU sets and the sysfs CPU-list text format.
//!
//! A CPU list is a comma-separated sequence of single ids or inclusive
//! ranges, e.g. `0-3,7,9-11`. The parser pulls its input through a small
//! fixed buffer so that it works over non-seekable descriptors and never
//! needs to know the input length up front.

use std::io::{self, Read};

use crate::MAX_CPUS;
use crate::error::CpulistError;

const WORDS: usize = MAX_CPUS / 64;

/// Chunk size used when reading CPU-list text.
const READ_CHUNK: usize = 16;

/// Fixed-size bitset of CPU ids below [`MAX_CPUS`].
#[derive(Clone, PartialEq, Eq)]
pub struct CpuSet {
    words: [u64; WORDS],
}

impl CpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    /// Adds `cpu`, failing if it is out of range.
    pub fn insert(&mut self, cpu: usize) -> Result<(), CpulistError> {
        if cpu >= MAX_CPUS {
            return Err(CpulistError::CpuOutOfRange { cpu, max: MAX_CPUS });
        }
        self.words[cpu / 64] |= 1 << (cpu % 64);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.words[cpu / 64] & (1 << (cpu % 64)) != 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest CPU id in the set.
    #[must_use]
    pub fn first(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * 64 + w.trailing_zeros() as usize)
    }

    /// CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_CPUS).filter(move |&cpu| self.contains(cpu))
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

fn parse_cpu(token: &[u8]) -> Result<usize, CpulistError> {
    let text = std::str::from_utf8(token)
        .map_err(|_| CpulistError::BadInteger {
            token: String::from_utf8_lossy(token).into_owned(),
        })?
        .trim();
    if text.is_empty() {
        return Err(CpulistError::EmptyEntry);
    }
    text.parse::<usize>()
        .map_err(|_| CpulistError::BadInteger {
            token: text.to_string(),
        })
}

fn read_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Parses CPU-list text from `reader`.
///
/// Whitespace around entries is ignored and a blank input is the empty
/// set (sysfs reports memory-only nodes that way). Empty entries, inverted
/// ranges, ranges without an end and ids at or above [`MAX_CPUS`] are
/// rejected; nothing is returned unless the whole input parsed.
pub fn parse_cpulist<R: Read>(mut reader: R) -> Result<CpuSet, CpulistError> {
    let mut set = CpuSet::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut carry_over = 0usize;
    let mut range_from: Option<usize> = None;
    let mut saw_entry = false;

    loop {
        let rc = read_retrying(&mut reader, &mut buf[carry_over..])?;
        let len = carry_over + rc;
        let at_eof = rc == 0;

        if len == 0 && at_eof {
            break;
        }
        // A token longer than the buffer can never be a valid cpu id.
        if len == READ_CHUNK && rc == 0 {
            return Err(CpulistError::BadInteger {
                token: String::from_utf8_lossy(&buf).into_owned(),
            });
        }

        let current = &buf[..len];
        let dash = current.iter().position(|&b| b == b'-');
        let comma = current.iter().position(|&b| b == b',');

        let consumed = match (dash, comma) {
            (Some(d), c) if c.is_none_or(|c| d < c) => {
                if let Some(from) = range_from {
                    // A second dash before the range end.
                    return Err(CpulistError::DanglingRange { from });
                }
                range_from = Some(parse_cpu(&current[..d])?);
                d + 1
            }
            _ if comma.is_some() || at_eof => {
                let end = comma.unwrap_or(len);
                let token = &current[..end];
                let blank = token.iter().all(u8::is_ascii_whitespace);
                if blank && comma.is_none() && !saw_entry && range_from.is_none() {
                    // Entire input was whitespace.
                    break;
                }
                let cpu = parse_cpu(token)?;
                match range_from.take() {
                    Some(from) if from > cpu => {
                        return Err(CpulistError::InvertedRange { from, to: cpu });
                    }
                    Some(from) => {
                        for c in from..=cpu {
                            set.insert(c)?;
                        }
                    }
                    None => set.insert(cpu)?,
                }
                saw_entry = true;
                comma.map_or(len, |c| c + 1)
            }
            _ => 0,
        };

        carry_over = len - consumed;
        buf.copy_within(consumed..len, 0);

        if at_eof && comma.is_none() && dash.is_none() {
            break;
        }
    }

    if let Some(from) = range_from {
        return Err(CpulistError::DanglingRange { from });
    }
    Ok(set)
}

/// Parses CPU-list text held in memory.
pub fn parse_cpulist_str(text: &str) -> Result<CpuSet, CpulistError> {
    parse_cpulist(text.as_bytes())
}
