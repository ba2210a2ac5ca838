// SPDX-License-Identifier: MIT OR Apache-2.0
//! Forward-only tar entry reader.
//!
//! The artifact format nests tar streams (payload tar inside compression
//! inside the outer tar) and every layer must be consumed strictly in order,
//! with running digests on the raw entry bytes.  That rules out archive APIs
//! that own the reader for the lifetime of an entry iterator, so this module
//! reads the ustar framing directly: 512-byte headers, content, zero padding,
//! two zero blocks at the end.  Only the subset the artifact format produces
//! is supported (regular files and directories, names up to 100 bytes plus
//! the ustar prefix field).

use airlift_error::{Error, ErrorKind, Result};
use std::io::Read;

const BLOCK: usize = 512;

/// Metadata of the entry the reader is positioned at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarEntryMeta {
    /// Entry path as stored.
    pub name: String,
    /// Content size in bytes.
    pub size: u64,
    /// `true` for directory entries (size zero, trailing slash).
    pub is_dir: bool,
}

/// Pull-based reader over one tar stream.
pub struct TarStream<R> {
    inner: R,
    /// Unread content bytes of the current entry.
    remaining: u64,
    /// Padding bytes after the current entry's content.
    padding: u64,
    finished: bool,
}

impl<R: Read> TarStream<R> {
    /// Wrap `inner`, positioned at the start of a tar stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            remaining: 0,
            padding: 0,
            finished: false,
        }
    }

    /// Advance to the next entry, skipping whatever the caller left unread.
    ///
    /// Returns `None` at the end-of-archive marker or raw EOF.
    pub fn next_entry(&mut self) -> Result<Option<TarEntryMeta>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_current()?;

        let mut header = [0u8; BLOCK];
        loop {
            if !self.read_block(&mut header)? {
                // Truncated archive without the end marker; treat as EOF.
                self.finished = true;
                return Ok(None);
            }
            if header.iter().all(|b| *b == 0) {
                // First of the two terminating zero blocks; drain the rest.
                self.finished = true;
                return Ok(None);
            }
            match parse_header(&header)? {
                ParsedHeader::Entry(meta) => {
                    self.remaining = meta.size;
                    self.padding = (BLOCK as u64 - meta.size % BLOCK as u64) % BLOCK as u64;
                    return Ok(Some(meta));
                }
                // pax extended headers carry metadata we don't use; skip the
                // attached content and keep scanning.
                ParsedHeader::Skip(size) => {
                    self.remaining = size;
                    self.padding = (BLOCK as u64 - size % BLOCK as u64) % BLOCK as u64;
                    self.skip_current()?;
                }
            }
        }
    }

    /// Reader over the current entry's content.
    pub fn entry_reader(&mut self) -> EntryReader<'_, R> {
        EntryReader { stream: self }
    }

    /// Read the whole current entry, enforcing a size cap.
    pub fn read_entry_to_vec(&mut self, cap: u64) -> Result<Vec<u8>> {
        if self.remaining > cap {
            return Err(Error::new(
                ErrorKind::Validation,
                format!("entry of {} bytes exceeds the {} byte limit", self.remaining, cap),
            ));
        }
        let mut buf = Vec::with_capacity(self.remaining as usize);
        self.entry_reader().read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Drain the rest of the stream (entries and end marker alike).
    pub fn drain(&mut self) -> Result<()> {
        while self.next_entry()?.is_some() {
            self.skip_current()?;
        }
        // Consume the remainder after the zero block so digest layers below
        // observe every byte, including the archive padding.
        std::io::copy(&mut self.inner, &mut std::io::sink())?;
        Ok(())
    }

    /// Unwrap the underlying reader (for digest finalization below this layer).
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn skip_current(&mut self) -> Result<()> {
        let to_skip = self.remaining + self.padding;
        if to_skip > 0 {
            std::io::copy(
                &mut self.inner.by_ref().take(to_skip),
                &mut std::io::sink(),
            )?;
            self.remaining = 0;
            self.padding = 0;
        }
        Ok(())
    }

    fn read_block(&mut self, block: &mut [u8; BLOCK]) -> Result<bool> {
        let mut filled = 0;
        while filled < BLOCK {
            let n = self.inner.read(&mut block[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(Error::new(
                    ErrorKind::Parse,
                    "truncated tar header block",
                ));
            }
            filled += n;
        }
        Ok(true)
    }
}

/// Limited reader over the current entry of a [`TarStream`].
pub struct EntryReader<'a, R> {
    stream: &'a mut TarStream<R>,
}

impl<R: Read> Read for EntryReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.stream.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.stream.remaining as usize);
        let n = self.stream.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tar entry truncated",
            ));
        }
        self.stream.remaining -= n as u64;
        Ok(n)
    }
}

enum ParsedHeader {
    Entry(TarEntryMeta),
    Skip(u64),
}

fn parse_header(header: &[u8; BLOCK]) -> Result<ParsedHeader> {
    let size = parse_octal(&header[124..136])?;
    let typeflag = header[156];

    match typeflag {
        // Regular file (also pre-POSIX '\0') and directory entries surface;
        // everything else is skipped with its content.
        b'0' | 0 | b'5' => {}
        b'x' | b'g' | b'L' | b'K' => return Ok(ParsedHeader::Skip(size)),
        other => {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("unsupported tar entry type '{}'", other as char),
            ));
        }
    }

    let mut name = field_str(&header[0..100])?;
    // ustar prefix field extends the name.
    if &header[257..262] == b"ustar" {
        let prefix = field_str(&header[345..500])?;
        if !prefix.is_empty() {
            name = format!("{prefix}/{name}");
        }
    }
    if name.is_empty() {
        return Err(Error::new(ErrorKind::Parse, "tar entry with empty name"));
    }

    let is_dir = typeflag == b'5' || name.ends_with('/');
    Ok(ParsedHeader::Entry(TarEntryMeta {
        name: name.trim_end_matches('/').to_string(),
        size,
        is_dir,
    }))
}

fn field_str(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(|s| s.to_string())
        .map_err(|_| Error::new(ErrorKind::Parse, "non-UTF-8 tar entry name"))
}

fn parse_octal(field: &[u8]) -> Result<u64> {
    let text = field
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| *b as char)
        .collect::<String>();
    let trimmed = text.trim_matches([' ', '\0']);
    if trimmed.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(trimmed, 8)
        .map_err(|_| Error::new(ErrorKind::Parse, format!("bad octal field '{trimmed}'")))
}
