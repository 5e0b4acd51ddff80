//! The persisted index container.
//!
//! Layout (all integers little-endian, all offsets from file start):
//!
//! ```text
//! "CPIX" | version u32 | section_count u32 | max_canonical_id u32
//! section table: { tag u32, offset u64, len u64 } * section_count
//! CANON:       count u32, { sha256 [32], canonical_id u32 } *   (sorted by id)
//! CONTEXTS:    count u32, variable entries (see read_contexts)
//! OCCURRENCES: count u32, { begin u32, end u32, target u64,
//!              bmp_off u32, bmp_len u32 } *                     (sorted by end, begin)
//! RELATIONS:   count u32, { symbol u64, entries_off u32, entry_count u32 } *
//!              followed by the entries blob                     (sorted by symbol)
//! BITMAPS:     raw bitmap bytes referenced by bmp_off/bmp_len
//! REFCOUNTS:   count u32, u32 *                                 (indexed by id)
//! ```
//!
//! The reader answers offset and symbol lookups directly from the byte
//! buffer: occurrence rows are fixed stride and sorted by `(end, begin)`,
//! relation index rows are fixed stride and sorted by symbol, so both
//! lookups are binary searches without hydrating anything.

use crate::frontend::{RelationKind, SymbolHash};

use super::bitmap::IdSet;
use super::file::{read_relation, Occurrence, Relation, RELATION_BYTES};

pub const MAGIC: &[u8; 4] = b"CPIX";
pub const VERSION: u32 = 1;

pub const TAG_CANON: u32 = 1;
pub const TAG_CONTEXTS: u32 = 2;
pub const TAG_OCCURRENCES: u32 = 3;
pub const TAG_RELATIONS: u32 = 4;
pub const TAG_BITMAPS: u32 = 5;
pub const TAG_REFCOUNTS: u32 = 6;

pub const OCCURRENCE_STRIDE: usize = 24;
pub const RELATION_INDEX_STRIDE: usize = 16;
pub const RELATION_ENTRY_STRIDE: usize = RELATION_BYTES + 8;

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("not an index file")]
    BadMagic,
    #[error("unsupported index version {0}")]
    BadVersion(u32),
    #[error("truncated index file")]
    Truncated,
    #[error("malformed {0} section")]
    Malformed(&'static str),
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> Result<u32, FormatError> {
    bytes
        .get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or(FormatError::Truncated)
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> Result<u64, FormatError> {
    bytes
        .get(at..at + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or(FormatError::Truncated)
}

/// A parsed section table over a loaded (or mapped) index buffer.
pub struct View<'a> {
    bytes: &'a [u8],
    sections: Vec<(u32, usize, usize)>,
    pub max_canonical_id: u32,
}

impl<'a> View<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FormatError> {
        if bytes.len() < 16 {
            return Err(FormatError::Truncated);
        }
        if &bytes[0..4] != MAGIC {
            return Err(FormatError::BadMagic);
        }
        let version = read_u32(bytes, 4)?;
        if version != VERSION {
            return Err(FormatError::BadVersion(version));
        }
        let section_count = read_u32(bytes, 8)? as usize;
        let max_canonical_id = read_u32(bytes, 12)?;

        let mut sections = Vec::with_capacity(section_count);
        let mut cursor = 16usize;
        for _ in 0..section_count {
            let tag = read_u32(bytes, cursor)?;
            let offset = read_u64(bytes, cursor + 4)? as usize;
            let len = read_u64(bytes, cursor + 12)? as usize;
            if offset.checked_add(len).map_or(true, |end| end > bytes.len()) {
                return Err(FormatError::Truncated);
            }
            sections.push((tag, offset, len));
            cursor += 20;
        }
        Ok(Self { bytes, sections, max_canonical_id })
    }

    pub fn section(&self, tag: u32) -> Option<&'a [u8]> {
        self.sections
            .iter()
            .find(|(t, _, _)| *t == tag)
            .map(|&(_, offset, len)| &self.bytes[offset..offset + len])
    }

    fn bitmap_at(&self, offset: u32, len: u32) -> Option<IdSet> {
        let bytes = self.bytes.get(offset as usize..(offset + len) as usize)?;
        IdSet::read(bytes).map(|(set, _)| set)
    }

    pub fn occurrence_count(&self) -> usize {
        self.section(TAG_OCCURRENCES)
            .and_then(|s| s.get(0..4))
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
            .unwrap_or(0)
    }

    fn occurrence_row(&self, index: usize) -> Option<(Occurrence, u32, u32)> {
        let section = self.section(TAG_OCCURRENCES)?;
        let at = 4 + index * OCCURRENCE_STRIDE;
        let row = section.get(at..at + OCCURRENCE_STRIDE)?;
        let begin = u32::from_le_bytes(row[0..4].try_into().unwrap());
        let end = u32::from_le_bytes(row[4..8].try_into().unwrap());
        let target = u64::from_le_bytes(row[8..16].try_into().unwrap());
        let bmp_off = u32::from_le_bytes(row[16..20].try_into().unwrap());
        let bmp_len = u32::from_le_bytes(row[20..24].try_into().unwrap());
        Some((
            Occurrence {
                range: crate::frontend::LocalSourceRange::new(begin, end),
                target,
            },
            bmp_off,
            bmp_len,
        ))
    }

    /// All occurrences containing `offset`, ascending `range.end`. The
    /// rows are sorted by `(end, begin)`, so the first candidate is found
    /// by binary search on `end > offset` and the scan stops at the first
    /// non-containing row.
    pub fn lookup_offset(&self, offset: u32, mut callback: impl FnMut(&Occurrence) -> bool) {
        let count = self.occurrence_count();
        let mut low = 0usize;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            match self.occurrence_row(mid) {
                Some((occurrence, _, _)) if occurrence.range.end <= offset => low = mid + 1,
                Some(_) => high = mid,
                None => return,
            }
        }
        // Rows past the partition all end after the offset; nested
        // occurrences may still begin past it, so filter rather than stop
        // at the first miss.
        let mut index = low;
        while let Some((occurrence, _, _)) = self.occurrence_row(index) {
            if occurrence.range.contains(offset) && !callback(&occurrence) {
                break;
            }
            index += 1;
        }
    }

    /// The canonical-context set of the occurrence at a row, for callers
    /// that need to know *which* contexts produced it.
    pub fn occurrence_contexts(&self, occurrence: &Occurrence) -> Option<IdSet> {
        let count = self.occurrence_count();
        for index in 0..count {
            let (row, bmp_off, bmp_len) = self.occurrence_row(index)?;
            if row == *occurrence {
                return self.bitmap_at(bmp_off, bmp_len);
            }
        }
        None
    }

    fn relation_index_count(&self) -> usize {
        self.section(TAG_RELATIONS)
            .and_then(|s| s.get(0..4))
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize)
            .unwrap_or(0)
    }

    fn relation_index_row(&self, index: usize) -> Option<(SymbolHash, u32, u32)> {
        let section = self.section(TAG_RELATIONS)?;
        let at = 4 + index * RELATION_INDEX_STRIDE;
        let row = section.get(at..at + RELATION_INDEX_STRIDE)?;
        let symbol = u64::from_le_bytes(row[0..8].try_into().unwrap());
        let entries_off = u32::from_le_bytes(row[8..12].try_into().unwrap());
        let entry_count = u32::from_le_bytes(row[12..16].try_into().unwrap());
        Some((symbol, entries_off, entry_count))
    }

    /// Relations of `symbol` whose kind intersects `mask`.
    pub fn lookup_relations(
        &self,
        symbol: SymbolHash,
        mask: RelationKind,
        mut callback: impl FnMut(&Relation) -> bool,
    ) {
        let count = self.relation_index_count();
        let mut low = 0usize;
        let mut high = count;
        while low < high {
            let mid = (low + high) / 2;
            match self.relation_index_row(mid) {
                Some((s, _, _)) if s < symbol => low = mid + 1,
                Some(_) => high = mid,
                None => return,
            }
        }
        let Some((found, entries_off, entry_count)) = self.relation_index_row(low) else {
            return;
        };
        if found != symbol {
            return;
        }
        // Entry offsets are from file start, like every other offset.
        for entry in 0..entry_count as usize {
            let at = entries_off as usize + entry * RELATION_ENTRY_STRIDE;
            let Some(bytes) = self.bytes.get(at..at + RELATION_ENTRY_STRIDE) else { return };
            let Some(relation) = read_relation(&bytes[..RELATION_BYTES]) else { return };
            if relation.kind.intersects(mask) && !callback(&relation) {
                return;
            }
        }
    }

    /// Iterate every symbol's relation rows with their bitmaps; used for
    /// hydration.
    pub fn for_each_relation(
        &self,
        mut callback: impl FnMut(SymbolHash, Relation, IdSet),
    ) -> Result<(), FormatError> {
        for index in 0..self.relation_index_count() {
            let (symbol, entries_off, entry_count) =
                self.relation_index_row(index).ok_or(FormatError::Malformed("relations"))?;
            for entry in 0..entry_count as usize {
                let at = entries_off as usize + entry * RELATION_ENTRY_STRIDE;
                let bytes = self
                    .bytes
                    .get(at..at + RELATION_ENTRY_STRIDE)
                    .ok_or(FormatError::Malformed("relations"))?;
                let relation = read_relation(&bytes[..RELATION_BYTES])
                    .ok_or(FormatError::Malformed("relations"))?;
                let bmp_off =
                    u32::from_le_bytes(bytes[RELATION_BYTES..RELATION_BYTES + 4].try_into().unwrap());
                let bmp_len = u32::from_le_bytes(
                    bytes[RELATION_BYTES + 4..RELATION_BYTES + 8].try_into().unwrap(),
                );
                let set = self
                    .bitmap_at(bmp_off, bmp_len)
                    .ok_or(FormatError::Malformed("bitmaps"))?;
                callback(symbol, relation, set);
            }
        }
        Ok(())
    }

    /// Iterate every occurrence row with its bitmap; used for hydration.
    pub fn for_each_occurrence(
        &self,
        mut callback: impl FnMut(Occurrence, IdSet),
    ) -> Result<(), FormatError> {
        for index in 0..self.occurrence_count() {
            let (occurrence, bmp_off, bmp_len) =
                self.occurrence_row(index).ok_or(FormatError::Malformed("occurrences"))?;
            let set =
                self.bitmap_at(bmp_off, bmp_len).ok_or(FormatError::Malformed("bitmaps"))?;
            callback(occurrence, set);
        }
        Ok(())
    }

    /// The canonical cache rows `{ sha256, id }`.
    pub fn for_each_canonical(
        &self,
        mut callback: impl FnMut([u8; 32], u32),
    ) -> Result<(), FormatError> {
        let Some(section) = self.section(TAG_CANON) else { return Ok(()) };
        let count = read_u32(section, 0)? as usize;
        for index in 0..count {
            let at = 4 + index * 36;
            let row = section.get(at..at + 36).ok_or(FormatError::Malformed("canonical"))?;
            let mut sha = [0u8; 32];
            sha.copy_from_slice(&row[0..32]);
            let id = u32::from_le_bytes(row[32..36].try_into().unwrap());
            callback(sha, id);
        }
        Ok(())
    }

    pub fn refcounts(&self) -> Result<Vec<u32>, FormatError> {
        let Some(section) = self.section(TAG_REFCOUNTS) else { return Ok(Vec::new()) };
        let count = read_u32(section, 0)? as usize;
        let mut counts = Vec::with_capacity(count);
        for index in 0..count {
            counts.push(read_u32(section, 4 + index * 4)?);
        }
        Ok(counts)
    }

    pub fn contexts(&self) -> Result<Vec<ContextEntry>, FormatError> {
        let Some(section) = self.section(TAG_CONTEXTS) else { return Ok(Vec::new()) };
        let count = read_u32(section, 0)? as usize;
        let mut entries = Vec::with_capacity(count);
        let mut cursor = 4usize;
        for _ in 0..count {
            let path_id = read_u32(section, cursor)?;
            let kind = *section.get(cursor + 4).ok_or(FormatError::Truncated)?;
            let version = read_u32(section, cursor + 5)?;
            cursor += 9;
            match kind {
                0 => {
                    let include_count = read_u32(section, cursor)? as usize;
                    cursor += 4;
                    let mut includes = Vec::with_capacity(include_count);
                    for _ in 0..include_count {
                        let position = read_u32(section, cursor)?;
                        let canonical = read_u32(section, cursor + 4)?;
                        includes.push((position, canonical));
                        cursor += 8;
                    }
                    entries.push(ContextEntry::Header { path_id, version, includes });
                }
                1 => {
                    let canonical = read_u32(section, cursor)?;
                    let build_at = read_u64(section, cursor + 4)?;
                    let location_count = read_u32(section, cursor + 12)? as usize;
                    cursor += 16;
                    let mut locations = Vec::with_capacity(location_count);
                    for _ in 0..location_count {
                        let line = read_u32(section, cursor)?;
                        let parent = read_u32(section, cursor + 4)?;
                        let path = read_u32(section, cursor + 8)?;
                        locations.push(IncludeSite { line, parent, path_id: path });
                        cursor += 12;
                    }
                    entries.push(ContextEntry::Compilation {
                        path_id,
                        version,
                        canonical,
                        build_at,
                        locations,
                    });
                }
                _ => return Err(FormatError::Malformed("contexts")),
            }
        }
        Ok(entries)
    }
}

/// An include location as persisted: global path ids, not unit-local refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeSite {
    pub line: u32,
    /// Index into the owning context's location list; `u32::MAX` for
    /// roots.
    pub parent: u32,
    pub path_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEntry {
    Header {
        path_id: u32,
        version: u32,
        /// `(include-chain position, canonical id)` bindings.
        includes: Vec<(u32, u32)>,
    },
    Compilation {
        path_id: u32,
        version: u32,
        canonical: u32,
        build_at: u64,
        locations: Vec<IncludeSite>,
    },
}
