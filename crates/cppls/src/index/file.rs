//! Per-file index records.
//!
//! A `FileIndex` is the unit of deduplication for the merged index: two
//! builds of the same file under the same preprocessor context must
//! produce byte-identical canonical serializations, so everything here is
//! strictly ordered and the canonical encoding is fixed-width
//! little-endian with no map iteration order leaking through.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::frontend::{LocalSourceRange, RelationKind, SymbolHash};

/// One textual appearance of a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Occurrence {
    pub range: LocalSourceRange,
    pub target: SymbolHash,
}

/// Extra payload of a relation: definitions carry the full declaration
/// range, symbol-to-symbol edges carry the target symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationAux {
    None,
    Range(LocalSourceRange),
    Target(SymbolHash),
}

/// A semantic edge attached to a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Relation {
    pub kind: RelationKind,
    pub range: LocalSourceRange,
    pub aux: RelationAux,
}

impl Relation {
    pub fn declaration(name_range: LocalSourceRange, decl_range: LocalSourceRange) -> Self {
        Self {
            kind: RelationKind::DECLARATION,
            range: name_range,
            aux: RelationAux::Range(decl_range),
        }
    }

    pub fn definition(name_range: LocalSourceRange, decl_range: LocalSourceRange) -> Self {
        Self {
            kind: RelationKind::DEFINITION,
            range: name_range,
            aux: RelationAux::Range(decl_range),
        }
    }

    pub fn reference(range: LocalSourceRange, weak: bool) -> Self {
        Self {
            kind: if weak { RelationKind::WEAK_REFERENCE } else { RelationKind::REFERENCE },
            range,
            aux: RelationAux::None,
        }
    }

    pub fn edge(kind: RelationKind, range: LocalSourceRange, target: SymbolHash) -> Self {
        Self { kind, range, aux: RelationAux::Target(target) }
    }

    /// The target symbol, for edges that carry one.
    pub fn target(&self) -> Option<SymbolHash> {
        match self.aux {
            RelationAux::Target(hash) => Some(hash),
            _ => None,
        }
    }
}

/// All occurrences and relations of one file under one preprocessor
/// context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileIndex {
    /// Strictly ascending by `(range.begin, range.end, target)`, unique.
    pub occurrences: Vec<Occurrence>,
    /// Per symbol, strictly ascending and unique.
    pub relations: BTreeMap<SymbolHash, Vec<Relation>>,
}

impl FileIndex {
    pub fn add_occurrence(&mut self, range: LocalSourceRange, target: SymbolHash) {
        self.occurrences.push(Occurrence { range, target });
    }

    pub fn add_relation(&mut self, symbol: SymbolHash, relation: Relation) {
        self.relations.entry(symbol).or_default().push(relation);
    }

    /// Establish the ordering invariants: sort and dedupe occurrences and
    /// every relation list. Idempotent.
    pub fn finish(&mut self) {
        self.occurrences.sort_unstable();
        self.occurrences.dedup();
        for relations in self.relations.values_mut() {
            relations.sort_unstable();
            relations.dedup();
        }
        self.relations.retain(|_, relations| !relations.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty() && self.relations.is_empty()
    }

    /// All occurrences containing `offset`, in ascending `(begin, end)`
    /// order (occurrences at one offset nest, so this is also ascending
    /// `end` for the common case of identical begins).
    pub fn lookup(&self, offset: u32) -> impl Iterator<Item = &Occurrence> {
        self.occurrences.iter().filter(move |o| o.range.contains(offset))
    }

    /// The canonical serialized form: what the merged index hashes to
    /// decide whether two header contexts are the same.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.occurrences.len() * 16);
        out.extend_from_slice(&(self.occurrences.len() as u32).to_le_bytes());
        for occurrence in &self.occurrences {
            write_occurrence(occurrence, &mut out);
        }
        out.extend_from_slice(&(self.relations.len() as u32).to_le_bytes());
        for (symbol, relations) in &self.relations {
            out.extend_from_slice(&symbol.to_le_bytes());
            out.extend_from_slice(&(relations.len() as u32).to_le_bytes());
            for relation in relations {
                write_relation(relation, &mut out);
            }
        }
        out
    }

    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_bytes());
        hasher.finalize().into()
    }
}

fn write_occurrence(occurrence: &Occurrence, out: &mut Vec<u8>) {
    out.extend_from_slice(&occurrence.range.begin.to_le_bytes());
    out.extend_from_slice(&occurrence.range.end.to_le_bytes());
    out.extend_from_slice(&occurrence.target.to_le_bytes());
}

pub(crate) const AUX_NONE: u8 = 0;
pub(crate) const AUX_RANGE: u8 = 1;
pub(crate) const AUX_TARGET: u8 = 2;

pub(crate) fn write_relation(relation: &Relation, out: &mut Vec<u8>) {
    out.extend_from_slice(&relation.kind.value().to_le_bytes());
    let (tag, aux): (u8, u64) = match relation.aux {
        RelationAux::None => (AUX_NONE, 0),
        RelationAux::Range(range) => {
            (AUX_RANGE, u64::from(range.begin) | (u64::from(range.end) << 32))
        }
        RelationAux::Target(hash) => (AUX_TARGET, hash),
    };
    out.push(tag);
    out.push(0);
    out.extend_from_slice(&relation.range.begin.to_le_bytes());
    out.extend_from_slice(&relation.range.end.to_le_bytes());
    out.extend_from_slice(&aux.to_le_bytes());
}

pub(crate) fn read_relation(bytes: &[u8]) -> Option<Relation> {
    if bytes.len() < 20 {
        return None;
    }
    let kind = RelationKind::from_value(u16::from_le_bytes(bytes[0..2].try_into().unwrap()));
    let tag = bytes[2];
    let begin = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    let end = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let aux_raw = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
    let aux = match tag {
        AUX_NONE => RelationAux::None,
        AUX_RANGE => RelationAux::Range(LocalSourceRange::new(
            (aux_raw & 0xffff_ffff) as u32,
            (aux_raw >> 32) as u32,
        )),
        AUX_TARGET => RelationAux::Target(aux_raw),
        _ => return None,
    };
    Some(Relation { kind, range: LocalSourceRange::new(begin, end), aux })
}

/// Serialized size of one relation row.
pub(crate) const RELATION_BYTES: usize = 20;

#[cfg(test)]
mod tests {
    use super::*;

    fn range(begin: u32, end: u32) -> LocalSourceRange {
        LocalSourceRange::new(begin, end)
    }

    #[test]
    fn finish_sorts_and_dedupes() {
        let mut index = FileIndex::default();
        index.add_occurrence(range(10, 12), 7);
        index.add_occurrence(range(4, 5), 7);
        index.add_occurrence(range(10, 12), 7);
        index.add_occurrence(range(10, 11), 3);
        index.finish();

        let keys: Vec<_> =
            index.occurrences.iter().map(|o| (o.range.begin, o.range.end, o.target)).collect();
        assert_eq!(keys, [(4, 5, 7), (10, 11, 3), (10, 12, 7)]);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn relations_are_unique_per_symbol() {
        let mut index = FileIndex::default();
        index.add_relation(7, Relation::reference(range(1, 2), false));
        index.add_relation(7, Relation::reference(range(1, 2), false));
        index.add_relation(7, Relation::declaration(range(1, 2), range(0, 9)));
        index.finish();
        assert_eq!(index.relations[&7].len(), 2);
    }

    #[test]
    fn canonical_bytes_ignore_insertion_order() {
        let mut forward = FileIndex::default();
        forward.add_occurrence(range(3, 4), 1);
        forward.add_occurrence(range(9, 10), 2);
        forward.add_relation(1, Relation::definition(range(3, 4), range(0, 20)));
        forward.add_relation(2, Relation::reference(range(9, 10), false));
        forward.finish();

        let mut backward = FileIndex::default();
        backward.add_relation(2, Relation::reference(range(9, 10), false));
        backward.add_relation(1, Relation::definition(range(3, 4), range(0, 20)));
        backward.add_occurrence(range(9, 10), 2);
        backward.add_occurrence(range(3, 4), 1);
        backward.finish();

        assert_eq!(forward, backward);
        assert_eq!(forward.canonical_bytes(), backward.canonical_bytes());
        assert_eq!(forward.content_hash(), backward.content_hash());
    }

    #[test]
    fn hash_distinguishes_different_contents() {
        let mut a = FileIndex::default();
        a.add_occurrence(range(0, 1), 1);
        a.finish();
        let mut b = FileIndex::default();
        b.add_occurrence(range(0, 1), 2);
        b.finish();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn relation_rows_round_trip() {
        for relation in [
            Relation::reference(range(5, 9), true),
            Relation::definition(range(5, 9), range(0, 44)),
            Relation::edge(RelationKind::CALLER, range(5, 9), 0xdead_beef),
            Relation::edge(RelationKind::BASE, range(0, 0), 42),
        ] {
            let mut bytes = Vec::new();
            write_relation(&relation, &mut bytes);
            assert_eq!(bytes.len(), RELATION_BYTES);
            assert_eq!(read_relation(&bytes), Some(relation));
        }
    }

    #[test]
    fn lookup_respects_half_open_ranges() {
        let mut index = FileIndex::default();
        index.add_occurrence(range(4, 7), 1);
        index.finish();
        assert_eq!(index.lookup(4).count(), 1);
        assert_eq!(index.lookup(6).count(), 1);
        assert_eq!(index.lookup(7).count(), 0);
    }
}
