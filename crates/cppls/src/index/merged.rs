//! The header-context-aware merged index.
//!
//! A header parsed inside many translation units may produce many distinct
//! `FileIndex` snapshots. Each distinct snapshot (keyed by the SHA-256 of
//! its canonical serialization) gets one dense canonical id; every
//! (translation unit, include-chain position) that reached the header
//! records which id was active. Occurrence and relation rows carry a
//! bitmap of the canonical ids they belong to, so storage is shared and
//! "which variant does this buffer match?" is a bitmap test.
//!
//! The index exists in two forms: hydrated in memory for mutation, or as
//! a loaded file buffer answering lookups in place. Mutation hydrates on
//! demand; `serialize` garbage-collects tombstoned ids first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::frontend::{RelationKind, SymbolHash};
use crate::pool::PathId;

use super::binary::{self, ContextEntry, IncludeSite, View};
use super::bitmap::IdSet;
use super::file::{FileIndex, Occurrence, Relation};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HeaderContext {
    version: u32,
    /// `(include-chain position, canonical id)` bindings, in merge order.
    includes: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CompilationContext {
    version: u32,
    canonical: u32,
    /// Milliseconds since the epoch at build time.
    build_at: u64,
    locations: Vec<IncludeSite>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MemIndex {
    max_canonical_id: u32,
    /// FileIndex content hash -> canonical id. Injective; in one-to-one
    /// correspondence with live ids plus tombstoned ids awaiting GC.
    canonical_cache: HashMap<[u8; 32], u32>,
    ref_counts: Vec<u32>,
    /// Ids whose ref count dropped to zero, compacted away on serialize.
    tombstones: IdSet,
    header_contexts: HashMap<u32, HeaderContext>,
    compilation_contexts: HashMap<u32, CompilationContext>,
    occurrences: HashMap<Occurrence, IdSet>,
    relations: HashMap<SymbolHash, HashMap<Relation, IdSet>>,
}

#[derive(Default)]
pub struct MergedIndex {
    buffer: Option<Vec<u8>>,
    mem: Option<MemIndex>,
    /// Sorted by `(range.end, range.begin, target)`; rebuilt lazily.
    occurrence_cache: Option<Vec<Occurrence>>,
}

impl MergedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a persisted index for read-only query. A missing or
    /// unreadable file yields an empty index.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_bytes(bytes),
            Err(_) => Self::default(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if let Err(error) = View::parse(&bytes) {
            tracing::warn!(%error, "discarding malformed index file");
            return Self::default();
        }
        Self { buffer: Some(bytes), mem: None, occurrence_cache: None }
    }

    pub fn is_empty(&self) -> bool {
        match (&self.mem, &self.buffer) {
            (Some(mem), _) => mem.occurrences.is_empty() && mem.relations.is_empty(),
            (None, Some(bytes)) => {
                View::parse(bytes).map(|v| v.occurrence_count() == 0).unwrap_or(true)
            }
            (None, None) => true,
        }
    }

    /// Hydrate the persisted buffer for mutation. No-op when already in
    /// memory.
    pub fn load_in_memory(&mut self) {
        if self.mem.is_some() {
            return;
        }
        let mut mem = MemIndex::default();
        if let Some(bytes) = self.buffer.take() {
            if let Ok(view) = View::parse(&bytes) {
                mem.max_canonical_id = view.max_canonical_id;
                let _ = view.for_each_canonical(|sha, id| {
                    mem.canonical_cache.insert(sha, id);
                });
                mem.ref_counts = view.refcounts().unwrap_or_default();
                mem.ref_counts.resize(mem.max_canonical_id as usize, 0);
                for (id, &count) in mem.ref_counts.iter().enumerate() {
                    if count == 0 {
                        mem.tombstones.add(id as u32);
                    }
                }
                if let Ok(contexts) = view.contexts() {
                    for entry in contexts {
                        match entry {
                            ContextEntry::Header { path_id, version, includes } => {
                                mem.header_contexts
                                    .insert(path_id, HeaderContext { version, includes });
                            }
                            ContextEntry::Compilation {
                                path_id,
                                version,
                                canonical,
                                build_at,
                                locations,
                            } => {
                                mem.compilation_contexts.insert(
                                    path_id,
                                    CompilationContext { version, canonical, build_at, locations },
                                );
                            }
                        }
                    }
                }
                let _ = view.for_each_occurrence(|occurrence, set| {
                    mem.occurrences.insert(occurrence, set);
                });
                let _ = view.for_each_relation(|symbol, relation, set| {
                    mem.relations.entry(symbol).or_default().insert(relation, set);
                });
            }
        }
        self.mem = Some(mem);
        self.occurrence_cache = None;
    }

    fn mem_mut(&mut self) -> &mut MemIndex {
        self.load_in_memory();
        self.occurrence_cache = None;
        self.mem.as_mut().unwrap()
    }

    /// Merge a header's `FileIndex` under one (translation unit,
    /// include-chain position). The caller removes the TU's previous
    /// bindings first when re-indexing.
    pub fn merge(&mut self, tu: PathId, include_position: u32, index: &FileIndex) {
        let mem = self.mem_mut();
        let id = mem.intern_index(index);
        let context = mem.header_contexts.entry(tu.0).or_default();
        context.version += 1;
        context.includes.push((include_position, id));
        // Bindings are kept in chain-position order, which is also the
        // serialized order, so hydrating a persisted index reproduces this
        // state exactly.
        context.includes.sort_unstable();
    }

    /// Merge a source file's own `FileIndex` (the compilation context),
    /// with its include locations and build timestamp.
    pub fn merge_main(
        &mut self,
        tu: PathId,
        build_at: u64,
        locations: Vec<IncludeSite>,
        index: &FileIndex,
    ) {
        let mem = self.mem_mut();
        let version = match mem.compilation_contexts.remove(&tu.0) {
            Some(previous) => {
                mem.release(previous.canonical);
                previous.version + 1
            }
            None => 0,
        };
        let id = mem.intern_index(index);
        mem.compilation_contexts
            .insert(tu.0, CompilationContext { version, canonical: id, build_at, locations });
    }

    /// Drop every binding of one translation unit. Canonical ids whose
    /// ref count reaches zero are tombstoned; their rows are reclaimed on
    /// the next serialize.
    pub fn remove(&mut self, tu: PathId) {
        let mem = self.mem_mut();
        if let Some(context) = mem.header_contexts.remove(&tu.0) {
            for (_, id) in context.includes {
                mem.release(id);
            }
        }
        if let Some(context) = mem.compilation_contexts.remove(&tu.0) {
            mem.release(context.canonical);
        }
    }

    /// All occurrences containing `offset`, ascending `range.end`.
    pub fn lookup_offset(&mut self, offset: u32) -> Vec<Occurrence> {
        if self.mem.is_some() {
            if self.occurrence_cache.is_none() {
                let mem = self.mem.as_ref().unwrap();
                let mut cache: Vec<Occurrence> = mem.occurrences.keys().copied().collect();
                cache.sort_unstable_by_key(|o| (o.range.end, o.range.begin, o.target));
                self.occurrence_cache = Some(cache);
            }
            let cache = self.occurrence_cache.as_ref().unwrap();
            // Rows before the partition point all end at or before the
            // offset; rows after it may still begin past it (nested
            // occurrences), so the tail is filtered, not truncated.
            let start = cache.partition_point(|o| o.range.end <= offset);
            cache[start..].iter().filter(|o| o.range.contains(offset)).copied().collect()
        } else if let Some(bytes) = &self.buffer {
            let mut out = Vec::new();
            if let Ok(view) = View::parse(bytes) {
                view.lookup_offset(offset, |occurrence| {
                    out.push(*occurrence);
                    true
                });
            }
            out
        } else {
            Vec::new()
        }
    }

    /// All relations of `symbol` whose kind intersects `mask`, in
    /// canonical order.
    pub fn lookup_relations(&self, symbol: SymbolHash, mask: RelationKind) -> Vec<Relation> {
        if let Some(mem) = &self.mem {
            let mut out: Vec<Relation> = mem
                .relations
                .get(&symbol)
                .map(|relations| {
                    relations.keys().copied().filter(|r| r.kind.intersects(mask)).collect()
                })
                .unwrap_or_default();
            out.sort_unstable();
            out
        } else if let Some(bytes) = &self.buffer {
            let mut out = Vec::new();
            if let Ok(view) = View::parse(bytes) {
                view.lookup_relations(symbol, mask, |relation| {
                    out.push(*relation);
                    true
                });
            }
            out
        } else {
            Vec::new()
        }
    }

    /// The canonical ids currently live (bound by at least one context).
    pub fn live_canonical_count(&mut self) -> u32 {
        let mem = self.mem_mut();
        mem.max_canonical_id - mem.tombstones.len() as u32
    }

    pub fn ref_count(&mut self, canonical: u32) -> u32 {
        let mem = self.mem_mut();
        mem.ref_counts.get(canonical as usize).copied().unwrap_or(0)
    }

    pub fn tombstone_count(&mut self) -> usize {
        self.mem_mut().tombstones.len()
    }

    /// Whether the on-disk state is stale relative to the files it was
    /// built from. `resolve` maps persisted path ids to live paths.
    pub fn need_update(&mut self, resolve: impl Fn(u32) -> Option<PathBuf>) -> bool {
        self.load_in_memory();
        let mem = self.mem.as_ref().unwrap();
        let Some(context) = mem.compilation_contexts.values().next() else {
            return true;
        };
        let mut checked: Vec<u32> = Vec::new();
        let mut paths: Vec<u32> = context.locations.iter().map(|l| l.path_id).collect();
        paths.extend(mem.compilation_contexts.keys().copied());
        for path_id in paths {
            if checked.contains(&path_id) {
                continue;
            }
            checked.push(path_id);
            let Some(path) = resolve(path_id) else { return true };
            let Ok(metadata) = std::fs::metadata(&path) else { return true };
            let Ok(modified) = metadata.modified() else { return true };
            let millis = modified
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(u64::MAX);
            if millis > context.build_at {
                return true;
            }
        }
        false
    }

    /// Serialize to the persisted container. Tombstoned canonical ids are
    /// compacted away first, so the output only describes live state and
    /// is a pure function of it.
    pub fn serialize(&mut self) -> Vec<u8> {
        if self.mem.is_none() {
            if let Some(bytes) = &self.buffer {
                return bytes.clone();
            }
            return write_binary(&MemIndex::default());
        }
        self.collect_garbage();
        write_binary(self.mem.as_ref().unwrap())
    }

    /// Compact tombstoned ids: renumber the survivors densely, clear dead
    /// bits out of every bitmap, and drop rows that end up with none.
    fn collect_garbage(&mut self) {
        let mem = self.mem_mut();
        if mem.tombstones.is_empty() {
            return;
        }
        let mut map: Vec<Option<u32>> = Vec::with_capacity(mem.max_canonical_id as usize);
        let mut next = 0u32;
        for id in 0..mem.max_canonical_id {
            if mem.tombstones.contains(id) {
                map.push(None);
            } else {
                map.push(Some(next));
                next += 1;
            }
        }

        mem.canonical_cache.retain(|_, id| map[*id as usize].is_some());
        for id in mem.canonical_cache.values_mut() {
            *id = map[*id as usize].unwrap();
        }

        let mut ref_counts = vec![0u32; next as usize];
        for (old, &count) in mem.ref_counts.iter().enumerate() {
            if let Some(new) = map[old] {
                ref_counts[new as usize] = count;
            }
        }
        mem.ref_counts = ref_counts;

        // Bindings only ever reference live ids (a bound id has a positive
        // ref count), so the remaps below cannot fail.
        for context in mem.header_contexts.values_mut() {
            for (_, id) in &mut context.includes {
                *id = map[*id as usize].unwrap();
            }
        }
        for context in mem.compilation_contexts.values_mut() {
            context.canonical = map[context.canonical as usize].unwrap();
        }

        mem.occurrences.retain(|_, set| {
            set.remap(&map);
            !set.is_empty()
        });
        mem.relations.retain(|_, relations| {
            relations.retain(|_, set| {
                set.remap(&map);
                !set.is_empty()
            });
            !relations.is_empty()
        });

        mem.max_canonical_id = next;
        mem.tombstones = IdSet::new();
    }

    /// Semantic equality, independent of representation. Hydrates both
    /// sides.
    pub fn equivalent(&mut self, other: &mut MergedIndex) -> bool {
        self.load_in_memory();
        other.load_in_memory();
        self.mem == other.mem
    }
}

impl MemIndex {
    /// Deduplicate a `FileIndex` snapshot into a canonical id, seeding its
    /// rows on first sight.
    fn intern_index(&mut self, index: &FileIndex) -> u32 {
        let hash = index.content_hash();
        if let Some(&id) = self.canonical_cache.get(&hash) {
            self.ref_counts[id as usize] += 1;
            self.tombstones.remove(id);
            return id;
        }
        let id = self.max_canonical_id;
        self.max_canonical_id += 1;
        self.canonical_cache.insert(hash, id);
        self.ref_counts.push(1);
        for occurrence in &index.occurrences {
            self.occurrences.entry(*occurrence).or_default().add(id);
        }
        for (symbol, relations) in &index.relations {
            let target = self.relations.entry(*symbol).or_default();
            for relation in relations {
                target.entry(*relation).or_default().add(id);
            }
        }
        id
    }

    fn release(&mut self, id: u32) {
        let count = &mut self.ref_counts[id as usize];
        debug_assert!(*count > 0, "ref count underflow for canonical id {id}");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.tombstones.add(id);
        }
    }
}

/// Emit the container described in [`binary`].
fn write_binary(mem: &MemIndex) -> Vec<u8> {
    // Canonical cache rows, sorted by id.
    let mut canonical: Vec<([u8; 32], u32)> =
        mem.canonical_cache.iter().map(|(sha, id)| (*sha, *id)).collect();
    canonical.sort_by_key(|(_, id)| *id);
    let mut canon_bytes = Vec::with_capacity(4 + canonical.len() * 36);
    canon_bytes.extend_from_slice(&(canonical.len() as u32).to_le_bytes());
    for (sha, id) in &canonical {
        canon_bytes.extend_from_slice(sha);
        canon_bytes.extend_from_slice(&id.to_le_bytes());
    }

    // Context entries, sorted by path id; header contexts sort their
    // bindings by chain position so merge order does not leak.
    let mut context_keys: Vec<(u32, bool)> = mem
        .header_contexts
        .keys()
        .map(|&path| (path, false))
        .chain(mem.compilation_contexts.keys().map(|&path| (path, true)))
        .collect();
    context_keys.sort();
    let mut context_bytes = Vec::new();
    context_bytes.extend_from_slice(&(context_keys.len() as u32).to_le_bytes());
    for (path_id, is_compilation) in context_keys {
        context_bytes.extend_from_slice(&path_id.to_le_bytes());
        if is_compilation {
            let context = &mem.compilation_contexts[&path_id];
            context_bytes.push(1);
            context_bytes.extend_from_slice(&context.version.to_le_bytes());
            context_bytes.extend_from_slice(&context.canonical.to_le_bytes());
            context_bytes.extend_from_slice(&context.build_at.to_le_bytes());
            context_bytes.extend_from_slice(&(context.locations.len() as u32).to_le_bytes());
            for location in &context.locations {
                context_bytes.extend_from_slice(&location.line.to_le_bytes());
                context_bytes.extend_from_slice(&location.parent.to_le_bytes());
                context_bytes.extend_from_slice(&location.path_id.to_le_bytes());
            }
        } else {
            let context = &mem.header_contexts[&path_id];
            context_bytes.push(0);
            context_bytes.extend_from_slice(&context.version.to_le_bytes());
            let includes = context.includes.clone();
            context_bytes.extend_from_slice(&(includes.len() as u32).to_le_bytes());
            for (position, id) in includes {
                context_bytes.extend_from_slice(&position.to_le_bytes());
                context_bytes.extend_from_slice(&id.to_le_bytes());
            }
        }
    }

    // Occurrence and relation rows with blob-relative bitmap offsets,
    // patched to absolute once the layout is known.
    let mut bitmap_blob: Vec<u8> = Vec::new();
    let mut write_bitmap = |set: &IdSet, blob: &mut Vec<u8>| -> (u32, u32) {
        let offset = blob.len() as u32;
        set.write(blob);
        (offset, blob.len() as u32 - offset)
    };

    let mut occurrences: Vec<(&Occurrence, &IdSet)> = mem.occurrences.iter().collect();
    occurrences.sort_by_key(|(o, _)| (o.range.end, o.range.begin, o.target));
    let occ_rows: Vec<(Occurrence, u32, u32)> = occurrences
        .into_iter()
        .map(|(occurrence, set)| {
            let (offset, len) = write_bitmap(set, &mut bitmap_blob);
            (*occurrence, offset, len)
        })
        .collect();

    let mut symbols: Vec<&SymbolHash> = mem.relations.keys().collect();
    symbols.sort();
    let mut rel_rows: Vec<(SymbolHash, Vec<(Relation, u32, u32)>)> = Vec::new();
    for &symbol in symbols {
        let relations = &mem.relations[&symbol];
        let mut sorted: Vec<&Relation> = relations.keys().collect();
        sorted.sort();
        let entries = sorted
            .into_iter()
            .map(|relation| {
                let (offset, len) = write_bitmap(&relations[relation], &mut bitmap_blob);
                (*relation, offset, len)
            })
            .collect();
        rel_rows.push((symbol, entries));
    }

    let mut refcount_bytes = Vec::with_capacity(4 + mem.ref_counts.len() * 4);
    refcount_bytes.extend_from_slice(&(mem.ref_counts.len() as u32).to_le_bytes());
    for count in &mem.ref_counts {
        refcount_bytes.extend_from_slice(&count.to_le_bytes());
    }

    // Layout.
    const SECTION_COUNT: usize = 6;
    let header_len = 16 + SECTION_COUNT * 20;
    let canon_off = header_len;
    let contexts_off = canon_off + canon_bytes.len();
    let occ_len = 4 + occ_rows.len() * binary::OCCURRENCE_STRIDE;
    let occ_off = contexts_off + context_bytes.len();
    let entry_total: usize = rel_rows.iter().map(|(_, entries)| entries.len()).sum();
    let rel_index_len = 4 + rel_rows.len() * binary::RELATION_INDEX_STRIDE;
    let rel_len = rel_index_len + entry_total * binary::RELATION_ENTRY_STRIDE;
    let rel_off = occ_off + occ_len;
    let bitmaps_off = rel_off + rel_len;
    let refcounts_off = bitmaps_off + bitmap_blob.len();
    let total = refcounts_off + refcount_bytes.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(binary::MAGIC);
    out.extend_from_slice(&binary::VERSION.to_le_bytes());
    out.extend_from_slice(&(SECTION_COUNT as u32).to_le_bytes());
    out.extend_from_slice(&mem.max_canonical_id.to_le_bytes());
    let mut section = |tag: u32, offset: usize, len: usize, out: &mut Vec<u8>| {
        out.extend_from_slice(&tag.to_le_bytes());
        out.extend_from_slice(&(offset as u64).to_le_bytes());
        out.extend_from_slice(&(len as u64).to_le_bytes());
    };
    section(binary::TAG_CANON, canon_off, canon_bytes.len(), &mut out);
    section(binary::TAG_CONTEXTS, contexts_off, context_bytes.len(), &mut out);
    section(binary::TAG_OCCURRENCES, occ_off, occ_len, &mut out);
    section(binary::TAG_RELATIONS, rel_off, rel_len, &mut out);
    section(binary::TAG_BITMAPS, bitmaps_off, bitmap_blob.len(), &mut out);
    section(binary::TAG_REFCOUNTS, refcounts_off, refcount_bytes.len(), &mut out);

    out.extend_from_slice(&canon_bytes);
    out.extend_from_slice(&context_bytes);

    out.extend_from_slice(&(occ_rows.len() as u32).to_le_bytes());
    for (occurrence, bmp_rel, bmp_len) in &occ_rows {
        out.extend_from_slice(&occurrence.range.begin.to_le_bytes());
        out.extend_from_slice(&occurrence.range.end.to_le_bytes());
        out.extend_from_slice(&occurrence.target.to_le_bytes());
        out.extend_from_slice(&(bitmaps_off as u32 + bmp_rel).to_le_bytes());
        out.extend_from_slice(&bmp_len.to_le_bytes());
    }

    out.extend_from_slice(&(rel_rows.len() as u32).to_le_bytes());
    let entries_start = rel_off + rel_index_len;
    let mut entry_cursor = entries_start;
    for (symbol, entries) in &rel_rows {
        out.extend_from_slice(&symbol.to_le_bytes());
        out.extend_from_slice(&(entry_cursor as u32).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        entry_cursor += entries.len() * binary::RELATION_ENTRY_STRIDE;
    }
    for (_, entries) in &rel_rows {
        for (relation, bmp_rel, bmp_len) in entries {
            super::file::write_relation(relation, &mut out);
            out.extend_from_slice(&(bitmaps_off as u32 + bmp_rel).to_le_bytes());
            out.extend_from_slice(&bmp_len.to_le_bytes());
        }
    }

    out.extend_from_slice(&bitmap_blob);
    out.extend_from_slice(&refcount_bytes);

    debug_assert_eq!(out.len(), total);
    out
}
