//! Session caches populated by secondary orders and consulted by
//! primary ones.
//!
//! A miss is `None`, never an error: the decoder falls back to asking
//! for full content. Index errors on `put` are protocol violations.

pub mod lru;
pub mod persistent;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

pub use lru::{LruCache, NOT_SET};
pub use persistent::{HashKey, PersistentCache, PersistentEntry, RecordHeader};

use crate::bitmap::{Bitmap, Cursor, Glyph, Palette};
use crate::error::{RdcError, Result};

pub const BITMAP_CACHE_IDS: usize = 3;
pub const BITMAP_CACHE_ENTRIES: usize = 0xa00;
/// Index addressing the single per-id volatile bitmap.
pub const VOLATILE_INDEX: u16 = 0x7fff;

pub const GLYPH_CACHE_IDS: usize = 12;
pub const GLYPH_CACHE_ENTRIES: usize = 256;
pub const TEXT_CACHE_ENTRIES: usize = 256;
pub const CURSOR_CACHE_ENTRIES: usize = 0x20;
pub const BRUSH_CACHE_ENTRIES: usize = 64;
pub const COLOUR_TABLE_ENTRIES: usize = 256;

// ── BitmapCache ──────────────────────────────────────────────────

/// Volatile bitmap cache: one LRU arena per cache id plus the
/// single-slot volatile bitmaps.
#[derive(Debug)]
pub struct BitmapCache {
    ids: Vec<LruCache<Arc<Bitmap>>>,
    volatile: [Option<Arc<Bitmap>>; BITMAP_CACHE_IDS],
}

impl Default for BitmapCache {
    fn default() -> Self {
        Self {
            ids: (0..BITMAP_CACHE_IDS)
                .map(|_| LruCache::new(BITMAP_CACHE_ENTRIES))
                .collect(),
            volatile: Default::default(),
        }
    }
}

impl BitmapCache {
    pub fn get(&mut self, id: u8, idx: u16) -> Option<Arc<Bitmap>> {
        let id = usize::from(id);
        if idx == VOLATILE_INDEX {
            return self.volatile.get(id)?.clone();
        }
        self.ids.get_mut(id)?.get(idx).cloned()
    }

    pub fn put(&mut self, id: u8, idx: u16, bitmap: Arc<Bitmap>) -> Result<()> {
        let i = usize::from(id);
        if idx == VOLATILE_INDEX {
            let slot = self
                .volatile
                .get_mut(i)
                .ok_or(RdcError::malformed("bitmap cache id out of range"))?;
            *slot = Some(bitmap);
            return Ok(());
        }
        self.ids
            .get_mut(i)
            .ok_or(RdcError::malformed("bitmap cache id out of range"))?
            .put(idx, bitmap)?;
        Ok(())
    }

    pub fn rebuild_linked_list(&mut self, id: u8, order: &[u16]) {
        if let Some(c) = self.ids.get_mut(usize::from(id)) {
            c.rebuild_linked_list(order);
        }
    }

    /// Occupied indices of `id`, least recently used first.
    pub fn lru_order(&self, id: u8) -> Vec<u16> {
        self.ids
            .get(usize::from(id))
            .map(|c| c.iter_lru().collect())
            .unwrap_or_default()
    }

    pub fn arena(&self, id: u8) -> Option<&LruCache<Arc<Bitmap>>> {
        self.ids.get(usize::from(id))
    }

    pub fn clear(&mut self) {
        for c in &mut self.ids {
            c.clear();
        }
        self.volatile = Default::default();
    }
}

// ── GlyphCache ───────────────────────────────────────────────────

/// Font glyphs: one LRU arena per font.
#[derive(Debug)]
pub struct GlyphCache {
    fonts: Vec<LruCache<Arc<Glyph>>>,
}

impl Default for GlyphCache {
    fn default() -> Self {
        Self {
            fonts: (0..GLYPH_CACHE_IDS)
                .map(|_| LruCache::new(GLYPH_CACHE_ENTRIES))
                .collect(),
        }
    }
}

impl GlyphCache {
    pub fn get(&mut self, font: u8, character: u16) -> Option<Arc<Glyph>> {
        self.fonts.get_mut(usize::from(font))?.get(character).cloned()
    }

    pub fn put(&mut self, font: u8, character: u16, glyph: Glyph) -> Result<()> {
        self.fonts
            .get_mut(usize::from(font))
            .ok_or(RdcError::malformed("font cache id out of range"))?
            .put(character, Arc::new(glyph))?;
        Ok(())
    }

    pub fn clear(&mut self) {
        for f in &mut self.fonts {
            f.clear();
        }
    }
}

// ── Fixed slot caches ────────────────────────────────────────────

/// A plain array of overwrite-only slots.
#[derive(Debug, Clone)]
pub struct SlotCache<T> {
    slots: Vec<Option<T>>,
    what: &'static str,
}

impl<T> SlotCache<T> {
    pub fn new(capacity: usize, what: &'static str) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, what }
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.slots.get(idx)?.as_ref()
    }

    pub fn put(&mut self, idx: usize, value: T) -> Result<()> {
        let slot = self
            .slots
            .get_mut(idx)
            .ok_or(RdcError::malformed(self.what))?;
        *slot = Some(value);
        Ok(())
    }

    pub fn clear(&mut self) {
        for s in &mut self.slots {
            *s = None;
        }
    }
}

/// Cached glyph-fragment runs, addressed by a one-byte id.
pub type TextCache = SlotCache<Vec<u8>>;

/// Brush pattern data cached by the brush secondary order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrushData {
    /// Bits per pixel of `data`.
    pub bpp: u8,
    pub data: Vec<u8>,
}

/// Brushes, split into monochrome and colour tables.
#[derive(Debug, Clone)]
pub struct BrushCache {
    mono: SlotCache<Arc<BrushData>>,
    colour: SlotCache<Arc<BrushData>>,
}

impl Default for BrushCache {
    fn default() -> Self {
        Self {
            mono: SlotCache::new(BRUSH_CACHE_ENTRIES, "brush cache index out of range"),
            colour: SlotCache::new(BRUSH_CACHE_ENTRIES, "brush cache index out of range"),
        }
    }
}

impl BrushCache {
    pub fn get(&self, bpp: u8, idx: u8) -> Option<Arc<BrushData>> {
        self.table(bpp).get(usize::from(idx)).cloned()
    }

    pub fn put(&mut self, idx: u8, brush: BrushData) -> Result<()> {
        let table = if brush.bpp == 1 {
            &mut self.mono
        } else {
            &mut self.colour
        };
        table.put(usize::from(idx), Arc::new(brush))
    }

    fn table(&self, bpp: u8) -> &SlotCache<Arc<BrushData>> {
        if bpp == 1 { &self.mono } else { &self.colour }
    }

    pub fn clear(&mut self) {
        self.mono.clear();
        self.colour.clear();
    }
}

// ── UseOrder ─────────────────────────────────────────────────────

/// Use order of persistent slots, whether or not the bitmap is
/// resident in the volatile arena.
#[derive(Debug, Default)]
struct UseOrder {
    clock: u32,
    last_use: HashMap<(u8, u16), u32>,
}

impl UseOrder {
    fn touch(&mut self, id: u8, idx: u16) {
        self.clock += 1;
        self.last_use.insert((id, idx), self.clock);
    }

    /// Slots of `id` that have been used, least recent first.
    fn order(&self, id: u8) -> Vec<u16> {
        let mut used: Vec<(u32, u16)> = self
            .last_use
            .iter()
            .filter(|((i, _), _)| *i == id)
            .map(|(&(_, idx), &at)| (at, idx))
            .collect();
        used.sort_unstable();
        used.into_iter().map(|(_, idx)| idx).collect()
    }
}

// ── CacheSet ─────────────────────────────────────────────────────

/// Every cache one session owns.
#[derive(Debug)]
pub struct CacheSet {
    pub bitmaps: BitmapCache,
    pub glyphs: GlyphCache,
    pub text: TextCache,
    pub cursors: SlotCache<Arc<Cursor>>,
    pub brushes: BrushCache,
    pub colour_tables: SlotCache<Arc<Palette>>,
    persistent: Option<PersistentCache>,
    uses: UseOrder,
}

impl Default for CacheSet {
    fn default() -> Self {
        Self {
            bitmaps: BitmapCache::default(),
            glyphs: GlyphCache::default(),
            text: TextCache::new(TEXT_CACHE_ENTRIES, "text cache index out of range"),
            cursors: SlotCache::new(CURSOR_CACHE_ENTRIES, "cursor cache index out of range"),
            brushes: BrushCache::default(),
            colour_tables: SlotCache::new(
                COLOUR_TABLE_ENTRIES,
                "colour table cache index out of range",
            ),
            persistent: None,
            uses: UseOrder::default(),
        }
    }
}

impl CacheSet {
    pub fn with_persistent(persistent: Option<PersistentCache>) -> Self {
        Self {
            persistent,
            ..Self::default()
        }
    }

    pub fn persistent(&self) -> Option<&PersistentCache> {
        self.persistent.as_ref()
    }

    pub fn is_persistent(&self, id: u8) -> bool {
        self.persistent.as_ref().is_some_and(|p| p.is_persistent(id))
    }

    /// Volatile lookup with read-through to the persistent cache.
    pub fn get_bitmap(&mut self, id: u8, idx: u16) -> Option<Arc<Bitmap>> {
        if let Some(bmp) = self.bitmaps.get(id, idx) {
            self.note_use(id, idx);
            return Some(bmp);
        }
        if idx == VOLATILE_INDEX {
            return None;
        }
        let entry = self.load_persistent(id, idx)?;
        let bpp = self.persistent.as_ref()?.bpp();
        let bitmap = Bitmap::new(
            u16::from(entry.header.width),
            u16::from(entry.header.height),
            bpp,
            entry.data,
        )
        .ok()?;
        let bitmap = Arc::new(bitmap);
        self.bitmaps.put(id, idx, Arc::clone(&bitmap)).ok()?;
        self.note_use(id, idx);
        debug!(id, idx, "bitmap loaded from persistent cache");
        Some(bitmap)
    }

    pub fn put_bitmap(&mut self, id: u8, idx: u16, bitmap: Arc<Bitmap>) -> Result<()> {
        self.bitmaps.put(id, idx, bitmap)?;
        self.note_use(id, idx);
        Ok(())
    }

    fn note_use(&mut self, id: u8, idx: u16) {
        if idx != VOLATILE_INDEX && self.is_persistent(id) {
            self.uses.touch(id, idx);
        }
    }

    /// Write-through of a bitmap the peer marked persistent.
    ///
    /// Failures disable persistence for `id`; they never fail the
    /// session.
    pub fn save_persistent(&mut self, id: u8, idx: u16, key: HashKey, bitmap: &Bitmap) {
        let Some(p) = self.persistent.as_mut() else {
            return;
        };
        let (Ok(w), Ok(h)) = (u8::try_from(bitmap.width), u8::try_from(bitmap.height)) else {
            return;
        };
        if let Err(e) = p.save(id, idx, key, w, h, &bitmap.data) {
            warn!(id, idx, "{e}");
            p.disable(id);
        }
    }

    /// Hash keys of `id` to advertise, in slot order.
    ///
    /// Rebuilds the LRU chain so that it matches the stamp order on
    /// disk, and with `precache` loads every stamped record into the
    /// volatile cache. Stamped records start out in the use order in
    /// stamp order, ahead of anything this session touches.
    pub fn enumerate_persistent(&mut self, id: u8, precache: bool) -> Vec<HashKey> {
        let Some(p) = self.persistent.as_mut() else {
            return Vec::new();
        };
        let listed = match p.enumerate(id) {
            Ok(l) => l,
            Err(e) => {
                warn!(id, "{e}");
                p.disable(id);
                return Vec::new();
            }
        };

        if precache {
            for (idx, header) in &listed {
                if header.stamp != 0 {
                    let _ = self.get_bitmap(id, *idx);
                }
            }
        }
        for (idx, header) in &listed {
            if header.stamp != 0 {
                self.uses.touch(id, *idx);
            }
        }
        let order: Vec<u16> = listed.iter().map(|(idx, _)| *idx).collect();
        self.bitmaps.rebuild_linked_list(id, &order);
        listed.into_iter().map(|(_, h)| h.key).collect()
    }

    /// Rewrite persistent stamps in use order, most recent highest, so
    /// the next session's enumeration reflects this session's recency.
    ///
    /// Slots never used keep their stamp of zero.
    pub fn save_state(&mut self) {
        let Some(p) = self.persistent.as_mut() else {
            return;
        };
        let mut stamp = 0u32;
        for id in 0..BITMAP_CACHE_IDS as u8 {
            if !p.is_persistent(id) {
                continue;
            }
            for idx in self.uses.order(id) {
                stamp += 1;
                if let Err(e) = p.touch(id, idx, stamp) {
                    warn!(id, "{e}");
                    p.disable(id);
                    break;
                }
            }
            debug!(id, stamps = stamp, "persistent cache state saved");
        }
        let _ = p.sync();
    }

    /// Forget everything volatile.
    pub fn clear_volatile(&mut self) {
        self.bitmaps.clear();
        self.glyphs.clear();
        self.text.clear();
        self.cursors.clear();
        self.brushes.clear();
        self.colour_tables.clear();
    }

    fn load_persistent(&mut self, id: u8, idx: u16) -> Option<PersistentEntry> {
        let p = self.persistent.as_mut()?;
        match p.load(id, idx) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(id, idx, "{e}");
                p.disable(id);
                None
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn bmp(fill: u8) -> Arc<Bitmap> {
        Arc::new(Bitmap::new(2, 2, 1, vec![fill; 4]).unwrap())
    }

    #[test]
    fn volatile_index_is_a_separate_slot() {
        let mut c = BitmapCache::default();
        c.put(1, VOLATILE_INDEX, bmp(7)).unwrap();
        assert_eq!(c.get(1, VOLATILE_INDEX).unwrap().data, vec![7; 4]);
        assert!(c.get(1, 0).is_none());
        assert!(c.lru_order(1).is_empty());
        assert!(c.put(3, 0, bmp(1)).is_err());
        assert!(c.get(3, 0).is_none());
    }

    #[test]
    fn text_and_glyph_slots() {
        let mut set = CacheSet::default();
        set.text.put(255, vec![1, 2, 3]).unwrap();
        assert_eq!(set.text.get(255).map(Vec::as_slice), Some(&[1u8, 2, 3][..]));
        assert!(set.text.put(256, vec![]).is_err());

        let glyph = Glyph {
            offset: 0,
            baseline: 0,
            width: 8,
            height: 1,
            data: vec![0xff],
        };
        set.glyphs.put(11, 65, glyph.clone()).unwrap();
        assert_eq!(*set.glyphs.get(11, 65).unwrap(), glyph);
        assert!(set.glyphs.put(12, 65, glyph).is_err());
        assert!(set.glyphs.get(0, 65).is_none());
    }

    #[test]
    fn brushes_split_by_depth() {
        let mut b = BrushCache::default();
        b.put(3, BrushData { bpp: 1, data: vec![0xaa; 8] }).unwrap();
        b.put(3, BrushData { bpp: 8, data: vec![1; 64] }).unwrap();
        assert_eq!(b.get(1, 3).unwrap().data.len(), 8);
        assert_eq!(b.get(8, 3).unwrap().data.len(), 64);
        assert!(b.get(1, 4).is_none());
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("rdc-set-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn saved_state_puts_the_last_used_bitmap_last() {
        let dir = temp_dir("recency");
        let mut pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        for (idx, key) in [(0u16, 0xaa), (1, 0xbb), (2, 0xcc)] {
            pc.save(2, idx, [key; 8], 2, 2, &[key; 4]).unwrap();
            pc.touch(2, idx, u32::from(idx + 1) * 10).unwrap();
        }
        drop(pc);

        let pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        let mut set = CacheSet::with_persistent(Some(pc));
        let keys = set.enumerate_persistent(2, false);
        assert_eq!(keys, vec![[0xaa; 8], [0xbb; 8], [0xcc; 8]]);
        // only the oldest record is ever drawn; it is read from disk
        assert_eq!(set.get_bitmap(2, 0).unwrap().data, vec![0xaa; 4]);
        set.save_state();
        drop(set);

        let pc = PersistentCache::open(&dir, 1, &[2]).unwrap();
        let mut set = CacheSet::with_persistent(Some(pc));
        let keys = set.enumerate_persistent(2, false);
        assert_eq!(keys, vec![[0xbb; 8], [0xcc; 8], [0xaa; 8]]);

        drop(set);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn clear_volatile_drops_everything() {
        let mut set = CacheSet::default();
        set.put_bitmap(0, 1, bmp(1)).unwrap();
        set.text.put(0, vec![1]).unwrap();
        set.clear_volatile();
        assert!(set.get_bitmap(0, 1).is_none());
        assert!(set.text.get(0).is_none());
    }
}
