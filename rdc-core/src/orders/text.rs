//! Expansion of a text2 order's glyph string.
//!
//! The string mixes glyph indices with fragment commands: `0xff id len`
//! stores the preceding `len` bytes as text fragment `id`, and
//! `0xfe id [delta]` replays a stored fragment.

use tracing::debug;

use crate::cache::CacheSet;
use crate::presenter::PlacedGlyph;

pub const TEXT2_VERTICAL: u8 = 0x04;
pub const TEXT2_IMPLICIT_X: u8 = 0x20;

const ADD_FRAGMENT: u8 = 0xff;
const USE_FRAGMENT: u8 = 0xfe;

/// Pen position and output of one run.
struct Layout {
    font: u8,
    flags: u8,
    x: i16,
    y: i16,
    glyphs: Vec<PlacedGlyph>,
}

impl Layout {
    fn advance(&mut self, by: i16) {
        if self.flags & TEXT2_VERTICAL != 0 {
            self.y = self.y.wrapping_add(by);
        } else {
            self.x = self.x.wrapping_add(by);
        }
    }

    /// Place the glyph at `text[idx]`, returning the index of the last
    /// byte it consumed.
    fn place(&mut self, caches: &mut CacheSet, text: &[u8], mut idx: usize) -> usize {
        let glyph = caches.glyphs.get(self.font, u16::from(text[idx]));
        if self.flags & TEXT2_IMPLICIT_X == 0 {
            idx += 1;
            match text.get(idx) {
                Some(&offset) if offset & 0x80 != 0 => {
                    let lo = text.get(idx + 1).copied().unwrap_or(0);
                    let hi = text.get(idx + 2).copied().unwrap_or(0);
                    self.advance(i16::from_le_bytes([lo, hi]));
                    idx += 2;
                }
                Some(&offset) => self.advance(i16::from(offset)),
                None => {}
            }
        }
        match glyph {
            Some(glyph) => {
                let width = glyph.width as i16;
                self.glyphs.push(PlacedGlyph {
                    x: self.x.wrapping_add(glyph.offset),
                    y: self.y.wrapping_add(glyph.baseline),
                    glyph,
                });
                if self.flags & TEXT2_IMPLICIT_X != 0 {
                    self.x = self.x.wrapping_add(width);
                }
            }
            None => debug!(font = self.font, ch = text[idx.min(text.len() - 1)], "glyph miss"),
        }
        idx
    }

    fn run(&mut self, caches: &mut CacheSet, text: &[u8]) {
        let mut i = 0;
        while i < text.len() {
            i = self.place(caches, text, i) + 1;
        }
    }
}

/// Lay out `text` starting at `(x, y)`, updating the text fragment
/// cache as the commands direct.
pub fn expand(
    caches: &mut CacheSet,
    font: u8,
    flags: u8,
    x: i16,
    y: i16,
    text: &[u8],
) -> Vec<PlacedGlyph> {
    let mut layout = Layout {
        font,
        flags,
        x,
        y,
        glyphs: Vec::new(),
    };
    let mut text = text;
    let mut i = 0;

    while i < text.len() {
        match text[i] {
            ADD_FRAGMENT => {
                if i + 3 > text.len() {
                    debug!("truncated add-fragment command");
                    break;
                }
                let id = usize::from(text[i + 1]);
                let len = usize::from(text[i + 2]).min(i);
                let _ = caches.text.put(id, text[..len].to_vec());
                text = &text[i + 3..];
                i = 0;
            }
            USE_FRAGMENT => {
                if i + 2 > text.len() {
                    debug!("truncated use-fragment command");
                    break;
                }
                let fragment = caches.text.get(usize::from(text[i + 1])).cloned();
                if let Some(fragment) = fragment {
                    if fragment.get(1) == Some(&0)
                        && flags & TEXT2_IMPLICIT_X == 0
                        && i + 2 < text.len()
                    {
                        layout.advance(i16::from(text[i + 2]));
                    }
                    layout.run(caches, &fragment);
                }
                let consumed = if i + 2 < text.len() { i + 3 } else { i + 2 };
                text = &text[consumed..];
                i = 0;
            }
            _ => {
                i = layout.place(caches, text, i) + 1;
            }
        }
    }
    layout.glyphs
}
