//! RAR's PPMd7 range decoder, and a known-incomplete stand-in for the PPMd7
//! context model itself.
//!
//! Grounded on `ext/unarr/rar/uncompress-rar.c`'s `PpmdRAR_RangeDec_Init`,
//! `Range_GetThreshold`, `Range_Decode_RAR`, and `Range_DecodeBit_RAR` — the
//! RAR-specific range coder, which renormalizes differently from the 7z
//! PPMd7 range decoder (a distinct `Low`-vs-`Code` divergence check instead
//! of top-byte comparison). [`RangeState`] is a faithful port of that coder.
//!
//! **Known limitation, not a sanctioned scope cut.** The reference model
//! (`Ppmd7`, from 7-Zip's PPMd var.H, also what `uncompress-rar.c`'s
//! `Ppmd7_*` calls drive) is a full suffix-tree context model with
//! SEE-assisted escape estimation, context promotion across up to 16
//! orders, and its own rescale threshold. [`PpmdModel`] below is NOT that:
//! it's a single-order adaptive frequency table keyed only by the previous
//! byte. It cannot decode real PPMd7/PPMd8 streams produced by
//! WinRAR/7-Zip — it will silently produce wrong bytes rather than erring,
//! since there is no structural way for this model to detect that its
//! prediction diverged from the real one. For that reason neither RAR v3's
//! PPMd sub-blocks nor ZIP method 98 ever invoke `decode_symbol` through the
//! normal decompression path anymore (see `rar::uncompress_v3::parse_codes`
//! and `zip::decompress::backend_for`, both of which now return
//! `Error::Unsupported` for PPMd instead of calling into this module) — a
//! loud, typed refusal instead of a silent-corruption "success". This type
//! is kept only as scaffolding for a real `Ppmd7` port; nothing in this
//! crate currently calls [`PpmdModel::decode_symbol`] outside its own unit
//! tests.
//!
//! [`RangeState`] carries no borrow of the [`BitReader`] it reads from (each
//! method takes it as an explicit argument) so it can be stored directly on
//! the surrounding v3 decompressor state and survive across the repeated
//! `expand` calls that make up one entry's decompression.

use crate::bitreader::BitReader;
use crate::error::Error;

/// RAR's PPMd7 range decoder state: renormalizes on
/// `(Low ^ (Low+Range)) < 1<<24` rather than on a fixed top-byte comparison,
/// with an extra correction branch for when `Range` underflows below
/// `1<<15`. Mirrors `Range_GetThreshold`/`Range_Decode_RAR` exactly.
pub struct RangeState {
    range: u32,
    code: u32,
    low: u32,
}

impl RangeState {
    /// Prime the decoder by reading its four seed bytes, mirroring
    /// `PpmdRAR_RangeDec_Init`. Called once per PPMd block.
    pub fn init(br: &mut BitReader) -> Self {
        let mut code = 0u32;
        for _ in 0..4 {
            code = (code << 8) | br.read_raw_byte().unwrap_or(0xFF) as u32;
        }
        Self {
            range: 0xFFFF_FFFF,
            code,
            low: 0,
        }
    }

    fn get_threshold(&mut self, total: u32) -> u32 {
        self.range /= total;
        self.code / self.range
    }

    fn decode(&mut self, br: &mut BitReader, start: u32, size: u32) {
        self.low = self.low.wrapping_add(start.wrapping_mul(self.range));
        self.code = self.code.wrapping_sub(start.wrapping_mul(self.range));
        self.range = self.range.wrapping_mul(size);
        loop {
            if (self.low ^ self.low.wrapping_add(self.range)) >= (1 << 24) {
                if self.range >= (1 << 15) {
                    break;
                }
                self.range = (0u32.wrapping_sub(self.low)) & ((1 << 15) - 1);
            }
            let byte = br.read_raw_byte().unwrap_or(0xFF);
            self.code = (self.code << 8) | byte as u32;
            self.range <<= 8;
            self.low <<= 8;
        }
    }
}

/// A single context's adaptive symbol frequency table, rescaled once its
/// total crosses a ceiling to keep cumulative frequencies bounded.
struct FreqTable {
    freq: [u16; 256],
    total: u32,
}

impl FreqTable {
    fn new() -> Self {
        Self {
            freq: [1u16; 256],
            total: 256,
        }
    }

    fn update(&mut self, symbol: u8) {
        self.freq[symbol as usize] = self.freq[symbol as usize].saturating_add(32);
        self.total += 32;
        if self.total > 1 << 15 {
            self.total = 0;
            for f in self.freq.iter_mut() {
                *f = (*f >> 1).max(1);
                self.total += *f as u32;
            }
        }
    }
}

/// Adaptive order-1 byte model: one [`FreqTable`] per preceding byte, lazily
/// allocated. Not a real `Ppmd7` context tree — see the module doc for why
/// this is a known limitation rather than a usable PPMd7 decoder.
pub struct PpmdModel {
    contexts: Vec<Option<Box<FreqTable>>>,
    last_byte: u8,
}

impl PpmdModel {
    /// `max_order` is accepted for interface parity with `Ppmd7_Init` but
    /// unused by this simplified model, which is always effectively order-1.
    pub fn new(_max_order: u32) -> Self {
        let mut contexts = Vec::with_capacity(256);
        contexts.resize_with(256, || None);
        Self {
            contexts,
            last_byte: 0,
        }
    }

    /// Decode one symbol, mirroring `Ppmd7_DecodeSymbol`'s return contract
    /// (a byte value, or an error on a corrupt/escape-exhausted stream).
    pub fn decode_symbol(&mut self, state: &mut RangeState, br: &mut BitReader) -> Result<u8, Error> {
        let ctx = self.contexts[self.last_byte as usize].get_or_insert_with(|| Box::new(FreqTable::new()));

        let threshold = state.get_threshold(ctx.total);
        let mut cum = 0u32;
        let mut symbol = 0usize;
        for (i, &f) in ctx.freq.iter().enumerate() {
            let next = cum + f as u32;
            if threshold < next {
                symbol = i;
                break;
            }
            cum = next;
        }
        let size = ctx.freq[symbol] as u32;
        state.decode(br, cum, size);
        ctx.update(symbol as u8);

        self.last_byte = symbol as u8;
        Ok(symbol as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn range_state_inits_from_four_bytes() {
        let mut mem = MemoryStream::new(vec![0x00u8, 0x00, 0x00, 0x00, 0xFF]);
        let mut br = BitReader::new(&mut mem, 5);
        let state = RangeState::init(&mut br);
        assert_eq!(state.code, 0);
        assert_eq!(state.range, 0xFFFF_FFFF);
    }

    #[test]
    fn model_decodes_without_panicking_on_arbitrary_bytes() {
        let bytes: Vec<u8> = (0..64u16).map(|i| (i * 37) as u8).collect();
        let mut mem = MemoryStream::new(bytes);
        let mut br = BitReader::new(&mut mem, 64);
        let mut state = RangeState::init(&mut br);
        let mut model = PpmdModel::new(6);
        for _ in 0..8 {
            let _ = model.decode_symbol(&mut state, &mut br);
        }
    }

    #[test]
    fn freq_table_rescales_without_zero_frequencies() {
        let mut t = FreqTable::new();
        for _ in 0..2000 {
            t.update(5);
        }
        assert!(t.freq.iter().all(|&f| f > 0));
    }
}
