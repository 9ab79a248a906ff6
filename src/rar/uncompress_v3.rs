//! RAR v3 Huffman/PPMd decompression: table parsing and the main symbol
//! dispatch loop.
//!
//! Grounded on `ext/unarr/rar/uncompress-rar.c`'s `rar_parse_codes`,
//! `rar_read_filter`, `rar_handle_ppmd_sequence`, and `rar_expand`.

use crate::bitreader::BitReader;
use crate::error::{Error, FormatError};
use crate::huffman::HuffmanCode;
use crate::lzss::Lzss;
use crate::rarvm::FilterQueue;

use super::ppmd::{PpmdModel, RangeState};

const MAINCODE_SIZE: usize = 299;
const OFFSETCODE_SIZE: usize = 60;
const LOWOFFSETCODE_SIZE: usize = 17;
const LENGTHCODE_SIZE: usize = 28;
const HUFFMAN_TABLE_SIZE: usize = MAINCODE_SIZE + OFFSETCODE_SIZE + LOWOFFSETCODE_SIZE + LENGTHCODE_SIZE;

static LENGTH_BASES: [u32; 28] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112, 128,
    160, 192, 224,
];
static LENGTH_BITS: [u32; 28] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5,
];
static OFFSET_BASES: [u32; 60] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536,
    2048, 3072, 4096, 6144, 8192, 12288, 16384, 24576, 32768, 49152, 65536, 98304, 131072, 196608,
    262144, 327680, 393216, 458752, 524288, 589824, 655360, 720896, 786432, 851968, 917504,
    983040, 1048576, 1310720, 1572864, 1835008, 2097152, 2359296, 2621440, 2883584, 3145728,
    3407872, 3670016, 3932160,
];
static OFFSET_BITS: [u32; 60] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13, 14, 14, 15, 15, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 18, 18, 18, 18,
    18, 18, 18, 18, 18, 18, 18, 18,
];
static SHORT_BASES: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 192];
static SHORT_BITS: [u32; 8] = [2, 2, 3, 4, 5, 6, 6, 6];

/// Per-solid-group v3 decompression state, carried across entries the way
/// `struct ar_archive_rar_uncomp_v3` is.
pub struct UncompressorV3 {
    maincode: Option<HuffmanCode>,
    offsetcode: Option<HuffmanCode>,
    lowoffsetcode: Option<HuffmanCode>,
    lengthcode: Option<HuffmanCode>,
    lengthtable: [u8; HUFFMAN_TABLE_SIZE],
    lastlength: u32,
    lastoffset: u32,
    oldoffset: [u32; 4],
    lastlowoffset: u32,
    numlowoffsetrepeats: u32,
    is_ppmd_block: bool,
    ppmd_escape: u8,
    ppmd_model: Option<PpmdModel>,
    range_state: Option<RangeState>,
    pending_range_reset: bool,
    pub start_new_table: bool,
}

impl Default for UncompressorV3 {
    fn default() -> Self {
        Self {
            maincode: None,
            offsetcode: None,
            lowoffsetcode: None,
            lengthcode: None,
            lengthtable: [0u8; HUFFMAN_TABLE_SIZE],
            lastlength: 0,
            lastoffset: 0,
            oldoffset: [0; 4],
            lastlowoffset: 0,
            numlowoffsetrepeats: 0,
            is_ppmd_block: false,
            ppmd_escape: 2,
            ppmd_model: None,
            range_state: None,
            pending_range_reset: false,
            start_new_table: true,
        }
    }
}

fn read_next_symbol(br: &mut BitReader, code: &Option<HuffmanCode>) -> Result<i32, Error> {
    let code = code
        .as_ref()
        .ok_or(FormatError::BadBitstream("huffman table not yet parsed"))?;
    Ok(code.read_next(br)?)
}

impl UncompressorV3 {
    /// Parse the next Huffman table (or PPMd block header), mirroring
    /// `rar_parse_codes`.
    pub fn parse_codes(&mut self, br: &mut BitReader) -> Result<(), Error> {
        br.align_to_byte();

        self.is_ppmd_block = br.bit();
        if self.is_ppmd_block {
            // This crate's PPMd model (`crate::rar::ppmd::PpmdModel`) is a
            // simplified order-1 approximation, not a bit-exact Ppmd7
            // context tree, and would silently hand back wrong bytes for
            // any real PPMd-compressed solid block. Refusing outright is
            // preferable to a silent-corruption "success" (see that
            // module's doc comment).
            return Err(Error::method_not_supported("RAR v3 PPMd"));
        } else {
            let mut bitlengths = [0u8; 20];
            if !br.bit() {
                self.lengthtable = [0u8; HUFFMAN_TABLE_SIZE];
            }
            let mut i = 0usize;
            while i < bitlengths.len() {
                bitlengths[i] = br.bits(4) as u8;
                if bitlengths[i] == 0x0F {
                    let zerocount = br.bits(4) as usize;
                    if zerocount > 0 {
                        let mut j = 0;
                        while j < zerocount + 2 && i < bitlengths.len() {
                            bitlengths[i] = 0;
                            i += 1;
                            j += 1;
                        }
                        i -= 1;
                    }
                }
                i += 1;
            }

            let precode = HuffmanCode::create(&bitlengths)?;
            let mut i = 0usize;
            while i < HUFFMAN_TABLE_SIZE {
                let val = precode.read_next(br)?;
                if val < 16 {
                    self.lengthtable[i] = (self.lengthtable[i] as i32 + val) as u8 & 0x0F;
                    i += 1;
                } else if val < 18 {
                    if i == 0 {
                        return Err(
                            FormatError::BadBitstream("length-table repeat with no prior symbol").into(),
                        );
                    }
                    let n = if val == 16 {
                        br.bits(3) as usize + 3
                    } else {
                        br.bits(7) as usize + 11
                    };
                    for _ in 0..n {
                        if i >= HUFFMAN_TABLE_SIZE {
                            break;
                        }
                        self.lengthtable[i] = self.lengthtable[i - 1];
                        i += 1;
                    }
                } else {
                    let n = if val == 18 {
                        br.bits(3) as usize + 3
                    } else {
                        br.bits(7) as usize + 11
                    };
                    for _ in 0..n {
                        if i >= HUFFMAN_TABLE_SIZE {
                            break;
                        }
                        self.lengthtable[i] = 0;
                        i += 1;
                    }
                }
            }

            self.maincode = Some(HuffmanCode::create(&self.lengthtable[..MAINCODE_SIZE])?);
            self.offsetcode = Some(HuffmanCode::create(
                &self.lengthtable[MAINCODE_SIZE..MAINCODE_SIZE + OFFSETCODE_SIZE],
            )?);
            self.lowoffsetcode = Some(HuffmanCode::create(
                &self.lengthtable[MAINCODE_SIZE + OFFSETCODE_SIZE
                    ..MAINCODE_SIZE + OFFSETCODE_SIZE + LOWOFFSETCODE_SIZE],
            )?);
            self.lengthcode = Some(HuffmanCode::create(
                &self.lengthtable[MAINCODE_SIZE + OFFSETCODE_SIZE + LOWOFFSETCODE_SIZE..],
            )?);
        }

        self.start_new_table = false;
        Ok(())
    }

    fn ppmd_byte(&mut self, br: &mut BitReader) -> Result<u8, Error> {
        if self.pending_range_reset {
            self.range_state = Some(RangeState::init(br));
            self.pending_range_reset = false;
        }
        let mut state = self.range_state.take().expect("range state initialized");
        let result = self
            .ppmd_model
            .as_mut()
            .expect("ppmd model allocated before use")
            .decode_symbol(&mut state, br);
        self.range_state = Some(state);
        result
    }

    /// Run the PPMd-escape-sequence dispatch: decode one PPMd symbol and act
    /// on RAR's escape protocol, mirroring `rar_handle_ppmd_sequence`.
    fn handle_ppmd_sequence(
        &mut self,
        br: &mut BitReader,
        lzss: &mut Lzss,
        filters: &mut FilterQueue,
        end: &mut u64,
    ) -> Result<bool, Error> {
        let sym = self.ppmd_byte(br)?;
        if sym != self.ppmd_escape {
            lzss.emit_literal(sym);
            return Ok(true);
        }

        let code = self.ppmd_byte(br)?;
        match code {
            0 => {
                // A nested table-change escape inside a PPMd block; table
                // data itself is Huffman-coded, read from the bit reader
                // directly rather than through the PPMd model.
                self.parse_codes(br)?;
                Ok(true)
            }
            2 => {
                self.start_new_table = true;
                Ok(true)
            }
            3 => {
                let lzss_pos = lzss.position();
                let flags = self.ppmd_byte(br)?;
                let mut length = (flags & 0x07) as u16 + 1;
                if length == 7 {
                    length = self.ppmd_byte(br)? as u16 + 7;
                } else if length == 8 {
                    let hi = self.ppmd_byte(br)? as u16;
                    let lo = self.ppmd_byte(br)? as u16;
                    length = (hi << 8) | lo;
                }
                let mut bytecode = Vec::with_capacity(length as usize);
                for _ in 0..length {
                    bytecode.push(self.ppmd_byte(br)?);
                }
                filters.parse_filter(&bytecode, flags, lzss_pos)?;
                if let Some(start) = filters.filter_start() {
                    if start < *end {
                        *end = start;
                    }
                }
                Ok(true)
            }
            4 => {
                let b2 = self.ppmd_byte(br)? as u32;
                let b1 = self.ppmd_byte(br)? as u32;
                let b0 = self.ppmd_byte(br)? as u32;
                let lzss_offset = (b2 << 16) | (b1 << 8) | b0;
                let length = self.ppmd_byte(br)? as usize;
                lzss.emit_match(lzss_offset as usize + 2, length + 32);
                Ok(true)
            }
            5 => {
                let length = self.ppmd_byte(br)? as usize;
                lzss.emit_match(1, length + 4);
                Ok(true)
            }
            _ => {
                lzss.emit_literal(sym);
                Ok(true)
            }
        }
    }

    /// Expand compressed data up to `end` (an absolute `Lzss` position),
    /// mirroring `rar_expand`. Returns the position actually reached; this
    /// equals `end` unless a filter trigger, table-change escape, or EOF
    /// was hit first, in which case it returns the (smaller) position where
    /// the caller must pause to act. `self.start_new_table` signals which
    /// of those happened.
    pub fn expand(
        &mut self,
        br: &mut BitReader,
        lzss: &mut Lzss,
        filters: &mut FilterQueue,
        mut end: u64,
    ) -> Result<u64, Error> {
        loop {
            if lzss.position() >= end {
                return Ok(end);
            }

            if self.is_ppmd_block {
                let cont = self.handle_ppmd_sequence(br, lzss, filters, &mut end)?;
                if !cont || self.start_new_table {
                    return Ok(lzss.position());
                }
                continue;
            }

            let symbol = read_next_symbol(br, &self.maincode)?;
            if symbol < 256 {
                lzss.emit_literal(symbol as u8);
                continue;
            }
            if symbol == 256 {
                if !br.bit() {
                    self.start_new_table = br.bit();
                    return Ok(lzss.position());
                }
                self.parse_codes(br)?;
                continue;
            }
            if symbol == 257 {
                let flags = br.bits(8) as u8;
                let mut length = (flags & 0x07) as u16 + 1;
                if length == 7 {
                    length = br.bits(8) as u16 + 7;
                } else if length == 8 {
                    length = (br.bits(8) as u16) << 8 | br.bits(8) as u16;
                }
                let mut code = Vec::with_capacity(length as usize);
                for _ in 0..length {
                    code.push(br.bits(8) as u8);
                }
                filters.parse_filter(&code, flags, lzss.position())?;
                if let Some(start) = filters.filter_start() {
                    if start < end {
                        end = start;
                    }
                }
                continue;
            }

            let (offs, len) = if symbol == 258 {
                if self.lastlength == 0 {
                    continue;
                }
                (self.lastoffset, self.lastlength)
            } else if symbol <= 262 {
                let idx = (symbol - 259) as usize;
                let lensymbol = read_next_symbol(br, &self.lengthcode)?;
                if lensymbol < 0 || lensymbol as usize >= LENGTH_BASES.len() {
                    return Err(FormatError::BadBitstream("invalid length symbol").into());
                }
                let offs = self.oldoffset[idx];
                let mut len = LENGTH_BASES[lensymbol as usize] + 2;
                if LENGTH_BITS[lensymbol as usize] > 0 {
                    len += br.bits(LENGTH_BITS[lensymbol as usize]);
                }
                for i in (1..=idx).rev() {
                    self.oldoffset[i] = self.oldoffset[i - 1];
                }
                self.oldoffset[0] = offs;
                (offs, len)
            } else if symbol <= 270 {
                let idx = (symbol - 263) as usize;
                let mut offs = SHORT_BASES[idx] + 1;
                if SHORT_BITS[idx] > 0 {
                    offs += br.bits(SHORT_BITS[idx]);
                }
                for i in (1..=3).rev() {
                    self.oldoffset[i] = self.oldoffset[i - 1];
                }
                self.oldoffset[0] = offs;
                (offs, 2)
            } else {
                let idx = (symbol - 271) as usize;
                if idx >= LENGTH_BASES.len() {
                    return Err(FormatError::BadBitstream("invalid length symbol").into());
                }
                let mut len = LENGTH_BASES[idx] + 3;
                if LENGTH_BITS[idx] > 0 {
                    len += br.bits(LENGTH_BITS[idx]);
                }
                let offssymbol = read_next_symbol(br, &self.offsetcode)?;
                if offssymbol < 0 || offssymbol as usize >= OFFSET_BASES.len() {
                    return Err(FormatError::BadBitstream("invalid offset symbol").into());
                }
                let offssymbol = offssymbol as usize;
                let mut offs = OFFSET_BASES[offssymbol] + 1;
                if OFFSET_BITS[offssymbol] > 0 {
                    if offssymbol > 9 {
                        if OFFSET_BITS[offssymbol] > 4 {
                            offs += br.bits(OFFSET_BITS[offssymbol] - 4) << 4;
                        }
                        if self.numlowoffsetrepeats > 0 {
                            self.numlowoffsetrepeats -= 1;
                            offs += self.lastlowoffset;
                        } else {
                            let lowoffsetsymbol = read_next_symbol(br, &self.lowoffsetcode)?;
                            if lowoffsetsymbol == 16 {
                                self.numlowoffsetrepeats = 15;
                                offs += self.lastlowoffset;
                            } else {
                                offs += lowoffsetsymbol as u32;
                                self.lastlowoffset = lowoffsetsymbol as u32;
                            }
                        }
                    } else {
                        offs += br.bits(OFFSET_BITS[offssymbol]);
                    }
                }
                if offs >= 0x40000 {
                    len += 1;
                }
                if offs >= 0x2000 {
                    len += 1;
                }
                for i in (1..=3).rev() {
                    self.oldoffset[i] = self.oldoffset[i - 1];
                }
                self.oldoffset[0] = offs;
                (offs, len)
            };

            self.lastoffset = offs;
            self.lastlength = len;
            lzss.emit_match(offs as usize, len as usize);

            if br.at_eof() {
                return Err(FormatError::BadBitstream("unexpected eof during decompression").into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnsupportedError;
    use crate::stream::MemoryStream;

    /// A solid block whose table-parse bit marks it as PPMd-coded must be
    /// refused outright rather than decoded through the simplified model
    /// (see `crate::rar::ppmd`'s module doc): this is the one real code
    /// path that can set `is_ppmd_block`, so exercising it here is the
    /// closest thing to an end-to-end PPMd fixture this crate can assert on
    /// without a bit-exact `Ppmd7` model to decode one.
    #[test]
    fn ppmd_block_is_refused_not_silently_decoded() {
        // First bit set (is_ppmd_block), rest is irrelevant padding: parsing
        // must fail before any of it is interpreted as a PPMd header.
        let mut bytes = vec![0xFFu8; 8];
        let mut mem = MemoryStream::new(&mut bytes);
        let mut br = BitReader::new(&mut mem, bytes.len() as u64);

        let mut uncomp = UncompressorV3::default();
        let err = uncomp.parse_codes(&mut br).unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported(UnsupportedError::MethodNotSupported(_))
        ));
    }
}
