//! RAR v2 Huffman decompression: table parsing, the main symbol dispatch
//! loop, and inline "true audio" block decoding.
//!
//! Grounded on `ext/unarr/rar/uncompress-rar.c`'s `rar_parse_codes_v2` and
//! `rar_expand_v2`. Simpler than the v3 path: no PPMd, no filters, and the
//! recent-offset history rotates through a fixed index rather than v3's
//! move-to-front shift.

use crate::bitreader::BitReader;
use crate::error::{Error, FormatError};
use crate::huffman::HuffmanCode;
use crate::lzss::Lzss;
use crate::rarvm::audio::V2AudioState;

const MAINCODE_SIZE: usize = 298;
const OFFSETCODE_SIZE: usize = 48;
const LENGTHCODE_SIZE: usize = 28;
const HUFFMAN_TABLE_SIZE: usize = 4 * 257;

static LENGTH_BASES: [u32; 28] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 32, 40, 48, 56, 64, 80, 96, 112, 128,
    160, 192, 224,
];
static LENGTH_BITS: [u32; 28] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5,
];
static OFFSET_BASES: [u32; 48] = [
    0, 1, 2, 3, 4, 6, 8, 12, 16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536,
    2048, 3072, 4096, 6144, 8192, 12288, 16384, 24576, 32768, 49152, 65536, 98304, 131072, 196608,
    262144, 327680, 393216, 458752, 524288, 589824, 655360, 720896, 786432, 851968, 917504,
    983040,
];
static OFFSET_BITS: [u32; 48] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13, 14, 14, 15, 15, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 16,
];
static SHORT_BASES: [u32; 8] = [0, 4, 8, 16, 32, 64, 128, 192];
static SHORT_BITS: [u32; 8] = [2, 2, 3, 4, 5, 6, 6, 6];

pub struct UncompressorV2 {
    maincode: Option<HuffmanCode>,
    offsetcode: Option<HuffmanCode>,
    lengthcode: Option<HuffmanCode>,
    audiocode: [Option<HuffmanCode>; 4],
    lengthtable: [u8; HUFFMAN_TABLE_SIZE],
    lastoffset: u32,
    lastlength: u32,
    oldoffset: [u32; 4],
    oldoffsetindex: u32,
    audioblock: bool,
    channel: u8,
    numchannels: u8,
    audiostate: [V2AudioState; 4],
    channeldelta: i8,
    pub start_new_table: bool,
}

impl Default for UncompressorV2 {
    fn default() -> Self {
        Self {
            maincode: None,
            offsetcode: None,
            lengthcode: None,
            audiocode: [None, None, None, None],
            lengthtable: [0u8; HUFFMAN_TABLE_SIZE],
            lastoffset: 0,
            lastlength: 0,
            oldoffset: [0; 4],
            oldoffsetindex: 0,
            audioblock: false,
            channel: 0,
            numchannels: 0,
            audiostate: [
                V2AudioState::new(),
                V2AudioState::new(),
                V2AudioState::new(),
                V2AudioState::new(),
            ],
            channeldelta: 0,
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

impl UncompressorV2 {
    /// Parse the next block's Huffman tables, mirroring `rar_parse_codes_v2`.
    pub fn parse_codes(&mut self, br: &mut BitReader) -> Result<(), Error> {
        self.audioblock = br.bit();
        if !br.bit() {
            self.lengthtable = [0u8; HUFFMAN_TABLE_SIZE];
        }

        let count = if self.audioblock {
            self.numchannels = br.bits(2) as u8 + 1;
            if self.channel > self.numchannels {
                self.channel = 0;
            }
            self.numchannels as usize * 257
        } else {
            MAINCODE_SIZE + OFFSETCODE_SIZE + LENGTHCODE_SIZE
        };

        let mut prelengths = [0u8; 19];
        for pl in prelengths.iter_mut() {
            *pl = br.bits(4) as u8;
        }

        let precode = HuffmanCode::create(&prelengths)?;
        let mut i = 0usize;
        while i < count {
            let val = precode.read_next(br)?;
            if val < 16 {
                self.lengthtable[i] = (self.lengthtable[i] as i32 + val) as u8 & 0x0F;
                i += 1;
            } else if val == 16 {
                if i == 0 {
                    return Err(FormatError::BadBitstream("length-table repeat with no prior symbol").into());
                }
                let n = br.bits(2) as usize + 3;
                for _ in 0..n {
                    if i >= count {
                        break;
                    }
                    self.lengthtable[i] = self.lengthtable[i - 1];
                    i += 1;
                }
            } else {
                let n = if val == 17 {
                    br.bits(3) as usize + 3
                } else {
                    br.bits(7) as usize + 11
                };
                for _ in 0..n {
                    if i >= count {
                        break;
                    }
                    self.lengthtable[i] = 0;
                    i += 1;
                }
            }
        }

        if self.audioblock {
            for c in 0..self.numchannels as usize {
                self.audiocode[c] = Some(HuffmanCode::create(
                    &self.lengthtable[c * 257..c * 257 + 257],
                )?);
            }
        } else {
            self.maincode = Some(HuffmanCode::create(&self.lengthtable[..MAINCODE_SIZE])?);
            self.offsetcode = Some(HuffmanCode::create(
                &self.lengthtable[MAINCODE_SIZE..MAINCODE_SIZE + OFFSETCODE_SIZE],
            )?);
            self.lengthcode = Some(HuffmanCode::create(
                &self.lengthtable[MAINCODE_SIZE + OFFSETCODE_SIZE..],
            )?);
        }

        self.start_new_table = false;
        Ok(())
    }

    /// Expand compressed data up to `end`, mirroring `rar_expand_v2`.
    pub fn expand(&mut self, br: &mut BitReader, lzss: &mut Lzss, end: u64) -> Result<u64, Error> {
        loop {
            if lzss.position() >= end {
                return Ok(end);
            }

            if self.audioblock {
                let symbol = read_next_symbol(br, &self.audiocode[self.channel as usize])?;
                if symbol == 256 {
                    self.start_new_table = true;
                    return Ok(lzss.position());
                }
                let byte = self.audiostate[self.channel as usize]
                    .decode(&mut self.channeldelta, symbol as u8 as i8);
                self.channel += 1;
                if self.channel == self.numchannels {
                    self.channel = 0;
                }
                lzss.emit_literal(byte);
                continue;
            }

            let symbol = read_next_symbol(br, &self.maincode)?;
            if symbol < 256 {
                lzss.emit_literal(symbol as u8);
                continue;
            }

            let (offs, len) = if symbol == 256 {
                (self.lastoffset, self.lastlength)
            } else if symbol <= 260 {
                let idx = (symbol - 256) as u32;
                let lensymbol = read_next_symbol(br, &self.lengthcode)?;
                if lensymbol < 0 || lensymbol as usize >= LENGTH_BASES.len() {
                    return Err(FormatError::BadBitstream("invalid length symbol").into());
                }
                let offs = self.oldoffset[((self.oldoffsetindex as i64 - idx as i64) & 0x03) as usize];
                let mut len = LENGTH_BASES[lensymbol as usize] + 2;
                if LENGTH_BITS[lensymbol as usize] > 0 {
                    len += br.bits(LENGTH_BITS[lensymbol as usize]);
                }
                if offs >= 0x40000 {
                    len += 1;
                }
                if offs >= 0x2000 {
                    len += 1;
                }
                if offs >= 0x101 {
                    len += 1;
                }
                (offs, len)
            } else if symbol <= 268 {
                let idx = (symbol - 261) as usize;
                let mut offs = SHORT_BASES[idx] + 1;
                if SHORT_BITS[idx] > 0 {
                    offs += br.bits(SHORT_BITS[idx]);
                }
                (offs, 2)
            } else if symbol == 269 {
                self.start_new_table = true;
                return Ok(lzss.position());
            } else {
                let idx = (symbol - 270) as usize;
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
                    offs += br.bits(OFFSET_BITS[offssymbol]);
                }
                if offs >= 0x40000 {
                    len += 1;
                }
                if offs >= 0x2000 {
                    len += 1;
                }
                (offs, len)
            };

            self.oldoffset[(self.oldoffsetindex & 0x03) as usize] = offs;
            self.oldoffsetindex += 1;
            self.lastoffset = offs;
            self.lastlength = len;
            lzss.emit_match(offs as usize, len as usize);

            if br.at_eof() {
                return Err(FormatError::BadBitstream("unexpected eof during decompression").into());
            }
        }
    }
}
