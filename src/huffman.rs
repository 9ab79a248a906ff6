//! Canonical Huffman decoding shared by the RAR v2/v3 uncompressors.
//!
//! Grounded on `ext/unarr/rar/huffman-rar.c`: a tree of `{branches: [i32;
//! 2]}` nodes (a leaf has `branches[0] == branches[1] == value`; `-1`/`-2`
//! marks an unset branch) plus a fast lookup table for the first
//! `min(maxlen, 10)` bits.

use crate::bitreader::BitReader;
use crate::error::FormatError;

const UNSET_LEFT: i32 = -1;
const UNSET_RIGHT: i32 = -2;

#[derive(Clone, Copy)]
struct Node {
    branches: [i32; 2],
}

#[derive(Clone, Copy)]
struct TableEntry {
    length: u8,
    value: i32,
}

/// A canonical Huffman code, built from a vector of per-symbol code lengths.
pub struct HuffmanCode {
    tree: Vec<Node>,
    min_length: u8,
    max_length: u8,
    table: Vec<TableEntry>,
    table_size: u32,
}

impl HuffmanCode {
    fn new_node(&mut self) -> usize {
        self.tree.push(Node {
            branches: [UNSET_LEFT, UNSET_RIGHT],
        });
        self.tree.len() - 1
    }

    fn add_value(&mut self, value: i32, codebits: u32, length: u8) -> Result<(), FormatError> {
        let mut node = 0usize;
        if self.tree.is_empty() {
            self.new_node();
        }
        for i in (0..length).rev() {
            let is_leaf_bit = self.tree[node].branches[0] >= 0 && self.is_leaf(node);
            if is_leaf_bit {
                // A strictly shorter code is already a leaf along this path:
                // conflicting prefix.
                return Err(FormatError::BadHuffmanTable("prefix conflict"));
            }
            let bit = ((codebits >> i) & 1) as usize;
            if self.tree[node].branches[bit] < 0 {
                let new_idx = self.new_node();
                self.tree[node].branches[bit] = new_idx as i32;
            }
            node = self.tree[node].branches[bit] as usize;
        }
        if self.tree[node].branches[0] >= 0 || self.tree[node].branches[1] >= 0 {
            return Err(FormatError::BadHuffmanTable("duplicate or conflicting code"));
        }
        self.tree[node].branches = [value, value];
        Ok(())
    }

    fn is_leaf(&self, node: usize) -> bool {
        self.tree[node].branches[0] == self.tree[node].branches[1]
    }

    /// Build a canonical code from per-symbol lengths (0 = symbol unused).
    /// Mirrors `rar_create_code`: for each length 1..=15 in turn, symbols
    /// with that length are assigned ascending codes, with a left-shift at
    /// every length boundary.
    pub fn create(lengths: &[u8]) -> Result<Self, FormatError> {
        let max_length = lengths.iter().copied().max().unwrap_or(0);
        let min_length = lengths.iter().copied().filter(|&l| l > 0).min().unwrap_or(0);
        let mut code = Self {
            tree: Vec::new(),
            min_length,
            max_length,
            table: Vec::new(),
            table_size: 0,
        };
        code.new_node();

        let mut codebits: u32 = 0;
        for length in 1..=15u8 {
            for (symbol, &l) in lengths.iter().enumerate() {
                if l == length {
                    code.add_value(symbol as i32, codebits, length)?;
                    codebits += 1;
                }
            }
            codebits <<= 1;
        }

        code.build_table();
        Ok(code)
    }

    fn build_table(&mut self) {
        let table_size = self.max_length.min(10);
        self.table_size = table_size as u32;
        self.table = vec![
            TableEntry {
                length: 0,
                value: -1
            };
            1usize << table_size
        ];
        if self.tree.is_empty() {
            return;
        }
        self.fill_table(0, 0, 0);
    }

    fn fill_table(&mut self, node: usize, prefix: u32, depth: u8) {
        if self.is_leaf(node) && depth > 0 {
            let value = self.tree[node].branches[0];
            let remaining = self.table_size - depth as u32;
            let base = (prefix as usize) << remaining;
            for i in 0..(1usize << remaining) {
                self.table[base + i] = TableEntry {
                    length: depth,
                    value,
                };
            }
            return;
        }
        if depth as u32 == self.table_size {
            // Code longer than the table width: leave a fallback entry
            // pointing back into the tree.
            self.table[prefix as usize] = TableEntry {
                length: (self.table_size + 1) as u8,
                value: node as i32,
            };
            return;
        }
        for bit in 0..2u32 {
            let branch = self.tree[node].branches[bit as usize];
            if branch == UNSET_LEFT || branch == UNSET_RIGHT {
                continue;
            }
            self.fill_table((branch as usize).max(0), (prefix << 1) | bit, depth + 1);
        }
    }

    /// Decode the next symbol from `br`.
    pub fn read_next(&self, br: &mut BitReader) -> Result<i32, FormatError> {
        if self.table.is_empty() {
            return Err(FormatError::BadHuffmanTable("empty code"));
        }
        let peeked = br.peek(self.table_size) as usize;
        let entry = self.table[peeked.min(self.table.len() - 1)];
        if entry.value < 0 && entry.length == 0 {
            return Err(FormatError::BadHuffmanTable("undecodable prefix"));
        }
        if (entry.length as u32) <= self.table_size {
            br.bits(entry.length as u32);
            return Ok(entry.value);
        }
        // Fall through to the tree for codes longer than the fast table.
        let mut node = entry.value as usize;
        br.bits(self.table_size);
        loop {
            if self.is_leaf(node) {
                return Ok(self.tree[node].branches[0]);
            }
            let bit = br.bits(1) as usize;
            let branch = self.tree[node].branches[bit];
            if branch < 0 {
                return Err(FormatError::BadHuffmanTable("undecodable prefix"));
            }
            node = branch as usize;
        }
    }

    /// Minimum non-zero code length used by this table.
    pub fn min_length(&self) -> u8 {
        self.min_length
    }

    /// Maximum code length used by this table.
    pub fn max_length(&self) -> u8 {
        self.max_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn round_trips_simple_code() {
        // Symbol 0 -> length 1 (code `0`), symbol 1 -> length 2 (code `10`),
        // symbol 2 -> length 2 (code `11`).
        let lengths = [1u8, 2, 2];
        let code = HuffmanCode::create(&lengths).unwrap();

        // Encode "0", "10", "11" manually as a bitstream: 0 10 11 = 01011 ->
        // pad to a byte: 01011000
        let byte = 0b0101_1000u8;
        let mut mem = MemoryStream::new(vec![byte]);
        let mut br = BitReader::new(&mut mem, 1);
        assert_eq!(code.read_next(&mut br).unwrap(), 0);
        assert_eq!(code.read_next(&mut br).unwrap(), 1);
        assert_eq!(code.read_next(&mut br).unwrap(), 2);
    }

    #[test]
    fn rejects_duplicate_code() {
        // length vector where two symbols fight over the same codepoint is
        // impossible to construct via create() since it assigns codes
        // canonically; instead exercise add_value conflict detection
        // directly via an artificial 1-bit-length overflow.
        let lengths = vec![1u8; 3]; // 3 symbols claiming length-1 codes: only 2 exist
        assert!(HuffmanCode::create(&lengths).is_err());
    }
}
