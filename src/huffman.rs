//! The Huffman model: frequency accumulation, tree construction, code
//! generation, the bit-level decoder, and the tree wire codec.
//!
//! Symbols are `u32` throughout: a byte value in binary mode, a Unicode
//! scalar value in UTF-8 mode. See [`crate::format`] for the linear wire
//! encoding of trees.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::convert::TryFrom;
use std::io::Cursor;

use bitstream_io::{BigEndian, BitReader, BitWriter};
use smallvec::SmallVec;

use crate::bits::{BitPacker, BitString};
use crate::errors::ArchiveError;
use crate::format::Codec;

pub(crate) type Symbol = u32;

/// A per-symbol prefix code, most significant bit first.
///
/// Code length is bounded well below 128 bits: with `u64` frequencies, a
/// depth-`d` leaf needs a total count on the order of the `d`th Fibonacci
/// number, so `d < 93`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Code {
    bits: u128,
    len: u8,
}

impl Code {
    /// The code of the sole symbol in a degenerate single-leaf tree.
    pub const ONE: Code = Code { bits: 1, len: 1 };

    fn empty() -> Self {
        Code { bits: 0, len: 0 }
    }

    fn extend(self, bit: bool) -> Self {
        Code {
            bits: (self.bits << 1) | bit as u128,
            len: self.len + 1,
        }
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    fn bit(&self, i: u8) -> bool {
        (self.bits >> (self.len - 1 - i)) & 1 == 1
    }

    pub fn pack_into(&self, packer: &mut BitPacker) {
        for i in 0..self.len() {
            packer.push_bit(self.bit(i));
        }
    }
}

/// Symbol frequency accumulator. First-seen order is kept so that
/// equal-frequency symbols enter the build queue FIFO and tree
/// construction stays deterministic.
#[derive(Debug, Default)]
pub(crate) struct FreqTable {
    counts: HashMap<Symbol, u64>,
    order: Vec<Symbol>,
}

impl FreqTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sym: Symbol) {
        let count = self.counts.entry(sym).or_insert(0);
        if *count == 0 {
            self.order.push(sym);
        }
        *count += 1;
    }

    pub fn add_all(&mut self, syms: &[Symbol]) {
        for &sym in syms {
            self.add(sym);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Leaf or internal node in the flat tree array; children index the
/// array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeNode {
    Node { left: usize, right: usize },
    Leaf(Symbol),
}

/// Pointer tree used only while building; flattened before use.
enum BuildNode {
    Leaf(Symbol),
    Node(Box<BuildNode>, Box<BuildNode>),
}

impl BuildNode {
    fn flatten(&self, arr: &mut Vec<TreeNode>) -> usize {
        match self {
            Self::Leaf(sym) => {
                arr.push(TreeNode::Leaf(*sym));
                arr.len() - 1
            }
            Self::Node(left, right) => {
                let left = left.flatten(arr);
                let right = right.flatten(arr);
                arr.push(TreeNode::Node { left, right });
                arr.len() - 1
            }
        }
    }
}

struct Queued {
    freq: u64,
    seq: u64,
    node: BuildNode,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse to pop the lowest frequency,
        // oldest insertion first
        (self.freq, self.seq).cmp(&(other.freq, other.seq)).reverse()
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        (self.freq, self.seq) == (other.freq, other.seq)
    }
}

impl Eq for Queued {}

/// An array-backed Huffman coding tree. Entries are in post-order, so
/// the root is the last element; decoding walks from the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HuffmanTree {
    entries: Vec<TreeNode>,
}

impl HuffmanTree {
    /// Build the coding tree for `freqs`. A table with exactly one
    /// symbol yields a single-leaf tree whose code is the single bit `1`.
    pub fn build(freqs: &FreqTable) -> Result<Self, ArchiveError> {
        if freqs.is_empty() {
            return Err(ArchiveError::Malformed("empty frequency table"));
        }

        let mut seq = 0u64;
        let mut heap: BinaryHeap<Queued> = freqs
            .order
            .iter()
            .map(|&sym| {
                let q = Queued {
                    freq: freqs.counts[&sym],
                    seq,
                    node: BuildNode::Leaf(sym),
                };
                seq += 1;
                q
            })
            .collect();

        while heap.len() > 1 {
            let left = heap.pop().expect("heap len checked");
            let right = heap.pop().expect("heap len checked");
            heap.push(Queued {
                freq: left.freq + right.freq,
                seq,
                node: BuildNode::Node(Box::new(left.node), Box::new(right.node)),
            });
            seq += 1;
        }

        let root = heap.pop().expect("heap holds the root").node;
        let mut entries = Vec::with_capacity(2 * freqs.order.len());
        root.flatten(&mut entries);
        Ok(Self { entries })
    }

    fn root(&self) -> usize {
        self.entries.len() - 1
    }

    /// The code table for this tree: `0` on left descent, `1` on right.
    pub fn codes(&self) -> HashMap<Symbol, Code> {
        let mut map = HashMap::new();
        if let TreeNode::Leaf(sym) = self.entries[self.root()] {
            map.insert(sym, Code::ONE);
            return map;
        }
        self.collect_codes(self.root(), Code::empty(), &mut map);
        map
    }

    fn collect_codes(&self, idx: usize, prefix: Code, map: &mut HashMap<Symbol, Code>) {
        match self.entries[idx] {
            TreeNode::Leaf(sym) => {
                map.insert(sym, prefix);
            }
            TreeNode::Node { left, right } => {
                self.collect_codes(left, prefix.extend(false), map);
                self.collect_codes(right, prefix.extend(true), map);
            }
        }
    }

    /// Decode `bits`, walking the tree bit-by-bit and restarting at the
    /// root on every leaf.
    ///
    /// `tail` is `None` while more payload is expected: everything
    /// decodable is decoded and the unconsumed trailing bits (a partial
    /// code) come back for the caller to extend. `tail` is `Some(pad)`
    /// for the final chunk, whose last byte is the pad-count byte itself:
    /// the trailing `8 + pad` bits are dropped before decoding.
    pub fn decode(
        &self,
        bits: &BitString,
        tail: Option<u8>,
    ) -> Result<(Vec<Symbol>, BitString), ArchiveError> {
        let limit = match tail {
            Some(pad) => bits
                .len()
                .checked_sub(8 + pad as usize)
                .ok_or(ArchiveError::Malformed("payload shorter than its padding"))?,
            None => bits.len(),
        };

        let mut out = Vec::new();
        let mut residual = BitString::new();

        if let TreeNode::Leaf(sym) = self.entries[self.root()] {
            // degenerate single-symbol tree: one bit per occurrence
            out.resize(limit, sym);
            return Ok((out, residual));
        }

        let mut idx = self.root();
        for i in 0..limit {
            let bit = bits.bit(i);
            residual.push_bit(bit);
            idx = match self.entries[idx] {
                TreeNode::Node { left, right } => {
                    if bit {
                        right
                    } else {
                        left
                    }
                }
                TreeNode::Leaf(_) => unreachable!("walk restarts at the root after a leaf"),
            };
            if let TreeNode::Leaf(sym) = self.entries[idx] {
                out.push(sym);
                residual.clear();
                idx = self.root();
            }
        }

        Ok((out, residual))
    }

    /// Serialize to the linear wire form described in [`crate::format`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut wtr = BitWriter::endian(Vec::new(), BigEndian);
        for entry in &self.entries {
            match entry {
                TreeNode::Leaf(sym) => {
                    wtr.write_bit(false)?;
                    wtr.write(32, *sym)?;
                }
                TreeNode::Node { .. } => wtr.write_bit(true)?,
            }
        }
        // terminator: a combine bit with fewer than two subtrees pending
        wtr.write_bit(true)?;
        wtr.byte_align()?;
        Ok(wtr.into_writer())
    }

    /// Rebuild a tree from its wire form.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ArchiveError> {
        let truncated = |_| ArchiveError::Malformed("truncated huffman tree");
        let mut rdr = BitReader::endian(Cursor::new(raw), BigEndian);
        let mut entries: Vec<TreeNode> = Vec::new();
        let mut pending: Vec<usize> = Vec::new();

        loop {
            let next = entries.len();
            if rdr.read_bit().map_err(truncated)? {
                if pending.len() < 2 {
                    break;
                }
                let right = pending.pop().expect("len checked");
                let left = pending.pop().expect("len checked");
                entries.push(TreeNode::Node { left, right });
            } else {
                let sym: Symbol = rdr.read(32).map_err(truncated)?;
                entries.push(TreeNode::Leaf(sym));
            }
            pending.push(next);
        }

        if entries.is_empty() || pending.len() != 1 {
            return Err(ArchiveError::Malformed("unbalanced huffman tree"));
        }
        Ok(Self { entries })
    }
}

/// Turns byte chunks into symbols for the active codec, carrying UTF-8
/// sequences that straddle chunk boundaries.
#[derive(Debug)]
pub(crate) struct SymbolBuffer {
    codec: Codec,
    carry: SmallVec<[u8; 4]>,
}

impl SymbolBuffer {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            carry: SmallVec::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Symbol>) -> Result<(), ArchiveError> {
        match self.codec {
            Codec::Binary => {
                out.extend(chunk.iter().map(|&b| Symbol::from(b)));
                Ok(())
            }
            Codec::Utf8 => {
                let joined;
                let data: &[u8] = if self.carry.is_empty() {
                    chunk
                } else {
                    joined = [&self.carry[..], chunk].concat();
                    &joined
                };
                let bad = ArchiveError::Malformed("input is not valid UTF-8");
                match std::str::from_utf8(data) {
                    Ok(text) => {
                        out.extend(text.chars().map(|c| c as Symbol));
                        self.carry.clear();
                        Ok(())
                    }
                    Err(err) => {
                        let (valid, rest) = data.split_at(err.valid_up_to());
                        if err.error_len().is_some() {
                            return Err(bad);
                        }
                        let text = std::str::from_utf8(valid).map_err(|_| bad)?;
                        out.extend(text.chars().map(|c| c as Symbol));
                        self.carry.clear();
                        self.carry.extend_from_slice(rest);
                        Ok(())
                    }
                }
            }
        }
    }

    pub fn finish(&self) -> Result<(), ArchiveError> {
        if self.carry.is_empty() {
            Ok(())
        } else {
            Err(ArchiveError::Malformed(
                "input ends inside a UTF-8 sequence",
            ))
        }
    }
}

/// Re-encode decoded symbols as bytes for hashing and output.
pub(crate) fn symbols_to_bytes(
    codec: Codec,
    syms: &[Symbol],
    out: &mut Vec<u8>,
) -> Result<(), ArchiveError> {
    match codec {
        Codec::Binary => {
            for &sym in syms {
                let byte = u8::try_from(sym)
                    .map_err(|_| ArchiveError::Malformed("byte symbol out of range"))?;
                out.push(byte);
            }
        }
        Codec::Utf8 => {
            let mut utf8 = [0u8; 4];
            for &sym in syms {
                let c = char::from_u32(sym)
                    .ok_or(ArchiveError::Malformed("invalid unicode scalar in tree"))?;
                out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
    Ok(())
}
