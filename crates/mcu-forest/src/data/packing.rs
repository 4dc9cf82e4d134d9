//! Bit-packed value storage.
//!
//! Values are packed LSB-first at a fixed width of 1..=8 bits. A value may
//! straddle two bytes when the width does not divide 8. The same layout is
//! used in memory and in the sample-store file.

/// Minimum number of bits able to represent `value` (at least 1).
#[inline]
pub fn bits_required(value: u32) -> u8 {
    if value == 0 {
        1
    } else {
        (32 - value.leading_zeros()) as u8
    }
}

/// Bits used per stored label, by label count: ≤2→1, ≤4→2, ≤16→4, else 8.
#[inline]
pub fn label_bits_for(num_labels: usize) -> u8 {
    match num_labels {
        0..=2 => 1,
        3..=4 => 2,
        5..=16 => 4,
        _ => 8,
    }
}

/// Bytes needed for `count` values of `bits` each.
#[inline]
pub fn packed_len(count: usize, bits: u8) -> usize {
    (count * bits as usize).div_ceil(8)
}

/// Read the `index`-th `bits`-wide value from a packed buffer.
///
/// Out-of-range reads return 0.
#[inline]
pub fn read_packed(buf: &[u8], index: usize, bits: u8) -> u8 {
    let bit_pos = index * bits as usize;
    let byte = bit_pos / 8;
    let shift = bit_pos % 8;
    let mask: u16 = (1u16 << bits) - 1;

    let lo = buf.get(byte).copied().unwrap_or(0) as u16;
    let word = if shift + bits as usize > 8 {
        lo | ((buf.get(byte + 1).copied().unwrap_or(0) as u16) << 8)
    } else {
        lo
    };
    ((word >> shift) & mask) as u8
}

/// Write the `index`-th `bits`-wide value. Bits above the width are dropped.
#[inline]
pub fn write_packed(buf: &mut [u8], index: usize, bits: u8, value: u8) {
    let bit_pos = index * bits as usize;
    let byte = bit_pos / 8;
    let shift = bit_pos % 8;
    let mask: u16 = (1u16 << bits) - 1;
    let v = (value as u16) & mask;

    if byte >= buf.len() {
        return;
    }
    let lo_mask = (mask << shift) as u8;
    buf[byte] = (buf[byte] & !lo_mask) | ((v << shift) as u8);

    if shift + bits as usize > 8 && byte + 1 < buf.len() {
        let hi_mask = (mask >> (8 - shift)) as u8;
        buf[byte + 1] = (buf[byte + 1] & !hi_mask) | ((v >> (8 - shift)) as u8);
    }
}

/// Pack a slice of values into a fresh buffer.
pub fn pack(values: &[u8], bits: u8) -> Vec<u8> {
    let mut buf = vec![0u8; packed_len(values.len(), bits)];
    for (i, &v) in values.iter().enumerate() {
        write_packed(&mut buf, i, bits, v);
    }
    buf
}

// ============================================================================
// PackedArray
// ============================================================================

/// Growable array of fixed-width values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedArray {
    bits: u8,
    len: usize,
    data: Vec<u8>,
}

impl PackedArray {
    /// Empty array of `bits`-wide values. `bits` is clamped to 1..=8.
    pub fn new(bits: u8) -> Self {
        Self {
            bits: bits.clamp(1, 8),
            len: 0,
            data: Vec::new(),
        }
    }

    /// Empty array with room for `capacity` values.
    pub fn with_capacity(bits: u8, capacity: usize) -> Self {
        let bits = bits.clamp(1, 8);
        Self {
            bits,
            len: 0,
            data: Vec::with_capacity(packed_len(capacity, bits)),
        }
    }

    #[inline]
    pub fn bits(&self) -> u8 {
        self.bits
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Largest storable value.
    #[inline]
    pub fn max_value(&self) -> u8 {
        ((1u16 << self.bits) - 1) as u8
    }

    /// Value at `index`, or 0 when out of range.
    #[inline]
    pub fn get(&self, index: usize) -> u8 {
        if index >= self.len {
            return 0;
        }
        read_packed(&self.data, index, self.bits)
    }

    /// Overwrite the value at `index`. Returns `false` when out of range.
    #[inline]
    pub fn set(&mut self, index: usize, value: u8) -> bool {
        if index >= self.len {
            return false;
        }
        write_packed(&mut self.data, index, self.bits, value);
        true
    }

    pub fn push(&mut self, value: u8) {
        self.resize(self.len + 1);
        let last = self.len - 1;
        write_packed(&mut self.data, last, self.bits, value);
    }

    /// Grow (zero-filled) or shrink to `len` values.
    pub fn resize(&mut self, len: usize) {
        self.len = len;
        self.data.resize(packed_len(len, self.bits), 0);
        // Clear any stale bits past the end after a shrink.
        let used_bits = len * self.bits as usize;
        if used_bits % 8 != 0 {
            if let Some(last) = self.data.last_mut() {
                *last &= (1u8 << (used_bits % 8)) - 1;
            }
        }
    }

    pub fn reserve(&mut self, additional: usize) {
        let needed = packed_len(self.len + additional, self.bits);
        self.data.reserve(needed.saturating_sub(self.data.len()));
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.data.clear();
    }

    /// Raw packed bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Heap bytes held.
    pub fn memory_usage(&self) -> usize {
        self.data.capacity()
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.len).map(move |i| read_packed(&self.data, i, self.bits))
    }
}

// =============================================================================
// Tests
// =============================================================================
