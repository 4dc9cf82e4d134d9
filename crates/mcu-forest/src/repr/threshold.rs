//! Threshold slot to quantized value mapping.

use super::layout::NodeLayout;

/// Maps a node's threshold slot to the quantized value it compares against.
///
/// When the layout keeps the full quantization width the mapping is the
/// identity. If the threshold field had to shrink, the `2^threshold_bits`
/// slots are spread evenly over the value range, so slot `s` compares at
/// `((s + 1) << (quant_bits - threshold_bits)) - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThresholdTable {
    quant_bits: u8,
    threshold_bits: u8,
}

impl ThresholdTable {
    pub fn new(quant_bits: u8, threshold_bits: u8) -> Self {
        let quant_bits = quant_bits.clamp(1, 8);
        Self {
            quant_bits,
            threshold_bits: threshold_bits.clamp(1, quant_bits),
        }
    }

    /// Table for `layout` over `quant_bits`-wide values.
    pub fn for_layout(layout: &NodeLayout, quant_bits: u8) -> Self {
        Self::new(quant_bits, layout.threshold_bits)
    }

    #[inline]
    pub fn quant_bits(&self) -> u8 {
        self.quant_bits
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        1usize << self.threshold_bits
    }

    /// Quantized value compared against for `slot`.
    #[inline]
    pub fn value(&self, slot: u8) -> u8 {
        let shift = self.quant_bits - self.threshold_bits;
        let v = ((slot as u32 + 1) << shift).saturating_sub(1);
        v.min((1u32 << self.quant_bits) - 1) as u8
    }

    /// Slots usable as split candidates, ascending.
    ///
    /// The top slot maps to the maximum value, which sends everything left,
    /// so it is never a candidate.
    pub fn candidates(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        (0..self.num_slots() - 1).map(move |s| (s as u8, self.value(s as u8)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_widths_match() {
        let table = ThresholdTable::new(2, 2);
        let values: Vec<_> = (0..4).map(|s| table.value(s)).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
        assert_eq!(table.candidates().count(), 3);
    }

    #[test]
    fn shrunk_slots_spread_over_range() {
        let table = ThresholdTable::new(8, 2);
        let values: Vec<_> = (0..4).map(|s| table.value(s)).collect();
        assert_eq!(values, vec![63, 127, 191, 255]);
    }

    #[test]
    fn threshold_width_never_exceeds_quantization() {
        let table = ThresholdTable::new(2, 8);
        assert_eq!(table.num_slots(), 4);
        assert_eq!(table.value(3), 3);
    }
}
