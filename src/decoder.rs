//! Turning a record's raw bytes into a typed value.
//!
//! A decoder only reads through the [`RecordAccessor`] getters. It runs
//! inside the consistent-read retry loop, so it may be invoked several
//! times per logical read and must not have side effects.

use crate::record::RecordAccessor;

/// Decodes a record value into `Output`.
///
/// Any `Fn(&RecordAccessor<'_>) -> T` is a decoder.
pub trait RecordDecoder {
    type Output;

    fn decode(&self, record: &RecordAccessor<'_>) -> Self::Output;
}

impl<F, T> RecordDecoder for F
where
    F: Fn(&RecordAccessor<'_>) -> T + ?Sized,
{
    type Output = T;

    #[inline(always)]
    fn decode(&self, record: &RecordAccessor<'_>) -> T {
        self(record)
    }
}

/// Top-of-book quote, the demonstration record format.
///
/// | offset | field     | type |
/// |--------|-----------|------|
/// | 0      | `bid`     | f64  |
/// | 8      | `ask`     | f64  |
/// | 16     | `bid_qty` | i32  |
/// | 20     | `ask_qty` | i32  |
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub bid_qty: i32,
    pub ask_qty: i32,
}

impl Quote {
    /// Encoded size in bytes.
    pub const SIZE: usize = 24;

    /// Little-endian encoding in the layout [`QuoteDecoder`] reads.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.bid.to_le_bytes());
        buf[8..16].copy_from_slice(&self.ask.to_le_bytes());
        buf[16..20].copy_from_slice(&self.bid_qty.to_le_bytes());
        buf[20..24].copy_from_slice(&self.ask_qty.to_le_bytes());
        buf
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

impl std::fmt::Display for Quote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{} / {}@{}",
            self.bid_qty, self.bid, self.ask_qty, self.ask
        )
    }
}

/// Decodes [`Quote`] records.
///
/// # Panics
///
/// Panics on a store whose value size is smaller than [`Quote::SIZE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QuoteDecoder;

impl RecordDecoder for QuoteDecoder {
    type Output = Quote;

    #[inline]
    fn decode(&self, record: &RecordAccessor<'_>) -> Quote {
        Quote {
            bid: record.get_f64(0),
            ask: record.get_f64(8),
            bid_qty: record.get_i32(16),
            ask_qty: record.get_i32(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_store;

    #[test]
    fn quote_decoder_reads_written_quote() {
        let mut ts = scratch_store(100, 199, Quote::SIZE, 16);
        let quote = Quote {
            bid: 101.25,
            ask: 101.5,
            bid_qty: 300,
            ask_qty: -1,
        };
        ts.writer.write_record(150, &quote.encode()).unwrap();

        let rec = ts.store.record(150).unwrap();
        let got = rec.read_consistent(&QuoteDecoder);
        assert_eq!(got, quote);
        assert_eq!(got.spread(), 0.25);
        assert_eq!(got.to_string(), "300@101.25 / -1@101.5");
    }

    #[test]
    fn closures_are_decoders() {
        let mut ts = scratch_store(0, 9, 8, 8);
        ts.writer.write_record(3, &77u64.to_le_bytes()).unwrap();
        let rec = ts.store.record(3).unwrap();
        let doubled = |r: &RecordAccessor<'_>| r.get_u64(0) * 2;
        assert_eq!(rec.read_consistent(&doubled), 154);
    }

    #[test]
    fn unwritten_quote_is_default() {
        let ts = scratch_store(0, 9, 32, 8);
        let rec = ts.store.record(0).unwrap();
        assert_eq!(rec.read_consistent(&QuoteDecoder), Quote::default());
    }
}
