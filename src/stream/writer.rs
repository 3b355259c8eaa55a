// Copyright (c) imx-tiered-store contributors.
// Licensed under the MIT License.

//! Word-level entry codec and offset arithmetic for TSD/EVT streams, kept
//! free of allocation/IO concerns so the engine's append path (which does
//! own allocation and the disk fallback) can stay in `engine.rs`.

use crate::constants::RecordType;
use crate::error::{Error, Result};
use crate::stream::descriptor::Entry;

/// Computes the word offset, within the tail sector's payload, at which the
/// next entry should be written.
pub fn write_word_offset(
    data_type: RecordType,
    start_index_within_tail: u32,
    count: u64,
    entries_per_sector: u32,
) -> u32 {
    let entry_index = start_index_within_tail + (count % entries_per_sector as u64) as u32;
    entry_index * data_type.entry_words()
}

/// Computes the word offset of the `n`th entry (0-based, from the start of
/// the sector) for reading.
pub fn read_word_offset(data_type: RecordType, entry_index_in_sector: u32) -> u32 {
    entry_index_in_sector * data_type.entry_words()
}

/// Encodes one entry into its word representation. Fails if `entry`'s kind
/// doesn't match `data_type` (a caller bug, not a corruption the codec
/// should paper over).
pub fn encode(data_type: RecordType, entry: Entry) -> Result<Vec<u32>> {
    match (data_type, entry) {
        (RecordType::Tsd, Entry::Tsd(v)) => Ok(vec![v]),
        (RecordType::Evt, Entry::Evt { timestamp, value }) => Ok(vec![timestamp, value]),
        _ => Err(Error::InvalidConfig(
            "entry kind does not match stream record type",
        )),
    }
}

/// Decodes one entry from its word representation.
pub fn decode(data_type: RecordType, words: &[u32]) -> Entry {
    match data_type {
        RecordType::Tsd => Entry::Tsd(words[0]),
        RecordType::Evt => Entry::Evt {
            timestamp: words[0],
            value: words[1],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsd_offset_wraps_at_entries_per_sector() {
        let eps = RecordType::Tsd.entries_per_sector(7);
        assert_eq!(eps, 7);
        assert_eq!(write_word_offset(RecordType::Tsd, 0, 0, eps), 0);
        assert_eq!(write_word_offset(RecordType::Tsd, 0, 6, eps), 6);
        assert_eq!(write_word_offset(RecordType::Tsd, 0, 7, eps), 0);
    }

    #[test]
    fn evt_offset_accounts_for_two_word_entries() {
        let eps = RecordType::Evt.entries_per_sector(7);
        assert_eq!(eps, 3);
        assert_eq!(write_word_offset(RecordType::Evt, 0, 0, eps), 0);
        assert_eq!(write_word_offset(RecordType::Evt, 0, 1, eps), 2);
        assert_eq!(write_word_offset(RecordType::Evt, 0, 2, eps), 4);
        assert_eq!(write_word_offset(RecordType::Evt, 0, 3, eps), 0);
    }

    #[test]
    fn encode_decode_round_trips() {
        let e = Entry::Evt {
            timestamp: 0xAAAA,
            value: 0xBBBB,
        };
        let words = encode(RecordType::Evt, e).unwrap();
        assert_eq!(decode(RecordType::Evt, &words), e);
    }

    #[test]
    fn mismatched_entry_kind_is_rejected() {
        assert!(encode(RecordType::Tsd, Entry::Evt { timestamp: 0, value: 0 }).is_err());
    }
}
