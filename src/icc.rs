//! ICC profile reassembly.
//!
//! A profile larger than one marker can hold is split across APP2
//! segments, each starting with:
//!
//! ```text
//! "ICC_PROFILE\0"   12 bytes
//! sequence number    1 byte  (1-based per the ICC spec; some writers start at 0)
//! marker count       1 byte
//! ```
//!
//! followed by a slice of the profile. The slices are concatenated in
//! sequence order. Anything inconsistent is rejected outright rather
//! than producing a corrupted profile.

extern crate alloc;

use alloc::vec::Vec;

use crate::decoder::{M_APP2, SavedMarker};
use crate::error::{Error, ProfileError, Result};

const ICC_SIGNATURE: &[u8; 12] = b"ICC_PROFILE\0";

/// Bytes of APP2 payload before the profile data.
pub const ICC_OVERHEAD_LEN: usize = 14;

/// Largest payload a single marker segment can carry.
pub const MAX_BYTES_IN_MARKER: usize = 65533;

fn is_icc_marker(marker: &SavedMarker) -> bool {
    marker.code == M_APP2 && marker.data.len() >= ICC_OVERHEAD_LEN && marker.data.starts_with(ICC_SIGNATURE)
}

/// Reassemble the ICC profile carried by `markers`, if any.
///
/// Returns `Ok(None)` when no marker carries the ICC signature.
pub fn read_icc_profile(markers: &[SavedMarker]) -> Result<Option<Vec<u8>>> {
    // sequence numbers are bytes, so 256 slots cover every numbering
    let mut slots: [Option<&SavedMarker>; 256] = [None; 256];
    let mut declared: Option<u8> = None;
    let mut found = 0usize;

    for marker in markers.iter().filter(|m| is_icc_marker(m)) {
        let count = marker.data[13];
        match declared {
            None => declared = Some(count),
            Some(d) if d != count => return Err(ProfileError::InconsistentCount.into()),
            Some(_) => {}
        }
        let seq = marker.data[12];
        // 0 is tolerated for writers that number from zero
        if seq > count {
            return Err(ProfileError::BadSequenceNumber.into());
        }
        let slot = &mut slots[seq as usize];
        if slot.is_some() {
            return Err(ProfileError::DuplicateSequence.into());
        }
        *slot = Some(marker);
        found += 1;
    }

    let Some(declared) = declared else {
        return Ok(None);
    };
    if found != declared as usize {
        return Err(ProfileError::InvalidMarkerCount.into());
    }

    let first = if slots[0].is_some() { 0 } else { 1 };
    let ordered = &slots[first..first + found];

    let mut total = 0usize;
    for slot in ordered {
        let marker = slot.ok_or(ProfileError::MissingSequence)?;
        let len = marker.data.len();
        if !(ICC_OVERHEAD_LEN..=MAX_BYTES_IN_MARKER).contains(&len) {
            return Err(ProfileError::InvalidDataLength.into());
        }
        total += len - ICC_OVERHEAD_LEN;
    }
    if total == 0 {
        return Err(ProfileError::EmptyMarkers.into());
    }

    let mut profile = Vec::new();
    profile
        .try_reserve_exact(total)
        .map_err(|_| Error::Alloc("reading ICC profile"))?;
    for marker in ordered.iter().flatten() {
        profile.extend_from_slice(&marker.data[ICC_OVERHEAD_LEN..]);
    }
    log::debug!("jpeg: icc profile of {} bytes from {} markers", total, found);
    Ok(Some(profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    fn icc(seq: u8, count: u8, payload: &[u8]) -> SavedMarker {
        let mut data = ICC_SIGNATURE.to_vec();
        data.push(seq);
        data.push(count);
        data.extend_from_slice(payload);
        SavedMarker {
            code: M_APP2,
            original_length: data.len(),
            data,
        }
    }

    fn err(markers: &[SavedMarker]) -> ProfileError {
        match read_icc_profile(markers) {
            Err(Error::InvalidProfile(e)) => e,
            other => panic!("expected profile error, got {:?}", other),
        }
    }

    #[test]
    fn three_markers_concatenate_in_order() {
        let markers = [icc(2, 3, b"BBB"), icc(1, 3, b"AAA"), icc(3, 3, b"CCC")];
        assert_eq!(read_icc_profile(&markers).unwrap().unwrap(), b"AAABBBCCC");
    }

    #[test]
    fn zero_based_numbering_is_accepted() {
        let markers = [icc(0, 2, b"xy"), icc(1, 2, b"z")];
        assert_eq!(read_icc_profile(&markers).unwrap().unwrap(), b"xyz");
    }

    #[test]
    fn inconsistent_counts_fail() {
        let markers = [icc(1, 3, b"A"), icc(2, 2, b"B")];
        assert_eq!(err(&markers), ProfileError::InconsistentCount);
        assert_eq!(
            Error::from(ProfileError::InconsistentCount).to_string(),
            "invalid icc profile: inconsistent num_markers fields"
        );
    }

    #[test]
    fn duplicate_sequence_fails() {
        let markers = [icc(1, 2, b"A"), icc(1, 2, b"B")];
        assert_eq!(err(&markers), ProfileError::DuplicateSequence);
    }

    #[test]
    fn no_icc_markers_is_no_profile() {
        assert_eq!(read_icc_profile(&[]).unwrap(), None);
        let other = SavedMarker {
            code: M_APP2,
            original_length: 4,
            data: b"FPXR".to_vec(),
        };
        let short = SavedMarker {
            code: M_APP2,
            original_length: 12,
            data: ICC_SIGNATURE.to_vec(),
        };
        assert_eq!(read_icc_profile(&[other, short]).unwrap(), None);
    }

    #[test]
    fn non_app2_markers_are_ignored() {
        let mut m = icc(1, 1, b"data");
        m.code = 0xE1;
        assert_eq!(read_icc_profile(&[m]).unwrap(), None);
    }

    #[test]
    fn sequence_beyond_count_fails() {
        assert_eq!(err(&[icc(3, 2, b"A")]), ProfileError::BadSequenceNumber);
    }

    #[test]
    fn missing_marker_count_fails() {
        assert_eq!(err(&[icc(1, 2, b"A")]), ProfileError::InvalidMarkerCount);
        // a count of zero can never be satisfied; libjpeg-based loaders
        // that start from a zero count report "no profile" here instead
        assert_eq!(err(&[icc(0, 0, b"A")]), ProfileError::InvalidMarkerCount);
    }

    #[test]
    fn gap_in_sequence_fails() {
        // both numbering schemes mixed: 0 and 2 of 2 leaves slot 1 empty
        let markers = [icc(0, 2, b"A"), icc(2, 2, b"B")];
        assert_eq!(err(&markers), ProfileError::MissingSequence);
    }

    #[test]
    fn oversized_marker_fails() {
        let markers = [icc(1, 1, &vec![0u8; MAX_BYTES_IN_MARKER])];
        assert_eq!(err(&markers), ProfileError::InvalidDataLength);
    }

    #[test]
    fn empty_payloads_fail() {
        let markers = [icc(1, 2, b""), icc(2, 2, b"")];
        assert_eq!(err(&markers), ProfileError::EmptyMarkers);
    }
}
