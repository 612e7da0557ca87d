//! This module contains the composite-prefix encoding that work packages
//! travel as, and the canonicalization applied on ingress.
//!
//! A composite prefix is `P0 ('-' Pi)*`: the common prefix shared by the
//! packaged states followed by each state's private continuation. Digits
//! use the raw branch alphabet `{'0','1','2','3'}`; the canonical `{0,1}`
//! form (`'2'→'0'`, `'3'→'1'`, separators dropped) is derived here and is
//! the only form the radix tree and the suspended-state pool ever see.

use itertools::Itertools;

use crate::error::protocol::{Error, Result};

/// Canonicalizes raw digits into the `{0,1}` alphabet.
///
/// # Errors
///
/// Returns [`Err`] if a character outside `{0,1,2,3,-}` appears.
pub fn canonicalize(raw: &[u8]) -> Result<Vec<u8>> {
    let mut canonical = Vec::with_capacity(raw.len());
    for digit in raw {
        match digit {
            b'0' | b'2' => canonical.push(b'0'),
            b'1' | b'3' => canonical.push(b'1'),
            b'-' => {}
            other => {
                return Err(Error::MalformedPrefix {
                    reason: format!("unexpected character {:?}", char::from(*other)),
                })
            }
        }
    }
    Ok(canonical)
}

/// Decodes a composite prefix into the full raw prefix of each packaged
/// state.
///
/// Without separators the message is a single prefix. With separators the
/// common part `P0` is prepended to each private continuation, so
/// `"00-110-111"` decodes to `["00110", "00111"]`. The empty message is
/// the empty prefix, which constrains nothing: it dispatches the whole
/// exploration space.
///
/// # Errors
///
/// Returns [`Err`] if the message contains a character outside the raw
/// alphabet.
pub fn decode_composite(message: &str) -> Result<Vec<Vec<u8>>> {
    let mut parts = message.as_bytes().split(|b| *b == b'-');
    let common = parts.next().expect("split yields at least one part");
    validate_digits(common)?;

    let mut prefixes = vec![];
    for part in parts {
        validate_digits(part)?;
        let mut full = common.to_vec();
        full.extend_from_slice(part);
        prefixes.push(full);
    }

    if prefixes.is_empty() {
        prefixes.push(common.to_vec());
    }
    Ok(prefixes)
}

/// Encodes the branch histories of a package of states as a composite
/// prefix: their longest common prefix, then each one's continuation.
///
/// # Panics
///
/// Panics if `histories` is empty; the offload rules guarantee at least
/// one state per package.
#[must_use]
pub fn encode_composite(histories: &[&[u8]]) -> String {
    assert!(!histories.is_empty(), "a package holds at least one state");

    if histories.len() == 1 {
        return String::from_utf8(histories[0].to_vec()).expect("digits are ASCII");
    }

    let common_len = longest_common_prefix(histories);
    let common = String::from_utf8_lossy(&histories[0][..common_len]);
    let suffixes = histories
        .iter()
        .map(|history| String::from_utf8_lossy(&history[common_len..]))
        .join("-");
    format!("{common}-{suffixes}")
}

/// Gets the length of the longest common prefix of `histories`.
fn longest_common_prefix(histories: &[&[u8]]) -> usize {
    let shortest = histories.iter().map(|h| h.len()).min().unwrap_or(0);
    (0..shortest)
        .find(|i| {
            let digit = histories[0][*i];
            histories.iter().any(|h| h[*i] != digit)
        })
        .unwrap_or(shortest)
}

fn validate_digits(digits: &[u8]) -> Result<()> {
    for digit in digits {
        if !(b'0'..=b'3').contains(digit) {
            return Err(Error::MalformedPrefix {
                reason: format!("unexpected character {:?}", char::from(*digit)),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonicalization_maps_unforked_digits() {
        let canonical = canonicalize(b"0123-2").expect("valid digits");
        assert_eq!(canonical, b"0101".to_vec().as_slice());
        canonical
            .iter()
            .for_each(|d| assert!(*d == b'0' || *d == b'1'));
    }

    #[test]
    fn canonicalization_rejects_garbage() {
        assert!(canonicalize(b"01x").is_err());
    }

    #[test]
    fn decodes_a_plain_prefix_to_itself() {
        let decoded = decode_composite("0120").expect("well-formed");
        assert_eq!(decoded, vec![b"0120".to_vec()]);
    }

    #[test]
    fn decodes_a_composite_into_full_prefixes() {
        let decoded = decode_composite("00-110-111").expect("well-formed");
        assert_eq!(decoded, vec![b"00110".to_vec(), b"00111".to_vec()]);
    }

    #[test]
    fn rejects_characters_outside_the_alphabet() {
        assert!(decode_composite("0a1").is_err());
        assert!(decode_composite("01-4").is_err());
    }

    #[test]
    fn the_empty_message_is_the_unconstrained_prefix() {
        assert_eq!(
            decode_composite("").expect("well-formed"),
            vec![Vec::<u8>::new()]
        );
    }

    #[test]
    fn encode_then_decode_round_trips() {
        let histories: Vec<&[u8]> = vec![b"00110", b"00111", b"0020"];
        let message = encode_composite(&histories);
        let decoded = decode_composite(&message).expect("well-formed");
        assert_eq!(
            decoded,
            vec![b"00110".to_vec(), b"00111".to_vec(), b"0020".to_vec()]
        );
    }

    #[test]
    fn single_state_packages_stay_plain() {
        let histories: Vec<&[u8]> = vec![b"0123"];
        assert_eq!(encode_composite(&histories), "0123");
    }
}
