//! Ordlock Listing Detection
//!
//! A marketplace listing wraps the seller's pubkey hash and the payment output
//! they expect between a fixed prefix and suffix of the ordlock contract.

use std::sync::LazyLock;

use bitcoin::consensus::encode::{deserialize_partial, serialize};
use bitcoin::TxOut;
use tracing::debug;

use crate::outpoint::ByteString;
use crate::script::decode_parts;
use crate::txo::Listing;

const ORDLOCK_PREFIX_HEX: &str = "2097dfd76851bf465e8f715593b217714858bbe9570ff3bd5e33840a34e20ff0262102ba79df5f8ae7604a9830f03c7933028186aede0675a16f025dc4f8be8eec0382201008ce7480da41702918d1ec8e6849ba32b4d65b1e40dc669c31a1e6306b266c0000";
const ORDLOCK_SUFFIX_HEX: &str = "615179547a75537a537a537a0079537a75527a527a7575615579008763567901c161517957795779210ac407f0e4bd44bfc207355a778b046225a7068fc59ee7eda43ad905aadbffc800206c266b30e6a1319c66dc401e5bd6b432ba49688eecd118297041da8074ce081059795679615679aa0079610079517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e01007e81517a75615779567956795679567961537956795479577995939521414136d08c5ed2bf3ba048afe6dcaebafeffffffffffffffffffffffffffffff00517951796151795179970079009f63007952799367007968517a75517a75517a7561527a75517a517951795296a0630079527994527a75517a6853798277527982775379012080517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f517f7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e7c7e01205279947f7754537993527993013051797e527e54797e58797e527e53797e52797e57797e0079517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a75517a756100795779ac517a75517a75517a75517a75517a75517a75517a75517a75517a7561517a75517a756169587951797e58797eaa577961007982775179517958947f7551790128947f77517a75517a75618777777777777777777767557951876351795779a9876957795779ac777777777777777767006868";

pub static ORDLOCK_PREFIX: LazyLock<Vec<u8>> =
    LazyLock::new(|| hex::decode(ORDLOCK_PREFIX_HEX).expect("valid ordlock prefix hex"));
pub static ORDLOCK_SUFFIX: LazyLock<Vec<u8>> =
    LazyLock::new(|| hex::decode(ORDLOCK_SUFFIX_HEX).expect("valid ordlock suffix hex"));

/// An ordlock contract found in a script
#[derive(Debug, Clone, PartialEq)]
pub struct OrdLock {
    /// Seller pubkey hash; replaces the output's standard owner
    pub owner: Vec<u8>,
    /// `None` when the payout output is missing or does not decode
    pub listing: Option<Listing>,
}

/// Search `script` for the ordlock template.
///
/// Yields `None` when the template is absent or its body does not decode.
/// A body whose payout part is unreadable still yields the owner.
pub fn parse_ordlock(script: &[u8]) -> Option<OrdLock> {
    let start = find(script, &ORDLOCK_PREFIX)? + ORDLOCK_PREFIX.len();
    let end = find(script, &ORDLOCK_SUFFIX)?;
    if end < start {
        return None;
    }

    let parts = match decode_parts(&script[start..end]) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("ordlock body does not decode: {}", e);
            return None;
        }
    };
    let mut parts = parts.into_iter();
    let owner = parts.next()?;
    let listing = parts.next().and_then(|pay_output| {
        match deserialize_partial::<TxOut>(&pay_output) {
            Ok((payout, _)) => Some(Listing {
                price: payout.value.to_sat(),
                payout: ByteString(serialize(&payout)),
            }),
            Err(e) => {
                debug!("ordlock payout does not decode: {}", e);
                None
            }
        }
    });
    Some(OrdLock { owner, listing })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
