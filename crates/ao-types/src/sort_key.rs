//! SortKey / Ordinate algebra (spec.md §4.A).
//!
//! A SortKey is a composite lexicographic key with up to three
//! comma-separated fields: `blockHeight,timestamp,hash`. Block height is
//! left-padded to 12 decimal digits so that byte-wise comparison equals
//! numeric order over (height, timestamp, hash).

use std::cmp::Ordering;

/// Smallest permissible collation character: any real ordinate compares
/// greater than this, so it doubles as the cold-start sentinel ordinate.
pub const MIN_COLLATION_CHAR: &str = "\u{0000}";

const HEIGHT_WIDTH: usize = 12;

/// Upper bound that compares greater than any real canonical SortKey, for
/// "evaluate everything currently available" queries where no specific
/// cutoff message is known.
pub fn max_bound() -> String {
    format!("{},{},~", "9".repeat(HEIGHT_WIDTH), u64::MAX)
}

/// A scheduled message's ordinate: its nonce, used to detect gaps and
/// duplicates in the SU's assigned sequence. The hash field of a SortKey
/// is opaque and does not itself encode the nonce, so an ordinate can
/// only be read back out of a SortKey that was built by
/// [`Ordinate::with_sort_key`] — typically the sortKey the evaluator just
/// assigned to a scheduled message, not an arbitrary key from a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ordinate(pub u64);

impl Ordinate {
    /// Extracts the ordinate previously embedded by [`Ordinate::with_sort_key`]
    /// in the hash field of `s`. Returns `None` for keys with no hash field,
    /// or whose hash field isn't a bare nonce (e.g. a transaction hash).
    pub fn from_sort_key(s: &str) -> Option<Ordinate> {
        let canon = canonicalize(s);
        let hash = canon.splitn(3, ',').nth(2)?;
        hash.strip_prefix("n:")?.parse().ok().map(Ordinate)
    }

    /// Embeds `self` into `sort_key`'s hash field using the `n:`
    /// convention [`from_sort_key`] reads back.
    pub fn with_sort_key(self, sort_key: &str) -> String {
        let canon = canonicalize(sort_key);
        let mut parts = canon.splitn(2, ',');
        let height = parts.next().unwrap_or("");
        match parts.next() {
            Some(rest) => {
                let timestamp = rest.splitn(2, ',').next().unwrap_or("");
                format!("{height},{timestamp},n:{}", self.0)
            }
            None => format!("{height},0,n:{}", self.0),
        }
    }
}

/// Left-pad the block-height field of `s` to [`HEIGHT_WIDTH`] digits.
/// Partial forms (height only, or height+hash) are accepted; only the
/// first field is padded.
pub fn canonicalize(s: &str) -> String {
    let mut parts = s.splitn(3, ',');
    let height = parts.next().unwrap_or("");
    let rest: Vec<&str> = parts.collect();

    let padded_height = format!("{:0>width$}", height, width = HEIGHT_WIDTH);

    if rest.is_empty() {
        padded_height
    } else {
        format!("{},{}", padded_height, rest.join(","))
    }
}

/// Byte-wise comparison of two canonicalized sort keys. Equivalent to
/// numeric order over (blockHeight, timestamp, hash) once both inputs are
/// canonical.
pub fn compare(a: &str, b: &str) -> Ordering {
    canonicalize(a).cmp(&canonicalize(b))
}

/// `from` bounds are inclusive as-is. `to` bounds are exclusive, unless
/// only a block-height is given, in which case callers must increment the
/// bound before sending so that the terminal block is included.
pub fn increment_bound(s: &str) -> String {
    let canon = canonicalize(s);
    if !canon.contains(',') {
        let height: u64 = canon.parse().unwrap_or(0);
        return format!("{:0>width$}", height + 1, width = HEIGHT_WIDTH);
    }
    canon
}

/// A cron-aware tiebreak ordering: first by timestamp ascending; if equal,
/// by cron-interval tag ascending (empty string sorts before any other
/// string), so that two cron schedules firing at the same timestamp are
/// deterministically ordered.
pub fn is_later_than(
    a_timestamp: u64,
    a_cron: Option<&str>,
    b_timestamp: u64,
    b_cron: Option<&str>,
) -> bool {
    match a_timestamp.cmp(&b_timestamp) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => a_cron.unwrap_or("") > b_cron.unwrap_or(""),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonicalize_pads_height() {
        assert_eq!(
            canonicalize("1257294,1694181441598,fb1eb…11d5"),
            "000001257294,1694181441598,fb1eb…11d5"
        );
    }

    #[test]
    fn canonicalize_is_idempotent() {
        let once = canonicalize("1257294,1694181441598,fb1eb…11d5");
        assert_eq!(canonicalize(&once), once);
    }

    #[test]
    fn canonicalize_accepts_height_only() {
        assert_eq!(canonicalize("1257294"), "000001257294");
    }

    #[test]
    fn increment_bound_on_height_only() {
        assert_eq!(increment_bound("1257294"), "000001257295");
    }

    #[test]
    fn increment_bound_leaves_full_key_intact() {
        assert_eq!(
            increment_bound("1257294,1694181441598,fb1eb"),
            "000001257294,1694181441598,fb1eb"
        );
    }

    #[test]
    fn compare_is_numeric_over_height() {
        assert_eq!(compare("9,5,a", "10,5,a"), Ordering::Less);
    }

    #[test]
    fn max_bound_exceeds_any_real_key() {
        assert_eq!(compare("1257294,1694181441598,fb1eb", &max_bound()), Ordering::Less);
    }

    #[test]
    fn ordinate_round_trips_through_sort_key() {
        let key = Ordinate(42).with_sort_key("1257294,1694181441598");
        assert_eq!(Ordinate::from_sort_key(&key), Some(Ordinate(42)));
    }

    #[test]
    fn ordinate_absent_from_opaque_hash() {
        assert_eq!(Ordinate::from_sort_key("1257294,1694181441598,fb1eb"), None);
        assert_eq!(Ordinate::from_sort_key("1257294"), None);
    }

    #[test]
    fn is_later_than_breaks_ties_on_cron() {
        assert!(is_later_than(10, Some("1m"), 10, None));
        assert!(!is_later_than(10, None, 10, Some("1m")));
        assert!(is_later_than(11, None, 10, None));
    }

    #[quickcheck_macros::quickcheck]
    fn canonicalize_round_trips(height: u32, ts: u64) -> bool {
        let s = format!("{},{}", height, ts);
        canonicalize(&canonicalize(&s)) == canonicalize(&s)
    }
}
