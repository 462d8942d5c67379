//! Deterministic hash bucketing for rollouts and experiments.
//!
//! A context maps to a 60-bit integer derived from SHA-1 of
//! `key.salt.attrValue` (or `seed.attrValue` when a seed is set); weighted
//! variation selection compares against that integer directly so placement
//! is identical regardless of floating-point mode.

use crate::{
    context::{AttributeRef, Context, Kind},
    model::WeightedVariation,
};
use hex::ToHex;
use serde_json::Value;
use sha1::{Digest, Sha1};

/// 2^60 - 1, the value a 15-hex-digit hash prefix is scaled against.
const BUCKET_SCALE: u64 = 0xFFF_FFFF_FFFF_FFFF;

/// Weights are expressed as integers out of this total.
const WEIGHT_SCALE: u64 = 100_000;

/// What seeds the hash alongside the attribute value.
#[derive(Clone, Copy, Debug)]
pub(crate) enum BucketPrefix<'a> {
    KeyAndSalt(&'a str, &'a str),
    Seed(i64),
}

/// Hash a context into the 60-bit bucket space.
///
/// `None` means no context of the wanted kind was present (callers report
/// "not in experiment" and fall back to bucket zero). An attribute that
/// resolves to anything but a string or integer buckets to zero.
pub(crate) fn bucket(
    prefix: BucketPrefix<'_>,
    context: &Context,
    kind: Option<&Kind>,
    bucket_by: Option<&AttributeRef>,
) -> Option<u64> {
    let user_kind = Kind::user();
    let selected = context.as_kind(kind.unwrap_or(&user_kind))?;

    let attr_value = match bucket_by {
        Some(reference) => selected.get_value(reference),
        None => Some(Value::String(selected.key().to_owned())),
    };
    let id = match attr_value {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => return Some(0),
        },
        _ => return Some(0),
    };

    let hasher = match prefix {
        BucketPrefix::KeyAndSalt(key, salt) => Sha1::new()
            .chain(key)
            .chain(".")
            .chain(salt)
            .chain(".")
            .chain(&id),
        BucketPrefix::Seed(seed) => Sha1::new().chain(seed.to_string()).chain(".").chain(&id),
    };
    let hash = &hasher.finalize()[..];
    let mut hex: String = hash.encode_hex();
    hex.truncate(15);
    // 15 hex digits always fit in a u64
    Some(u64::from_str_radix(&hex, 16).unwrap_or(0))
}

/// The bucket as a fraction of the space, for reporting only.
pub(crate) fn as_fraction(n: u64) -> f64 {
    n as f64 / BUCKET_SCALE as f64
}

/// Walk the weighted variation list; the first cumulative bound strictly
/// above the scaled bucket wins, and the last entry absorbs any rounding
/// remainder. `None` only for an empty list.
pub(crate) fn select_weighted(
    variations: &[WeightedVariation],
    n: u64,
) -> Option<&WeightedVariation> {
    let mut cumulative: u64 = 0;
    for wv in variations {
        cumulative += wv.weight as u64;
        // integer form of: cumulative / 100000 > n / (2^60 - 1)
        if (cumulative as u128) * (BUCKET_SCALE as u128) > (n as u128) * (WEIGHT_SCALE as u128) {
            return Some(wv);
        }
    }
    variations.last()
}

/// Does the scaled bucket fall under `weight` out of 100000?
///
/// Used by segment rules carrying a percentage weight.
pub(crate) fn within_weight(weight: u32, n: u64) -> bool {
    (weight as u128) * (BUCKET_SCALE as u128) > (n as u128) * (WEIGHT_SCALE as u128)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use serde_json::json;

    fn wv(variation: usize, weight: u32) -> WeightedVariation {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }

    fn bucket_of(key: &str) -> u64 {
        let context = Context::builder(key).build().unwrap();
        bucket(
            BucketPrefix::KeyAndSalt("flag", "s"),
            &context,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn buckets_are_deterministic_known_values() {
        // sha1("flag.s.ctx-42")[..15] as integer
        assert_eq!(371_048_093_743_563_377, bucket_of("ctx-42"));
        assert!((as_fraction(bucket_of("ctx-42")) - 0.321833).abs() < 1e-6);
        assert!((as_fraction(bucket_of("ctx-1")) - 0.567228).abs() < 1e-6);
        assert!((as_fraction(bucket_of("ctx-4")) - 0.100121).abs() < 1e-6);
    }

    #[test]
    fn even_split_places_known_keys_on_both_sides() {
        let variations = [wv(0, 50_000), wv(1, 50_000)];
        // below 0.5
        for key in &["ctx-42", "ctx-4", "ctx-5"] {
            let selected = select_weighted(&variations, bucket_of(key)).unwrap();
            assert_eq!(0, selected.variation, "{}", key);
        }
        // above 0.5
        for key in &["ctx-1", "ctx-2", "ctx-3"] {
            let selected = select_weighted(&variations, bucket_of(key)).unwrap();
            assert_eq!(1, selected.variation, "{}", key);
        }
    }

    #[test]
    fn last_variation_absorbs_rounding_remainder() {
        // weights sum below 100000; every bucket past the sum lands on the tail
        let variations = [wv(0, 1), wv(1, 1)];
        let selected = select_weighted(&variations, bucket_of("ctx-2")).unwrap();
        assert_eq!(1, selected.variation);
        assert!(select_weighted(&[], 0).is_none());
    }

    #[test]
    fn seed_replaces_key_and_salt() {
        let context = Context::builder("alice").build().unwrap();
        let n = bucket(BucketPrefix::Seed(61), &context, None, None).unwrap();
        // sha1("61.alice")
        assert!((as_fraction(n) - 0.686192).abs() < 1e-6);
    }

    #[test]
    fn buckets_by_custom_attribute() {
        let context = Context::builder("alice")
            .set("tier", "gold")
            .set("account", 12345)
            .build()
            .unwrap();
        let by_tier = bucket(
            BucketPrefix::KeyAndSalt("flag", "s"),
            &context,
            None,
            Some(&AttributeRef::new("tier")),
        )
        .unwrap();
        assert!((as_fraction(by_tier) - 0.187863).abs() < 1e-6);

        // integer attributes hash via their decimal form
        let by_account = bucket(
            BucketPrefix::KeyAndSalt("flag", "s"),
            &context,
            None,
            Some(&AttributeRef::new("account")),
        )
        .unwrap();
        assert!((as_fraction(by_account) - 0.908994).abs() < 1e-6);
    }

    #[test]
    fn non_string_non_int_attribute_buckets_to_zero() {
        let context = Context::builder("alice")
            .set("weird", json!({"a": 1}))
            .set("frac", 1.5)
            .build()
            .unwrap();
        for attr in &["weird", "frac", "missing"] {
            let n = bucket(
                BucketPrefix::KeyAndSalt("flag", "s"),
                &context,
                None,
                Some(&AttributeRef::new(*attr)),
            )
            .unwrap();
            assert_eq!(0, n, "{}", attr);
        }
    }

    #[test]
    fn missing_context_kind_yields_none() {
        let context = Context::builder("alice").build().unwrap();
        let org = Kind::try_parse("org").unwrap();
        assert_eq!(
            None,
            bucket(
                BucketPrefix::KeyAndSalt("flag", "s"),
                &context,
                Some(&org),
                None
            )
        );
    }

    #[test]
    fn within_weight_matches_fraction_comparison() {
        // beta.salty.alice hashes to ~0.0619; 25% weight includes it
        let context = Context::builder("alice").build().unwrap();
        let n = bucket(
            BucketPrefix::KeyAndSalt("beta", "salty"),
            &context,
            None,
            None,
        )
        .unwrap();
        assert!(within_weight(25_000, n));
        let context = Context::builder("bob").build().unwrap();
        let n = bucket(
            BucketPrefix::KeyAndSalt("beta", "salty"),
            &context,
            None,
            None,
        )
        .unwrap();
        assert!(!within_weight(25_000, n)); // ~0.334
    }
}
