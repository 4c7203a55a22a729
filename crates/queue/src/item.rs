use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Largest accepted weight; anything above clamps silently.
pub const MAX_WEIGHT: u64 = 99_999;

/// Terminal progress value.
pub const MAX_PROGRESS: u8 = 100;

// RFC 3339 with nanoseconds is "2006-01-02T15:04:05.999999999" through
// character 29; everything beyond is offset rendering, which varies by
// producer.
const CREATED_AT_EQ_CHARS: usize = 29;

/// One queued job: the single persisted entity.
///
/// `bucket`, `created_at` and `key` are fixed at creation. `value` and
/// `progress` are rewritten by workers through re-enqueue. `canceled` is
/// set only by the engine, when the item leaves the scheduled namespace
/// before reaching terminal progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub bucket: String,
    pub created_at: DateTime<Utc>,
    pub key: String,
    pub value: String,
    pub progress: u8,
    pub canceled: bool,
    pub error: String,
    pub request_id: String,
}

impl Item {
    /// Creates a new item in `bucket` with the given weight and payload.
    pub fn new(bucket: &str, weight: u64, value: &str) -> Item {
        let created_at = Utc::now();
        Item {
            bucket: bucket.to_string(),
            created_at,
            key: encode_key(bucket, weight, created_at),
            value: value.to_string(),
            progress: 0,
            canceled: false,
            error: String::new(),
            request_id: String::new(),
        }
    }

    /// Field-wise equality, comparing `created_at` by its 29-character
    /// RFC 3339 prefix to tolerate serialization rounding.
    pub fn equal(&self, other: &Item) -> bool {
        self.bucket == other.bucket
            && created_at_eq(&self.created_at, &other.created_at)
            && self.key == other.key
            && self.value == other.value
            && self.progress == other.progress
            && self.canceled == other.canceled
            && self.error == other.error
            && self.request_id == other.request_id
    }
}

/// Encodes (bucket, weight, creation time) into a key whose lexicographic
/// order within a bucket is: higher weight first, ties broken by earlier
/// creation.
///
/// Layout: `<bucket>/<5-digit decimal of MAX_WEIGHT - weight><35-digit
/// uppercase hex of creation time in Unix nanoseconds>`.
pub fn encode_key(bucket: &str, weight: u64, created_at: DateTime<Utc>) -> String {
    let rank = MAX_WEIGHT - weight.min(MAX_WEIGHT);
    let nanos = created_at.timestamp_nanos_opt().unwrap_or_default().max(0);
    format!("{bucket}/{rank:05}{nanos:035X}")
}

fn created_at_eq(a: &DateTime<Utc>, b: &DateTime<Utc>) -> bool {
    let a = a.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let b = b.to_rfc3339_opts(SecondsFormat::Nanos, true);
    a.get(..CREATED_AT_EQ_CHARS) == b.get(..CREATED_AT_EQ_CHARS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, nanos).expect("valid timestamp")
    }

    #[test]
    fn keys_order_higher_weight_first() {
        let t = at(1_700_000_000, 0);
        let heavy = encode_key("b", 90, t);
        let light = encode_key("b", 10, t);
        assert!(heavy < light);
    }

    #[test]
    fn keys_break_weight_ties_by_earlier_creation() {
        let earlier = encode_key("b", 50, at(1_700_000_000, 0));
        let later = encode_key("b", 50, at(1_700_000_000, 1));
        assert!(earlier < later);
    }

    #[test]
    fn weight_above_maximum_clamps() {
        let t = at(1_700_000_000, 123);
        assert_eq!(encode_key("b", 7_000_000, t), encode_key("b", MAX_WEIGHT, t));
        assert!(encode_key("b", u64::MAX, t).starts_with("b/00000"));
    }

    #[test]
    fn key_shape_is_fixed_width() {
        let key = encode_key("jobs", 0, at(0, 1));
        assert_eq!(key.len(), "jobs/".len() + 5 + 35);
        assert!(key.starts_with("jobs/99999"));
    }

    #[test]
    fn wire_format_field_names() {
        let item = Item::new("b", 3, "payload");
        let value = serde_json::to_value(&item).expect("serializes");
        let object = value.as_object().expect("object");

        let mut names: Vec<_> = object.keys().map(String::as_str).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "bucket",
                "canceled",
                "created_at",
                "error",
                "key",
                "progress",
                "request_id",
                "value",
            ]
        );
    }

    #[test]
    fn json_round_trip_compares_equal() {
        let item = Item::new("bucket", 25, "v");
        let raw = serde_json::to_string(&item).expect("serializes");
        let back: Item = serde_json::from_str(&raw).expect("deserializes");
        assert!(item.equal(&back));
        assert!(back.equal(&item));
    }

    #[test]
    fn equality_is_reflexive_and_symmetric() {
        let a = Item::new("b", 1, "v");
        let b = a.clone();
        assert!(a.equal(&a));
        assert!(a.equal(&b));
        assert!(b.equal(&a));
    }

    #[test]
    fn equality_discriminates_changed_fields() {
        let a = Item::new("b", 1, "v");

        let mut b = a.clone();
        b.value = "w".to_string();
        assert!(!a.equal(&b));

        let mut b = a.clone();
        b.progress = 10;
        assert!(!a.equal(&b));

        let mut b = a.clone();
        b.created_at = at(1_700_000_000, 999);
        assert!(!a.equal(&b));
    }
}
