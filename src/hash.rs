use serde::{Deserialize, Serialize};

use crate::util::default_true;

const FNV32_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV32_PRIME: u32 = 0x0100_0193;

/// Selects one of the bucketing hash algorithms.
///
/// The two versions are not interchangeable: a given seed and unit value land in different
/// buckets under each. Evaluators in other processes must agree on the version, so changing
/// either algorithm requires a new version rather than an edit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum HashVersion {
    /// `fnv32a(value + seed) % 1000 / 1000`.
    #[default]
    V1,
    /// `fnv32a(str(fnv32a(seed + value))) % 10000 / 10000`; better distribution for similar inputs.
    V2,
}

impl TryFrom<u8> for HashVersion {
    type Error = u8;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version {
            1 => Ok(HashVersion::V1),
            2 => Ok(HashVersion::V2),
            other => Err(other),
        }
    }
}

impl From<HashVersion> for u8 {
    fn from(version: HashVersion) -> Self {
        match version {
            HashVersion::V1 => 1,
            HashVersion::V2 => 2,
        }
    }
}

impl Serialize for HashVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8((*self).into())
    }
}

impl<'de> Deserialize<'de> for HashVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = u8::deserialize(deserializer)?;
        HashVersion::try_from(version).map_err(|v| {
            serde::de::Error::custom(format!("unsupported hash version {}", v))
        })
    }
}

/// 32-bit FNV-1a over the UTF-16 code units of the input.
///
/// Hashing code units instead of UTF-8 bytes keeps the output identical to evaluators running on
/// UTF-16 string runtimes for any non-ASCII identifier.
fn fnv32a<'a>(parts: impl IntoIterator<Item = &'a str>) -> u32 {
    let mut hval = FNV32_OFFSET_BASIS;
    for part in parts {
        for unit in part.encode_utf16() {
            hval ^= u32::from(unit);
            hval = hval.wrapping_mul(FNV32_PRIME);
        }
    }
    hval
}

/// Deterministically hashes `value` under `seed` into `[0, 1)`.
pub fn hash(seed: &str, value: &str, version: HashVersion) -> f64 {
    match version {
        HashVersion::V1 => f64::from(fnv32a([value, seed]) % 1000) / 1000.0,
        HashVersion::V2 => {
            let inner = fnv32a([seed, value]).to_string();
            f64::from(fnv32a([inner.as_str()]) % 10000) / 10000.0
        }
    }
}

/// A namespace restricts an experiment to a slice of the hash space shared with other
/// experiments, making them mutually exclusive.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Namespace {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(alias = "id")]
    pub name: String,
    /// Half-open `[start, end)` range of the namespace hash the experiment occupies.
    pub range: (f64, f64),
}

impl Namespace {
    /// Returns true if the unit falls inside this namespace's range.
    ///
    /// Disabled namespaces admit every unit.
    pub fn contains(&self, unit_value: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let seed = format!("__{}", self.name);
        let n = hash(&seed, unit_value, HashVersion::V1);
        in_range(n, self.range)
    }
}

pub(crate) fn in_range(n: f64, range: (f64, f64)) -> bool {
    n >= range.0 && n < range.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use spectral::prelude::*;
    use test_case::test_case;

    #[test_case("", "a", HashVersion::V1, 0.22)]
    #[test_case("", "b", HashVersion::V1, 0.077)]
    #[test_case("b", "a", HashVersion::V1, 0.946)]
    #[test_case("ef", "d", HashVersion::V1, 0.652)]
    #[test_case("asdf", "8952klfjas09ujkasdf", HashVersion::V1, 0.335)]
    #[test_case("", "123", HashVersion::V1, 0.011)]
    #[test_case("", "a", HashVersion::V2, 0.0216)]
    #[test_case("", "b", HashVersion::V2, 0.9054)]
    #[test_case("b", "a", HashVersion::V2, 0.665)]
    #[test_case("ef", "d", HashVersion::V2, 0.8601)]
    #[test_case("asdf", "8952klfjas09ujkasdf", HashVersion::V2, 0.5491)]
    #[test_case("seed", "😊", HashVersion::V2, 0.2404; "hashes utf16 code units")]
    #[test_case("rollout-seed", "user-1462", HashVersion::V2, 0.73)]
    #[test_case("exp-seed", "user-10895", HashVersion::V2, 0.2)]
    fn golden_vectors(seed: &str, value: &str, version: HashVersion, expected: f64) {
        assert_eq!(hash(seed, value, version), expected);
    }

    #[test]
    fn versions_are_not_interchangeable() {
        assert_ne!(
            hash("", "a", HashVersion::V1),
            hash("", "a", HashVersion::V2)
        );
    }

    #[test]
    fn parses_hash_version() {
        let version: HashVersion = serde_json::from_str("2").expect("should parse");
        assert_that!(version).is_equal_to(HashVersion::V2);
        assert_that!(serde_json::from_str::<HashVersion>("3")).is_err();
        assert_that!(serde_json::to_string(&HashVersion::V1).unwrap()).is_equal_to("1".to_string());
    }

    #[test]
    fn namespace_uses_prefixed_seed() {
        // hash("__ns", "user-1", 1) == 0.709
        let namespace = Namespace {
            enabled: true,
            name: "ns".into(),
            range: (0.7, 0.8),
        };
        assert!(namespace.contains("user-1"));

        let namespace = Namespace {
            range: (0.0, 0.709),
            ..namespace
        };
        assert!(!namespace.contains("user-1"), "range end is exclusive");

        let namespace = Namespace {
            enabled: false,
            ..namespace
        };
        assert!(namespace.contains("user-1"));
    }

    #[test]
    fn parses_namespace() {
        let namespace: Namespace =
            serde_json::from_str(r#"{"name": "pricing", "range": [0, 0.5]}"#)
                .expect("should parse");
        assert_that!(namespace).is_equal_to(Namespace {
            enabled: true,
            name: "pricing".into(),
            range: (0.0, 0.5),
        });
    }

    proptest! {
        #[test]
        fn hash_is_in_unit_interval(seed in ".*", value in ".*", version: HashVersion) {
            let h = hash(&seed, &value, version);
            prop_assert!((0.0..1.0).contains(&h));
        }

        #[test]
        fn hash_is_deterministic(seed in ".*", value in ".*", version: HashVersion) {
            prop_assert_eq!(hash(&seed, &value, version), hash(&seed, &value, version));
        }
    }
}
