use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// The I/O sorting strategy applied before issuing prefetch requests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SortStrategy {
    /// Do not sort. Useful on flash where seeks are free.
    None,

    /// Sort by file path only. Useful for network filesystems.
    Path,

    /// Sort by inode number. Does less house-keeping I/O than the next
    /// option.
    Inode,

    /// Sort by on-disk block. Most sophisticated, and useful for most local
    /// Linux filesystems.
    #[default]
    Block,
}

impl SortStrategy {
    fn from_index(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Path),
            2 => Some(Self::Inode),
            3 => Some(Self::Block),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Path => "path",
            Self::Inode => "inode",
            Self::Block => "block",
        }
    }
}

impl Serialize for SortStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

// Accepts both the historic numeric form (0..=3) and the named form.
impl<'de> Deserialize<'de> for SortStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = SortStrategy;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("0..=3 or one of \"none\", \"path\", \"inode\", \"block\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<SortStrategy, E> {
                SortStrategy::from_index(value)
                    .ok_or_else(|| E::custom(format!("invalid sort strategy: {value}")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<SortStrategy, E> {
                u64::try_from(value)
                    .ok()
                    .and_then(SortStrategy::from_index)
                    .ok_or_else(|| E::custom(format!("invalid sort strategy: {value}")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<SortStrategy, E> {
                match value {
                    "none" => Ok(SortStrategy::None),
                    "path" => Ok(SortStrategy::Path),
                    "inode" => Ok(SortStrategy::Inode),
                    "block" => Ok(SortStrategy::Block),
                    other => Err(E::custom(format!("invalid sort strategy: {other:?}"))),
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Wrapper {
        sortstrategy: SortStrategy,
    }

    #[test]
    fn accepts_numeric_form() {
        let w: Wrapper = toml_edit::de::from_str("sortstrategy = 1").unwrap();
        assert_eq!(w.sortstrategy, SortStrategy::Path);
    }

    #[test]
    fn accepts_named_form() {
        let w: Wrapper = toml_edit::de::from_str("sortstrategy = \"inode\"").unwrap();
        assert_eq!(w.sortstrategy, SortStrategy::Inode);
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(toml_edit::de::from_str::<Wrapper>("sortstrategy = 7").is_err());
    }
}
