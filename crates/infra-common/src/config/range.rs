use std::fmt;

/// Inclusive numeric range, written `min-max` in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: u32,
    pub max: u32,
}

impl Range {
    pub const fn new(min: u32, max: u32) -> Self {
        Range { min, max }
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    /// Number of values covered by the range
    pub fn size(&self) -> u32 {
        self.max.saturating_sub(self.min).saturating_add(1)
    }

    pub(crate) fn parse(value: &str) -> Option<Range> {
        let value = value.trim();
        let (min, max) = match value.split_once('-') {
            Some((lo, hi)) => (lo.trim().parse().ok()?, hi.trim().parse().ok()?),
            None => {
                let v = value.parse().ok()?;
                (v, v)
            }
        };
        if min > max {
            return None;
        }
        Some(Range { min, max })
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(Range::parse("1024-49152"), Some(Range::new(1024, 49152)));
        assert_eq!(Range::parse(" 5 - 10 "), Some(Range::new(5, 10)));
        assert_eq!(Range::parse("7"), Some(Range::new(7, 7)));
        assert_eq!(Range::parse("10-5"), None);
        assert_eq!(Range::parse("a-b"), None);
    }

    #[test]
    fn test_contains_and_size() {
        let r = Range::new(5, 10);
        assert!(r.contains(5));
        assert!(r.contains(10));
        assert!(!r.contains(11));
        assert_eq!(r.size(), 6);
        assert_eq!(r.to_string(), "5-10");
    }
}
