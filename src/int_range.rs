use anyhow::{bail, Context};

/// A range of 1-based chapter numbers, possibly open on either side.
#[derive(PartialEq, Clone, Default)]
pub struct IntRange {
    start: Option<u32>,
    end: Option<u32>,
    end_inclusive: bool,
}

impl IntRange {
    /// Checks to see if the given value is within the given range and returns true if it is.
    pub fn contains(&self, value: &u32) -> bool {
        match (self.start, self.end, self.end_inclusive) {
            (None, None, _) => true,
            (None, Some(end), true) => value <= &end,
            (None, Some(end), false) => value < &end,
            (Some(start), None, _) => value >= &start,
            (Some(start), Some(end), true) => value >= &start && value <= &end,
            (Some(start), Some(end), false) => value >= &start && value < &end,
        }
    }

    #[cfg(test)]
    fn new(start: Option<u32>, end: Option<u32>, end_inclusive: bool) -> Self {
        Self {
            start,
            end,
            end_inclusive,
        }
    }
}

impl std::fmt::Debug for IntRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |n: Option<u32>| n.map(|n| n.to_string()).unwrap_or_default();
        match (self.start, self.end, self.end_inclusive) {
            (Some(start), Some(end), true) if start == end => write!(f, "{start}"),
            (start, end, inclusive) => write!(
                f,
                "{}..{}{}",
                show(start),
                if inclusive { "=" } else { "" },
                show(end)
            ),
        }
    }
}

fn bound(s: &str, what: &'static str) -> anyhow::Result<Option<u32>> {
    if s.is_empty() {
        Ok(None)
    } else {
        Ok(Some(s.trim().parse::<u32>().context(what)?))
    }
}

impl std::str::FromStr for IntRange {
    type Err = anyhow::Error;

    /// Accepts `5`, `1-5` (inclusive), `3-`, and the rust forms `1..5`,
    /// `1..=5`, `3..`, `..5`, `..=5` and `..`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            bail!("Empty range");
        }

        if let Some((start, end)) = s.split_once("..") {
            let (end, end_inclusive) = match end.strip_prefix('=') {
                Some(end) => (end, true),
                None => (end, false),
            };
            return Ok(Self {
                start: bound(start, "Invalid start value")?,
                end: bound(end, "Invalid end value")?,
                end_inclusive,
            });
        }

        if let Some((start, end)) = s.split_once('-') {
            if start.is_empty() {
                bail!("Invalid start value");
            }
            return Ok(Self {
                start: bound(start, "Invalid start value")?,
                end: bound(end, "Invalid end value")?,
                end_inclusive: true,
            });
        }

        let unit = bound(s, "Invalid chapter number")?;
        Ok(Self {
            start: unit,
            end: unit,
            end_inclusive: true,
        })
    }
}

/// Comma separated [`IntRange`]s, e.g. `1-5,7,10..`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChapterSelection(Vec<IntRange>);

impl ChapterSelection {
    /// 0-based positions of the selected chapters out of `count`, ascending
    /// and without repeats. An empty selection picks everything.
    pub fn indices(&self, count: usize) -> Vec<usize> {
        (0..count)
            .filter(|i| {
                let number = (*i as u32).saturating_add(1);
                self.0.is_empty() || self.0.iter().any(|range| range.contains(&number))
            })
            .collect()
    }
}

impl std::str::FromStr for ChapterSelection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<IntRange>()
                    .with_context(|| format!("Invalid chapter range {part:?}"))
            })
            .collect::<anyhow::Result<Vec<_>>>()
            .map(ChapterSelection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parse_rust_ranges() -> anyhow::Result<()> {
        assert_eq!(
            IntRange::from_str("5..10")?,
            IntRange::new(Some(5), Some(10), false)
        );
        assert_eq!(
            IntRange::from_str("0..=100")?,
            IntRange::new(Some(0), Some(100), true)
        );
        assert_eq!(
            IntRange::from_str("..=10")?,
            IntRange::new(None, Some(10), true)
        );
        assert_eq!(IntRange::from_str("..")?, IntRange::new(None, None, false));
        Ok(())
    }

    #[test]
    fn parse_dash_ranges() -> anyhow::Result<()> {
        assert_eq!(
            IntRange::from_str("1-5")?,
            IntRange::new(Some(1), Some(5), true)
        );
        assert_eq!(IntRange::from_str("7-")?, IntRange::new(Some(7), None, true));
        assert!(IntRange::from_str("1-5")?.contains(&5));
        Ok(())
    }

    #[test]
    fn parse_unit() -> anyhow::Result<()> {
        assert_eq!(
            IntRange::from_str("10")?,
            IntRange::new(Some(10), Some(10), true)
        );
        assert!(IntRange::from_str("10")?.contains(&10));
        assert!(!IntRange::from_str("10")?.contains(&11));
        Ok(())
    }

    #[test]
    fn invalid_values() {
        assert_eq!(
            IntRange::from_str("a..10").err().unwrap().to_string(),
            "Invalid start value"
        );
        assert_eq!(
            IntRange::from_str("..a").err().unwrap().to_string(),
            "Invalid end value"
        );
        assert_eq!(
            IntRange::from_str("-3").err().unwrap().to_string(),
            "Invalid start value"
        );
        assert_eq!(
            IntRange::from_str("x").err().unwrap().to_string(),
            "Invalid chapter number"
        );
    }

    #[test]
    fn debug_round_trips_the_syntax() {
        assert_eq!(format!("{:?}", IntRange::new(Some(3), Some(3), true)), "3");
        assert_eq!(format!("{:?}", IntRange::new(Some(1), Some(5), true)), "1..=5");
        assert_eq!(format!("{:?}", IntRange::new(None, Some(5), false)), "..5");
    }

    #[test]
    fn selection_picks_sorted_unique_indices() -> anyhow::Result<()> {
        let selection = ChapterSelection::from_str("1-5,7-10")?;
        assert_eq!(selection.indices(12), vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);

        let overlapping = ChapterSelection::from_str("4, 2-5 ,3")?;
        assert_eq!(overlapping.indices(10), vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn selection_drops_out_of_range_chapters() -> anyhow::Result<()> {
        let selection = ChapterSelection::from_str("0,2,8..")?;
        assert_eq!(selection.indices(3), vec![1]);
        Ok(())
    }

    #[test]
    fn empty_selection_is_everything() -> anyhow::Result<()> {
        assert_eq!(ChapterSelection::from_str("")?.indices(3), vec![0, 1, 2]);
        assert_eq!(ChapterSelection::default().indices(2), vec![0, 1]);
        Ok(())
    }

    #[test]
    fn bad_part_names_itself() {
        let err = ChapterSelection::from_str("1,x").err().unwrap();
        assert_eq!(err.to_string(), "Invalid chapter range \"x\"");
    }
}
