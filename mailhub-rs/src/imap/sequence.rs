//! Sequence sets (`1`, `2:4`, `*`, `1,3:*`)

use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqNumber {
    Value(u32),
    /// `*`: the largest number in use
    Last,
}

impl SeqNumber {
    fn resolve(self, last: u32) -> u32 {
        match self {
            SeqNumber::Value(n) => n,
            SeqNumber::Last => last,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSet {
    ranges: Vec<(SeqNumber, SeqNumber)>,
}

impl SequenceSet {
    /// Members that exist in `1..=last`, ascending and without duplicates
    ///
    /// Ranges may be given in either order; numbers beyond `last` are
    /// ignored.
    pub fn resolve(&self, last: u32) -> Vec<u32> {
        if last == 0 {
            return Vec::new();
        }
        let mut members = BTreeSet::new();
        for (start, end) in &self.ranges {
            let a = start.resolve(last);
            let b = end.resolve(last);
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            let low = low.max(1);
            let high = high.min(last);
            if low <= high {
                members.extend(low..=high);
            }
        }
        members.into_iter().collect()
    }

    /// Whether `value` is a member, with `*` standing for `last`
    pub fn contains(&self, value: u32, last: u32) -> bool {
        self.ranges.iter().any(|(start, end)| {
            let a = start.resolve(last);
            let b = end.resolve(last);
            a.min(b) <= value && value <= a.max(b)
        })
    }
}

impl FromStr for SequenceSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = |part: &str| -> Result<SeqNumber, String> {
            if part == "*" {
                return Ok(SeqNumber::Last);
            }
            match part.parse::<u32>() {
                Ok(0) | Err(_) => Err(format!("Invalid sequence number: {}", part)),
                Ok(n) => Ok(SeqNumber::Value(n)),
            }
        };

        let ranges = s
            .split(',')
            .map(|item| match item.split_once(':') {
                Some((start, end)) => Ok((number(start)?, number(end)?)),
                None => {
                    let n = number(item)?;
                    Ok((n, n))
                }
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { ranges })
    }
}
