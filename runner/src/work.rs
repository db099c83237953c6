use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("'{0}' is not a <n>_<k> token")]
    Token(String),
    #[error("'{0}' does not follow the uni_<n>_<kmin>_<kmax>.txt naming")]
    OutputName(String),
    #[error("Request is missing the '{0}' section")]
    MissingSection(&'static str),
    #[error("Request section '{section}' holds an invalid value '{value}'")]
    InvalidSection {
        section: &'static str,
        value: String,
    },
    #[error("Processing mode '{0}' is not supported")]
    UnsupportedMode(String),
}

/// Strictly parse a non-negative decimal, rejecting signs and whitespace
pub fn parse_number(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        None
    } else {
        value.parse().ok()
    }
}

/// One unit of approximation work, the angle `2πk/n`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkId {
    pub n: u64,
    pub k: u64,
}

impl WorkId {
    pub fn new(n: u64, k: u64) -> Self {
        Self { n, k }
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.n, self.k)
    }
}

impl FromStr for WorkId {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        token
            .split_once('_')
            .and_then(|(n, k)| Some(Self::new(parse_number(n)?, parse_number(k)?)))
            .ok_or_else(|| ParseError::Token(token.to_owned()))
    }
}

/// Half-open span `[kmin, kmax)` of k values for a fixed n, walked with `step`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub n: u64,
    pub kmin: u64,
    pub kmax: u64,
    pub step: u64,
}

impl Range {
    pub fn new(n: u64, kmin: u64, kmax: u64, step: u64) -> Self {
        Self {
            n,
            kmin,
            kmax,
            step: step.max(1),
        }
    }

    /// number of ids owned by the range
    pub fn len(&self) -> u64 {
        if self.kmax <= self.kmin {
            0
        } else {
            (self.kmax - self.kmin).div_ceil(self.step)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = WorkId> {
        let n = self.n;

        (self.kmin..self.kmax)
            .step_by(self.step as usize)
            .map(move |k| WorkId::new(n, k))
    }

    /// Shared stem of every artifact belonging to the range.
    /// Single-id jobs drop the upper bound: `8_3` instead of `8_3_5`.
    pub fn stem(&self, single: bool) -> String {
        if single {
            format!("{}_{}", self.n, self.kmin)
        } else {
            format!("{}_{}_{}", self.n, self.kmin, self.kmax)
        }
    }

    pub fn output_name(&self, single: bool) -> String {
        format!("uni_{}.txt", self.stem(single))
    }

    /// Recover a range from an output file name, either `uni_<n>_<kmin>_<kmax>.txt`
    /// or the single-id form `uni_<n>_<k>.txt`
    pub fn parse_output_name(name: &str, step: u64) -> Result<Self, ParseError> {
        let invalid = || ParseError::OutputName(name.to_owned());
        let core = name
            .strip_prefix("uni_")
            .and_then(|rest| rest.strip_suffix(".txt"))
            .ok_or_else(invalid)?;
        let fields = core
            .split('_')
            .map(parse_number)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(invalid)?;

        match fields.as_slice() {
            [n, kmin, kmax] => Ok(Self::new(*n, *kmin, *kmax, step)),
            [n, k] => {
                let kmax = k.checked_add(step.max(1)).ok_or_else(invalid)?;

                Ok(Self::new(*n, *k, kmax, step))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n={} [{}, {})", self.n, self.kmin, self.kmax)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    #[test]
    fn work_id_tokens() {
        assert_eq!("8_3".parse::<WorkId>(), Ok(WorkId::new(8, 3)));
        assert_eq!(WorkId::new(2097152, 1021).to_string(), "2097152_1021");

        for malformed in ["8", "8_", "_3", "8_-3", "8_+3", "8_3_5", "a_b", ""] {
            assert!(malformed.parse::<WorkId>().is_err(), "{malformed}");
        }
    }

    #[test]
    fn range_ids_follow_step() {
        let range = Range::new(8, 1, 8, 2);

        assert_eq!(range.len(), 4);
        assert_eq!(range.ids().map(|id| id.k).collect_vec(), vec![1, 3, 5, 7]);
        assert!(Range::new(8, 9, 9, 2).is_empty());
        assert!(Range::new(8, 9, 3, 2).is_empty());
    }

    #[test]
    fn output_names() {
        let range = Range::new(8, 1, 9, 2);

        assert_eq!(range.output_name(false), "uni_8_1_9.txt");
        assert_eq!(Range::new(8, 3, 5, 2).output_name(true), "uni_8_3.txt");

        assert_eq!(Range::parse_output_name("uni_8_1_9.txt", 2), Ok(range));
        assert_eq!(
            Range::parse_output_name("uni_8_3.txt", 2),
            Ok(Range::new(8, 3, 5, 2))
        );
    }

    #[test]
    fn malformed_output_names() {
        for name in [
            "uni_8_1_x.txt",
            "uni_8_1_9_11.txt",
            "uni_8.txt",
            "uni_8_-1_9.txt",
            "uni__1_9.txt",
            "out_8_1_9.txt",
            "uni_8_1_9.dat",
        ] {
            assert_eq!(
                Range::parse_output_name(name, 2),
                Err(ParseError::OutputName(name.to_owned()))
            );
        }
    }
}
