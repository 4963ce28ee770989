//! Splitting of bulk ranges into schedulable pieces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::range::TagRange;

/// How finely a bulk range is split before its pieces run element by element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "GrainRepr", into = "GrainRepr")]
pub enum Grain {
    /// `original_size / workers / 4`, at least 1.
    #[default]
    Auto,
    /// Split until pieces hold at most this many elements.
    Fixed(usize),
    /// Never split; the whole range runs as one piece.
    Never,
}

impl Grain {
    /// Resolves the grain for a range of `original` elements on `workers` threads.
    pub fn resolve(self, original: usize, workers: usize) -> usize {
        match self {
            Grain::Auto => (original / workers.max(1) / 4).max(1),
            Grain::Fixed(n) => n.max(1),
            Grain::Never => usize::MAX,
        }
    }
}

impl FromStr for Grain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Grain::Auto),
            "never" => Ok(Grain::Never),
            other => other
                .parse::<usize>()
                .map(Grain::Fixed)
                .map_err(|_| format!("expected 'auto', 'never' or a size, got '{}'", s)),
        }
    }
}

impl fmt::Display for Grain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grain::Auto => f.write_str("auto"),
            Grain::Fixed(n) => write!(f, "{}", n),
            Grain::Never => f.write_str("never"),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum GrainRepr {
    Size(usize),
    Word(String),
}

impl TryFrom<GrainRepr> for Grain {
    type Error = String;

    fn try_from(repr: GrainRepr) -> Result<Self, Self::Error> {
        match repr {
            GrainRepr::Size(n) => Ok(Grain::Fixed(n)),
            GrainRepr::Word(w) => w.parse(),
        }
    }
}

impl From<Grain> for GrainRepr {
    fn from(grain: Grain) -> Self {
        match grain {
            Grain::Fixed(n) => GrainRepr::Size(n),
            other => GrainRepr::Word(other.to_string()),
        }
    }
}

/// One step of a recursive split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divided<R> {
    /// Piece handed off to run independently.
    pub split_off: Option<R>,
    /// What the caller keeps.
    pub remainder: R,
    /// Whether `remainder` is still worth splitting.
    pub more: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Partitioner {
    grain: Grain,
    workers: usize,
}

impl Partitioner {
    pub fn new(grain: Grain, workers: usize) -> Self {
        Partitioner {
            grain,
            workers: workers.max(1),
        }
    }

    pub fn grain(&self) -> Grain {
        self.grain
    }

    /// Concrete grain size for a range that started with `original` elements.
    pub fn grain_for(&self, original: usize) -> usize {
        self.grain.resolve(original, self.workers)
    }

    /// Splits `range` in half if it is larger than `grain`; the upper half is
    /// split off.
    pub fn divide<R: TagRange>(&self, range: R, grain: usize) -> Divided<R> {
        let size = range.size();
        if size <= grain || size < 2 {
            return Divided {
                split_off: None,
                remainder: range,
                more: false,
            };
        }
        let (lower, upper) = range.split_at(size / 2);
        let more = lower.size() > grain && lower.size() >= 2;
        Divided {
            split_off: Some(upper),
            remainder: lower,
            more,
        }
    }

    /// Splits `range` all the way down, returning the leaves in range order.
    pub fn leaves<R: TagRange>(&self, range: R) -> Vec<R> {
        let grain = self.grain_for(range.size());
        let mut out = Vec::new();
        let mut stack = vec![range];
        while let Some(piece) = stack.pop() {
            let divided = self.divide(piece, grain);
            match divided.split_off {
                Some(upper) => {
                    stack.push(upper);
                    stack.push(divided.remainder);
                }
                None => out.push(divided.remainder),
            }
        }
        out
    }
}
