//! Configuration structures for setting up a [`Vision`] or [`SegaroStream`].
//!
//! Every knob is a [`SizeRange`]: an inclusive `min-max` range from which the
//! engines sample uniformly. A range whose `min` or `max` is zero is
//! disabled.
//!
//! To build a config, you should make three decisions in order:
//!
//! 1. The padding block size and the sub-chunk size. Each sub-chunk of at
//!    most `subchunk_size` payload bytes is preceded by `padding_size` random
//!    bytes. Zero for either disables padding.
//! 2. The split size range. Padded payloads are cut into pieces whose length
//!    is drawn from this range, and the initiator's first chunk is inflated to
//!    fall within it.
//!
//!    A receiver recognizes a padded handshake record by the record prefix in
//!    the first sub-chunk of its first piece, so enabled sub-chunk sizes and
//!    split sizes must hold at least three bytes. Smaller values are rejected
//!    with a [`ConfigError`].
//! 3. The decoy ranges for each role: how many decoy packets follow a
//!    handshake record, and how large each one is.
//!
//! Both endpoints must use the same configuration, otherwise they will not be
//! able to parse each other's padding or validate each other's decoys.
//!
//! # Example
//!
//! ```
//! use segaro::config::{Config, DecoyRanges, SizeRange};
//!
//! let config = Config::builder_with_padding(16, 64)
//!     .unwrap()
//!     .with_split_size("200-300".parse().unwrap())
//!     .unwrap()
//!     .with_decoys(
//!         DecoyRanges::parse("50-100", "1-3").unwrap(),
//!         DecoyRanges::parse("30-60", "1-2").unwrap(),
//!     );
//!
//! assert_eq!(config.split_size(), SizeRange::new(200, 300).unwrap());
//! ```
//!
//! [`Vision`]: crate::Vision
//! [`SegaroStream`]: crate::SegaroStream
use core::{
    error,
    fmt::{Display, Formatter},
    num::ParseIntError,
    str::FromStr,
};

use rand::Rng;

use crate::{binding::Role, specification::HANDSHAKE_PREFIX_LEN};

/// An inclusive range of sizes or counts, written as `"min-max"` or `"n"`.
///
/// The empty string parses to the disabled range `0-0`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct SizeRange {
    min: u32,
    max: u32,
}

impl SizeRange {
    /// The disabled range `0-0`.
    pub const DISABLED: Self = Self { min: 0, max: 0 };

    /// Creates a range, rejecting `min > max`.
    pub fn new(min: u32, max: u32) -> Result<Self, ParseRangeError> {
        if min > max {
            return Err(ParseRangeError::Inverted { min, max });
        }
        Ok(Self { min, max })
    }

    /// Creates a range holding exactly `n`.
    pub fn exact(n: u32) -> Self {
        Self { min: n, max: n }
    }

    /// Lower bound.
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// A range is enabled when both bounds are non-zero.
    pub fn is_enabled(&self) -> bool {
        self.min != 0 && self.max != 0
    }

    /// Returns `true` if `n` falls within the range.
    pub fn contains(&self, n: u32) -> bool {
        (self.min..=self.max).contains(&n)
    }

    pub(crate) fn sample<R: Rng>(&self, rng: &mut R) -> u32 {
        rng.random_range(self.min..=self.max)
    }
}

impl FromStr for SizeRange {
    type Err = ParseRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::DISABLED);
        }
        match s.split_once('-') {
            Some((min, max)) => {
                let min = min.trim().parse().map_err(ParseRangeError::InvalidNumber)?;
                let max = max.trim().parse().map_err(ParseRangeError::InvalidNumber)?;
                Self::new(min, max)
            }
            None => s
                .parse()
                .map(Self::exact)
                .map_err(ParseRangeError::InvalidNumber),
        }
    }
}

impl Display for SizeRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// An error returned when parsing a [`SizeRange`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseRangeError {
    /// One of the bounds is not a valid unsigned integer.
    InvalidNumber(ParseIntError),

    /// The lower bound exceeds the upper bound.
    Inverted {
        /// Parsed lower bound.
        min: u32,
        /// Parsed upper bound.
        max: u32,
    },
}

impl Display for ParseRangeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ParseRangeError::InvalidNumber(e) => write!(f, "InvalidNumber: {}", e),
            ParseRangeError::Inverted { min, max } => {
                write!(f, "Inverted: min {} exceeds max {}", min, max)
            }
        }
    }
}

impl error::Error for ParseRangeError {}

/// An error returned when a [`ConfigBuilder`] step is given sizes the
/// receiver could not parse back.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum ConfigError {
    /// Padding is enabled but a sub-chunk cannot hold a handshake record
    /// prefix.
    SubchunkTooSmall {
        /// The rejected sub-chunk size.
        subchunk_size: u32,
    },

    /// Splitting is enabled but a piece can be shorter than a handshake
    /// record prefix.
    SplitTooSmall {
        /// The rejected lower bound.
        min: u32,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::SubchunkTooSmall { subchunk_size } => write!(
                f,
                "SubchunkTooSmall: {} bytes, minimum {}",
                subchunk_size, HANDSHAKE_PREFIX_LEN
            ),
            ConfigError::SplitTooSmall { min } => write!(
                f,
                "SplitTooSmall: {} bytes, minimum {}",
                min, HANDSHAKE_PREFIX_LEN
            ),
        }
    }
}

impl error::Error for ConfigError {}

/// The decoy ranges of one role: the size of each decoy packet and the number
/// of packets in a burst.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct DecoyRanges {
    /// Size of each decoy packet in bytes.
    pub size: SizeRange,
    /// Number of decoy packets in a burst.
    pub count: SizeRange,
}

impl DecoyRanges {
    /// Decoys disabled.
    pub const DISABLED: Self = Self {
        size: SizeRange::DISABLED,
        count: SizeRange::DISABLED,
    };

    /// Parses a size range and a count range.
    pub fn parse(size: &str, count: &str) -> Result<Self, ParseRangeError> {
        Ok(Self {
            size: size.parse()?,
            count: count.parse()?,
        })
    }

    /// Decoys are sent only when both ranges are enabled.
    pub fn is_enabled(&self) -> bool {
        self.size.is_enabled() && self.count.is_enabled()
    }
}

/// Configuration structure for setting up a [`Vision`] or [`SegaroStream`].
///
/// For details on constructing and configuring `config`, refer to
/// the [`config`] module.
///
/// [`config`]: crate::config
/// [`Vision`]: crate::Vision
/// [`SegaroStream`]: crate::SegaroStream
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Config {
    pub(crate) padding_size: u32,
    pub(crate) subchunk_size: u32,
    pub(crate) split_size: SizeRange,
    pub(crate) server_decoys: DecoyRanges,
    pub(crate) client_decoys: DecoyRanges,
}

/// A builder for creating a [`Config`] instance.
///
/// To get a [`ConfigBuilder`], use [`Config::builder_with_padding`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConfigBuilder<State> {
    state: State,
}

impl Config {
    /// Sets up the padding block size and the sub-chunk size.
    ///
    /// Passing zero for either disables padding. With padding enabled,
    /// `subchunk_size` must be at least 3.
    pub fn builder_with_padding(
        padding_size: u32,
        subchunk_size: u32,
    ) -> Result<ConfigBuilder<WantsSplit>, ConfigError> {
        let padded = padding_size != 0 && subchunk_size != 0;
        if padded && (subchunk_size as usize) < HANDSHAKE_PREFIX_LEN {
            return Err(ConfigError::SubchunkTooSmall { subchunk_size });
        }
        Ok(ConfigBuilder {
            state: WantsSplit {
                padding_size,
                subchunk_size,
            },
        })
    }

    /// Size of the random block in front of every sub-chunk.
    pub fn padding_size(&self) -> u32 {
        self.padding_size
    }

    /// Maximum payload bytes per sub-chunk.
    pub fn subchunk_size(&self) -> u32 {
        self.subchunk_size
    }

    /// Range for piece lengths and first-chunk inflation.
    pub fn split_size(&self) -> SizeRange {
        self.split_size
    }

    /// Returns `true` if both padding parameters are non-zero.
    pub fn is_padding_enabled(&self) -> bool {
        self.padding_size != 0 && self.subchunk_size != 0
    }

    /// The decoy ranges used by the endpoint playing `role` when it sends.
    pub fn decoys(&self, role: Role) -> DecoyRanges {
        match role {
            Role::Responder => self.server_decoys,
            Role::Initiator => self.client_decoys,
        }
    }
}

impl ConfigBuilder<WantsSplit> {
    /// Sets up the split size range.
    ///
    /// An enabled range must not go below 3.
    pub fn with_split_size(
        self,
        split_size: SizeRange,
    ) -> Result<ConfigBuilder<WantsDecoys>, ConfigError> {
        if split_size.is_enabled() && (split_size.min() as usize) < HANDSHAKE_PREFIX_LEN {
            return Err(ConfigError::SplitTooSmall {
                min: split_size.min(),
            });
        }
        Ok(self.into_wants_decoys(split_size))
    }

    /// Do not split payloads and do not inflate the first chunk.
    pub fn without_split(self) -> ConfigBuilder<WantsDecoys> {
        self.into_wants_decoys(SizeRange::DISABLED)
    }

    fn into_wants_decoys(self, split_size: SizeRange) -> ConfigBuilder<WantsDecoys> {
        ConfigBuilder {
            state: WantsDecoys {
                padding_size: self.state.padding_size,
                subchunk_size: self.state.subchunk_size,
                split_size,
            },
        }
    }
}

impl ConfigBuilder<WantsDecoys> {
    /// Sets up the decoy ranges of the responder (`server`) and the
    /// initiator (`client`).
    pub fn with_decoys(self, server: DecoyRanges, client: DecoyRanges) -> Config {
        Config {
            padding_size: self.state.padding_size,
            subchunk_size: self.state.subchunk_size,
            split_size: self.state.split_size,
            server_decoys: server,
            client_decoys: client,
        }
    }

    /// No decoys in either direction.
    pub fn without_decoys(self) -> Config {
        self.with_decoys(DecoyRanges::DISABLED, DecoyRanges::DISABLED)
    }
}

/// Config builder state where the caller must supply a split size range.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsSplit {
    padding_size: u32,
    subchunk_size: u32,
}

/// Config builder state where the caller must supply decoy ranges.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct WantsDecoys {
    padding_size: u32,
    subchunk_size: u32,
    split_size: SizeRange,
}

#[cfg(test)]
mod test {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!("50-100".parse::<SizeRange>(), SizeRange::new(50, 100));
        assert_eq!("7".parse::<SizeRange>(), Ok(SizeRange::exact(7)));
        assert_eq!(" 1 - 3 ".parse::<SizeRange>(), SizeRange::new(1, 3));
        assert_eq!("".parse::<SizeRange>(), Ok(SizeRange::DISABLED));
    }

    #[test]
    fn test_parse_range_rejects_garbage() {
        assert!(matches!(
            "abc".parse::<SizeRange>(),
            Err(ParseRangeError::InvalidNumber(_))
        ));
        assert!(matches!(
            "5-x".parse::<SizeRange>(),
            Err(ParseRangeError::InvalidNumber(_))
        ));
        assert_eq!(
            "9-3".parse::<SizeRange>(),
            Err(ParseRangeError::Inverted { min: 9, max: 3 })
        );
    }

    #[test]
    fn test_range_display_matches_parse() {
        assert_eq!(SizeRange::new(50, 100).unwrap().to_string(), "50-100");
        assert_eq!(SizeRange::exact(64).to_string(), "64");
    }

    #[test]
    fn test_zero_bound_disables() {
        assert!(!SizeRange::new(0, 10).unwrap().is_enabled());
        assert!(!SizeRange::DISABLED.is_enabled());
        assert!(SizeRange::new(1, 10).unwrap().is_enabled());
        assert!(!DecoyRanges::parse("50-100", "0").unwrap().is_enabled());
    }

    #[test]
    fn test_sample_stays_in_range() {
        let mut rng = StdRng::from_seed([3u8; 32]);
        let range = SizeRange::new(200, 300).unwrap();
        for _ in 0..1000 {
            assert!(range.contains(range.sample(&mut rng)));
        }
    }

    #[test]
    fn test_decoys_by_role() {
        let server = DecoyRanges::parse("50-100", "1-3").unwrap();
        let client = DecoyRanges::parse("10-20", "2").unwrap();
        let config = Config::builder_with_padding(16, 64)
            .unwrap()
            .without_split()
            .with_decoys(server, client);
        assert_eq!(config.decoys(Role::Responder), server);
        assert_eq!(config.decoys(Role::Initiator), client);
        assert!(config.is_padding_enabled());
    }

    #[test]
    fn test_sizes_below_record_prefix_rejected() {
        assert_eq!(
            Config::builder_with_padding(8, 1),
            Err(ConfigError::SubchunkTooSmall { subchunk_size: 1 })
        );
        assert_eq!(
            Config::builder_with_padding(8, 2),
            Err(ConfigError::SubchunkTooSmall { subchunk_size: 2 })
        );
        // nothing to parse back when padding is off
        assert!(Config::builder_with_padding(0, 1).is_ok());
        assert!(Config::builder_with_padding(8, 3).is_ok());

        let builder = Config::builder_with_padding(8, 32).unwrap();
        assert_eq!(
            builder.clone().with_split_size(SizeRange::new(2, 100).unwrap()),
            Err(ConfigError::SplitTooSmall { min: 2 })
        );
        let disabled = SizeRange::new(0, 100).unwrap();
        assert!(builder.clone().with_split_size(disabled).is_ok());
        assert!(builder.with_split_size(SizeRange::exact(3)).is_ok());
    }
}
