//! Source identification type.

use std::str::FromStr;

use crate::MixerError;

/// Identifies one of the three fixed source roles.
///
/// The wire name (`stream`, `cast`, `tv`) is what appears in published topics
/// and inbound command names.
///
/// # Example
///
/// ```
/// use media_bridge::SourceKind;
///
/// let kind: SourceKind = "cast".parse().unwrap();
/// assert_eq!(kind, SourceKind::Cast);
/// assert_eq!(kind.to_string(), "cast");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// Streaming client (spotifyd-style Connect endpoint).
    Stream,
    /// Wireless-cast receiver (shairport-sync-style).
    Cast,
    /// Television digital audio input.
    Tv,
}

impl SourceKind {
    /// All source kinds, in publication order.
    pub const ALL: [SourceKind; 3] = [Self::Stream, Self::Cast, Self::Tv];

    /// Returns the wire name of this source.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Cast => "cast",
            Self::Tv => "tv",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = MixerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" | "spotify" => Ok(Self::Stream),
            "cast" | "airplay" => Ok(Self::Cast),
            "tv" | "television" => Ok(Self::Tv),
            _ => Err(MixerError::unknown_source(s)),
        }
    }
}

impl AsRef<str> for SourceKind {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trip_names() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_source_kind_aliases() {
        assert_eq!("Spotify".parse::<SourceKind>().unwrap(), SourceKind::Stream);
        assert_eq!("airplay".parse::<SourceKind>().unwrap(), SourceKind::Cast);
        assert_eq!(" television ".parse::<SourceKind>().unwrap(), SourceKind::Tv);
    }

    #[test]
    fn test_source_kind_unknown() {
        let err = "radio".parse::<SourceKind>().unwrap_err();
        assert!(matches!(err, MixerError::UnknownSource { ref name } if name == "radio"));
    }

    #[test]
    fn test_source_kind_display() {
        assert_eq!(format!("{}", SourceKind::Tv), "tv");
        assert_eq!(SourceKind::Stream.as_ref(), "stream");
    }
}
