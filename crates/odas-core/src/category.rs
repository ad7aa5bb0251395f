use std::fmt;

/// Telemetry channel a frame arrived on.
///
/// ODAS writes sound-source tracking (SST) and potential-source detections
/// (SSL) to two independent sockets; every decoded frame carries the
/// category of the socket it came from.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Category {
    Tracking,
    Potential,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Tracking, Category::Potential];

    /// Wire name, used both as the envelope `type` and the status payload key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tracking => "tracking",
            Self::Potential => "potential",
        }
    }

    /// Short tag for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Tracking => "TRACK",
            Self::Potential => "POT",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(Category::Tracking.as_str(), "tracking");
        assert_eq!(Category::Potential.to_string(), "potential");
        assert_eq!(Category::Tracking.label(), "TRACK");
    }

    #[test]
    fn wire_name_matches_message_kind() {
        for category in Category::ALL {
            assert_eq!(
                category.as_str(),
                crate::MessageKind::from(category).as_str()
            );
        }
    }
}
