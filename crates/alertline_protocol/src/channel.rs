//! Channel addressing.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Identifier of a subscription channel.
///
/// Channel ids are opaque strings that stay stable across sessions. Ids
/// derived from an event are `area + "_" + type`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Creates a channel id from an opaque string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the channel id for an area and event type.
    pub fn from_parts(area: &str, event_type: &str) -> Self {
        Self(format!("{area}_{event_type}"))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ChannelId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A subscription filter selecting one area and event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Filter {
    /// Area (site, zone, or district) the events belong to.
    pub area: String,
    /// Event type within the area.
    pub event_type: String,
}

impl Filter {
    /// Creates a filter.
    pub fn new(area: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            event_type: event_type.into(),
        }
    }

    /// Parses `area:type` notation.
    ///
    /// ```rust
    /// use alertline_protocol::Filter;
    ///
    /// let filter = Filter::parse("giridih:id").unwrap();
    /// assert_eq!(filter.channel_id().as_str(), "giridih_id");
    /// assert!(Filter::parse("no-separator").is_none());
    /// ```
    pub fn parse(spec: &str) -> Option<Self> {
        let (area, event_type) = spec.split_once(':')?;
        if area.is_empty() || event_type.is_empty() {
            return None;
        }
        Some(Self::new(area, event_type))
    }

    /// Returns the channel this filter subscribes to.
    pub fn channel_id(&self) -> ChannelId {
        ChannelId::from_parts(&self.area, &self.event_type)
    }
}
