//! MQTT topic validation, wildcard matching and the relay topic layout
//!
//! Topic filters follow MQTT 3.1.1/5 rules: levels are separated by `/`,
//! `+` matches exactly one level, `#` matches any number of remaining levels
//! (including the parent level) and must be the last level of a filter.
//! Topics starting with `$` are never matched by a leading wildcard.

use thiserror::Error;

pub const LEVEL_SEPARATOR: char = '/';
pub const SINGLE_LEVEL_WILDCARD: &str = "+";
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains a null character: {0:?}")]
    NullCharacter(String),
    #[error("Multi-level wildcard must be the last level: {0}")]
    MisplacedMultiLevelWildcard(String),
    #[error("Wildcard must occupy an entire level: {0}")]
    PartialWildcard(String),
    #[error("Wildcards are not allowed in topic names: {0}")]
    WildcardInTopicName(String),
}

/// Validate a subscription filter
pub fn validate_filter(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::Empty);
    }
    if filter.contains('\0') {
        return Err(TopicError::NullCharacter(filter.to_string()));
    }

    let levels: Vec<&str> = filter.split(LEVEL_SEPARATOR).collect();
    let last = levels.len() - 1;

    for (index, level) in levels.iter().enumerate() {
        match *level {
            MULTI_LEVEL_WILDCARD if index != last => {
                return Err(TopicError::MisplacedMultiLevelWildcard(filter.to_string()));
            }
            MULTI_LEVEL_WILDCARD | SINGLE_LEVEL_WILDCARD => {}
            other if other.contains('#') || other.contains('+') => {
                return Err(TopicError::PartialWildcard(filter.to_string()));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Validate a concrete topic name used for publishing
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter(topic.to_string()));
    }
    if topic.contains('#') || topic.contains('+') {
        return Err(TopicError::WildcardInTopicName(topic.to_string()));
    }
    Ok(())
}

/// Check whether `topic` is matched by the subscription `filter`
///
/// The filter is assumed to be valid (see [`validate_filter`]).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$')
        && (filter.starts_with(SINGLE_LEVEL_WILDCARD) || filter.starts_with(MULTI_LEVEL_WILDCARD))
    {
        return false;
    }

    let mut filter_levels = filter.split(LEVEL_SEPARATOR);
    let mut topic_levels = topic.split(LEVEL_SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL_WILDCARD), _) => return true,
            (Some(SINGLE_LEVEL_WILDCARD), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Topic naming for one relay controller
///
/// Status topics are `{base}/{channel}/{status_suffix}` and command topics
/// `{base}/{channel}/{command_suffix}`. The presence topic is a fixed,
/// device-specific name. Latency pings go to the ping topic and come back
/// on `{ping}/echo`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicLayout {
    base: String,
    presence: String,
    status_suffix: String,
    command_suffix: String,
    ping: String,
}

/// Level appended to the ping topic for replies
const ECHO_LEVEL: &str = "echo";

impl TopicLayout {
    pub fn new(
        base: impl Into<String>,
        presence: impl Into<String>,
        status_suffix: impl Into<String>,
        command_suffix: impl Into<String>,
    ) -> Self {
        let base = base.into().trim_end_matches(LEVEL_SEPARATOR).to_string();
        Self {
            ping: format!("{base}/device/ping"),
            base,
            presence: presence.into(),
            status_suffix: status_suffix.into(),
            command_suffix: command_suffix.into(),
        }
    }

    pub fn with_ping_topic(mut self, ping: impl Into<String>) -> Self {
        self.ping = ping.into();
        self
    }

    pub fn presence_topic(&self) -> &str {
        &self.presence
    }

    pub fn ping_topic(&self) -> &str {
        &self.ping
    }

    pub fn ping_echo_topic(&self) -> String {
        format!("{}/{ECHO_LEVEL}", self.ping)
    }

    /// Filter matching the status topic of every channel: `{base}/+/{status_suffix}`
    pub fn status_filter(&self) -> String {
        format!(
            "{}/{SINGLE_LEVEL_WILDCARD}/{}",
            self.base, self.status_suffix
        )
    }

    pub fn status_topic(&self, channel_id: &str) -> String {
        format!("{}/{channel_id}/{}", self.base, self.status_suffix)
    }

    pub fn command_topic(&self, channel_id: &str) -> String {
        format!("{}/{channel_id}/{}", self.base, self.command_suffix)
    }

    /// Filter matching the command topic of every channel
    pub fn command_filter(&self) -> String {
        format!(
            "{}/{SINGLE_LEVEL_WILDCARD}/{}",
            self.base, self.command_suffix
        )
    }

    /// Extract the channel id from a status topic
    pub fn channel_from_status_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        Self::channel_between(topic, &self.base, &self.status_suffix)
    }

    /// Extract the channel id from a command topic
    pub fn channel_from_command_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        Self::channel_between(topic, &self.base, &self.command_suffix)
    }

    fn channel_between<'a>(topic: &'a str, base: &str, suffix: &str) -> Option<&'a str> {
        let rest = topic.strip_prefix(base)?.strip_prefix(LEVEL_SEPARATOR)?;
        let channel = rest.strip_suffix(suffix)?.strip_suffix(LEVEL_SEPARATOR)?;
        if channel.is_empty() || channel.contains(LEVEL_SEPARATOR) {
            None
        } else {
            Some(channel)
        }
    }
}
