//! Topic filters and the namespace-scoped topic layout.
//!
//! Every database topic lives under `{prefix}db/v1/...`, health under
//! `{prefix}health/v1/db` and shared presentation state under
//! `{prefix}namespaces/v1/{room}/...`. Single-level wildcards (`+`) carry
//! side-channel arguments such as the author, sequence and patch ID of a
//! patch message.

use crate::error::{ProtocolError, ProtocolResult};
use std::fmt;

/// Delivery guarantee requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Delivered at least once.
    AtLeastOnce,
    /// Delivered exactly once.
    ExactlyOnce,
}

/// A topic pattern with optional `+` and trailing `#` wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    pattern: String,
}

impl TopicFilter {
    /// Wraps a pattern.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Returns the pattern.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Returns true if the pattern contains wildcards.
    pub fn has_wildcards(&self) -> bool {
        self.pattern.split('/').any(|s| s == "+" || s == "#")
    }

    /// Returns true if `topic` matches this filter.
    pub fn matches(&self, topic: &str) -> bool {
        self.wildcard_args(topic).is_some()
    }

    /// Returns the values matched by the wildcards of this filter, in order,
    /// or `None` if `topic` does not match. A trailing `#` yields the rest of
    /// the topic as one value.
    pub fn wildcard_args(&self, topic: &str) -> Option<Vec<String>> {
        let mut args = Vec::new();
        let mut pattern = self.pattern.split('/');
        let mut segments = topic.split('/');
        loop {
            match (pattern.next(), segments.next()) {
                (None, None) => return Some(args),
                (Some("#"), Some(first)) => {
                    let mut rest = first.to_string();
                    for s in segments.by_ref() {
                        rest.push('/');
                        rest.push_str(s);
                    }
                    args.push(rest);
                    return Some(args);
                }
                (Some("+"), Some(segment)) => args.push(segment.to_string()),
                (Some(p), Some(segment)) if p == segment => {}
                _ => return None,
            }
        }
    }

    /// Substitutes `args` for the wildcards, producing a publishable topic.
    pub fn render(&self, args: &[&str]) -> ProtocolResult<String> {
        let mut args = args.iter();
        let mut out = Vec::new();
        for segment in self.pattern.split('/') {
            if segment == "+" || segment == "#" {
                let arg = args
                    .next()
                    .ok_or_else(|| ProtocolError::topic(&self.pattern, "not enough arguments"))?;
                if segment == "+" && (arg.is_empty() || arg.contains(['/', '+', '#'])) {
                    return Err(ProtocolError::topic(
                        &self.pattern,
                        format!("invalid segment argument {arg:?}"),
                    ));
                }
                out.push(*arg);
            } else {
                out.push(segment);
            }
        }
        if args.next().is_some() {
            return Err(ProtocolError::topic(&self.pattern, "too many arguments"));
        }
        Ok(out.join("/"))
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// A filter together with how messages on it are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    /// Topic filter.
    pub filter: TopicFilter,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Whether the broker keeps the last message for new subscribers.
    pub retained: bool,
}

impl TopicSpec {
    fn new(pattern: String, qos: QoS, retained: bool) -> Self {
        Self {
            filter: TopicFilter::new(pattern),
            qos,
            retained,
        }
    }
}

/// Topic layout of one namespace, room and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    prefix: String,
    room: String,
    client_id: String,
}

impl Topics {
    /// Creates the layout. `prefix` is used verbatim, so it normally ends
    /// with `/` (or is empty).
    pub fn new(
        prefix: impl Into<String>,
        room: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            room: room.into(),
            client_id: client_id.into(),
        }
    }

    /// Namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Client ID used in request topics.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn patches(&self) -> String {
        format!("{}db/v1/patches", self.prefix)
    }

    fn files(&self) -> String {
        format!("{}db/v1/files/request/{}", self.prefix, self.client_id)
    }

    fn room(&self) -> String {
        format!("{}namespaces/v1/{}", self.prefix, self.room)
    }

    /// Latest patches; arguments are author, sequence and patch ID.
    pub fn latest_patch(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/latest/patch/+/+/+", self.patches()), QoS::ExactlyOnce, false)
    }

    /// Head of the version chain, retained by the broker.
    pub fn latest_version(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/latest/version", self.patches()), QoS::ExactlyOnce, true)
    }

    /// Version proposals, arbitrated into [`Topics::latest_version`].
    pub fn propose_version(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/latest/version/propose", self.patches()), QoS::ExactlyOnce, false)
    }

    /// Rejected patch IDs.
    pub fn latest_reject(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/latest/reject", self.patches()), QoS::ExactlyOnce, false)
    }

    /// Requests for missing sequences sent by this client.
    pub fn request_get(&self) -> TopicSpec {
        TopicSpec::new(
            format!("{}/request/{}/get", self.patches(), self.client_id),
            QoS::ExactlyOnce,
            false,
        )
    }

    /// Requests for missing sequences sent by any client; argument is the client ID.
    pub fn request_get_any(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/request/+/get", self.patches()), QoS::ExactlyOnce, false)
    }

    /// Patches answering this client's requests; arguments as for [`Topics::latest_patch`].
    pub fn request_patch(&self) -> TopicSpec {
        TopicSpec::new(
            format!("{}/request/{}/patch/+/+/+", self.patches(), self.client_id),
            QoS::ExactlyOnce,
            false,
        )
    }

    /// Versions answering this client's requests.
    pub fn request_version(&self) -> TopicSpec {
        TopicSpec::new(
            format!("{}/request/{}/version", self.patches(), self.client_id),
            QoS::ExactlyOnce,
            false,
        )
    }

    /// Database reachability, retained.
    pub fn health(&self) -> TopicSpec {
        TopicSpec::new(format!("{}health/v1/db", self.prefix), QoS::AtLeastOnce, true)
    }

    /// Blob requests by name.
    pub fn files_request_get(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/get", self.files()), QoS::ExactlyOnce, false)
    }

    /// Blob contents answering requests; argument is the file name.
    pub fn files_request_file(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/file/+", self.files()), QoS::ExactlyOnce, false)
    }

    /// Blob uploads; argument is the file name.
    pub fn files_request_set(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/set/+", self.files()), QoS::ExactlyOnce, false)
    }

    /// Upload results.
    pub fn files_request_set_response(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/set/response", self.files()), QoS::ExactlyOnce, false)
    }

    /// Song currently shown in the room, retained.
    pub fn song(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/song", self.room()), QoS::AtLeastOnce, true)
    }

    /// Position inside the shown song, retained.
    pub fn position(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/position", self.room()), QoS::AtLeastOnce, true)
    }

    /// Whether the presentation is visible, retained.
    pub fn visibility(&self) -> TopicSpec {
        TopicSpec::new(format!("{}/visibility", self.room()), QoS::AtLeastOnce, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_args_in_order() {
        let filter = TopicFilter::new("s/db/v1/patches/latest/patch/+/+/+");
        let args = filter
            .wildcard_args("s/db/v1/patches/latest/patch/alice/3/p3")
            .unwrap();
        assert_eq!(args, vec!["alice", "3", "p3"]);
        assert!(!filter.matches("s/db/v1/patches/latest/patch/alice/3"));
        assert!(!filter.matches("s/db/v1/patches/latest/version"));
    }

    #[test]
    fn exact_and_hash() {
        assert!(TopicFilter::new("a/b").matches("a/b"));
        assert!(!TopicFilter::new("a/b").matches("a/b/c"));
        let hash = TopicFilter::new("a/#");
        assert_eq!(hash.wildcard_args("a/b/c").unwrap(), vec!["b/c"]);
        assert!(!hash.matches("a"));
    }

    #[test]
    fn render_checks_arguments() {
        let filter = TopicFilter::new("x/+/y/+");
        assert_eq!(filter.render(&["1", "2"]).unwrap(), "x/1/y/2");
        assert!(filter.render(&["1"]).is_err());
        assert!(filter.render(&["1", "2", "3"]).is_err());
        assert!(filter.render(&["a/b", "2"]).is_err());
        assert_eq!(TopicFilter::new("plain").render(&[]).unwrap(), "plain");
    }

    #[test]
    fn layout() {
        let topics = Topics::new("church/", "main", "c1");
        assert_eq!(
            topics.latest_version().filter.as_str(),
            "church/db/v1/patches/latest/version"
        );
        assert!(topics.latest_version().retained);
        assert_eq!(
            topics.request_patch().filter.as_str(),
            "church/db/v1/patches/request/c1/patch/+/+/+"
        );
        assert_eq!(topics.health().filter.as_str(), "church/health/v1/db");
        assert_eq!(
            topics.position().filter.as_str(),
            "church/namespaces/v1/main/position"
        );
        assert!(topics
            .request_get_any()
            .filter
            .matches(topics.request_get().filter.as_str()));
        assert!(!topics.latest_version().filter.has_wildcards());
        assert!(topics.files_request_file().filter.has_wildcards());
    }
}
