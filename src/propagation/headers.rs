use http::HeaderMap;

use crate::rpc::Metadata;

/// Inbound request headers the host forwards to plugins.
///
/// Names are kept in configuration order, deduplicated case-insensitively, and used
/// lowercased as metadata keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderForwardingPolicy {
    names: Vec<String>,
}

impl HeaderForwardingPolicy {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            if !name.is_empty() && !policy.names.contains(&name) {
                policy.names.push(name);
            }
        }
        policy
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Copy every allowed header, with all of its values, into the metadata.
    ///
    /// Values that are not valid UTF-8 are forwarded with replacement characters.
    pub fn forward(&self, inbound: &HeaderMap, metadata: &mut Metadata) {
        for name in &self.names {
            for value in inbound.get_all(name.as_str()) {
                metadata.append(name, String::from_utf8_lossy(value.as_bytes()));
            }
        }
    }
}
