/// Default key expression prefix for the bridge.
pub const KEY_PREFIX: &str = "s7bridge";

/// Builder for the bridge's key expressions.
///
/// All channels hang off a single prefix:
///
/// ```text
/// <prefix>/commands   inbound requests
/// <prefix>/response   snapshots and error replies
/// <prefix>/status     bridge lifecycle status
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeKeys {
    prefix: String,
}

impl Default for BridgeKeys {
    fn default() -> Self {
        Self::new(KEY_PREFIX)
    }
}

impl BridgeKeys {
    /// Create a key builder rooted at `prefix`. Trailing slashes are dropped.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The prefix all keys are built from.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key the bridge subscribes to for inbound requests.
    ///
    /// # Example
    /// ```
    /// use s7bridge_common::keyexpr::BridgeKeys;
    ///
    /// assert_eq!(BridgeKeys::new("plant/line1").commands(), "plant/line1/commands");
    /// ```
    pub fn commands(&self) -> String {
        format!("{}/commands", self.prefix)
    }

    /// Key snapshots and error replies are published to.
    pub fn response(&self) -> String {
        format!("{}/response", self.prefix)
    }

    /// Key lifecycle status documents are published to.
    pub fn status(&self) -> String {
        format!("{}/status", self.prefix)
    }
}

/// Check that a prefix can be used to build concrete (non-wildcard) keys.
pub fn validate_prefix(prefix: &str) -> Result<(), String> {
    if prefix.trim_matches('/').is_empty() {
        return Err("key prefix cannot be empty".to_string());
    }
    if prefix.contains('*') || prefix.contains('$') || prefix.contains('?') || prefix.contains('#')
    {
        return Err(format!("key prefix '{}' must not contain wildcards", prefix));
    }
    if prefix.starts_with('/') || prefix.contains("//") {
        return Err(format!("key prefix '{}' has an empty chunk", prefix));
    }
    Ok(())
}
