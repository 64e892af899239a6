//! Caller key derivation.

/// Namespace for each algorithm's keys, so algorithms never share state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmTag {
    FixedWindow,
    TokenBucket,
    SlidingWindowLog,
    SlidingWindowCounter,
    LeakyBucket,
}

impl AlgorithmTag {
    /// Short prefix used in store keys.
    pub fn prefix(&self) -> &'static str {
        match self {
            AlgorithmTag::FixedWindow => "fw",
            AlgorithmTag::TokenBucket => "tb",
            AlgorithmTag::SlidingWindowLog => "swl",
            AlgorithmTag::SlidingWindowCounter => "swc",
            AlgorithmTag::LeakyBucket => "lb",
        }
    }

    /// Human readable name, matching the configuration spelling.
    pub fn name(&self) -> &'static str {
        match self {
            AlgorithmTag::FixedWindow => "fixed_window",
            AlgorithmTag::TokenBucket => "token_bucket",
            AlgorithmTag::SlidingWindowLog => "sliding_window_log",
            AlgorithmTag::SlidingWindowCounter => "sliding_window_counter",
            AlgorithmTag::LeakyBucket => "leaky_bucket",
        }
    }
}

/// The subject of one rate limit: which policy, which algorithm, which caller.
///
/// Window-based algorithms add the epoch with [`CallerKey::at_epoch`] before
/// touching the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerKey {
    /// Policy name the key belongs to, if any
    pub namespace: Option<String>,
    /// Algorithm owning the key
    pub tag: AlgorithmTag,
    /// Caller identity, e.g. a client address
    pub identity: String,
    /// Window index for window-based algorithms
    pub epoch: Option<u64>,
}

impl CallerKey {
    /// Create a key for `identity` under `tag`.
    pub fn new(tag: AlgorithmTag, identity: &str) -> Self {
        Self {
            namespace: None,
            tag,
            identity: identity.to_string(),
            epoch: None,
        }
    }

    /// Scope the key to a policy.
    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// The same key pinned to a window index.
    pub fn at_epoch(&self, epoch: u64) -> Self {
        Self {
            epoch: Some(epoch),
            ..self.clone()
        }
    }

    /// Render the key as stored: `[{namespace}:]{prefix}:{identity}[:{epoch}]`.
    ///
    /// `:` and `%` inside the namespace and identity are percent-escaped, so
    /// every segment boundary in the result is one of ours.
    pub fn to_store_key(&self) -> String {
        let mut key = String::new();
        if let Some(ref ns) = self.namespace {
            push_escaped(&mut key, ns);
            key.push(':');
        }
        key.push_str(self.tag.prefix());
        key.push(':');
        push_escaped(&mut key, &self.identity);
        if let Some(epoch) = self.epoch {
            key.push(':');
            key.push_str(&epoch.to_string());
        }
        key
    }
}

fn push_escaped(key: &mut String, segment: &str) {
    for c in segment.chars() {
        match c {
            '%' => key.push_str("%25"),
            ':' => key.push_str("%3A"),
            c => key.push(c),
        }
    }
}

impl std::fmt::Display for CallerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_store_key())
    }
}
