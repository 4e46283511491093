use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Named partition of the keyspace, each with its own default TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    UserData,
    MediaData,
    SearchResults,
    MediaDetails,
    MalData,
}

impl Scope {
    pub const ALL: [Scope; 5] = [
        Scope::UserData,
        Scope::MediaData,
        Scope::SearchResults,
        Scope::MediaDetails,
        Scope::MalData,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::UserData => "userData",
            Scope::MediaData => "mediaData",
            Scope::SearchResults => "searchResults",
            Scope::MediaDetails => "mediaDetails",
            Scope::MalData => "malData",
        }
    }

    pub fn parse(s: &str) -> Option<Scope> {
        Scope::ALL.into_iter().find(|scope| scope.as_str() == s)
    }

    /// Scopes whose entries belong to a user (lists, stats) and are therefore
    /// tracked in the `byUser` index.
    pub fn is_user_owned(self) -> bool {
        matches!(self, Scope::UserData)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scope, optionally prefixed by provider: `userData` or `anilist:userData`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopeId {
    pub provider: Option<String>,
    pub scope: Scope,
}

impl ScopeId {
    pub fn new(scope: Scope, provider: Option<&str>) -> Self {
        Self {
            provider: provider.filter(|p| !p.is_empty()).map(str::to_string),
            scope,
        }
    }

    pub fn global(scope: Scope) -> Self {
        Self::new(scope, None)
    }

    pub fn for_provider(provider: &str, scope: Scope) -> Self {
        Self::new(scope, Some(provider))
    }

    /// True when `provider` is `None` (match everything) or equal to this
    /// scope's provider.
    pub fn matches_provider(&self, provider: Option<&str>) -> bool {
        match provider {
            None => true,
            Some(p) => self.provider.as_deref() == Some(p),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.provider {
            Some(provider) => write!(f, "{}:{}", provider, self.scope),
            None => f.write_str(self.scope.as_str()),
        }
    }
}

impl FromStr for ScopeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (provider, scope) = match s.rsplit_once(':') {
            Some((provider, scope)) => (Some(provider), scope),
            None => (None, s),
        };
        let scope = Scope::parse(scope).ok_or_else(|| format!("unknown cache scope '{s}'"))?;
        Ok(ScopeId::new(scope, provider))
    }
}

impl TryFrom<String> for ScopeId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopeId> for String {
    fn from(value: ScopeId) -> Self {
        value.to_string()
    }
}

/// Canonical cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `name=value` pairs sorted by name, percent-encoded and joined by `&`.
    /// Null fields are dropped, so an explicit null and a missing field
    /// produce the same key.
    pub fn from_descriptor(descriptor: &KeyDescriptor) -> Self {
        let parts: Vec<String> = descriptor
            .fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(&stringify(value))
                )
            })
            .collect();
        Self(parts.join("&"))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Structured description of a logical request. Field order is irrelevant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyDescriptor {
    fields: BTreeMap<String, Value>,
}

impl KeyDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Adds `name` only when `value` is present.
    pub fn maybe<V: Into<Value>>(mut self, name: impl Into<String>, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(name, value);
        }
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    /// Value feeding the `byUser` index: `username`, else `userId`.
    pub fn user(&self) -> Option<String> {
        self.get("username")
            .or_else(|| self.get("userId"))
            .map(stringify)
            .filter(|s| !s.is_empty())
    }

    /// Value feeding the `byMedia` index.
    pub fn media_id(&self) -> Option<String> {
        self.get("mediaId").map(stringify).filter(|s| !s.is_empty())
    }

    pub fn canonical(&self) -> CacheKey {
        CacheKey::from_descriptor(self)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for KeyDescriptor {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut descriptor = KeyDescriptor::new();
        for (name, value) in iter {
            descriptor.insert(name, value);
        }
        descriptor
    }
}

/// Either a ready-made key or a descriptor to canonicalize.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyInput {
    Raw(CacheKey),
    Descriptor(KeyDescriptor),
}

impl KeyInput {
    pub fn key(&self) -> CacheKey {
        match self {
            KeyInput::Raw(key) => key.clone(),
            KeyInput::Descriptor(descriptor) => descriptor.canonical(),
        }
    }

    pub fn descriptor(&self) -> Option<&KeyDescriptor> {
        match self {
            KeyInput::Raw(_) => None,
            KeyInput::Descriptor(descriptor) => Some(descriptor),
        }
    }
}

impl From<&str> for KeyInput {
    fn from(value: &str) -> Self {
        KeyInput::Raw(CacheKey::from(value))
    }
}

impl From<String> for KeyInput {
    fn from(value: String) -> Self {
        KeyInput::Raw(CacheKey::from(value))
    }
}

impl From<CacheKey> for KeyInput {
    fn from(value: CacheKey) -> Self {
        KeyInput::Raw(value)
    }
}

impl From<&CacheKey> for KeyInput {
    fn from(value: &CacheKey) -> Self {
        KeyInput::Raw(value.clone())
    }
}

impl From<KeyDescriptor> for KeyInput {
    fn from(value: KeyDescriptor) -> Self {
        KeyInput::Descriptor(value)
    }
}

impl From<&KeyDescriptor> for KeyInput {
    fn from(value: &KeyDescriptor) -> Self {
        KeyInput::Descriptor(value.clone())
    }
}
