use serde_json::{Map, Value};
use std::{borrow::Cow, collections::HashMap, fmt};

/// Kind reserved for joining several single-kind contexts.
const MULTI_KIND: &str = "multi";

/// Default kind applied when a context is built without one.
pub const DEFAULT_KIND: &str = "user";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ContextError {
    #[error("Context key must not be empty")]
    EmptyKey,

    #[error("Invalid context kind: {0:?}")]
    InvalidKind(String),

    #[error("Multi-context must contain at least one context")]
    EmptyMultiContext,

    #[error("Multi-context contains duplicate kind: {0:?}")]
    DuplicateKind(String),

    #[error("Multi-context cannot nest another multi-context")]
    NestedMultiContext,

    #[error("Context JSON is malformed: {0}")]
    MalformedJson(String),
}

/// Namespace label for a context (e.g. `user`, `org`).
///
/// Kinds are restricted to ASCII letters, digits, `.`, `_` and `-`,
/// and may not be the reserved words `kind` or `multi`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Kind(String);

impl Kind {
    pub fn user() -> Self {
        Kind(DEFAULT_KIND.into())
    }

    /// Validate and wrap a kind string.
    pub fn try_parse<S: Into<String>>(s: S) -> Result<Self, ContextError> {
        let s = s.into();
        if !Self::is_valid(&s) {
            return Err(ContextError::InvalidKind(s));
        }
        Ok(Kind(s))
    }

    fn is_valid(s: &str) -> bool {
        !s.is_empty()
            && s != "kind"
            && s != MULTI_KIND
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_user(&self) -> bool {
        self.0 == DEFAULT_KIND
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for Kind {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::try_parse(s)
    }
}

impl<'de> serde::Deserialize<'de> for Kind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Kind::try_parse(raw).map_err(serde::de::Error::custom)
    }
}

impl serde::Serialize for Kind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// Reference to a context attribute, resolved as a dotted path.
///
/// The first path component may name a built-in (`key`, `kind`, `name`,
/// `anonymous`) or a custom attribute; further components descend into
/// nested JSON objects. An empty or blank-component reference is invalid
/// and never resolves.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttributeRef {
    raw: String,
    components: Vec<String>,
}

impl AttributeRef {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        let raw = raw.into();
        let components: Vec<String> = if raw.is_empty() || raw.split('.').any(str::is_empty) {
            Vec::new()
        } else {
            raw.split('.').map(str::to_owned).collect()
        };
        Self { raw, components }
    }

    pub fn is_valid(&self) -> bool {
        !self.components.is_empty()
    }

    /// Single-component reference, taken literally (no path splitting).
    pub fn literal<S: Into<String>>(name: S) -> Self {
        let raw = name.into();
        let components = if raw.is_empty() {
            Vec::new()
        } else {
            vec![raw.clone()]
        };
        Self { raw, components }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub(crate) fn first(&self) -> Option<&str> {
        self.components.first().map(String::as_str)
    }
}

impl fmt::Display for AttributeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.raw.fmt(f)
    }
}

impl<'de> serde::Deserialize<'de> for Context {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Context::from_json(value).map_err(serde::de::Error::custom)
    }
}

impl<'de> serde::Deserialize<'de> for AttributeRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(AttributeRef::new(raw))
    }
}

impl serde::Serialize for AttributeRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// The entity a flag is evaluated for.
///
/// Either a single context of one kind, or a multi-context joining one
/// context per kind. Build with [Context::builder] or
/// [Context::multi_builder]; an invalid shape is rejected at build time so
/// every constructed `Context` is usable for evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Context {
    kind: Kind,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
    // populated for kind "multi" only, sorted by kind
    contexts: Vec<Context>,
    canonical: String,
}

impl Context {
    pub fn builder<S: Into<String>>(key: S) -> ContextBuilder {
        ContextBuilder::new(key)
    }

    pub fn multi_builder() -> MultiContextBuilder {
        MultiContextBuilder::new()
    }

    /// Parse a context from its wire JSON form.
    ///
    /// Unlike the builders, an empty or missing key is preserved rather
    /// than rejected here: contexts arrive embedded in larger payloads,
    /// and one bad key should cost that one evaluation (as
    /// `USER_NOT_SPECIFIED`), not the whole payload. Structural problems
    /// (wrong types, unknown kinds, empty multi) still fail the parse.
    pub fn from_json(value: Value) -> Result<Context, ContextError> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => {
                return Err(ContextError::MalformedJson(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };
        let kind_raw = match obj.remove("kind") {
            None => DEFAULT_KIND.to_owned(),
            Some(Value::String(s)) => s,
            Some(other) => {
                return Err(ContextError::MalformedJson(format!(
                    "kind must be a string, got {}",
                    other
                )))
            }
        };
        if kind_raw != MULTI_KIND {
            return Self::single_from_json(Kind::try_parse(kind_raw)?, obj);
        }

        let mut parts = Vec::with_capacity(obj.len());
        for (part_kind, part) in obj {
            let kind = Kind::try_parse(part_kind)?;
            let part = match part {
                Value::Object(part) => part,
                other => {
                    return Err(ContextError::MalformedJson(format!(
                        "context for kind {} must be an object, got {}",
                        kind, other
                    )))
                }
            };
            parts.push(Self::single_from_json(kind, part)?);
        }
        if parts.is_empty() {
            return Err(ContextError::EmptyMultiContext);
        }
        if parts.len() == 1 {
            return Ok(parts.pop().unwrap());
        }
        parts.sort_by(|a, b| a.kind.cmp(&b.kind));
        let canonical = parts
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Context {
            kind: Kind(MULTI_KIND.into()),
            key: String::new(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
            contexts: parts,
            canonical,
        })
    }

    fn single_from_json(kind: Kind, mut obj: Map<String, Value>) -> Result<Context, ContextError> {
        let key = match obj.remove("key") {
            Some(Value::String(key)) => key,
            None | Some(Value::Null) => String::new(),
            Some(other) => {
                return Err(ContextError::MalformedJson(format!(
                    "key must be a string, got {}",
                    other
                )))
            }
        };
        let name = match obj.remove("name") {
            Some(Value::String(name)) => Some(name),
            None | Some(Value::Null) => None,
            Some(other) => {
                return Err(ContextError::MalformedJson(format!(
                    "name must be a string, got {}",
                    other
                )))
            }
        };
        let anonymous = match obj.remove("anonymous") {
            Some(Value::Bool(anonymous)) => anonymous,
            None | Some(Value::Null) => false,
            Some(other) => {
                return Err(ContextError::MalformedJson(format!(
                    "anonymous must be a boolean, got {}",
                    other
                )))
            }
        };
        let mut private_attributes = Vec::new();
        if let Some(Value::Object(mut meta)) = obj.remove("_meta") {
            if let Some(Value::Array(refs)) = meta.remove("privateAttributes") {
                for reference in refs {
                    if let Value::String(reference) = reference {
                        private_attributes.push(AttributeRef::new(reference));
                    }
                }
            }
        }
        let canonical = Context::canonical_key_of(&kind, &key);
        Ok(Context {
            kind,
            key,
            name,
            anonymous,
            attributes: obj.into_iter().collect(),
            private_attributes,
            contexts: Vec::new(),
            canonical,
        })
    }

    /// Whether this context can be evaluated.
    ///
    /// Builder-constructed contexts are always valid; a context parsed
    /// from wire JSON may carry an empty key, which evaluation reports as
    /// `USER_NOT_SPECIFIED`.
    pub fn is_valid(&self) -> bool {
        if self.is_multi() {
            self.contexts.iter().all(|c| !c.key.is_empty())
        } else {
            !self.key.is_empty()
        }
    }

    pub fn is_multi(&self) -> bool {
        !self.contexts.is_empty()
    }

    /// Kind of a single context; `multi` for a multi-context.
    pub fn kind_str(&self) -> &str {
        if self.is_multi() {
            MULTI_KIND
        } else {
            self.kind.as_str()
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn private_attributes(&self) -> &[AttributeRef] {
        &self.private_attributes
    }

    /// All kinds present, in sorted order for a multi-context.
    pub fn kinds(&self) -> Vec<&Kind> {
        if self.is_multi() {
            self.contexts.iter().map(|c| &c.kind).collect()
        } else {
            vec![&self.kind]
        }
    }

    pub fn contexts(&self) -> &[Context] {
        if self.is_multi() {
            &self.contexts
        } else {
            std::slice::from_ref(self)
        }
    }

    /// Select the single context of the given kind, if present.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        if self.is_multi() {
            self.contexts.iter().find(|c| &c.kind == kind)
        } else if &self.kind == kind {
            Some(self)
        } else {
            None
        }
    }

    /// Stable key identifying this context across all kinds.
    ///
    /// Used for event deduplication. Single user-kind contexts use the bare
    /// key; other kinds prefix it; multi-contexts join all kind:key pairs in
    /// kind order with `:` and `%` escaped inside keys.
    pub fn canonical_key(&self) -> &str {
        &self.canonical
    }

    /// Resolve an attribute reference against this context.
    ///
    /// Only meaningful for single contexts; a multi-context resolves `kind`
    /// and nothing else.
    pub fn get_value(&self, reference: &AttributeRef) -> Option<Value> {
        let first = reference.first()?;
        if first == "kind" {
            return Some(Value::String(self.kind_str().to_owned()));
        }
        if self.is_multi() {
            return None;
        }
        let top: Cow<'_, Value> = match first {
            "key" => Cow::Owned(Value::String(self.key.clone())),
            "name" => Cow::Owned(Value::String(self.name.clone()?)),
            "anonymous" => Cow::Owned(Value::Bool(self.anonymous)),
            custom => Cow::Borrowed(self.attributes.get(custom)?),
        };
        let mut current = top;
        for component in &reference.components()[1..] {
            let next = match current.as_ref() {
                Value::Object(map) => map.get(component)?.clone(),
                _ => return None,
            };
            current = Cow::Owned(next);
        }
        Some(current.into_owned())
    }

    fn canonical_key_of(kind: &Kind, key: &str) -> String {
        if kind.is_user() {
            key.to_owned()
        } else {
            format!("{}:{}", kind, escape_key(key))
        }
    }
}

fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace(':', "%3A")
}

/// Builder for single-kind contexts.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    attributes: HashMap<String, Value>,
    private_attributes: Vec<AttributeRef>,
}

impl ContextBuilder {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self {
            kind: DEFAULT_KIND.into(),
            key: key.into(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
        }
    }

    pub fn kind<S: Into<String>>(mut self, kind: S) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn anonymous(mut self, anonymous: bool) -> Self {
        self.anonymous = anonymous;
        self
    }

    /// Set a custom attribute to any JSON value.
    pub fn set<S: Into<String>, V: Into<Value>>(mut self, name: S, value: V) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Mark an attribute as private for event redaction.
    pub fn private<S: Into<String>>(mut self, reference: S) -> Self {
        self.private_attributes.push(AttributeRef::new(reference));
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        if self.key.is_empty() {
            return Err(ContextError::EmptyKey);
        }
        let kind = Kind::try_parse(self.kind)?;
        let canonical = Context::canonical_key_of(&kind, &self.key);
        Ok(Context {
            kind,
            key: self.key,
            name: self.name,
            anonymous: self.anonymous,
            attributes: self.attributes,
            private_attributes: self.private_attributes,
            contexts: Vec::new(),
            canonical,
        })
    }
}

/// Builder joining single contexts of distinct kinds.
#[derive(Debug, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, context: Context) -> Self {
        self.contexts.push(context);
        self
    }

    pub fn build(self) -> Result<Context, ContextError> {
        if self.contexts.is_empty() {
            return Err(ContextError::EmptyMultiContext);
        }
        if self.contexts.len() == 1 {
            // single-entry multi collapses to the inner context
            return Ok(self.contexts.into_iter().next().unwrap());
        }
        let mut contexts = self.contexts;
        for c in &contexts {
            if c.is_multi() {
                return Err(ContextError::NestedMultiContext);
            }
        }
        contexts.sort_by(|a, b| a.kind.cmp(&b.kind));
        for pair in contexts.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(ContextError::DuplicateKind(pair[0].kind.to_string()));
            }
        }
        let canonical = contexts
            .iter()
            .map(|c| format!("{}:{}", c.kind, escape_key(&c.key)))
            .collect::<Vec<_>>()
            .join(":");
        Ok(Context {
            kind: Kind(MULTI_KIND.into()),
            key: String::new(),
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            private_attributes: Vec::new(),
            contexts,
            canonical,
        })
    }
}
