/// Direction of one field in a shard key or index key pattern.
///
/// Ordered fields use `1`/`-1`; special index types (`"hashed"`, `"text"`,
/// `"2dsphere"`, ...) are carried by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexDirection {
    Ascending,
    Descending,
    Special(String),
}

impl IndexDirection {
    /// Parses a direction as the engine reports it; `1.0` counts as `1`.
    pub fn from_json(raw: &JsonValue) -> std::result::Result<Self, String> {
        if let Some(kind) = raw.as_str() {
            if kind.trim().is_empty() {
                return Err("index type must not be empty".to_string());
            }
            return Ok(Self::Special(kind.to_string()));
        }
        let value = raw
            .as_i64()
            .or_else(|| raw.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("unsupported key direction {}", raw))?;
        match value {
            1 => Ok(Self::Ascending),
            -1 => Ok(Self::Descending),
            other => Err(format!("key direction must be 1 or -1, got {}", other)),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Ascending => JsonValue::from(1),
            Self::Descending => JsonValue::from(-1),
            Self::Special(kind) => JsonValue::from(kind.as_str()),
        }
    }

    pub fn is_ordered(&self) -> bool {
        !matches!(self, Self::Special(_))
    }
}

impl fmt::Display for IndexDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "1"),
            Self::Descending => write!(f, "-1"),
            Self::Special(kind) => write!(f, "{:?}", kind),
        }
    }
}

/// One `field → direction` entry of a key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyField {
    pub field: String,
    pub direction: IndexDirection,
}

/// Ordered mapping of field name to direction.
///
/// Order is significant: `{a: 1, b: 1}` and `{b: 1, a: 1}` are different
/// shard keys and different indexes. The JSON form is an object whose member
/// order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Map<String, JsonValue>", into = "Map<String, JsonValue>")]
pub struct KeyPattern {
    fields: Vec<KeyField>,
}

impl KeyPattern {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an ascending field.
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(KeyField {
            field: field.into(),
            direction: IndexDirection::Ascending,
        });
        self
    }

    /// Appends a descending field.
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.fields.push(KeyField {
            field: field.into(),
            direction: IndexDirection::Descending,
        });
        self
    }

    /// Appends a field of a special index type such as `"hashed"`.
    pub fn special(mut self, field: impl Into<String>, kind: impl Into<String>) -> Self {
        self.fields.push(KeyField {
            field: field.into(),
            direction: IndexDirection::Special(kind.into()),
        });
        self
    }

    pub fn fields(&self) -> &[KeyField] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Renders the pattern as a command document, e.g. `{"author_id": 1}`.
    pub fn to_document(&self) -> JsonValue {
        JsonValue::Object(self.clone().into())
    }

    /// Parses a key document as returned by the engine.
    ///
    /// Engines may report directions as floats (`1.0`) or as special index
    /// types (`"hashed"`, `"text"`).
    pub fn from_document(doc: &JsonValue) -> std::result::Result<Self, String> {
        let object = doc
            .as_object()
            .ok_or_else(|| format!("key pattern must be an object, got {}", doc))?;
        Self::try_from(object.clone())
    }
}

impl TryFrom<Map<String, JsonValue>> for KeyPattern {
    type Error = String;

    fn try_from(object: Map<String, JsonValue>) -> std::result::Result<Self, Self::Error> {
        let mut fields = Vec::with_capacity(object.len());
        for (field, raw) in object {
            let direction = IndexDirection::from_json(&raw)
                .map_err(|err| format!("key '{}': {}", field, err))?;
            fields.push(KeyField { field, direction });
        }
        Ok(Self { fields })
    }
}

impl From<KeyPattern> for Map<String, JsonValue> {
    fn from(pattern: KeyPattern) -> Self {
        pattern
            .fields
            .into_iter()
            .map(|key| {
                let direction = key.direction.to_json();
                (key.field, direction)
            })
            .collect()
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return write!(f, "{{}}");
        }
        let rendered = self
            .fields
            .iter()
            .map(|key| format!("{}: {}", key.field, key.direction))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{ {} }}", rendered)
    }
}
