//! Tag declaration files
//!
//! A tag file is a YAML mapping from tag name to its declaration:
//!
//! ```yaml
//! LakeLevel:
//!   desc: Lake level above datum
//!   type: float
//!   units: m
//!   dp: 2
//!   min: 400.0
//!   max: 410.0
//! GateMode:
//!   desc: Gate control mode
//!   multi: [Off, Manual, Auto]
//!   init: 0
//! ```
//!
//! Validation follows the long-standing declaration rules: `multi` forces
//! type int (an explicit type is redundant and logged), a missing type
//! defaults to float, `dp` is 0 for int and 2 for float and meaningless
//! elsewhere, and unknown type names are hard errors.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use tracing::warn;

use tagbus_client::{Registry, Tag, TagMeta};
use tagbus_protocol::{TagKind, TagValue};

use crate::error::{ConfigError, Result};

/// One tag declaration as written in YAML
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TagSpec {
    /// Scalar type name: int, float, str, bytes, dict, list
    #[serde(rename = "type")]
    pub type_name: Option<String>,

    /// Free-text description
    pub desc: Option<String>,

    /// Engineering units
    pub units: Option<String>,

    /// Decimal places for display
    pub dp: Option<u32>,

    /// Lower limit
    pub min: Option<f64>,

    /// Upper limit
    pub max: Option<f64>,

    /// Ordered state labels; implies type int
    pub multi: Option<Vec<String>>,

    /// Initial value, applied before the bus connection comes up
    pub init: Option<serde_yaml::Value>,

    /// Display format hint
    pub format: Option<String>,

    /// Suppress numeric changes smaller than this
    pub deadband: Option<f64>,
}

/// A validated tag declaration
#[derive(Debug, Clone)]
pub struct TagDef {
    /// Tag name
    pub name: String,
    /// Resolved scalar type
    pub kind: TagKind,
    /// Metadata to attach
    pub meta: TagMeta,
    /// Initial value, already type-checked
    pub init: Option<TagValue>,
}

impl TagDef {
    /// Validate one raw declaration
    fn resolve(name: &str, spec: TagSpec) -> Result<Self> {
        if spec.desc.is_none() {
            warn!(tag = name, "declaration has no desc");
        }

        let kind = match (&spec.multi, &spec.type_name) {
            // multi always means int; an explicit type is redundant at
            // best and is overridden either way
            (Some(_), Some(_)) => {
                warn!(tag = name, "redundant type cast for multi");
                TagKind::Int
            }
            (Some(_), None) => TagKind::Int,
            (None, Some(type_name)) => type_name
                .parse::<TagKind>()
                .map_err(|reason| ConfigError::invalid(name, reason))?,
            (None, None) => TagKind::Float,
        };

        let dp = match (kind, spec.dp) {
            (TagKind::Int, Some(_)) => {
                warn!(tag = name, "redundant dp for int");
                Some(0)
            }
            (TagKind::Int, None) => Some(0),
            (TagKind::Float, None) => Some(2),
            (TagKind::Float, given) => given,
            (_, Some(_)) => {
                warn!(tag = name, "dp is only for numeric tags");
                None
            }
            (_, None) => None,
        };

        if spec.deadband.is_some() && !kind.is_numeric() {
            return Err(ConfigError::invalid(name, "deadband is only for numeric tags"));
        }

        // multi carries its own limits: the label range
        let (min, max) = match &spec.multi {
            Some(labels) if labels.is_empty() => {
                return Err(ConfigError::invalid(name, "multi needs at least one label"));
            }
            Some(labels) => (Some(0.0), Some((labels.len() - 1) as f64)),
            None => (spec.min, spec.max),
        };

        let init = spec
            .init
            .map(|raw| resolve_init(name, kind, raw))
            .transpose()?;

        Ok(Self {
            name: name.to_string(),
            kind,
            meta: TagMeta {
                desc: spec.desc.unwrap_or_default(),
                units: spec.units,
                dp,
                min,
                max,
                multi: spec.multi,
                format: spec.format,
                deadband: spec.deadband,
            },
            init,
        })
    }
}

/// Convert a YAML init value to the declared kind
fn resolve_init(name: &str, kind: TagKind, raw: serde_yaml::Value) -> Result<TagValue> {
    use serde_yaml::Value;

    let value = match (kind, raw) {
        (TagKind::Int, Value::Number(n)) if n.as_i64().is_some() => {
            TagValue::Int(n.as_i64().unwrap())
        }
        (TagKind::Float, Value::Number(n)) if n.as_f64().is_some() => {
            TagValue::Float(n.as_f64().unwrap())
        }
        (TagKind::Text, Value::String(s)) => TagValue::Text(s),
        (TagKind::Bytes, Value::String(s)) => TagValue::Bytes(s.into_bytes().into()),
        (TagKind::Mapping | TagKind::Sequence, raw @ (Value::Mapping(_) | Value::Sequence(_))) => {
            let json = serde_json::to_value(&raw)
                .map_err(|e| ConfigError::invalid(name, format!("init not JSON-shaped: {e}")))?;
            TagValue::Json(json)
        }
        (kind, raw) => {
            return Err(ConfigError::invalid(
                name,
                format!("init {raw:?} does not fit type {kind}"),
            ));
        }
    };

    if !value.matches(kind) {
        return Err(ConfigError::invalid(name, "init does not fit declared type"));
    }
    Ok(value)
}

/// A parsed and validated tag declaration file
#[derive(Debug, Clone, Default)]
pub struct TagsFile {
    defs: Vec<TagDef>,
}

impl TagsFile {
    /// Load and validate a YAML tag file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        contents.parse()
    }

    /// The validated declarations, in name order
    pub fn defs(&self) -> &[TagDef] {
        &self.defs
    }

    /// Create every declared tag in `registry`, attach its metadata and
    /// apply its initial value.
    ///
    /// Initial values are locally authored sets: once the bus connection
    /// comes up they are published like any other change.
    pub fn apply(&self, registry: &Registry) -> Result<Vec<Tag>> {
        let mut tags = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let tag = registry.tag(&def.name, def.kind)?;
            tag.set_metadata(def.meta.clone())?;
            if let Some(init) = &def.init {
                tag.set(init.clone())?;
            }
            tags.push(tag);
        }
        Ok(tags)
    }
}

impl FromStr for TagsFile {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        // BTreeMap keeps application order deterministic
        let raw: BTreeMap<String, TagSpec> = serde_yaml::from_str(s)?;
        let defs = raw
            .into_iter()
            .map(|(name, spec)| TagDef::resolve(&name, spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { defs })
    }
}
