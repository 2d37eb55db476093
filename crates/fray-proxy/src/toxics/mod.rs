//! Toxic definitions.
//!
//! A toxic arrives as a [`ToxicSpec`] record (the JSON/TOML boundary), is
//! validated into a [`ToxicWrapper`] holding a parsed [`ToxicKind`], and is
//! executed per connection by a pipeline stage (see `stage.rs`).
//!
//! # Kinds
//!
//! | type         | attributes                                   | draw       |
//! |--------------|----------------------------------------------|------------|
//! | `noop`       |                                              | chunk      |
//! | `latency`    | `latency` ms, `jitter` ms                    | chunk      |
//! | `bandwidth`  | `rate` KB/s                                  | chunk      |
//! | `slicer`     | `average_size`, `size_variation`, `delay` µs | chunk      |
//! | `timeout`    | `timeout` ms                                 | connection |
//! | `slow_close` | `delay` ms                                   | connection |
//! | `reset_peer` | `timeout` ms                                 | connection |
//! | `limit_data` | `bytes`                                      | connection |

mod stage;

pub(crate) use stage::{Chunk, Frame, Stage, StageState};

use crate::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Numeric toxic attributes keyed by name.
pub type Attributes = BTreeMap<String, f64>;

/// Direction of travel through a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to upstream.
    Upstream,
    /// Upstream to client.
    Downstream,
}

impl Direction {
    /// Both directions, upstream first.
    pub const ALL: [Direction; 2] = [Direction::Upstream, Direction::Downstream];

    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Upstream => 0,
            Direction::Downstream => 1,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "upstream"),
            Direction::Downstream => write!(f, "downstream"),
        }
    }
}

/// Serialized toxic record.
///
/// ```json
/// {"name": "slow", "type": "latency", "stream": "downstream",
///  "toxicity": 1.0, "attributes": {"latency": 100, "jitter": 0}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicSpec {
    /// Unique within (proxy, direction).
    pub name: String,

    /// Registered type name, e.g. `latency`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Which direction the toxic applies to.
    pub stream: Direction,

    /// Probability in [0, 1] that the toxic applies.
    /// Default: 1.0
    #[serde(default = "default_toxicity")]
    pub toxicity: f64,

    /// Disabled toxics stay listed but are skipped by streams.
    /// Default: true
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Kind-specific numeric attributes. Missing attributes read as 0.
    #[serde(default)]
    pub attributes: Attributes,
}

fn default_toxicity() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ToxicSpec {
    /// Create a spec with full toxicity and no attributes.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, stream: Direction) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            stream,
            toxicity: default_toxicity(),
            attributes: Attributes::new(),
            enabled: true,
        }
    }

    /// Set one attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: f64) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Set the toxicity.
    #[must_use]
    pub fn with_toxicity(mut self, toxicity: f64) -> Self {
        self.toxicity = toxicity;
        self
    }
}

/// When a toxic's toxicity is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrawScope {
    /// Once per chunk entering the stage.
    Chunk,
    /// Once per link, kept across chain rebuilds.
    Connection,
}

/// The closed set of transforms, with attributes already validated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ToxicKind {
    /// Forwards chunks unchanged.
    Noop,
    /// Delays each chunk by `latency ± jitter` from the moment it was read.
    Latency { latency: Duration, jitter: Duration },
    /// Caps throughput; excess is held back and released at the cap.
    Bandwidth { rate_kbps: u64 },
    /// Splits chunks into smaller pieces separated by `delay`.
    Slicer {
        average_size: usize,
        size_variation: usize,
        delay: Duration,
    },
    /// Closes the link after `timeout` without traffic. Zero never fires.
    Timeout { timeout: Duration },
    /// Holds back the close of the stream by `delay`.
    SlowClose { delay: Duration },
    /// Resets the link `timeout` after the stage starts.
    ResetPeer { timeout: Duration },
    /// Closes the link once `bytes` have been forwarded.
    LimitData { bytes: u64 },
}

impl ToxicKind {
    /// Every registered type name.
    pub const NAMES: [&'static str; 8] = [
        "noop",
        "latency",
        "bandwidth",
        "slicer",
        "timeout",
        "slow_close",
        "reset_peer",
        "limit_data",
    ];

    /// Build a kind from its type name and attributes.
    ///
    /// # Errors
    /// * `ProxyError::UnknownKind` - `kind` is not in [`ToxicKind::NAMES`]
    /// * `ProxyError::InvalidAttribute` - an attribute is negative, not
    ///   finite, or too large for its unit
    pub fn parse(kind: &str, attributes: &Attributes) -> Result<Self> {
        let attrs = AttributeReader { kind, attributes };
        let parsed = match kind {
            "noop" => ToxicKind::Noop,
            "latency" => ToxicKind::Latency {
                latency: attrs.millis("latency")?,
                jitter: attrs.millis("jitter")?,
            },
            "bandwidth" => ToxicKind::Bandwidth {
                rate_kbps: attrs.integer("rate")?,
            },
            "slicer" => ToxicKind::Slicer {
                average_size: attrs.size("average_size")?,
                size_variation: attrs.size("size_variation")?,
                delay: attrs.micros("delay")?,
            },
            "timeout" => ToxicKind::Timeout {
                timeout: attrs.millis("timeout")?,
            },
            "slow_close" => ToxicKind::SlowClose {
                delay: attrs.millis("delay")?,
            },
            "reset_peer" => ToxicKind::ResetPeer {
                timeout: attrs.millis("timeout")?,
            },
            "limit_data" => ToxicKind::LimitData {
                bytes: attrs.integer("bytes")?,
            },
            other => {
                return Err(ProxyError::UnknownKind {
                    kind: other.to_string(),
                })
            }
        };
        Ok(parsed)
    }

    /// The registered type name.
    pub fn name(&self) -> &'static str {
        match self {
            ToxicKind::Noop => "noop",
            ToxicKind::Latency { .. } => "latency",
            ToxicKind::Bandwidth { .. } => "bandwidth",
            ToxicKind::Slicer { .. } => "slicer",
            ToxicKind::Timeout { .. } => "timeout",
            ToxicKind::SlowClose { .. } => "slow_close",
            ToxicKind::ResetPeer { .. } => "reset_peer",
            ToxicKind::LimitData { .. } => "limit_data",
        }
    }

    pub(crate) fn scope(&self) -> DrawScope {
        match self {
            ToxicKind::Noop
            | ToxicKind::Latency { .. }
            | ToxicKind::Bandwidth { .. }
            | ToxicKind::Slicer { .. } => DrawScope::Chunk,
            ToxicKind::Timeout { .. }
            | ToxicKind::SlowClose { .. }
            | ToxicKind::ResetPeer { .. }
            | ToxicKind::LimitData { .. } => DrawScope::Connection,
        }
    }
}

struct AttributeReader<'a> {
    kind: &'a str,
    attributes: &'a Attributes,
}

impl AttributeReader<'_> {
    fn raw(&self, field: &str) -> Result<f64> {
        let value = self.attributes.get(field).copied().unwrap_or(0.0);
        if !value.is_finite() || value < 0.0 {
            return Err(self.invalid(field, format!("expected a non-negative number, got {value}")));
        }
        Ok(value)
    }

    fn millis(&self, field: &str) -> Result<Duration> {
        let value = self.raw(field)?;
        Duration::try_from_secs_f64(value / 1_000.0)
            .map_err(|e| self.invalid(field, e.to_string()))
    }

    fn micros(&self, field: &str) -> Result<Duration> {
        let value = self.raw(field)?;
        Duration::try_from_secs_f64(value / 1_000_000.0)
            .map_err(|e| self.invalid(field, e.to_string()))
    }

    fn integer(&self, field: &str) -> Result<u64> {
        let value = self.raw(field)?;
        if value > u64::MAX as f64 {
            return Err(self.invalid(field, format!("{value} is out of range")));
        }
        Ok(value as u64)
    }

    fn size(&self, field: &str) -> Result<usize> {
        let value = self.integer(field)?;
        usize::try_from(value).map_err(|e| self.invalid(field, e.to_string()))
    }

    fn invalid(&self, field: &str, message: String) -> ProxyError {
        ProxyError::InvalidAttribute {
            kind: self.kind.to_string(),
            field: field.to_string(),
            message,
        }
    }
}

/// A validated toxic as stored in a [`crate::ToxicCollection`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToxicWrapper {
    name: String,
    kind: ToxicKind,
    direction: Direction,
    toxicity: f64,
    attributes: Attributes,
    enabled: bool,
    /// Identity within a collection, assigned on add and kept by updates.
    serial: u64,
}

impl ToxicWrapper {
    /// Validate a spec.
    ///
    /// # Errors
    /// * `ProxyError::Validation` - empty name
    /// * `ProxyError::UnknownKind` - unregistered type name
    /// * `ProxyError::InvalidAttribute` - bad attribute or toxicity
    pub fn from_spec(spec: ToxicSpec) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(ProxyError::Validation("toxic name must not be empty".to_string()));
        }
        let kind = ToxicKind::parse(&spec.kind, &spec.attributes)?;
        check_toxicity(kind, spec.toxicity)?;
        Ok(Self {
            name: spec.name,
            kind,
            direction: spec.stream,
            toxicity: spec.toxicity,
            attributes: spec.attributes,
            enabled: spec.enabled,
            serial: 0,
        })
    }

    pub(crate) fn with_serial(self, serial: u64) -> Self {
        Self { serial, ..self }
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Copy of this toxic with new attributes and toxicity, same name and kind.
    pub(crate) fn updated(&self, attributes: Attributes, toxicity: f64) -> Result<Self> {
        let kind = ToxicKind::parse(self.kind.name(), &attributes)?;
        check_toxicity(kind, toxicity)?;
        Ok(Self {
            kind,
            toxicity,
            attributes,
            ..self.clone()
        })
    }

    /// The record form of this toxic.
    pub fn to_spec(&self) -> ToxicSpec {
        ToxicSpec {
            name: self.name.clone(),
            kind: self.kind.name().to_string(),
            stream: self.direction,
            toxicity: self.toxicity,
            attributes: self.attributes.clone(),
            enabled: self.enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ToxicKind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn toxicity(&self) -> f64 {
        self.toxicity
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

fn check_toxicity(kind: ToxicKind, toxicity: f64) -> Result<()> {
    if (0.0..=1.0).contains(&toxicity) {
        Ok(())
    } else {
        Err(ProxyError::InvalidAttribute {
            kind: kind.name().to_string(),
            field: "toxicity".to_string(),
            message: format!("expected a probability in [0, 1], got {toxicity}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, f64)]) -> Attributes {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_parse_latency() {
        let kind = ToxicKind::parse("latency", &attrs(&[("latency", 100.0), ("jitter", 5.0)]));
        assert_eq!(
            kind.unwrap(),
            ToxicKind::Latency {
                latency: Duration::from_millis(100),
                jitter: Duration::from_millis(5),
            }
        );
    }

    #[test]
    fn test_parse_missing_attributes_default_to_zero() {
        let kind = ToxicKind::parse("slicer", &Attributes::new()).unwrap();
        assert_eq!(
            kind,
            ToxicKind::Slicer {
                average_size: 0,
                size_variation: 0,
                delay: Duration::ZERO,
            }
        );
    }

    #[test]
    fn test_parse_slicer_delay_is_microseconds() {
        let kind = ToxicKind::parse("slicer", &attrs(&[("average_size", 8.0), ("delay", 250.0)]));
        match kind.unwrap() {
            ToxicKind::Slicer { delay, .. } => assert_eq!(delay, Duration::from_micros(250)),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_kind() {
        let err = ToxicKind::parse("gremlin", &Attributes::new()).unwrap_err();
        assert!(matches!(err, ProxyError::UnknownKind { kind } if kind == "gremlin"));
    }

    #[test]
    fn test_parse_negative_attribute_rejected() {
        let err = ToxicKind::parse("limit_data", &attrs(&[("bytes", -1.0)])).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAttribute { field, .. } if field == "bytes"));
    }

    #[test]
    fn test_parse_nan_attribute_rejected() {
        let err = ToxicKind::parse("latency", &attrs(&[("latency", f64::NAN)])).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_every_name_parses() {
        for name in ToxicKind::NAMES {
            let kind = ToxicKind::parse(name, &Attributes::new()).unwrap();
            assert_eq!(kind.name(), name);
        }
    }

    #[test]
    fn test_scope_split() {
        assert_eq!(ToxicKind::Noop.scope(), DrawScope::Chunk);
        assert_eq!(
            ToxicKind::LimitData { bytes: 1 }.scope(),
            DrawScope::Connection
        );
        assert_eq!(
            ToxicKind::ResetPeer {
                timeout: Duration::ZERO
            }
            .scope(),
            DrawScope::Connection
        );
    }

    #[test]
    fn test_wrapper_rejects_bad_toxicity() {
        let spec = ToxicSpec::new("t", "noop", Direction::Upstream).with_toxicity(1.5);
        let err = ToxicWrapper::from_spec(spec).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAttribute { field, .. } if field == "toxicity"));
    }

    #[test]
    fn test_wrapper_rejects_empty_name() {
        let spec = ToxicSpec::new("", "noop", Direction::Upstream);
        assert!(matches!(
            ToxicWrapper::from_spec(spec),
            Err(ProxyError::Validation(_))
        ));
    }

    #[test]
    fn test_wrapper_updated_keeps_identity() {
        let spec = ToxicSpec::new("slow", "latency", Direction::Downstream)
            .with_attribute("latency", 10.0);
        let wrapper = ToxicWrapper::from_spec(spec).unwrap();
        let updated = wrapper.updated(attrs(&[("latency", 50.0)]), 0.5).unwrap();
        assert_eq!(updated.name(), "slow");
        assert_eq!(updated.direction(), Direction::Downstream);
        assert_eq!(updated.toxicity(), 0.5);
        assert_eq!(
            updated.kind(),
            ToxicKind::Latency {
                latency: Duration::from_millis(50),
                jitter: Duration::ZERO,
            }
        );
    }

    #[test]
    fn test_spec_json_record() {
        let json = r#"{
            "name": "limit_data_downstream",
            "type": "limit_data",
            "stream": "downstream",
            "toxicity": 0.5,
            "attributes": {"bytes": 100}
        }"#;
        let spec: ToxicSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.kind, "limit_data");
        assert_eq!(spec.stream, Direction::Downstream);
        assert!(spec.enabled);
        let wrapper = ToxicWrapper::from_spec(spec).unwrap();
        assert_eq!(wrapper.kind(), ToxicKind::LimitData { bytes: 100 });
    }

    #[test]
    fn test_spec_json_defaults() {
        let json = r#"{"name": "n", "type": "noop", "stream": "upstream"}"#;
        let spec: ToxicSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.toxicity, 1.0);
        assert!(spec.attributes.is_empty());
    }

    #[test]
    fn test_to_spec_uses_type_name() {
        let wrapper =
            ToxicWrapper::from_spec(ToxicSpec::new("r", "reset_peer", Direction::Upstream))
                .unwrap();
        let value = serde_json::to_value(wrapper.to_spec()).unwrap();
        assert_eq!(value["type"], "reset_peer");
        assert_eq!(value["stream"], "upstream");
    }
}
