mod client;
pub mod conditions;
mod error;

pub use self::client::*;
pub use self::error::Error as ShimError;
use self::error::Result;

use crate::constants;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use lazy_static::lazy_static;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::{ensure, OptionExt, ResultExt};
use validator::{Validate, ValidationError};

use std::collections::BTreeMap;
use std::fmt;

lazy_static! {
    // Name segment of a label key, and the full grammar of a label value (which may also be empty).
    static ref LABEL_NAME_RE: regex::Regex =
        regex::Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$")
            .expect("Invalid regex literal.");
    // DNS-1123 subdomain, used as the optional prefix of a label key.
    static ref DNS_SUBDOMAIN_RE: regex::Regex = regex::Regex::new(
        r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$"
    )
    .expect("Invalid regex literal.");
}

const LABEL_NAME_MAX_LENGTH: usize = 63;
const LABEL_PREFIX_MAX_LENGTH: usize = 253;

// We can't use these consts inside macros, but we do provide constants for use in generating
// kubernetes objects.
pub const K8S_SHIM_KIND: &str = "Shim";

/// `ShimSpec` declares which shim binary should be installed, on which nodes, and how quickly the
/// installation may roll across them. The controller owns the `ShimStatus`.
#[derive(
    Clone, CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, JsonSchema, Validate,
)]
#[kube(
    derive = "Default",
    derive = "PartialEq",
    group = "runtime.k8s.containerd.io",
    kind = "Shim",
    namespaced,
    plural = "shims",
    singular = "shim",
    status = "ShimStatus",
    version = "v1alpha1",
    printcolumn = r#"{"name":"Runtime Class", "type":"string", "jsonPath":".spec.runtimeClass"}"#,
    printcolumn = r#"{"name":"Upgraded", "type":"string", "jsonPath":".status.upgradedNodes[*].name"}"#,
    printcolumn = r#"{"name":"Upgrading", "type":"string", "jsonPath":".status.upgradingNodes[*].name"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ShimSpec {
    /// Labels a node must carry for the shim to be installed on it. An empty selector matches
    /// every node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[validate(custom = "validate_node_selector")]
    pub node_selector: BTreeMap<String, String>,
    /// Where the shim binary is fetched from.
    pub source: ShimSource,
    /// Name of the RuntimeClass handled by the shim. Opaque to the controller.
    #[validate(length(min = 1))]
    pub runtime_class: String,
    /// How the installation is rolled across the selected nodes.
    pub rollout_strategy: ShimRolloutStrategy,
}

/// Only one of its members may be specified.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShimSource {
    /// A shim hosted at a URL which can be downloaded anonymously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_http: Option<AnonymousHttpSource>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnonymousHttpSource {
    /// URL of the shim's .tar.gz archive.
    #[validate(url)]
    pub location: String,
    /// Name of the file inside the archive which contains the shim.
    #[validate(length(min = 1))]
    pub file: String,
}

/// Only one of its members may be specified.
#[derive(Clone, Serialize, Deserialize, Debug, Default, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShimRolloutStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling: Option<RollingRolloutStrategy>,
}

#[derive(Clone, Serialize, Deserialize, Debug, Eq, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollingRolloutStrategy {
    /// The maximum number of nodes which may be upgrading at any given time. Either an absolute
    /// number (ex: 5) or a percentage of the selected nodes (ex: "10%").
    pub max_unavailable: IntOrString,
}

/// Identifies a specific k8s node. The uid distinguishes a node from a later node which reuses its
/// name.
#[derive(
    Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, JsonSchema,
)]
pub struct NodeReference {
    pub name: String,
    pub uid: String,
}

impl NodeReference {
    pub fn new<S1: Into<String>, S2: Into<String>>(name: S1, uid: S2) -> Self {
        NodeReference {
            name: name.into(),
            uid: uid.into(),
        }
    }
}

impl fmt::Display for NodeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.uid)
    }
}

/// `ShimStatus` records how far the rollout of the current source has progressed. Every node
/// selected by the `Shim` is in at most one of the three node lists.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShimStatus {
    /// The generation last processed by the controller.
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// The source the current rollout delivers. A differing spec source restarts the rollout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_source: Option<ShimSource>,
    /// Generation at which `observed_source` was first seen. Node reports older than this belong
    /// to a previous rollout.
    #[serde(default)]
    pub source_generation: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgraded_nodes: Vec<NodeReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrading_nodes: Vec<NodeReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queued_nodes: Vec<NodeReference>,
}

/// The validated form of `ShimSource`: exactly one kind of source.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShimSourceKind {
    AnonymousHttp(AnonymousHttpSource),
}

/// The validated form of `ShimRolloutStrategy`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RolloutStrategy {
    Rolling { max_unavailable: MaxUnavailable },
}

/// A bound on concurrently upgrading nodes, before it is resolved against the number of selected
/// nodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MaxUnavailable {
    Count(u32),
    Percent(u32),
}

/// A `ShimSpec` whose oneOf fields and selector have been checked.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedShimSpec<'a> {
    pub node_selector: &'a BTreeMap<String, String>,
    pub source: ShimSourceKind,
    pub strategy: RolloutStrategy,
}

impl ShimSpec {
    /// Checks field constraints and that exactly one variant of each oneOf field is populated.
    pub fn validated(&self) -> Result<ValidatedShimSpec<'_>> {
        self.validate().context(error::InvalidFieldsSnafu)?;
        Ok(ValidatedShimSpec {
            node_selector: &self.node_selector,
            source: self.source.kind()?,
            strategy: self.rollout_strategy.strategy()?,
        })
    }
}

impl ShimSource {
    pub fn kind(&self) -> Result<ShimSourceKind> {
        // Further source kinds join this match; more than one populated member is rejected there.
        let http = self
            .anonymous_http
            .as_ref()
            .context(error::MissingVariantSnafu { field: "source" })?;
        http.validate().context(error::InvalidFieldsSnafu)?;
        Ok(ShimSourceKind::AnonymousHttp(http.clone()))
    }
}

impl ShimRolloutStrategy {
    pub fn strategy(&self) -> Result<RolloutStrategy> {
        let rolling = self.rolling.as_ref().context(error::MissingVariantSnafu {
            field: "rolloutStrategy",
        })?;
        Ok(RolloutStrategy::Rolling {
            max_unavailable: MaxUnavailable::try_from(&rolling.max_unavailable)?,
        })
    }
}

impl TryFrom<&IntOrString> for MaxUnavailable {
    type Error = ShimError;

    fn try_from(value: &IntOrString) -> Result<Self> {
        match value {
            IntOrString::Int(count) => {
                ensure!(
                    *count >= 0,
                    error::InvalidMaxUnavailableSnafu {
                        value: count.to_string()
                    }
                );
                Ok(MaxUnavailable::Count(*count as u32))
            }
            IntOrString::String(s) => s
                .strip_suffix('%')
                .and_then(|percent| percent.parse::<u32>().ok())
                .map(MaxUnavailable::Percent)
                .context(error::InvalidMaxUnavailableSnafu { value: s.clone() }),
        }
    }
}

fn validate_node_selector(
    selector: &BTreeMap<String, String>,
) -> std::result::Result<(), ValidationError> {
    for (key, value) in selector {
        if !is_label_key(key) {
            let mut err = ValidationError::new("label_key");
            err.message = Some(format!("invalid node selector key '{}'", key).into());
            return Err(err);
        }
        if !is_label_value(value) {
            let mut err = ValidationError::new("label_value");
            err.message = Some(
                format!("invalid node selector value '{}' for key '{}'", value, key).into(),
            );
            return Err(err);
        }
    }
    Ok(())
}

fn is_label_key(key: &str) -> bool {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    let prefix_ok = prefix.map_or(true, |prefix| {
        prefix.len() <= LABEL_PREFIX_MAX_LENGTH && DNS_SUBDOMAIN_RE.is_match(prefix)
    });
    prefix_ok && name.len() <= LABEL_NAME_MAX_LENGTH && LABEL_NAME_RE.is_match(name)
}

fn is_label_value(value: &str) -> bool {
    value.is_empty() || (value.len() <= LABEL_NAME_MAX_LENGTH && LABEL_NAME_RE.is_match(value))
}

/// Namespace and name of a `Shim`.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ShimKey {
    pub namespace: String,
    pub name: String,
}

impl ShimKey {
    pub fn new<S1: Into<String>, S2: Into<String>>(namespace: S1, name: S2) -> Self {
        ShimKey {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The `Node` annotation key a node-side installer uses to report on this shim.
    pub fn report_annotation_key(&self) -> String {
        format!(
            "{}/{}.{}",
            constants::NODE_REPORT_ANNOTATION_PREFIX,
            self.namespace,
            self.name
        )
    }
}

impl fmt::Display for ShimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Shim {
    pub fn key(&self) -> ShimKey {
        ShimKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers()
            .iter()
            .any(|finalizer| finalizer == constants::SHIM_FINALIZER)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn spec() -> ShimSpec {
        ShimSpec {
            node_selector: btreemap! {
                "runtime.k8s.containerd.io/spin".to_string() => "true".to_string(),
            },
            source: ShimSource {
                anonymous_http: Some(AnonymousHttpSource {
                    location: "https://example.com/shim-v1.tar.gz".to_string(),
                    file: "containerd-shim-spin-v2".to_string(),
                }),
            },
            runtime_class: "wasmtime-spin".to_string(),
            rollout_strategy: ShimRolloutStrategy {
                rolling: Some(RollingRolloutStrategy {
                    max_unavailable: IntOrString::String("40%".to_string()),
                }),
            },
        }
    }

    #[test]
    fn test_valid_spec() {
        let spec = spec();
        let validated = spec.validated().unwrap();
        assert_eq!(
            validated.strategy,
            RolloutStrategy::Rolling {
                max_unavailable: MaxUnavailable::Percent(40)
            }
        );
        assert!(matches!(validated.source, ShimSourceKind::AnonymousHttp(_)));
    }

    #[test]
    fn test_missing_variants_rejected() {
        let mut no_source = spec();
        no_source.source.anonymous_http = None;
        assert!(no_source.validated().is_err());

        let mut no_strategy = spec();
        no_strategy.rollout_strategy.rolling = None;
        assert!(no_strategy.validated().is_err());
    }

    #[test]
    fn test_invalid_fields_rejected() {
        let mut bad_url = spec();
        bad_url.source.anonymous_http.as_mut().unwrap().location = "not a url".to_string();
        assert!(bad_url.validated().is_err());

        let mut bad_selector = spec();
        bad_selector
            .node_selector
            .insert("bad key!".to_string(), "x".to_string());
        assert!(bad_selector.validated().is_err());

        let mut bad_value = spec();
        bad_value
            .node_selector
            .insert("kind".to_string(), "-leading-dash".to_string());
        assert!(bad_value.validated().is_err());
    }

    #[test]
    fn test_max_unavailable_parsing() {
        let test_cases = vec![
            (IntOrString::Int(3), Some(MaxUnavailable::Count(3))),
            (IntOrString::Int(0), Some(MaxUnavailable::Count(0))),
            (IntOrString::Int(-1), None),
            (
                IntOrString::String("25%".to_string()),
                Some(MaxUnavailable::Percent(25)),
            ),
            (IntOrString::String("25".to_string()), None),
            (IntOrString::String("x%".to_string()), None),
        ];
        for (value, expected) in test_cases {
            assert_eq!(MaxUnavailable::try_from(&value).ok(), expected, "{:?}", value);
        }
    }

    #[test]
    fn test_label_grammar() {
        assert!(is_label_key("kubernetes.io/arch"));
        assert!(is_label_key("arch"));
        assert!(!is_label_key("Bad_Prefix/arch"));
        assert!(!is_label_key(""));
        assert!(is_label_value(""));
        assert!(is_label_value("amd64"));
        assert!(!is_label_value(&"a".repeat(64)));
    }

    #[test]
    fn test_status_wire_format() {
        let status = ShimStatus {
            upgrading_nodes: vec![NodeReference::new("node-a", "uid-a")],
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["upgradingNodes"][0]["name"], "node-a");
        assert!(value.get("queuedNodes").is_none());
    }
}
