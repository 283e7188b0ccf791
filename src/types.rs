use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{PipelineError, Result};

// ── File names ──────────────────────────────────────────────────────────

pub(crate) const SUBJECT_MANIFEST_FILE: &str = "__preproc_dict.json";
pub(crate) const GLOBAL_MANIFEST_FILE: &str = "__final_preproc_dict.json";
pub(crate) const GROUP_STATS_MANIFEST_FILE: &str = "__group_stats.json";
pub(crate) const ERRORS_DIR: &str = "errors";
pub(crate) const TMP_DIR: &str = "tmp";
pub(crate) const GROUP_STATS_DIR: &str = "group_stats";

// ── BValue ──────────────────────────────────────────────────────────────

/// Diffusion weighting of a volume, kept in canonical form.
///
/// The canonical string is what appears as a manifest key: integral values
/// carry a trailing `.0` (`"0.0"`, `"1000.0"`), others use the shortest
/// round-trip representation (`"1000.5"`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct BValue(f64);

impl BValue {
    pub(crate) const ZERO: BValue = BValue(0.0);

    pub(crate) fn new(value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(PipelineError::config(format!(
                "bvalue must be a finite non-negative number, got {value}"
            )));
        }
        // Collapses -0.0 onto 0.0.
        Ok(Self(if value == 0.0 { 0.0 } else { value }))
    }

    pub(crate) fn parse(raw: &str) -> Result<Self> {
        let value = raw
            .trim()
            .parse::<f64>()
            .map_err(|_| PipelineError::config(format!("invalid bvalue '{raw}'")))?;
        Self::new(value)
    }

    #[cfg(test)]
    pub(crate) fn value(self) -> f64 {
        self.0
    }

    pub(crate) fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Short form embedded in file names (`__bval1000`).
    pub(crate) fn label(self) -> String {
        if self.0.fract() == 0.0 {
            format!("{:.0}", self.0)
        } else {
            format!("{}", self.0)
        }
    }
}

impl fmt::Display for BValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.fract() == 0.0 {
            write!(f, "{:.1}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl PartialEq for BValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for BValue {}

impl Hash for BValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for BValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Serialize for BValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct BValueVisitor;

        impl Visitor<'_> for BValueVisitor {
            type Value = BValue;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a non-negative bvalue as number or string")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<BValue, E> {
                BValue::new(v).map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<BValue, E> {
                BValue::new(v as f64).map_err(E::custom)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<BValue, E> {
                BValue::new(v as f64).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<BValue, E> {
                BValue::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(BValueVisitor)
    }
}

// ── Index ───────────────────────────────────────────────────────────────

/// Volume path to bvalue for one subject.
pub(crate) type SubjectVolumes = BTreeMap<PathBuf, BValue>;

/// Subject key to its split diffusion volumes.
pub(crate) type SplitDiffusionIndex = BTreeMap<String, SubjectVolumes>;

/// Group a subject's volumes by bvalue, keeping path order inside a group.
pub(crate) fn group_by_bvalue(volumes: &SubjectVolumes) -> BTreeMap<BValue, Vec<PathBuf>> {
    let mut groups: BTreeMap<BValue, Vec<PathBuf>> = BTreeMap::new();
    for (path, bval) in volumes {
        groups.entry(*bval).or_default().push(path.clone());
    }
    groups
}

// ── Stages ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Stage {
    Denoise,
    Rigid,
    Affine,
    Nonlinear,
    DefField,
    InvDefField,
}

impl Stage {
    pub(crate) const ALL: [Stage; 6] = [
        Stage::Denoise,
        Stage::Rigid,
        Stage::Affine,
        Stage::Nonlinear,
        Stage::DefField,
        Stage::InvDefField,
    ];

    /// Stages whose outputs are images that can be averaged across subjects.
    pub(crate) const IMAGES: [Stage; 4] = [Stage::Denoise, Stage::Rigid, Stage::Affine, Stage::Nonlinear];

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Denoise => "denoise",
            Self::Rigid => "rigid",
            Self::Affine => "affine",
            Self::Nonlinear => "nonlinear",
            Self::DefField => "def_field",
            Self::InvDefField => "inv_def_field",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Manifests ───────────────────────────────────────────────────────────

pub(crate) type StageOutputs = BTreeMap<BValue, PathBuf>;

/// Outputs of one subject, one optional field per stage.
///
/// Serializes to `{stage: {bvalue: path}}`. Older spellings of the
/// nonlinear stage are accepted on read and never written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct SubjectManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) denoise: Option<StageOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) rigid: Option<StageOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) affine: Option<StageOutputs>,
    #[serde(
        default,
        alias = "non-linear",
        alias = "non_linear",
        skip_serializing_if = "Option::is_none"
    )]
    pub(crate) nonlinear: Option<StageOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) def_field: Option<StageOutputs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inv_def_field: Option<StageOutputs>,
}

impl SubjectManifest {
    pub(crate) fn stage(&self, stage: Stage) -> Option<&StageOutputs> {
        match stage {
            Stage::Denoise => self.denoise.as_ref(),
            Stage::Rigid => self.rigid.as_ref(),
            Stage::Affine => self.affine.as_ref(),
            Stage::Nonlinear => self.nonlinear.as_ref(),
            Stage::DefField => self.def_field.as_ref(),
            Stage::InvDefField => self.inv_def_field.as_ref(),
        }
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut StageOutputs {
        let slot = match stage {
            Stage::Denoise => &mut self.denoise,
            Stage::Rigid => &mut self.rigid,
            Stage::Affine => &mut self.affine,
            Stage::Nonlinear => &mut self.nonlinear,
            Stage::DefField => &mut self.def_field,
            Stage::InvDefField => &mut self.inv_def_field,
        };
        slot.get_or_insert_with(BTreeMap::new)
    }

    pub(crate) fn record(&mut self, stage: Stage, bval: BValue, path: impl Into<PathBuf>) {
        self.stage_mut(stage).insert(bval, path.into());
    }

    pub(crate) fn leaf_paths(&self) -> Vec<&Path> {
        Stage::ALL
            .iter()
            .filter_map(|stage| self.stage(*stage))
            .flat_map(|outputs| outputs.values().map(PathBuf::as_path))
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.leaf_paths().is_empty()
    }

    /// Drop stages that were initialised but never filled.
    pub(crate) fn prune_empty(&mut self) {
        for slot in [
            &mut self.denoise,
            &mut self.rigid,
            &mut self.affine,
            &mut self.nonlinear,
            &mut self.def_field,
            &mut self.inv_def_field,
        ] {
            if slot.as_ref().is_some_and(|m| m.is_empty()) {
                *slot = None;
            }
        }
    }
}

/// Subject key to manifest; also the on-disk shape of a subject manifest file.
pub(crate) type GlobalManifest = BTreeMap<String, SubjectManifest>;

// ── Run options ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub(crate) enum RerunStrategy {
    /// Reuse complete prior results, rerun incomplete ones from scratch.
    #[default]
    Resume,
    /// Always delete prior results and rerun.
    Delete,
    /// Rerun on top of whatever is already there.
    Force,
}

impl RerunStrategy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Resume => "resume",
            Self::Delete => "delete",
            Self::Force => "force",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum CommandSpec {
    String(String),
    Array(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EngineSpec {
    pub(crate) command: CommandSpec,
    #[serde(default)]
    pub(crate) timeout_ms: Option<u64>,
}

/// Directory-safe form of a subject key.
pub(crate) fn safe_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bvalue_canonical_strings() {
        assert_eq!(BValue::new(0.0).unwrap().to_string(), "0.0");
        assert_eq!(BValue::new(-0.0).unwrap().to_string(), "0.0");
        assert_eq!(BValue::new(1000.0).unwrap().to_string(), "1000.0");
        assert_eq!(BValue::new(1000.5).unwrap().to_string(), "1000.5");
        assert_eq!(BValue::parse("1000").unwrap().to_string(), "1000.0");
        assert_eq!(BValue::new(1000.0).unwrap().label(), "1000");
    }

    #[test]
    fn test_bvalue_rejects_negative_and_nan() {
        assert!(BValue::new(-1.0).is_err());
        assert!(BValue::new(f64::NAN).is_err());
        assert!(BValue::parse("abc").is_err());
    }

    #[test]
    fn test_bvalue_orders_numerically() {
        let mut values = vec![
            BValue::parse("1000").unwrap(),
            BValue::parse("0").unwrap(),
            BValue::parse("500").unwrap(),
        ];
        values.sort();
        let rendered: Vec<String> = values.iter().map(|b| b.to_string()).collect();
        assert_eq!(rendered, vec!["0.0", "500.0", "1000.0"]);
    }

    #[test]
    fn test_manifest_serializes_nested_shape() {
        let mut manifest = SubjectManifest::default();
        manifest.record(Stage::Rigid, BValue::ZERO, "/out/r0.nii");
        manifest.record(Stage::Rigid, BValue::new(1000.0).unwrap(), "/out/r1000.nii");
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"rigid": {"0.0": "/out/r0.nii", "1000.0": "/out/r1000.nii"}})
        );
    }

    #[test]
    fn test_manifest_accepts_legacy_nonlinear_spelling() {
        let raw = r#"{"non-linear": {"0.0": "/out/w0.nii"}}"#;
        let manifest: SubjectManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(
            manifest.nonlinear.unwrap().get(&BValue::ZERO).unwrap(),
            Path::new("/out/w0.nii")
        );
    }

    #[test]
    fn test_prune_empty_removes_unfilled_stages() {
        let mut manifest = SubjectManifest::default();
        manifest.stage_mut(Stage::InvDefField);
        manifest.record(Stage::Denoise, BValue::ZERO, "/out/d.nii");
        manifest.prune_empty();
        assert!(manifest.inv_def_field.is_none());
        assert!(manifest.denoise.is_some());
    }

    #[test]
    fn test_safe_key_replaces_separators() {
        assert_eq!(safe_key("site/A 01"), "site_A_01");
        assert_eq!(safe_key(".."), "_..");
        assert_eq!(safe_key("sub-01.ses_2"), "sub-01.ses_2");
    }
}
