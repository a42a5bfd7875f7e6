use crate::error::{Json, PatchNotFound, ReadFile, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::path::Path;

/// A named collection of byte patches and the variants that select them.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase", default)]
pub struct PatchFile {
    pub id: String,
    pub name: String,
    pub description: String,
    pub patches: Vec<PatchDefinition>,
    pub variants: Vec<PatchVariant>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase", default)]
pub struct PatchDefinition {
    pub id: String,
    /// Hex tokens, `**` wildcards and `%name%` placeholders.
    pub pattern: Vec<String>,
    pub replacements: Vec<PatchReplacement>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase", default)]
pub struct PatchReplacement {
    /// Offset relative to the start of the match, may be negative.
    pub index: i64,
    pub bytes: String,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase", default)]
pub struct PatchVariant {
    pub id: String,
    pub name: String,
    pub patches: Vec<String>,
    pub variables: Vec<VariantVariable>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
#[serde(rename_all = "lowercase", default)]
pub struct VariantVariable {
    pub variable: String,
    pub value: String,
}

/// Record of one variant applied to a binary, persisted in its metadata.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct AppliedPatch {
    pub patch: String,
    pub variant: String,
}

impl PatchFile {
    /// Parses a patch definition document. Keys are matched case-insensitively
    /// and unknown keys are ignored.
    pub fn from_json(text: &str) -> Result<PatchFile> {
        let value: Value = serde_json::from_str(text).context(Json)?;
        serde_json::from_value(lowercase_keys(value)).context(Json)
    }

    pub fn from_path(path: &Path) -> Result<PatchFile> {
        let text = fs::read_to_string(path).context(ReadFile { path })?;
        PatchFile::from_json(&text)
    }

    pub fn variant(&self, id: &str) -> Option<&PatchVariant> {
        self.variants.iter().find(|v| v.id.eq_ignore_ascii_case(id))
    }

    pub fn patch(&self, id: &str) -> Option<&PatchDefinition> {
        self.patches.iter().find(|p| p.id.eq_ignore_ascii_case(id))
    }

    /// Looks up every patch referenced by `variant`, in the variant's order.
    /// Fails before anything is applied if any id is unknown.
    pub fn resolve(&self, variant: &PatchVariant) -> Result<Vec<&PatchDefinition>> {
        variant
            .patches
            .iter()
            .map(|id| self.patch(id).context(PatchNotFound { id: id.as_str() }))
            .collect()
    }
}

impl PatchVariant {
    pub fn value(&self, variable: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|v| v.variable == variable)
            .map(|v| v.value.as_str())
    }
}

impl AppliedPatch {
    pub fn new(file: &PatchFile, variant: &PatchVariant) -> Self {
        AppliedPatch {
            patch: file.id.clone(),
            variant: variant.id.clone(),
        }
    }
}

/// Maps persisted records back to the loaded patch files. Records whose patch
/// file or variant is not loaded are skipped. A later record for the same patch
/// file replaces an earlier one.
pub fn select_applied<'a>(
    files: &'a [PatchFile],
    applied: &[AppliedPatch],
) -> Vec<(&'a PatchFile, &'a PatchVariant)> {
    let mut selected: Vec<(&PatchFile, &PatchVariant)> = Vec::new();
    for record in applied {
        let file = match files.iter().find(|f| f.id.eq_ignore_ascii_case(&record.patch)) {
            Some(file) => file,
            None => {
                warn!("Unable to find patch with id '{}'", record.patch);
                continue;
            }
        };
        let variant = match file.variant(&record.variant) {
            Some(variant) => variant,
            None => {
                warn!(
                    "Unable to find variant '{}' in patch '{}'",
                    record.variant, file.id
                );
                continue;
            }
        };
        match selected.iter_mut().find(|(f, _)| f.id == file.id) {
            Some(entry) => entry.1 = variant,
            None => selected.push((file, variant)),
        }
    }
    selected
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    const FILE: &str = r#"{
        "Id": "fov",
        "Name": "Field of view",
        "Description": "Widens the field of view",
        "Author": "someone",
        "Patches": [
            { "Id": "Clamp", "Pattern": ["F3 0F 10 05", "** ** ** **"],
              "Replacements": [ { "Index": -2, "Bytes": "90 90" } ] },
            { "id": "scale", "pattern": ["C7 45 %SCALE%"], "REPLACEMENTS": [] }
        ],
        "Variants": [
            { "Id": "wide", "Name": "Wide", "Patches": ["clamp", "SCALE"],
              "Variables": [ { "Variable": "SCALE", "Value": "00 00 80 3F" } ] },
            { "Id": "broken", "Name": "Broken", "Patches": ["missing"] }
        ]
    }"#;

    #[test]
    fn parses_case_insensitive_keys() {
        let file = PatchFile::from_json(FILE).unwrap();
        assert_eq!(file.id, "fov");
        assert_eq!(file.patches.len(), 2);
        assert_eq!(file.patches[0].pattern, vec!["F3 0F 10 05", "** ** ** **"]);
        assert_eq!(
            file.patches[0].replacements,
            vec![PatchReplacement {
                index: -2,
                bytes: "90 90".to_string()
            }]
        );
        assert_eq!(file.variants[0].value("SCALE"), Some("00 00 80 3F"));
        assert_eq!(file.variants[0].value("scale"), None);
        assert!(file.variants[1].variables.is_empty());
    }

    #[test]
    fn resolves_in_variant_order() {
        let file = PatchFile::from_json(FILE).unwrap();
        let variant = file.variant("WIDE").unwrap();
        let ids: Vec<_> = file
            .resolve(variant)
            .unwrap()
            .into_iter()
            .map(|p| p.id.as_str())
            .collect();
        assert_eq!(ids, vec!["Clamp", "scale"]);
    }

    #[test]
    fn missing_patch_fails_resolution() {
        let file = PatchFile::from_json(FILE).unwrap();
        let variant = file.variant("broken").unwrap();
        match file.resolve(variant) {
            Err(Error::PatchNotFound { id }) => assert_eq!(id, "missing"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn selects_applied_variants() {
        let file = PatchFile::from_json(FILE).unwrap();
        let files = vec![file];
        let applied = vec![
            AppliedPatch {
                patch: "FOV".to_string(),
                variant: "broken".to_string(),
            },
            AppliedPatch {
                patch: "unknown".to_string(),
                variant: "x".to_string(),
            },
            AppliedPatch {
                patch: "fov".to_string(),
                variant: "Wide".to_string(),
            },
            AppliedPatch {
                patch: "fov".to_string(),
                variant: "gone".to_string(),
            },
        ];
        let selected = select_applied(&files, &applied);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].1.id, "wide");
    }
}
