//! Source configuration: tag definitions, tag instructions, gating
//! defaults and the conflict-ignore list.
//!
//! The file is YAML with 1-indexed cross-references:
//!
//! ```yaml
//! tags:
//!   - name: stage
//!     type: Section
//!   - name: body
//!     type: SectionTask
//! tagInstructions:
//!   - tag: 1
//!     location: 12
//!     type: Start
//!   - tag: 1
//!     location: 31
//!     type: Stop
//! flags:
//!   processCallsByDefault: true
//!   processAccessesByDefault: true
//! ignore:
//!   - function: 4
//!     delta: 2
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::domain::{
    ConfigError, FunctionId, Tag, TagInstruction, TagInstructionKind, TagKind,
};

#[derive(Debug, Deserialize)]
struct RawSourceConfig {
    #[serde(default)]
    tags: Vec<RawTag>,
    #[serde(default, rename = "tagInstructions")]
    tag_instructions: Vec<RawTagInstruction>,
    #[serde(default)]
    flags: RawFlags,
    #[serde(default)]
    ignore: Vec<RawIgnore>,
}

#[derive(Debug, Deserialize)]
struct RawTag {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawTagInstruction {
    /// 1-based index into `tags`.
    tag: i64,
    /// Source-location id the instrumentation resolves against.
    location: i64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawFlags {
    #[serde(default, rename = "processCallsByDefault")]
    process_calls_by_default: bool,
    #[serde(default, rename = "processAccessesByDefault")]
    process_accesses_by_default: bool,
}

#[derive(Debug, Deserialize)]
struct RawIgnore {
    function: FunctionId,
    delta: i64,
}

/// An access site excluded from conflict detection: line `delta` below the
/// first line of `function`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictIgnore {
    pub function: FunctionId,
    pub delta: i64,
}

#[derive(Debug)]
pub struct SourceConfig {
    /// Tag ids are the 1-based position in the file.
    pub tags: Vec<Tag>,
    /// Tag-instruction ids are the 1-based position in the file.
    pub tag_instructions: Vec<TagInstruction>,
    pub process_calls_by_default: bool,
    pub process_accesses_by_default: bool,
    pub conflict_ignores: Vec<ConflictIgnore>,
}

impl SourceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_text = path.as_ref().display().to_string();
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path_text.clone(), source })?;
        Self::parse(&text, &path_text)
    }

    fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let raw: RawSourceConfig = serde_yaml::from_str(text)
            .map_err(|source| ConfigError::Yaml { path: path.to_string(), source })?;

        let mut tags = Vec::with_capacity(raw.tags.len());
        for (index, tag) in raw.tags.iter().enumerate() {
            let kind = TagKind::from_config_name(&tag.kind).ok_or_else(|| ConfigError::Invalid {
                path: path.to_string(),
                message: format!("unknown tag type '{}'", tag.kind),
            })?;
            let id = i64::try_from(index + 1).unwrap_or(i64::MAX);
            tags.push(Tag { id, name: tag.name.clone(), kind });
        }

        let mut tag_instructions = Vec::with_capacity(raw.tag_instructions.len());
        for (index, instruction) in raw.tag_instructions.iter().enumerate() {
            let tag_count = i64::try_from(tags.len()).unwrap_or(i64::MAX);
            if instruction.tag < 1 || instruction.tag > tag_count {
                return Err(ConfigError::Invalid {
                    path: path.to_string(),
                    message: format!("tag instruction {} references unknown tag", index + 1),
                });
            }
            let kind = TagInstructionKind::from_config_name(&instruction.kind).ok_or_else(|| {
                ConfigError::Invalid {
                    path: path.to_string(),
                    message: format!("unknown tag instruction type '{}'", instruction.kind),
                }
            })?;
            let id = i64::try_from(index + 1).unwrap_or(i64::MAX);
            tag_instructions.push(TagInstruction {
                id,
                tag: instruction.tag,
                location: instruction.location,
                kind,
            });
        }

        Ok(Self {
            tags,
            tag_instructions,
            process_calls_by_default: raw.flags.process_calls_by_default,
            process_accesses_by_default: raw.flags.process_accesses_by_default,
            conflict_ignores: raw
                .ignore
                .iter()
                .map(|i| ConflictIgnore { function: i.function, delta: i.delta })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "
tags:
  - name: stage
    type: Section
  - name: body
    type: SectionTask
tagInstructions:
  - tag: 1
    location: 12
    type: Start
  - tag: 1
    location: 31
    type: Stop
flags:
  processCallsByDefault: true
ignore:
  - function: 4
    delta: 2
";

    #[test]
    fn parses_tags_with_one_based_ids() {
        let config = SourceConfig::parse(SOURCE, "source.yaml").expect("valid config");
        assert_eq!(config.tags.len(), 2);
        assert_eq!(config.tags[0].id, 1);
        assert_eq!(config.tags[0].kind, TagKind::Section);
        assert_eq!(config.tags[1].id, 2);
        assert_eq!(config.tags[1].kind, TagKind::SectionTask);

        assert_eq!(config.tag_instructions.len(), 2);
        assert_eq!(config.tag_instructions[0].id, 1);
        assert_eq!(config.tag_instructions[0].tag, 1);
        assert_eq!(config.tag_instructions[1].kind, TagInstructionKind::Stop);

        assert!(config.process_calls_by_default);
        assert!(!config.process_accesses_by_default);
        assert_eq!(config.conflict_ignores, vec![ConflictIgnore { function: 4, delta: 2 }]);
    }

    #[test]
    fn unknown_tag_type_is_rejected() {
        let err = SourceConfig::parse("tags:\n  - name: x\n    type: Sectional\n", "source.yaml");
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn dangling_tag_reference_is_rejected() {
        let text = "
tags:
  - name: x
    type: Simple
tagInstructions:
  - tag: 9
    location: 1
    type: Start
";
        let err = SourceConfig::parse(text, "source.yaml");
        assert!(matches!(err, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn empty_document_defaults_everything_off() {
        let config = SourceConfig::parse("{}", "source.yaml").expect("empty config");
        assert!(config.tags.is_empty());
        assert!(!config.process_calls_by_default);
        assert!(!config.process_accesses_by_default);
    }
}
