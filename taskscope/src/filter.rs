//! Regex include/exclude filters over images, files and functions.
//!
//! A name is filtered out when the include list is non-empty and nothing
//! matches, or when any exclude pattern matches. Filters run where the
//! front-end would have applied them: while the trace's cross-reference
//! tables are loaded.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::domain::ConfigError;

#[derive(Debug, Default, Deserialize)]
struct RawFilterList {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Default)]
struct FilterList {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl FilterList {
    fn compile(raw: &RawFilterList) -> Result<Self, ConfigError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, ConfigError> {
            patterns
                .iter()
                .map(|pattern| {
                    Regex::new(pattern).map_err(|source| ConfigError::Pattern {
                        pattern: pattern.clone(),
                        source,
                    })
                })
                .collect()
        };
        Ok(Self { include: compile(&raw.include)?, exclude: compile(&raw.exclude)? })
    }

    fn is_filtered(&self, content: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(content)) {
            return true;
        }
        self.exclude.iter().any(|re| re.is_match(content))
    }
}

/// Compiled filter configuration. [`Filter::default`] passes everything.
#[derive(Debug, Default)]
pub struct Filter {
    image: FilterList,
    file: FilterList,
    function: FilterList,
}

impl Filter {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_text = path.as_ref().display().to_string();
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path_text.clone(), source })?;
        Self::parse(&text, &path_text)
    }

    fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let mut raw: HashMap<String, RawFilterList> = serde_yaml::from_str(text)
            .map_err(|source| ConfigError::Yaml { path: path.to_string(), source })?;

        let mut take = |name: &str| -> Result<FilterList, ConfigError> {
            raw.remove(name).as_ref().map_or_else(|| Ok(FilterList::default()), FilterList::compile)
        };

        Ok(Self { image: take("image")?, file: take("file")?, function: take("function")? })
    }

    /// Parse from a YAML string without touching the filesystem.
    #[cfg(test)]
    pub fn parse_for_tests(text: &str) -> Self {
        Self::parse(text, "filter.yaml").expect("valid filter text")
    }

    #[must_use]
    pub fn is_image_filtered(&self, image: &str) -> bool {
        self.image.is_filtered(image)
    }

    #[must_use]
    pub fn is_file_filtered(&self, file: &str) -> bool {
        self.file.is_filtered(file)
    }

    #[must_use]
    pub fn is_function_filtered(&self, function: &str) -> bool {
        self.function.is_filtered(function)
    }
}
