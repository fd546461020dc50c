use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_yaml::Mapping;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::pipeline::OperationMode;

/// Keys every library template header is expected to carry.
pub const REQUIRED_HEADER_KEYS: [&str; 3] = ["flow", "variant", "changelog"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVariant {
    #[default]
    Basic,
    Advanced,
}

impl PromptVariant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" | "basico" => Some(Self::Basic),
            "advanced" | "avancado" => Some(Self::Advanced),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to read prompt {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML header in prompt {}: {source}", path.display())]
    Header {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("YAML header in prompt {} must be a mapping", path.display())]
    HeaderNotMapping { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    pub body: String,
    pub header: Option<Mapping>,
    pub source: PathBuf,
}

impl PromptTemplate {
    pub fn sha256(&self) -> String {
        format!("{:x}", Sha256::digest(self.body.as_bytes()))
    }

    pub fn missing_header_keys(&self) -> Vec<&'static str> {
        REQUIRED_HEADER_KEYS
            .into_iter()
            .filter(|key| {
                let value = self.header.as_ref().and_then(|header| header.get(*key));
                value.map_or(true, serde_yaml::Value::is_null)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptSummary {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_header_keys: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn prompt_file_name(mode: OperationMode, variant: PromptVariant) -> &'static str {
    match (mode, variant) {
        (OperationMode::Rating, PromptVariant::Basic) => "rating_basic.md",
        (OperationMode::Rating, PromptVariant::Advanced) => "rating_advanced.md",
        (OperationMode::Tagging, PromptVariant::Basic) => "tagging_basic.md",
        (OperationMode::Tagging, PromptVariant::Advanced) => "tagging_advanced.md",
        (OperationMode::Export, PromptVariant::Basic) => "export_basic.md",
        (OperationMode::Export, PromptVariant::Advanced) => "export_advanced.md",
        (OperationMode::Treatment, PromptVariant::Basic) => "treatment_basic.md",
        (OperationMode::Treatment, PromptVariant::Advanced) => "treatment_advanced.md",
        (OperationMode::Full, _) => "full.md",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptLibrary {
    dir: PathBuf,
}

impl PromptLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, mode: OperationMode, variant: PromptVariant) -> PathBuf {
        self.dir.join(prompt_file_name(mode, variant))
    }

    /// An override file, when given, replaces the library lookup entirely.
    pub fn load(
        &self,
        mode: OperationMode,
        variant: PromptVariant,
        override_file: Option<&Path>,
    ) -> Result<PromptTemplate, PromptError> {
        let path = match override_file {
            Some(path) => path.to_path_buf(),
            None => self.path_for(mode, variant),
        };
        load_prompt_file(&path)
    }

    /// Markdown templates available in the library, sorted by name.
    pub fn list(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "md"))
            .collect();
        files.sort();
        files
    }

    /// One entry per template: its hash and header gaps, or why it failed to load.
    pub fn summaries(&self) -> Vec<PromptSummary> {
        self.list()
            .into_iter()
            .map(|path| {
                let file = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match load_prompt_file(&path) {
                    Ok(template) => PromptSummary {
                        file,
                        sha256: Some(template.sha256()),
                        missing_header_keys: template.missing_header_keys(),
                        error: None,
                    },
                    Err(err) => PromptSummary {
                        file,
                        sha256: None,
                        missing_header_keys: Vec::new(),
                        error: Some(err.to_string()),
                    },
                }
            })
            .collect()
    }
}

pub fn load_prompt_file(path: &Path) -> Result<PromptTemplate, PromptError> {
    let content = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PromptError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            PromptError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    let (header, body) = split_front_matter(&content)
        .map(|(raw_header, body)| -> Result<_, PromptError> {
            let parsed: serde_yaml::Value =
                serde_yaml::from_str(raw_header).map_err(|source| PromptError::Header {
                    path: path.to_path_buf(),
                    source,
                })?;
            match parsed {
                serde_yaml::Value::Mapping(mapping) => Ok((Some(mapping), body)),
                serde_yaml::Value::Null => Ok((None, body)),
                _ => Err(PromptError::HeaderNotMapping {
                    path: path.to_path_buf(),
                }),
            }
        })
        .transpose()?
        .unwrap_or((None, content.as_str()));

    Ok(PromptTemplate {
        body: body.to_string(),
        header,
        source: path.to_path_buf(),
    })
}

/// `---\n<yaml>\n---\n<body>` split into its two halves.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let (header, body) = rest.split_once("---")?;
    Some((header, body.trim_start_matches(['\r', '\n'])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_library() -> PromptLibrary {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("shutter_prompts_{stamp}"));
        fs::create_dir_all(&dir).expect("prompt dir should be created");
        PromptLibrary::new(dir)
    }

    #[test]
    fn maps_modes_and_variants_to_files() {
        assert_eq!(
            prompt_file_name(OperationMode::Tagging, PromptVariant::Advanced),
            "tagging_advanced.md"
        );
        assert_eq!(prompt_file_name(OperationMode::Full, PromptVariant::Advanced), "full.md");
        assert_eq!(PromptVariant::parse("avancado"), Some(PromptVariant::Advanced));
        assert_eq!(PromptVariant::parse("expert"), None);
    }

    #[test]
    fn strips_yaml_header_from_body() {
        let library = temp_library();
        fs::write(
            library.path_for(OperationMode::Rating, PromptVariant::Basic),
            "---\nflow: rating\nvariant: basic\n---\nRate each image from -1 to 5.\n",
        )
        .expect("prompt should be written");

        let template = library
            .load(OperationMode::Rating, PromptVariant::Basic, None)
            .expect("prompt should load");

        assert_eq!(template.body, "Rate each image from -1 to 5.\n");
        let header = template.header.as_ref().expect("header should be parsed");
        assert_eq!(
            header.get("flow").and_then(serde_yaml::Value::as_str),
            Some("rating")
        );
        assert_eq!(template.sha256().len(), 64);
    }

    #[test]
    fn plain_prompt_has_no_header() {
        let library = temp_library();
        let path = library.dir().join("custom.md");
        fs::write(&path, "Just tag things.").expect("prompt should be written");

        let template = library
            .load(OperationMode::Tagging, PromptVariant::Basic, Some(&path))
            .expect("override prompt should load");

        assert_eq!(template.body, "Just tag things.");
        assert!(template.header.is_none());
        assert_eq!(template.source, path);
    }

    #[test]
    fn scalar_header_is_rejected() {
        let library = temp_library();
        let path = library.path_for(OperationMode::Export, PromptVariant::Basic);
        fs::write(&path, "---\njust a string\n---\nbody").expect("prompt should be written");

        let error = library
            .load(OperationMode::Export, PromptVariant::Basic, None)
            .expect_err("scalar header should fail");
        assert!(matches!(error, PromptError::HeaderNotMapping { .. }));
    }

    #[test]
    fn missing_prompt_reports_path() {
        let library = temp_library();
        let error = library
            .load(OperationMode::Treatment, PromptVariant::Advanced, None)
            .expect_err("missing prompt should fail");
        assert!(error.to_string().contains("treatment_advanced.md"));
    }

    #[test]
    fn lists_markdown_templates_sorted() {
        let library = temp_library();
        fs::write(library.dir().join("b.md"), "b").expect("prompt should be written");
        fs::write(library.dir().join("a.md"), "a").expect("prompt should be written");
        fs::write(library.dir().join("notes.txt"), "x").expect("file should be written");

        let names: Vec<String> = library
            .list()
            .iter()
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }

    #[test]
    fn header_keys_are_checked() {
        let library = temp_library();
        let path = library.dir().join("rating_basic.md");
        fs::write(&path, "---\nflow: rating\nvariant: basic\nchangelog: ~\n---\nRate.")
            .expect("prompt should be written");
        let template = load_prompt_file(&path).expect("prompt should load");
        assert_eq!(template.missing_header_keys(), vec!["changelog"]);

        let bare = PromptTemplate {
            body: String::from("Rate."),
            header: None,
            source: path,
        };
        assert_eq!(bare.missing_header_keys(), REQUIRED_HEADER_KEYS.to_vec());
    }

    #[test]
    fn summaries_report_hashes_and_load_failures() {
        let library = temp_library();
        fs::write(
            library.dir().join("export_basic.md"),
            "---\nflow: export\nvariant: basic\nchangelog: first cut\n---\nPick keepers.",
        )
        .expect("prompt should be written");
        fs::write(library.dir().join("tagging_basic.md"), "---\n[unclosed\n---\nTag.")
            .expect("prompt should be written");

        let summaries = library.summaries();

        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].file, "export_basic.md");
        assert_eq!(summaries[0].sha256.as_deref().map(str::len), Some(64));
        assert!(summaries[0].missing_header_keys.is_empty());
        assert!(summaries[0].error.is_none());
        assert_eq!(summaries[1].file, "tagging_basic.md");
        assert!(summaries[1].sha256.is_none());
        assert!(summaries[1]
            .error
            .as_deref()
            .is_some_and(|error| error.contains("invalid YAML header")));
    }
}
