//! Model picking and import
//!
//! A [`ModelPicker`] produces the path of a model file to load, or reports
//! that the user cancelled. Cancellation is not an error: it is logged and
//! nothing else happens.
//!
//! Picked files can be copied into a cache directory before loading, so the
//! loaded copy survives the original being moved. Copies live under
//! `<cache>/models/` and an existing copy of the same name is reused. Files
//! picked from inside that directory are used as they are.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{LlamaChatError, Result};

/// Result of a pick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickOutcome {
    /// The user chose this file
    Picked(PathBuf),
    /// The user dismissed the picker
    Cancelled,
}

/// Source of model file choices
#[async_trait]
pub trait ModelPicker: Send {
    /// Ask for a model file
    async fn pick(&mut self) -> Result<PickOutcome>;
}

/// Line-oriented user input
///
/// `Ok(None)` means the input was closed.
#[async_trait]
pub trait LineInput: Send {
    /// Show `prompt` and read one line
    async fn read_line(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Picker that asks for a path on a line input
pub struct PromptPicker<'a, I: LineInput> {
    input: &'a mut I,
}

impl<'a, I: LineInput> PromptPicker<'a, I> {
    /// Create a picker reading from `input`
    pub fn new(input: &'a mut I) -> Self {
        Self { input }
    }
}

#[async_trait]
impl<I: LineInput> ModelPicker for PromptPicker<'_, I> {
    async fn pick(&mut self) -> Result<PickOutcome> {
        let line = self.input.read_line("Model path (empty to cancel): ").await?;
        let outcome = interpret_pick(line.as_deref());
        if outcome == PickOutcome::Cancelled {
            tracing::info!("No file picked");
        }
        Ok(outcome)
    }
}

/// Turn a typed answer into a pick
///
/// Surrounding whitespace and one pair of matching quotes are removed, as
/// left by terminals that paste dropped files. Empty or missing input is a
/// cancellation.
///
/// # Examples
///
/// ```
/// use llamachat::picker::{interpret_pick, PickOutcome};
/// use std::path::PathBuf;
///
/// assert_eq!(
///     interpret_pick(Some(" '/models/tiny.gguf' ")),
///     PickOutcome::Picked(PathBuf::from("/models/tiny.gguf"))
/// );
/// assert_eq!(interpret_pick(Some("   ")), PickOutcome::Cancelled);
/// assert_eq!(interpret_pick(None), PickOutcome::Cancelled);
/// ```
pub fn interpret_pick(line: Option<&str>) -> PickOutcome {
    let Some(line) = line else {
        return PickOutcome::Cancelled;
    };
    let trimmed = line.trim();
    let unquoted = ['"', '\'']
        .iter()
        .find_map(|q| {
            trimmed
                .strip_prefix(*q)
                .and_then(|rest| rest.strip_suffix(*q))
        })
        .unwrap_or(trimmed);
    if unquoted.is_empty() {
        PickOutcome::Cancelled
    } else {
        PickOutcome::Picked(PathBuf::from(unquoted))
    }
}

/// What importing a model into the cache will do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelImport {
    /// A copy already exists at this path
    Cached(PathBuf),
    /// `source` must be copied to `target`
    Copy {
        /// Picked file
        source: PathBuf,
        /// Destination inside the cache
        target: PathBuf,
    },
}

impl ModelImport {
    /// Path the model will be loaded from
    pub fn target(&self) -> &Path {
        match self {
            ModelImport::Cached(path) => path,
            ModelImport::Copy { target, .. } => target,
        }
    }

    /// Whether [`ModelImport::run`] copies anything
    pub fn needs_copy(&self) -> bool {
        matches!(self, ModelImport::Copy { .. })
    }

    /// Carry out the import and return the path to load
    ///
    /// A copy first removes stale files from the `models` directory. The
    /// source file is never removed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be prepared or the
    /// copy fails.
    pub async fn run(self) -> Result<PathBuf> {
        match self {
            ModelImport::Cached(path) => {
                tracing::debug!("Reusing cached model {}", path.display());
                Ok(path)
            }
            ModelImport::Copy { source, target } => {
                let dir = target
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                tokio::fs::create_dir_all(&dir)
                    .await
                    .map_err(LlamaChatError::Io)?;
                remove_stale_models(&dir, &source).await?;
                let bytes = tokio::fs::copy(&source, &target)
                    .await
                    .map_err(LlamaChatError::Io)?;
                tracing::info!(
                    "Copied {} to {} ({} bytes)",
                    source.display(),
                    target.display(),
                    bytes
                );
                Ok(target)
            }
        }
    }
}

/// Delete the files in `dir`, keeping `keep`
async fn remove_stale_models(dir: &Path, keep: &Path) -> Result<()> {
    let keep = tokio::fs::canonicalize(keep).await.ok();
    let mut entries = tokio::fs::read_dir(dir).await.map_err(LlamaChatError::Io)?;
    while let Some(entry) = entries.next_entry().await.map_err(LlamaChatError::Io)? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(LlamaChatError::Io)?;
        if !file_type.is_file() {
            continue;
        }
        if keep.is_some() && tokio::fs::canonicalize(&path).await.ok() == keep {
            continue;
        }
        tracing::debug!("Removing stale model {}", path.display());
        tokio::fs::remove_file(&path)
            .await
            .map_err(LlamaChatError::Io)?;
    }
    Ok(())
}

/// Decide how `source` would be imported into `cache_dir`
///
/// The copy is named after the picked file with a `.gguf` extension ensured.
/// A file already inside the cache's `models` directory is loaded in place.
///
/// # Errors
///
/// Returns [`LlamaChatError::ModelPick`] when `source` does not exist or has
/// no file name.
pub async fn plan_import(source: &Path, cache_dir: &Path) -> Result<ModelImport> {
    if tokio::fs::metadata(source).await.is_err() {
        return Err(LlamaChatError::ModelPick(format!(
            "model file not found: {}",
            source.display()
        ))
        .into());
    }
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| {
            LlamaChatError::ModelPick(format!("not a file path: {}", source.display()))
        })?;
    let file_name = if name.ends_with(".gguf") {
        name
    } else {
        format!("{}.gguf", name)
    };

    let models = cache_dir.join("models");
    if is_inside(source, &models).await {
        return Ok(ModelImport::Cached(source.to_path_buf()));
    }

    let target = models.join(file_name);
    if tokio::fs::metadata(&target).await.is_ok() {
        Ok(ModelImport::Cached(target))
    } else {
        Ok(ModelImport::Copy {
            source: source.to_path_buf(),
            target,
        })
    }
}

/// Whether `path` is a file directly inside `dir`
async fn is_inside(path: &Path, dir: &Path) -> bool {
    let (Ok(path), Ok(dir)) = (
        tokio::fs::canonicalize(path).await,
        tokio::fs::canonicalize(dir).await,
    ) else {
        return false;
    };
    path.parent() == Some(dir.as_path())
}

/// Import `source` into `cache_dir` and return the path to load
///
/// # Examples
///
/// ```
/// use llamachat::picker::import_model;
///
/// tokio_test::block_on(async {
///     let src = tempfile::tempdir().unwrap();
///     let cache = tempfile::tempdir().unwrap();
///     let model = src.path().join("tiny.gguf");
///     std::fs::write(&model, b"GGUF").unwrap();
///
///     let imported = import_model(&model, cache.path()).await.unwrap();
///     assert_eq!(imported, cache.path().join("models").join("tiny.gguf"));
///     assert_eq!(std::fs::read(&imported).unwrap(), b"GGUF");
/// });
/// ```
pub async fn import_model(source: &Path, cache_dir: &Path) -> Result<PathBuf> {
    plan_import(source, cache_dir).await?.run().await
}
