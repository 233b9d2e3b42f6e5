//! Result file layout: `{root}/{model}/{result type}/{suffix}.jsonl`.

use crate::models::ResultType;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, model_id: &str, result_type: ResultType, suffix: &str) -> PathBuf {
        self.root
            .join(model_dir_name(model_id))
            .join(result_type.dir_name())
            .join(format!("{suffix}.jsonl"))
    }
}

/// Directory name for a model id ("Qwen/Qwen3-8B" → "Qwen-Qwen3-8B").
pub fn model_dir_name(model_id: &str) -> String {
    model_id.replace(['/', ':'], "-")
}
