//! Build-manifest templates.
//!
//! Templates live in a directory as `<name>.tera` files and are loaded once
//! per run. The pipeline renders the per-app template and the shared
//! `finalize` template; the version resolver renders one-off command strings.

use std::path::Path;

use tera::Tera;

pub use tera::Context;

/// All templates of one run, loaded eagerly so a missing or malformed
/// template fails before any clone happens.
pub struct TemplateStore {
    tera: Tera,
}

impl TemplateStore {
    pub fn load(dir: &Path) -> Result<Self, TemplateError> {
        let glob = dir.join("**").join("*.tera");
        let glob = glob
            .to_str()
            .ok_or_else(|| TemplateError::InvalidDir(dir.to_path_buf()))?;
        let tera = Tera::new(glob).map_err(|source| TemplateError::Load {
            dir: dir.to_path_buf(),
            source,
        })?;
        tracing::debug!(dir = %dir.display(), count = tera.get_template_names().count(), "templates loaded");
        Ok(Self { tera })
    }

    /// Whether `<name>.tera` was found in the template directory.
    pub fn contains(&self, name: &str) -> bool {
        let file = format!("{name}.tera");
        self.tera.get_template_names().any(|n| n == file)
    }

    pub fn render(&self, name: &str, context: &Context) -> Result<String, TemplateError> {
        let file = format!("{name}.tera");
        if !self.contains(name) {
            return Err(TemplateError::Missing {
                name: name.to_owned(),
            });
        }
        self.tera
            .render(&file, context)
            .map_err(|source| TemplateError::Render {
                name: name.to_owned(),
                source,
            })
    }

    /// Render a one-off command string with a single `version` variable.
    /// Used for the configured version write-back command.
    pub fn render_command(template: &str, version: &str) -> Result<String, TemplateError> {
        let mut context = Context::new();
        context.insert("version", version);
        Tera::default()
            .render_str(template, &context)
            .map_err(|source| TemplateError::Render {
                name: "<inline command>".to_owned(),
                source,
            })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("failed to load templates from {dir}")]
    Load { dir: std::path::PathBuf, source: tera::Error },

    #[error("template directory path is not valid UTF-8: {0}")]
    InvalidDir(std::path::PathBuf),

    #[error("no template named '{name}' in the template directory")]
    Missing { name: String },

    #[error("failed to render template '{name}'")]
    Render { name: String, source: tera::Error },
}
