//! Filesystem template renderer backed by minijinja.

use std::{io::ErrorKind as IoErrorKind, path::PathBuf};

use minijinja::{Environment, ErrorKind, Value as TemplateValue, path_loader};
use serde_json::{Map, Value};

use crate::{
    application::render::{TemplateError, TemplateRenderer},
    domain::identifiers::validate_template_name,
};

pub const TEMPLATE_EXTENSION: &str = "html";

/// Renders `{directory}/{name}.html`. Every template sees `SITE_URL`.
pub struct FsTemplateRenderer {
    directory: PathBuf,
    env: Environment<'static>,
}

impl FsTemplateRenderer {
    pub fn new(directory: PathBuf, site_url: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(directory.clone()));
        env.add_global("SITE_URL", site_url.into());
        Self { directory, env }
    }

    fn file_name(template: &str) -> Result<String, TemplateError> {
        validate_template_name(template).map_err(|_| TemplateError::NotFound {
            template: template.to_string(),
        })?;
        Ok(format!("{template}.{TEMPLATE_EXTENSION}"))
    }
}

impl TemplateRenderer for FsTemplateRenderer {
    fn render(&self, template: &str, data: &Map<String, Value>) -> Result<String, TemplateError> {
        let file_name = Self::file_name(template)?;

        let compiled = self.env.get_template(&file_name).map_err(|err| match err.kind() {
            ErrorKind::TemplateNotFound => TemplateError::NotFound {
                template: template.to_string(),
            },
            _ => TemplateError::Render {
                template: template.to_string(),
                message: err.to_string(),
            },
        })?;

        compiled
            .render(TemplateValue::from_serialize(data))
            .map_err(|err| TemplateError::Render {
                template: template.to_string(),
                message: err.to_string(),
            })
    }

    fn source(&self, template: &str) -> Result<String, TemplateError> {
        let path = self.directory.join(Self::file_name(template)?);
        std::fs::read_to_string(&path).map_err(|err| match err.kind() {
            IoErrorKind::NotFound => TemplateError::NotFound {
                template: template.to_string(),
            },
            _ => TemplateError::Io(format!("{}: {err}", path.display())),
        })
    }
}
