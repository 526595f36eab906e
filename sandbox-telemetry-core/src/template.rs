//! Image templating.
//!
//! Explicitly out of scope as a component in its own right (spec.md §1), but
//! the Sandbox Runtime still needs *some* renderer to turn `build_args` into
//! a concrete Dockerfile, so this is the thinnest possible wrapper: one
//! `minijinja` environment rendering one named template string. Grounded on
//! `original_source/templates/template_manager.py`, which does the same
//! one-template, dict-of-strings substitution.

use minijinja::{context, Environment};

use crate::error::{Result, SandboxError};

/// Built-in base template: idles on a no-op entrypoint unless `user_emul` is
/// set, in which case `binary_file` becomes the entrypoint itself.
pub const DEFAULT_DOCKERFILE_TEMPLATE: &str = r#"FROM {{ base_image_tag }}
COPY {{ binary_file }} /opt/sandbox/{{ binary_file }}
RUN chmod +x /opt/sandbox/{{ binary_file }}
{% if user_emul %}
ENTRYPOINT ["/opt/sandbox/{{ binary_file }}"]
{% else %}
ENTRYPOINT ["tail", "-f", "/dev/null"]
{% endif %}
"#;

pub struct DockerfileTemplate {
    source: String,
}

impl DockerfileTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self { source: source.into() }
    }

    pub fn default_template() -> Self {
        Self::new(DEFAULT_DOCKERFILE_TEMPLATE)
    }

    /// Render against `base_image_tag`, `user_emul`, and the session's
    /// `build_args` (which must carry at least `binary_file`).
    pub fn render(
        &self,
        base_image_tag: &str,
        user_emul: bool,
        build_args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        let binary_file = build_args
            .get("binary_file")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SandboxError::Validation("build_args missing binary_file".into()))?;

        let mut env = Environment::new();
        env.add_template("dockerfile", &self.source)
            .map_err(|err| SandboxError::Validation(format!("invalid template: {err}")))?;
        let tmpl = env
            .get_template("dockerfile")
            .map_err(|err| SandboxError::Validation(format!("template lookup failed: {err}")))?;

        tmpl.render(context! {
            base_image_tag => base_image_tag,
            binary_file => binary_file,
            user_emul => user_emul,
        })
        .map_err(|err| SandboxError::Validation(format!("rendering template: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_idle_entrypoint_when_not_user_emul() {
        let tmpl = DockerfileTemplate::default_template();
        let mut args = serde_json::Map::new();
        args.insert("binary_file".into(), "payload.bin".into());
        let rendered = tmpl.render("ubuntu:22.04", false, &args).unwrap();
        assert!(rendered.contains("FROM ubuntu:22.04"));
        assert!(rendered.contains("tail"));
        assert!(!rendered.contains("/opt/sandbox/payload.bin\"]"));
    }

    #[test]
    fn renders_binary_entrypoint_when_user_emul() {
        let tmpl = DockerfileTemplate::default_template();
        let mut args = serde_json::Map::new();
        args.insert("binary_file".into(), "payload.bin".into());
        let rendered = tmpl.render("ubuntu:22.04", true, &args).unwrap();
        assert!(rendered.contains("/opt/sandbox/payload.bin\"]"));
    }

    #[test]
    fn missing_binary_file_is_rejected() {
        let tmpl = DockerfileTemplate::default_template();
        let args = serde_json::Map::new();
        let err = tmpl.render("ubuntu:22.04", false, &args).unwrap_err();
        assert!(matches!(err, SandboxError::Validation(_)));
    }
}
