//! Template rendering — resolves a template id and substitutes contact
//! variables into subject and body.
//!
//! Rendering failures are permanent dispatch failures: a template that
//! cannot resolve all of its placeholders will fail the same way on every
//! retry.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use outreach_core::error::{OutreachError, OutreachResult};

/// Rendered subject and body, ready for the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// A stored email template. `{{name}}` placeholders are substituted from
/// the contact's attribute map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub subject: String,
    pub body: String,
}

/// Collaborator contract: resolve a template id and render it with the
/// given variables.
pub trait TemplateRenderer: Send + Sync {
    fn render(
        &self,
        template_id: &str,
        variables: &HashMap<String, String>,
    ) -> OutreachResult<RenderedEmail>;
}

/// In-memory renderer with `{{var}}` substitution.
#[derive(Default)]
pub struct InMemoryTemplateRenderer {
    templates: DashMap<String, EmailTemplate>,
}

impl InMemoryTemplateRenderer {
    pub fn new() -> Self {
        Self {
            templates: DashMap::new(),
        }
    }

    pub fn register(&self, template: EmailTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    fn substitute(text: &str, variables: &HashMap<String, String>) -> OutreachResult<String> {
        let mut result = text.to_string();
        for (key, value) in variables {
            let placeholder = format!("{{{{{key}}}}}");
            result = result.replace(&placeholder, value);
        }
        // Any placeholder left over references a variable the contact does
        // not carry; the send would go out with raw markup.
        if let Some(start) = result.find("{{") {
            let tail: String = result[start..].chars().take(32).collect();
            return Err(OutreachError::Render(format!(
                "unresolved placeholder near '{tail}'"
            )));
        }
        Ok(result)
    }
}

impl TemplateRenderer for InMemoryTemplateRenderer {
    fn render(
        &self,
        template_id: &str,
        variables: &HashMap<String, String>,
    ) -> OutreachResult<RenderedEmail> {
        let template = self
            .templates
            .get(template_id)
            .ok_or_else(|| OutreachError::Render(format!("unknown template {template_id}")))?;

        Ok(RenderedEmail {
            subject: Self::substitute(&template.subject, variables)?,
            body: Self::substitute(&template.body, variables)?,
        })
    }
}
