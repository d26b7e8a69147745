use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{EmailContent, PayloadData, PushContent, TemplateContent};

const CATALOG_DE: &str = include_str!("../i18n/de.json");
const CATALOG_EN: &str = include_str!("../i18n/en.json");

/// Language used when neither the intent nor the recipient names one.
pub const DEFAULT_LANGUAGE: &str = "de";

/// Base URL used for deep links when none is configured.
pub const DEFAULT_SITE_URL: &str = "http://localhost:3000";

/// Placeholder that expands to the event's deep link.
const LINK_PLACEHOLDER: &str = "link";

/// Templates for one event type in one language.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventTemplate {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub email: Option<EmailContent>,
    #[serde(default)]
    pub push: Option<PushContent>,
    /// Path appended to the site URL to build the deep link.
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to parse template catalog for '{language}': {source}")]
    Catalog {
        language: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolves `(event type, language)` to rendered content with a fallback to the default language.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    catalogs: HashMap<String, HashMap<String, EventTemplate>>,
    default_language: String,
    site_url: String,
}

impl TemplateResolver {
    /// Creates an empty resolver.
    pub fn new(default_language: impl Into<String>, site_url: impl Into<String>) -> Self {
        Self {
            catalogs: HashMap::new(),
            default_language: default_language.into(),
            site_url: site_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Creates a resolver loaded with the bundled `de` and `en` catalogs.
    pub fn builtin(
        default_language: impl Into<String>,
        site_url: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let mut resolver = Self::new(default_language, site_url);
        resolver.register_catalog("de", CATALOG_DE)?;
        resolver.register_catalog("en", CATALOG_EN)?;
        Ok(resolver)
    }

    /// Parses a JSON catalog (`{ "EVENT": { message, email, push, link } }`) for `language`.
    ///
    /// Events already registered for the language are replaced.
    pub fn register_catalog(&mut self, language: &str, json: &str) -> Result<(), TemplateError> {
        let parsed: HashMap<String, EventTemplate> =
            serde_json::from_str(json).map_err(|source| TemplateError::Catalog {
                language: language.to_string(),
                source,
            })?;
        self.catalogs
            .entry(language.to_string())
            .or_default()
            .extend(parsed);
        Ok(())
    }

    pub fn default_language(&self) -> &str {
        &self.default_language
    }

    /// Returns `true` when the event has a template in any registered language.
    pub fn supports(&self, event_type: &str) -> bool {
        self.catalogs
            .values()
            .any(|catalog| catalog.contains_key(event_type))
    }

    /// Renders the plain message for an event, or an empty string when no template exists.
    pub fn build_message(&self, event_type: &str, data: &PayloadData, language: Option<&str>) -> String {
        let language = self.effective_language(language, data);
        self.candidates(event_type, &language)
            .find_map(|template| {
                template
                    .message
                    .as_deref()
                    .map(|message| render(message, data, &self.deep_link(template)))
            })
            .unwrap_or_default()
    }

    /// Renders e-mail and push content for an event.
    ///
    /// Returns `None` when the event type is unsupported, which callers treat as a
    /// non-retryable skip. The language is `language`, else the payload's `lang`
    /// field, else the default language.
    pub fn build_notification_content(
        &self,
        event_type: &str,
        data: &PayloadData,
        language: Option<&str>,
    ) -> Option<TemplateContent> {
        let language = self.effective_language(language, data);
        let template = self
            .candidates(event_type, &language)
            .find(|template| template.email.is_some() && template.push.is_some())?;
        let (email, push) = (template.email.as_ref()?, template.push.as_ref()?);
        let link = self.deep_link(template);

        Some(TemplateContent {
            email: EmailContent {
                subject: render(&email.subject, data, &link),
                html: render(&email.html, data, &link),
            },
            push: PushContent {
                title: render(&push.title, data, &link),
                body: render(&push.body, data, &link),
            },
        })
    }

    /// Deep link for the event: site URL plus the event's fixed path.
    pub fn deep_link(&self, template: &EventTemplate) -> String {
        match template.link.as_deref() {
            Some(path) if path.starts_with('/') => format!("{}{path}", self.site_url),
            Some(path) => format!("{}/{path}", self.site_url),
            None => self.site_url.clone(),
        }
    }

    fn effective_language(&self, requested: Option<&str>, data: &PayloadData) -> String {
        requested
            .filter(|value| !value.is_empty())
            .or_else(|| data.get("lang").and_then(|value| value.as_str()))
            .unwrap_or(self.default_language.as_str())
            .to_string()
    }

    fn candidates<'a>(
        &'a self,
        event_type: &'a str,
        language: &str,
    ) -> impl Iterator<Item = &'a EventTemplate> + 'a {
        let primary = self.lookup(language, event_type);
        let fallback = if language == self.default_language {
            None
        } else {
            self.lookup(&self.default_language, event_type)
        };
        primary.into_iter().chain(fallback)
    }

    fn lookup(&self, language: &str, event_type: &str) -> Option<&EventTemplate> {
        self.catalogs.get(language)?.get(event_type)
    }
}

/// Replaces each `{{key}}` with the payload value for `key`, or an empty string when absent.
///
/// `{{link}}` falls back to `link` when the payload has no `link` field. No escaping is
/// applied: payload fields embedded into HTML must be sanitized by the caller.
pub fn render(template: &str, data: &PayloadData, link: &str) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };

        output.push_str(&rest[..open]);
        let key = after_open[..close].trim();
        match data.get(key) {
            Some(value) => output.push_str(&value.to_string()),
            None if key == LINK_PLACEHOLDER => output.push_str(link),
            None => {}
        }
        rest = &after_open[close + 2..];
    }

    output.push_str(rest);
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> TemplateResolver {
        TemplateResolver::builtin(DEFAULT_LANGUAGE, "https://mutuus.example/").expect("catalogs")
    }

    fn data(pairs: &[(&str, &str)]) -> PayloadData {
        let mut data = PayloadData::new();
        for (key, value) in pairs {
            data.insert(*key, *value);
        }
        data
    }

    #[test]
    fn renders_placeholders_and_blanks_missing_keys() {
        let mut payload = data(&[("name", "Max")]);
        payload.insert("count", 3_i64);

        let rendered = render("Hi {{ name }}, {{count}} new, {{missing}}!", &payload, "");
        assert_eq!(rendered, "Hi Max, 3 new, !");
    }

    #[test]
    fn leaves_unterminated_placeholder_untouched() {
        let rendered = render("Hello {{name", &data(&[("name", "Max")]), "");
        assert_eq!(rendered, "Hello {{name");
    }

    #[test]
    fn does_not_escape_html() {
        let rendered = render("<p>{{title}}</p>", &data(&[("title", "<b>x</b>")]), "");
        assert_eq!(rendered, "<p><b>x</b></p>");
    }

    #[test]
    fn message_uses_requested_language() {
        let message = resolver().build_message(
            "JOB_ACCEPTED",
            &data(&[("helper_name", "Max"), ("job_title", "Test")]),
            Some("en"),
        );
        assert_eq!(message, "Max accepted your job \"Test\".");
    }

    #[test]
    fn message_falls_back_to_default_language() {
        let message = resolver().build_message(
            "JOB_REMOVED",
            &data(&[("title", "Umzug")]),
            Some("en"),
        );
        assert_eq!(message, "Dein Auftrag \"Umzug\" ist abgelaufen und wurde entfernt.");

        let unconfigured = resolver().build_message(
            "JOB_ACCEPTED",
            &data(&[("helper_name", "Max"), ("job_title", "Test")]),
            Some("fr"),
        );
        assert!(unconfigured.contains("Max"));
        assert!(unconfigured.contains("Test"));
    }

    #[test]
    fn unknown_event_yields_empty_message_and_no_content() {
        let resolver = resolver();
        assert_eq!(resolver.build_message("UNKNOWN", &PayloadData::new(), None), "");
        assert!(resolver
            .build_notification_content("UNKNOWN", &PayloadData::new(), None)
            .is_none());
        assert!(!resolver.supports("UNKNOWN"));
    }

    #[test]
    fn structured_content_german() {
        let content = resolver()
            .build_notification_content(
                "NEW_APPLICATION",
                &data(&[
                    ("job_title", "Gartenhilfe"),
                    ("applicant_name", "Max"),
                    ("lang", "de"),
                ]),
                None,
            )
            .expect("content");

        assert_eq!(content.email.subject, "Neue Bewerbung für Gartenhilfe");
        assert!(content.email.html.contains("Gartenhilfe"));
        assert!(content.email.html.contains("Max"));
        assert!(content
            .email
            .html
            .contains("https://mutuus.example/dashboard/applications"));
        assert_eq!(content.push.title, "Neue Bewerbung");
        assert_eq!(content.push.body, "Max hat sich beworben");
    }

    #[test]
    fn structured_content_prefers_explicit_language_over_payload() {
        let content = resolver()
            .build_notification_content(
                "NEW_APPLICATION",
                &data(&[("job_title", "Gardener"), ("applicant_name", "John"), ("lang", "de")]),
                Some("en"),
            )
            .expect("content");

        assert_eq!(content.email.subject, "New application for Gardener");
        assert_eq!(content.push.title, "New application");
        assert_eq!(content.push.body, "John has applied");
    }

    #[test]
    fn registered_catalog_overrides_event() {
        let mut resolver = resolver();
        resolver
            .register_catalog(
                "en",
                r#"{"JOB_ACCEPTED": {"message": "Accepted by {{helper_name}}"}}"#,
            )
            .expect("register");

        let message =
            resolver.build_message("JOB_ACCEPTED", &data(&[("helper_name", "Ana")]), Some("en"));
        assert_eq!(message, "Accepted by Ana");

        // the override has no channel templates, so structured content comes from `de`
        let content = resolver
            .build_notification_content("JOB_ACCEPTED", &data(&[("helper_name", "Ana")]), Some("en"))
            .expect("fallback content");
        assert_eq!(content.push.title, "Auftrag angenommen");
    }

    #[test]
    fn invalid_catalog_is_reported() {
        let mut resolver = TemplateResolver::new("de", DEFAULT_SITE_URL);
        let err = resolver
            .register_catalog("it", "{not json")
            .expect_err("invalid json");
        assert!(matches!(err, TemplateError::Catalog { language, .. } if language == "it"));
    }
}
