use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::{Captures, Regex};
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::TemplateError,
    models::{
        response::ApiResponse,
        retry::RetryConfig,
        template::{RenderedContent, Template},
    },
    utils::retry_with_backoff,
};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}")
        .expect("placeholder pattern is valid")
});

static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<[^>]*>").expect("html tag pattern is valid")
});

/// Read-only source of template skeletons.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn resolve(&self, code: &str, language: &str) -> Result<Template, TemplateError>;
}

pub struct TemplateServiceClient {
    http_client: Client,
    base_url: String,
    retry_config: RetryConfig,
}

impl TemplateServiceClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(config.template_fetch_timeout_ms))
            .build()
            .map_err(|_| anyhow::anyhow!("Failed to create HTTP client"))?;

        info!(base_url = %config.template_service_url, "Template service client initialized");

        Ok(Self {
            http_client,
            base_url: config.template_service_url.trim_end_matches('/').to_string(),
            retry_config: config.retry_config(),
        })
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }
}

#[async_trait]
impl TemplateStore for TemplateServiceClient {
    async fn resolve(&self, code: &str, language: &str) -> Result<Template, TemplateError> {
        let url = format!("{}/api/v1/templates/{}", self.base_url, code);

        debug!(template_code = code, language, "Fetching template from service");

        let fetched = retry_with_backoff(&self.retry_config, || {
            let client = self.http_client.clone();
            let url = url.clone();

            async move {
                let response = client
                    .get(&url)
                    .query(&[("lang", language)])
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;

                let status = response.status();

                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }

                if !status.is_success() {
                    return Err(format!("Template service returned status {}", status));
                }

                let body: ApiResponse<Template> = response
                    .json()
                    .await
                    .map_err(|e| format!("Failed to parse template JSON: {}", e))?;

                Ok(body.data)
            }
        })
        .await
        .map_err(TemplateError::StoreUnavailable)?;

        match fetched {
            Some(template) if template.language == language => Ok(template),
            Some(template) => {
                warn!(
                    template_code = code,
                    requested = language,
                    returned = %template.language,
                    "Template service returned a different language"
                );
                Err(not_found(code, language))
            }
            None => Err(not_found(code, language)),
        }
    }
}

fn not_found(code: &str, language: &str) -> TemplateError {
    TemplateError::NotFound {
        code: code.to_string(),
        language: language.to_string(),
    }
}

#[derive(Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<(String, String), Template>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_templates(templates: impl IntoIterator<Item = Template>) -> Self {
        let store = Self::new();
        for template in templates {
            store.insert(template);
        }
        store
    }

    pub fn insert(&self, template: Template) {
        let key = (template.code.clone(), template.language.clone());
        self.templates.write().insert(key, template);
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn resolve(&self, code: &str, language: &str) -> Result<Template, TemplateError> {
        self.templates
            .read()
            .get(&(code.to_string(), language.to_string()))
            .cloned()
            .ok_or_else(|| not_found(code, language))
    }
}

#[derive(Clone)]
pub struct TemplateResolver {
    store: Arc<dyn TemplateStore>,
}

impl TemplateResolver {
    pub fn new(store: Arc<dyn TemplateStore>) -> Self {
        Self { store }
    }

    /// No language fallback happens here.
    pub async fn resolve(&self, code: &str, language: &str) -> Result<Template, TemplateError> {
        self.store.resolve(code, language).await
    }
}

/// Substitutes every placeholder in subject and bodies.
pub fn render(
    template: &Template,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<RenderedContent, TemplateError> {
    debug!(
        template_code = %template.code,
        variable_count = variables.len(),
        "Rendering template"
    );

    let subject = replace_variables(&template.subject, variables)?;
    let html = replace_variables(&template.body, variables)?;
    let text = match &template.text {
        Some(text) => replace_variables(text, variables)?,
        None => strip_html(&html),
    };

    Ok(RenderedContent {
        subject,
        html,
        text: Some(text),
    })
}

fn lookup<'a>(
    variables: &'a HashMap<String, serde_json::Value>,
    path: &str,
) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;

    // A literal dotted key wins over path traversal.
    if let Some(value) = variables.get(path) {
        return Some(value);
    }

    segments.try_fold(variables.get(first)?, |value, segment| value.get(segment))
}

fn replace_variables(
    skeleton: &str,
    variables: &HashMap<String, serde_json::Value>,
) -> Result<String, TemplateError> {
    // Anything still opening a placeholder once every key is removed can never
    // be substituted, and must not reach a recipient as literal text.
    let stripped = PLACEHOLDER.replace_all(skeleton, "");
    if let Some(start) = stripped.find("{{") {
        let fragment = stripped[start..]
            .split_once("}}")
            .map_or(&stripped[start..], |(open, _)| open);
        let key = fragment.trim_start_matches('{').trim().to_string();
        warn!(fragment = %fragment, "Template contains a malformed placeholder");
        return Err(TemplateError::VariableMissing(key));
    }

    let mut failure = None;

    let rendered = PLACEHOLDER.replace_all(skeleton, |caps: &Captures| {
        let key = &caps[1];

        let replacement = match lookup(variables, key) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            Some(serde_json::Value::Bool(b)) => Ok(b.to_string()),
            Some(_) => Err(TemplateError::UnsupportedVariable(key.to_string())),
            None => Err(TemplateError::VariableMissing(key.to_string())),
        };

        replacement.unwrap_or_else(|e| {
            failure.get_or_insert(e);
            String::new()
        })
    });

    match failure {
        Some(e) => {
            warn!(error = %e, "Template contains unresolvable variable");
            Err(e)
        }
        None => Ok(rendered.into_owned()),
    }
}

fn strip_html(html: &str) -> String {
    HTML_TAG.replace_all(html, "").into_owned()
}
