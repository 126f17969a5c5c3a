use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub code: String,
    pub language: String,
    pub subject: String,
    #[serde(alias = "body_html")]
    pub body: String,

    #[serde(default, alias = "body_text", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl Template {
    pub fn new(
        code: impl Into<String>,
        language: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            subject: subject.into(),
            body: body.into(),
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Subject and bodies with every placeholder substituted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedContent {
    pub subject: String,
    pub html: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
