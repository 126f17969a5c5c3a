use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct SendGridRequest {
    pub personalizations: Vec<Personalization>,
    pub from: EmailAddress,
    pub subject: String,
    pub content: Vec<Content>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Personalization {
    pub to: Vec<EmailAddress>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailAddress {
    pub email: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    #[serde(rename = "type")]
    pub content_type: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendGridErrorBody {
    #[serde(default)]
    pub errors: Vec<SendGridErrorDetail>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendGridErrorDetail {
    pub message: String,
}
