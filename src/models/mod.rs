pub mod circuit_breaker;
pub mod health;
pub mod message;
pub mod provider;
pub mod response;
pub mod retry;
pub mod sendgrid;
pub mod status;
pub mod template;
pub mod validation;
