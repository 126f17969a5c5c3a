pub mod circuit_breaker;
pub mod health;
pub mod provider;
pub mod rbmq;
pub mod sendgrid;
pub mod smtp;
pub mod status;
pub mod template;
