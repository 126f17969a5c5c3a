use anyhow::{Result, anyhow};

pub fn validate_email_address(address: &str) -> Result<()> {
    if address.is_empty() {
        return Err(anyhow!("Email address cannot be empty"));
    }

    if address.len() > 254 {
        return Err(anyhow!("Email address too long (maximum 254 characters)"));
    }

    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(anyhow!("Email address contains whitespace"));
    }

    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| anyhow!("Email address is missing '@'"))?;

    if local.is_empty() || local.len() > 64 {
        return Err(anyhow!("Email address has an invalid local part"));
    }

    if local.contains('@') {
        return Err(anyhow!("Email address contains more than one '@'"));
    }

    let valid_domain = domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '.');

    if !valid_domain {
        return Err(anyhow!("Email address has an invalid domain"));
    }

    Ok(())
}
