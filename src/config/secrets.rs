//! Secret handling utilities.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// A DSN safe to log: the password component is masked.
pub fn redacted_dsn(dsn: &SecretString) -> String {
    let raw = dsn.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "<redacted>".to_string();
    };
    match rest.rsplit_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_masked() {
        let dsn = SecretString::from("postgresql://gate:hunter2@db:5432/events");
        assert_eq!(redacted_dsn(&dsn), "postgresql://gate:***@db:5432/events");
    }

    #[test]
    fn dsn_without_credentials_is_unchanged() {
        let dsn = SecretString::from("postgres://localhost/events");
        assert_eq!(redacted_dsn(&dsn), "postgres://localhost/events");
    }
}
