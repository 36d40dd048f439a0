use std::collections::HashMap;

use anyhow::{bail, Context, Result};

/// An OpenAI-compatible endpoint serving one or more models.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub api_key: Option<String>,
}

/// Backend name to endpoint, resolved from the environment.
///
/// `PARLEY_BACKEND_<NAME>_URL` / `PARLEY_BACKEND_<NAME>_API_KEY` configure a
/// named backend; anything unnamed falls back to `PARLEY_BASE_URL` and
/// `PARLEY_API_KEY` (or `OPENAI_API_KEY`).
#[derive(Debug, Clone)]
pub struct Endpoints {
    default: Endpoint,
    named: HashMap<String, Endpoint>,
}

impl Endpoints {
    pub fn from_env(backends: &[&str]) -> Self {
        Self::from_lookup(backends, |var| std::env::var(var).ok())
    }

    pub fn from_lookup(backends: &[&str], lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Endpoint {
            url: lookup("PARLEY_BASE_URL").unwrap_or_else(|| "http://localhost:8080/v1".into()),
            api_key: lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY")),
        };
        let mut named = HashMap::new();
        for backend in backends {
            let prefix = format!("PARLEY_BACKEND_{}", env_name(backend));
            if let Some(url) = lookup(&format!("{prefix}_URL")) {
                let api_key =
                    lookup(&format!("{prefix}_API_KEY")).or_else(|| default.api_key.clone());
                named.insert(backend.to_string(), Endpoint { url, api_key });
            }
        }
        Self { default, named }
    }

    pub fn resolve(&self, backend: &str) -> &Endpoint {
        self.named.get(backend).unwrap_or(&self.default)
    }
}

fn env_name(backend: &str) -> String {
    backend
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Parse `backend:model`. Model names may themselves contain colons.
pub fn parse_backend_model(value: &str) -> Result<(String, String)> {
    let (backend, model) = value
        .split_once(':')
        .with_context(|| format!("expected backend:model, got {value:?}"))?;
    if backend.is_empty() || model.is_empty() {
        bail!("expected backend:model, got {value:?}");
    }
    Ok((backend.to_string(), model.to_string()))
}
