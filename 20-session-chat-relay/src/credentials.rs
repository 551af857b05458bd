//! Client credentials loaded from a JSON file of `id -> password` pairs.

use std::{collections::HashMap, fs, path::Path};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct CredentialStore {
    entries: HashMap<String, String>,
}

impl CredentialStore {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials from {}", path.display()))?;
        Self::from_json(&raw)
            .with_context(|| format!("invalid credentials file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(id, password)| (id.into(), password.into()))
                .collect(),
        }
    }

    pub fn lookup(&self, client_id: &str) -> Option<&str> {
        self.entries.get(client_id).map(String::as_str)
    }

    pub fn verify(&self, client_id: &str, password: &str) -> bool {
        self.lookup(client_id) == Some(password)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
