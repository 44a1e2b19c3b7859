use crate::{Error, Result};
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;

/// How to launch the execution environment for one language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Whether the runner's output is consumed incrementally.
    #[serde(default)]
    pub streaming: bool,
}

impl LanguageProfile {
    pub fn new<I, S>(id: &str, image: &str, launch_args: I, streaming: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        LanguageProfile {
            id: id.to_string(),
            image: image.to_string(),
            launch_args: launch_args.into_iter().map(Into::into).collect(),
            streaming,
        }
    }
}

/// Read-only mapping from language id to [`LanguageProfile`].
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, LanguageProfile>,
}

lazy_static! {
    static ref BUILTIN: ProfileRegistry = ProfileRegistry::new(
        ["cpp", "python", "javascript", "typescript"]
            .iter()
            .map(|&id| {
                let image = match id {
                    "cpp" => "phluent/clang".to_string(),
                    other => format!("phluent/{}", other),
                };
                LanguageProfile::new(id, &image, vec!["-stream=true"], true)
            })
    );
}

impl ProfileRegistry {
    /// Builds a registry; a later profile with the same id replaces an earlier one.
    pub fn new<I>(profiles: I) -> Self
    where
        I: IntoIterator<Item = LanguageProfile>,
    {
        let profiles = profiles
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        ProfileRegistry { profiles }
    }

    /// The process-wide default profiles.
    pub fn builtin() -> &'static ProfileRegistry {
        &BUILTIN
    }

    /// Loads profiles from a JSON array of profile objects.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let profiles: Vec<LanguageProfile> = serde_json::from_str(json)?;
        Ok(Self::new(profiles))
    }

    pub fn resolve(&self, language: &str) -> Result<&LanguageProfile> {
        self.profiles
            .get(language)
            .ok_or_else(|| Error::UnknownLanguage {
                language: language.to_string(),
            })
    }

    pub fn languages(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
