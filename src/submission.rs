use crate::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::borrow::Cow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: String,
    pub content: String,
}

impl File {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        File {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Source code and input for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub language: String,
    pub files: Vec<File>,
    pub problem_id: String,
    pub stdin: String,
}

/// Structured result written by the in-container runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub error: String,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.error.is_empty()
    }
}

// Field order is the wire order.
#[derive(Serialize, Deserialize)]
struct Payload<'a> {
    #[serde(borrow)]
    language: Cow<'a, str>,
    files: Vec<File>,
    #[serde(borrow)]
    problem: Problem<'a>,
    #[serde(borrow)]
    stdin: Cow<'a, str>,
}

#[derive(Serialize, Deserialize)]
struct Problem<'a> {
    #[serde(borrow)]
    id: Cow<'a, str>,
}

impl Submission {
    pub fn new(language: impl Into<String>, files: Vec<File>) -> Self {
        Submission {
            language: language.into(),
            files,
            problem_id: String::new(),
            stdin: String::new(),
        }
    }

    pub fn with_problem(mut self, problem_id: impl Into<String>) -> Self {
        self.problem_id = problem_id.into();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// Parses a submission from its wire representation.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let payload: Payload<'_> = serde_json::from_str(json)?;
        Ok(Submission {
            language: payload.language.into_owned(),
            files: payload.files,
            problem_id: payload.problem.id.into_owned(),
            stdin: payload.stdin.into_owned(),
        })
    }

    /// Serializes the submission into the payload consumed by the runner.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = Payload {
            language: self.language.as_str().into(),
            files: self.files.clone(),
            problem: Problem {
                id: self.problem_id.as_str().into(),
            },
            stdin: self.stdin.as_str().into(),
        };

        serde_json::to_vec(&payload).map_err(|e| Error::EncodeFailed { source: e })
    }
}
