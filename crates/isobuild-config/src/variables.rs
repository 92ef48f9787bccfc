//! `${...}` references in pipeline files.
//!
//! | reference | value |
//! |-----------|-------|
//! | `${git.sha}`, `${git.short_sha}` | commit of the checkout (short is 7 chars) |
//! | `${git.branch}`, `${git.tag}` | branch, or a tag pointing exactly at HEAD |
//! | `${git.ref}` | the tag if there is one, else the branch |
//! | `${pipeline.name}` | the `pipeline` node |
//! | `${toolchain.image}`, `${toolchain.version}` | the builder toolchain |
//! | `${env.NAME}` | host environment |
//! | `${date}` | UTC date, `YYYY-MM-DD` |
//! | `${name}` | a `--var name=value` |
//!
//! Build commands keep references nothing can answer, so shell syntax such
//! as `${HOME}` reaches the builder untouched. Image tags go through
//! [`VariableContext::interpolate_strict`] instead, which refuses them.

use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\}")
        .expect("reference pattern is valid")
});

/// What is known about the commit being built. A field is `None` when
/// neither CI nor git could say.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitContext {
    pub sha: Option<String>,
    pub branch: Option<String>,
    pub tag: Option<String>,
}

impl GitContext {
    /// Commit details exported by CI systems (GitHub Actions, GitLab CI,
    /// or `ISOBUILD_*` set by hand).
    pub fn from_ci_env() -> Self {
        Self {
            sha: first_env(&["ISOBUILD_COMMIT_SHA", "GITHUB_SHA", "CI_COMMIT_SHA", "GIT_COMMIT"]),
            branch: first_env(&["ISOBUILD_BRANCH", "GITHUB_REF_NAME", "CI_COMMIT_BRANCH"]),
            tag: first_env(&["ISOBUILD_TAG", "CI_COMMIT_TAG"]),
        }
    }

    /// Ask git about the checkout containing `dir`. Outside a checkout, or
    /// without git installed, every field stays `None`.
    pub fn from_checkout(dir: &Path) -> Self {
        let git = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir)
                .output()
                .ok()
                .filter(|out| out.status.success())
                .and_then(|out| non_empty(String::from_utf8_lossy(&out.stdout).trim()))
        };

        Self {
            sha: git(&["rev-parse", "HEAD"]),
            // Fails on a detached HEAD, which has no branch to report.
            branch: git(&["symbolic-ref", "--quiet", "--short", "HEAD"]),
            tag: git(&["describe", "--tags", "--exact-match", "HEAD"]),
        }
    }

    /// Fill the fields this context lacks from `fallback`.
    pub fn or(self, fallback: GitContext) -> Self {
        Self {
            sha: self.sha.or(fallback.sha),
            branch: self.branch.or(fallback.branch),
            tag: self.tag.or(fallback.tag),
        }
    }

    pub fn short_sha(&self) -> Option<String> {
        self.sha.as_ref().map(|sha| sha.chars().take(7).collect())
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.tag.as_deref().or(self.branch.as_deref())
    }
}

fn first_env(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().and_then(|v| non_empty(v.trim())))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Toolchain the builder runs, filled in from the `toolchain` node.
#[derive(Debug, Clone, Default)]
pub struct ToolchainContext {
    pub image: String,
    pub version: String,
}

/// Everything a `${...}` reference can name.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline_name: String,
    pub toolchain: ToolchainContext,
    pub env: HashMap<String, String>,
    /// `--var` values.
    pub custom: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_git(mut self, git: GitContext) -> Self {
        self.git = git;
        self
    }

    /// Make the host environment available as `${env.*}`.
    pub fn capture_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Value of the reference `name` (without `${}`), if it has one.
    ///
    /// Unknown git details and an unset pipeline or toolchain count as
    /// unresolved rather than empty.
    pub fn resolve(&self, name: &str) -> Option<String> {
        match name.split_once('.') {
            Some(("git", field)) => match field {
                "sha" => self.git.sha.clone(),
                "short_sha" => self.git.short_sha(),
                "branch" => self.git.branch.clone(),
                "tag" => self.git.tag.clone(),
                "ref" => self.git.ref_name().map(str::to_string),
                _ => None,
            },
            Some(("pipeline", "name")) => non_empty(&self.pipeline_name),
            Some(("toolchain", "image")) => non_empty(&self.toolchain.image),
            Some(("toolchain", "version")) => non_empty(&self.toolchain.version),
            Some(("env", var)) => self.env.get(var).cloned(),
            Some(_) => None,
            None if name == "date" => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            None => self.custom.get(name).cloned(),
        }
    }

    /// Substitute every reference that resolves; leave the rest verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        REFERENCE
            .replace_all(input, |caps: &Captures| {
                self.resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    pub fn interpolate_all(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Substitute every reference, or return the names of those that do not
    /// resolve.
    pub fn interpolate_strict(&self, input: &str) -> Result<String, Vec<String>> {
        let missing = self.unresolved(input);
        if missing.is_empty() {
            Ok(self.interpolate(input))
        } else {
            Err(missing)
        }
    }

    /// Names of references in `input` that do not resolve, in order.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        REFERENCE
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}
