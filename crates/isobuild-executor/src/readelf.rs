//! Artifact inspection with `readelf`.
//!
//! `readelf` reads ELF headers directly, so the artifact is never executed on
//! the host and cross-compiled artifacts inspect the same way.

use async_trait::async_trait;
use isobuild_core::inspect::{Architecture, ArtifactInspection, ArtifactInspector};
use isobuild_core::{Error, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// Inspects artifacts by running `readelf -hldSW`.
pub struct ReadelfInspector {
    program: String,
}

impl ReadelfInspector {
    pub fn new() -> Self {
        Self {
            program: "readelf".to_string(),
        }
    }

    /// Use a specific readelf binary (e.g., a cross binutils build).
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ReadelfInspector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactInspector for ReadelfInspector {
    async fn inspect(&self, path: &Path) -> Result<ArtifactInspection> {
        let output = Command::new(&self.program)
            .arg("-hldSW")
            .arg(path)
            .output()
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "failed to run {} - is binutils installed? {}",
                    self.program, e
                ))
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Not an ELF file") {
            return Err(Error::InvariantViolation(format!(
                "{} is not an ELF executable",
                path.display()
            )));
        }
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "{} failed on {}: {}",
                self.program,
                path.display(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let inspection = parse_inspection(&stdout)?;
        debug!(
            path = %path.display(),
            architecture = %inspection.architecture,
            needed = ?inspection.needed,
            stripped = inspection.is_stripped(),
            "Inspected artifact"
        );
        Ok(inspection)
    }
}

/// Build an inspection from the combined `readelf -hldSW` output.
pub fn parse_inspection(output: &str) -> Result<ArtifactInspection> {
    let architecture = parse_machine(output)
        .ok_or_else(|| Error::InvariantViolation("ELF header has no machine".to_string()))?;
    let sections = parse_sections(output);

    Ok(ArtifactInspection {
        architecture,
        needed: parse_needed(output),
        interpreter: parse_interpreter(output),
        has_symtab: sections.iter().any(|s| s == ".symtab"),
        debug_sections: sections
            .into_iter()
            .filter(|s| s.starts_with(".debug"))
            .collect(),
    })
}

/// Machine from the ELF header, e.g. `Machine: Advanced Micro Devices X86-64`.
pub fn parse_machine(output: &str) -> Option<Architecture> {
    let machine = output
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("Machine:"))?
        .trim();

    Some(match machine {
        m if m.ends_with("X86-64") => Architecture::X86_64,
        "AArch64" => Architecture::Aarch64,
        other => Architecture::Other(other.to_string()),
    })
}

/// `NEEDED` entries of the dynamic section.
///
/// ```text
///  0x0000000000000001 (NEEDED)             Shared library: [libssl.so.3]
/// ```
pub fn parse_needed(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("(NEEDED)"))
        .filter_map(|line| {
            let start = line.find('[')?;
            let end = line.rfind(']')?;
            (end > start).then(|| line[start + 1..end].to_string())
        })
        .collect()
}

/// Program interpreter requested in the program headers.
pub fn parse_interpreter(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line
            .trim()
            .strip_prefix("[Requesting program interpreter:")?;
        Some(rest.trim_end_matches(']').trim().to_string())
    })
}

/// Section names from the section header table.
pub fn parse_sections(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim_start().strip_prefix('[')?;
            let (index, rest) = rest.split_once(']')?;
            index.trim().parse::<u32>().ok()?;
            let name = rest.split_whitespace().next()?;
            name.starts_with('.').then(|| name.to_string())
        })
        .collect()
}
