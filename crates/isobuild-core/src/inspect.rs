//! Artifact inspection.
//!
//! Inspectors read an executable's headers without running it and report what
//! the pipeline needs to enforce: which shared objects it requests, and
//! whether symbol or debug sections survived linking.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::artifact::Linkage;
use crate::environment::{BuildFlags, CryptoLinkage};
use crate::{Error, Result};

/// Machine the artifact was built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Aarch64,
    Other(String),
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Aarch64 => write!(f, "aarch64"),
            Architecture::Other(name) => write!(f, "{}", name),
        }
    }
}

/// What an inspector found in an executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactInspection {
    pub architecture: Architecture,
    /// `NEEDED` entries of the dynamic section, in file order.
    pub needed: Vec<String>,
    /// Requested program interpreter, absent for fully static executables.
    pub interpreter: Option<String>,
    /// Whether a `.symtab` section is present.
    pub has_symtab: bool,
    /// Names of `.debug_*` sections.
    pub debug_sections: Vec<String>,
}

impl ArtifactInspection {
    pub fn is_stripped(&self) -> bool {
        !self.has_symtab && self.debug_sections.is_empty()
    }

    /// Shared objects that belong to the crypto library.
    pub fn crypto_dependencies(&self, crypto: &CryptoLinkage) -> Vec<String> {
        self.needed
            .iter()
            .filter(|lib| crypto.matches_shared_object(lib))
            .cloned()
            .collect()
    }

    pub fn linkage(&self, crypto: &CryptoLinkage) -> Linkage {
        let libraries = self.crypto_dependencies(crypto);
        if libraries.is_empty() {
            Linkage::Static
        } else {
            Linkage::Dynamic { libraries }
        }
    }

    /// Check the static-link and strip invariants selected by `flags`.
    pub fn verify(&self, flags: &BuildFlags, crypto: &CryptoLinkage) -> Result<()> {
        if flags.static_crypto {
            if let Linkage::Dynamic { libraries } = self.linkage(crypto) {
                return Err(Error::InvariantViolation(format!(
                    "{} must be linked statically but the artifact needs {}",
                    crypto.library,
                    libraries.join(", ")
                )));
            }
        }
        if flags.strip && !self.is_stripped() {
            let mut sections = self.debug_sections.clone();
            if self.has_symtab {
                sections.insert(0, ".symtab".to_string());
            }
            return Err(Error::InvariantViolation(format!(
                "artifact must be stripped but still carries {}",
                sections.join(", ")
            )));
        }
        Ok(())
    }
}

/// Reads linkage and section information from an executable.
#[async_trait]
pub trait ArtifactInspector: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<ArtifactInspection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspection(needed: &[&str], has_symtab: bool, debug: &[&str]) -> ArtifactInspection {
        ArtifactInspection {
            architecture: Architecture::X86_64,
            needed: needed.iter().map(|s| s.to_string()).collect(),
            interpreter: Some("/lib64/ld-linux-x86-64.so.2".to_string()),
            has_symtab,
            debug_sections: debug.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_static_crypto_with_libc_is_accepted() {
        let crypto = CryptoLinkage::new("openssl");
        let found = inspection(&["libc.so.6", "libgcc_s.so.1"], false, &[]);

        assert_eq!(found.linkage(&crypto), Linkage::Static);
        assert!(found.verify(&BuildFlags::default(), &crypto).is_ok());
    }

    #[test]
    fn test_dynamic_crypto_violates_static_invariant() {
        let crypto = CryptoLinkage::new("openssl");
        let found = inspection(&["libssl.so.3", "libcrypto.so.3", "libc.so.6"], false, &[]);

        assert_eq!(
            found.linkage(&crypto),
            Linkage::Dynamic {
                libraries: vec!["libssl.so.3".to_string(), "libcrypto.so.3".to_string()]
            }
        );
        let err = found.verify(&BuildFlags::default(), &crypto).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
        assert!(err.to_string().contains("libssl.so.3"));

        // Allowed when static linking was not requested.
        let flags = BuildFlags {
            strip: true,
            static_crypto: false,
        };
        assert!(found.verify(&flags, &crypto).is_ok());
    }

    #[test]
    fn test_unstripped_violates_strip_invariant() {
        let crypto = CryptoLinkage::new("openssl");
        let found = inspection(&["libc.so.6"], true, &[".debug_info", ".debug_line"]);

        assert!(!found.is_stripped());
        let err = found.verify(&BuildFlags::default(), &crypto).unwrap_err();
        assert!(err.to_string().contains(".symtab, .debug_info, .debug_line"));

        let flags = BuildFlags {
            strip: false,
            static_crypto: true,
        };
        assert!(found.verify(&flags, &crypto).is_ok());
    }

    #[test]
    fn test_debug_sections_alone_mean_unstripped() {
        let found = inspection(&[], false, &[".debug_str"]);
        assert!(!found.is_stripped());
    }
}
