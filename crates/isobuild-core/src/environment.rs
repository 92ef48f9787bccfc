//! Build environment handed to the builder stage.
//!
//! A [`BuildEnvironment`] is constructed once per pipeline invocation and is
//! never mutated afterwards. Everything the compiler and linker see (toolchain
//! image, native packages, static/dynamic selection, search paths, strip flag)
//! is derived from it, so two environments that compare equal produce the same
//! build.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Directory the builder points `CARGO_TARGET_DIR` at.
pub const TARGET_DIR: &str = "/build/target";

/// Image tags that move over time and therefore cannot pin a toolchain.
const FLOATING_TAGS: &[&str] = &["latest", "stable", "beta", "nightly"];

/// Linker argument that drops the symbol table and debug sections.
const STRIP_RUSTFLAG: &str = "-C link-arg=-s";

/// Toolchain image identity, e.g. `rust` at `1.75`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    /// Image repository (e.g., "rust").
    pub image: String,
    /// Pinned tag (e.g., "1.75" or "1.75-bookworm").
    pub version: String,
}

impl Toolchain {
    pub fn new(image: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            version: version.into(),
        }
    }

    /// Full image reference, `image:version`.
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.version)
    }

    /// Whether the version names a fixed release rather than a moving tag.
    pub fn is_pinned(&self) -> bool {
        let version = self.version.trim();
        !version.is_empty() && !FLOATING_TAGS.contains(&version)
    }
}

/// Package manager available in the toolchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Apt,
    Apk,
}

impl PackageManager {
    /// A single shell step that installs `packages` and purges the package
    /// cache before the step ends. `None` when there is nothing to install.
    pub fn install_script(&self, packages: &BTreeSet<String>) -> Option<String> {
        if packages.is_empty() {
            return None;
        }
        let list = packages.iter().cloned().collect::<Vec<_>>().join(" ");
        let script = match self {
            PackageManager::Apt => format!(
                "apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
                list
            ),
            PackageManager::Apk => {
                format!("apk add --no-cache {} && rm -rf /var/cache/apk/*", list)
            }
        };
        Some(script)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageManager::Apt => write!(f, "apt"),
            PackageManager::Apk => write!(f, "apk"),
        }
    }
}

impl FromStr for PackageManager {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apt" | "apt-get" => Ok(PackageManager::Apt),
            "apk" => Ok(PackageManager::Apk),
            other => Err(Error::InvalidInput(format!(
                "unknown package manager: {}",
                other
            ))),
        }
    }
}

/// How the artifact links against the cryptography library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoLinkage {
    /// Library name as the `-sys` crate knows it (e.g., "openssl").
    pub library: String,
    /// Directory holding the compiled library objects.
    pub lib_dir: Option<String>,
    /// Directory holding the library headers.
    pub include_dir: Option<String>,
    /// Shared object stems that would indicate a dynamic dependency.
    pub shared_objects: Vec<String>,
}

impl CryptoLinkage {
    pub fn new(library: impl Into<String>) -> Self {
        let library = library.into();
        let shared_objects = Self::default_shared_objects(&library);
        Self {
            library,
            lib_dir: None,
            include_dir: None,
            shared_objects,
        }
    }

    pub fn with_lib_dir(mut self, dir: impl Into<String>) -> Self {
        self.lib_dir = Some(dir.into());
        self
    }

    pub fn with_include_dir(mut self, dir: impl Into<String>) -> Self {
        self.include_dir = Some(dir.into());
        self
    }

    /// Shared objects a library is known to ship as.
    pub fn default_shared_objects(library: &str) -> Vec<String> {
        match library {
            "openssl" => vec!["libssl".to_string(), "libcrypto".to_string()],
            other if other.starts_with("lib") => vec![other.to_string()],
            other => vec![format!("lib{}", other)],
        }
    }

    /// Prefix of the environment variables the `-sys` crate reads
    /// (`openssl` -> `OPENSSL`).
    pub fn env_prefix(&self) -> String {
        self.library.to_ascii_uppercase().replace('-', "_")
    }

    /// Whether a `NEEDED` entry refers to this library.
    pub fn matches_shared_object(&self, needed: &str) -> bool {
        self.shared_objects
            .iter()
            .any(|stem| needed.starts_with(&format!("{}.so", stem)))
    }
}

/// Flags that decide the properties of the compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFlags {
    /// Strip symbols and debug information at link time.
    pub strip: bool,
    /// Link the cryptography library statically.
    pub static_crypto: bool,
}

impl Default for BuildFlags {
    fn default() -> Self {
        Self {
            strip: true,
            static_crypto: true,
        }
    }
}

/// The complete, immutable environment of the builder stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEnvironment {
    pub toolchain: Toolchain,
    pub package_manager: PackageManager,
    /// Native packages, kept sorted so rendering is deterministic.
    pub packages: BTreeSet<String>,
    pub crypto: CryptoLinkage,
    pub flags: BuildFlags,
    /// Additional variables; may not shadow derived ones.
    pub extra_env: BTreeMap<String, String>,
}

impl BuildEnvironment {
    pub fn new(toolchain: Toolchain, crypto: CryptoLinkage) -> Self {
        Self {
            toolchain,
            package_manager: PackageManager::default(),
            packages: BTreeSet::new(),
            crypto,
            flags: BuildFlags::default(),
            extra_env: BTreeMap::new(),
        }
    }

    pub fn with_package_manager(mut self, package_manager: PackageManager) -> Self {
        self.package_manager = package_manager;
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    pub fn with_flags(mut self, flags: BuildFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    /// Variables derived from the crypto linkage and build flags.
    fn derived_env(&self) -> BTreeMap<String, String> {
        let prefix = self.crypto.env_prefix();
        let mut env = BTreeMap::new();

        if self.flags.static_crypto {
            env.insert(format!("{}_STATIC", prefix), "1".to_string());
        } else {
            env.insert(format!("{}_DYNAMIC", prefix), "1".to_string());
        }
        if let Some(dir) = &self.crypto.lib_dir {
            env.insert(format!("{}_LIB_DIR", prefix), dir.clone());
        }
        if let Some(dir) = &self.crypto.include_dir {
            env.insert(format!("{}_INCLUDE_DIR", prefix), dir.clone());
        }
        if self.flags.strip {
            env.insert("RUSTFLAGS".to_string(), STRIP_RUSTFLAG.to_string());
        }
        env.insert("CARGO_TARGET_DIR".to_string(), TARGET_DIR.to_string());
        env
    }

    /// Environment the compiler and linker run with.
    pub fn compiler_env(&self) -> BTreeMap<String, String> {
        let mut env = self.derived_env();
        for (key, value) in &self.extra_env {
            env.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env
    }

    /// Provisioning step for the declared package set.
    pub fn install_script(&self) -> Option<String> {
        self.package_manager.install_script(&self.packages)
    }

    /// Reject environments that cannot yield a reproducible build.
    pub fn validate(&self) -> Result<()> {
        if !self.toolchain.is_pinned() {
            return Err(Error::InvalidInput(format!(
                "toolchain '{}' is not pinned to a release",
                self.toolchain.image_ref()
            )));
        }
        if self.crypto.library.trim().is_empty() {
            return Err(Error::InvalidInput(
                "crypto library name is empty".to_string(),
            ));
        }
        let derived = self.derived_env();
        if let Some(key) = self.extra_env.keys().find(|k| derived.contains_key(*k)) {
            return Err(Error::InvalidInput(format!(
                "environment variable '{}' is derived from the build flags and cannot be overridden",
                key
            )));
        }
        Ok(())
    }

    /// SHA-256 over the canonical form of everything that affects the
    /// artifact: toolchain, packages, compiler environment and `commands`.
    pub fn fingerprint(&self, commands: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("toolchain={}\n", self.toolchain.image_ref()));
        hasher.update(format!("package-manager={}\n", self.package_manager));
        for package in &self.packages {
            hasher.update(format!("package={}\n", package));
        }
        for (key, value) in self.compiler_env() {
            hasher.update(format!("env={}={}\n", key, value));
        }
        for command in commands {
            hasher.update(format!("run={}\n", command));
        }
        hex::encode(hasher.finalize())
    }
}
