//! Artifact inspection command.

use anyhow::{Context, Result, bail};
use isobuild_core::artifact::Linkage;
use isobuild_core::environment::{BuildFlags, CryptoLinkage};
use isobuild_core::inspect::ArtifactInspector;
use isobuild_executor::ReadelfInspector;
use std::path::Path;

/// Print what the pipeline would conclude about `binary` and fail if it is
/// not statically linked against `crypto` and stripped.
pub async fn inspect(binary: &Path, crypto: &str, readelf: &str) -> Result<()> {
    let report = ReadelfInspector::with_program(readelf)
        .inspect(binary)
        .await
        .with_context(|| format!("Failed to inspect {}", binary.display()))?;
    let crypto = CryptoLinkage::new(crypto);

    println!("{}", binary.display());
    println!("  architecture: {}", report.architecture);
    println!(
        "  interpreter:  {}",
        report.interpreter.as_deref().unwrap_or("(none)")
    );
    println!("  needed:       {}", report.needed.join(", "));
    match report.linkage(&crypto) {
        Linkage::Static => println!("  {}:      static", crypto.library),
        Linkage::Dynamic { libraries } => {
            println!("  {}:      dynamic ({})", crypto.library, libraries.join(", "))
        }
    }
    println!("  stripped:     {}", report.is_stripped());

    if let Err(e) = report.verify(&BuildFlags::default(), &crypto) {
        bail!("{}", e);
    }
    println!("✓ Ready for a runtime image");
    Ok(())
}
