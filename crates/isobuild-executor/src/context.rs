//! Build context packing and artifact extraction.
//!
//! The runtime build context holds exactly two entries: the runtime
//! containerfile and the artifact. Nothing else from the builder can reach
//! the image because nothing else is in the archive.

use isobuild_core::image::{ARTIFACT_CONTEXT_NAME, AssemblyRequest, CONTAINERFILE_NAME};
use isobuild_core::{Error, Result};
use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

/// Pack the runtime build context for `request`.
pub fn runtime_context(request: &AssemblyRequest) -> Result<Vec<u8>> {
    let path = &request.artifact.staged_path;
    let artifact = fs::read(path).map_err(|e| {
        Error::ArtifactHandoff(format!("cannot read artifact at {}: {}", path.display(), e))
    })?;

    let mut builder = Builder::new(Vec::new());
    append_file(
        &mut builder,
        CONTAINERFILE_NAME,
        request.containerfile().as_bytes(),
        0o644,
    )?;
    append_file(&mut builder, ARTIFACT_CONTEXT_NAME, &artifact, 0o755)?;
    Ok(builder.into_inner()?)
}

fn append_file(builder: &mut Builder<Vec<u8>>, name: &str, data: &[u8], mode: u32) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(mode);
    // Fixed mtime keeps the context byte-identical across rebuilds.
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

/// Names and modes of the entries in an archive, in order.
pub fn list_entries(archive: &[u8]) -> Result<Vec<(String, u32)>> {
    let mut archive = Archive::new(archive);
    let mut result = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        result.push((name, entry.header().mode()?));
    }
    Ok(result)
}

/// Write the one regular file in `archive` to `dest` with mode 0755.
///
/// Copying a path out of a container yields a tar stream; anything other than
/// a single regular file means the declared artifact path was wrong.
pub fn extract_single_file(archive: &[u8], dest: &Path) -> Result<u64> {
    let mut archive = Archive::new(archive);
    let mut written = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                if written.is_some() {
                    return Err(Error::ArtifactHandoff(format!(
                        "expected a single file but found another entry '{}'",
                        name
                    )));
                }
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                fs::write(dest, &data)?;
                fs::set_permissions(dest, fs::Permissions::from_mode(0o755))?;
                written = Some(data.len() as u64);
            }
            EntryType::Directory => {
                return Err(Error::ArtifactHandoff(format!(
                    "'{}' is a directory, not an executable",
                    name
                )));
            }
            EntryType::Symlink | EntryType::Link => {
                return Err(Error::ArtifactHandoff(format!(
                    "'{}' is a link; declare the path of the file itself",
                    name
                )));
            }
            other => {
                return Err(Error::ArtifactHandoff(format!(
                    "'{}' has unsupported entry type {:?}",
                    name, other
                )));
            }
        }
    }

    written.ok_or_else(|| Error::ArtifactHandoff("archive contained no file".to_string()))
}
