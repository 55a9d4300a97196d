//! File roles of one tool run and where they live on disk.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// The files a DAOPHOT/ALLSTAR run reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileRole {
    /// FIND star positions.
    Coo,
    /// PHOT aperture photometry.
    Ap,
    /// PICK PSF candidate list.
    Lst,
    /// PSF model.
    Psf,
    /// PSF stars with their neighbours, written when the PSF converges.
    Nei,
    /// ALLSTAR fit results.
    Als,
    /// ALLSTAR star-subtracted image.
    StarSub,
    /// Aperture photometry with rejected stars removed.
    CleanAp,
    /// ALLSTAR results of the second pass.
    CleanAls,
    /// Star-subtracted image of the second pass.
    CleanStarSub,
}

impl FileRole {
    pub const ALL: [FileRole; 10] = [
        FileRole::Coo,
        FileRole::Ap,
        FileRole::Lst,
        FileRole::Psf,
        FileRole::Nei,
        FileRole::Als,
        FileRole::StarSub,
        FileRole::CleanAp,
        FileRole::CleanAls,
        FileRole::CleanStarSub,
    ];

    /// Suffix appended to the image base name.
    pub fn extension(self) -> &'static str {
        match self {
            FileRole::Coo => "coo",
            FileRole::Ap => "ap",
            FileRole::Lst => "lst",
            FileRole::Psf => "psf",
            FileRole::Nei => "nei",
            FileRole::Als => "als",
            FileRole::StarSub => "starsub.fits",
            FileRole::CleanAp => "cleanap",
            FileRole::CleanAls => "cleanals",
            FileRole::CleanStarSub => "cleanstarsub.fits",
        }
    }
}

/// Immutable mapping from [`FileRole`] to path for one run.
///
/// Every role defaults to `<base>.<extension>` where `<base>` is the image
/// path without its `.fits` suffix. The first path assigned to a role sticks:
/// later assignments return an unchanged copy, so a file the tool has already
/// written is never silently re-pointed.
///
/// ```
/// use daophot::tools::{FileRole, RunArtifacts};
///
/// let artifacts = RunArtifacts::for_image("/data/m31.fits");
/// let artifacts = artifacts.assign_default(FileRole::Coo);
/// let artifacts = artifacts.assign(FileRole::Coo, "/elsewhere/m31.coo");
/// assert_eq!(artifacts.resolve(FileRole::Coo).to_str(), Some("/data/m31.coo"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    base: PathBuf,
    assigned: BTreeMap<FileRole, PathBuf>,
}

impl RunArtifacts {
    pub fn for_image(image: impl AsRef<Path>) -> Self {
        let image = image.as_ref();
        let base = match image.to_str().and_then(|s| s.strip_suffix(".fits")) {
            Some(stripped) => PathBuf::from(stripped),
            None => image.with_extension(""),
        };
        Self {
            base,
            assigned: BTreeMap::new(),
        }
    }

    /// Image path without the `.fits` suffix.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn default_path(&self, role: FileRole) -> PathBuf {
        let mut name = OsString::from(self.base.as_os_str());
        name.push(".");
        name.push(role.extension());
        PathBuf::from(name)
    }

    pub fn get(&self, role: FileRole) -> Option<&Path> {
        self.assigned.get(&role).map(PathBuf::as_path)
    }

    /// The assigned path, or the default one if the role is still open.
    pub fn resolve(&self, role: FileRole) -> PathBuf {
        self.get(role)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.default_path(role))
    }

    /// Copy with `role` bound to `path`, unless the role is already bound.
    #[must_use]
    pub fn assign(&self, role: FileRole, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut next = self.clone();
        match next.assigned.get(&role) {
            Some(existing) if *existing != path => {
                debug!(
                    "{:?} already bound to {}, ignoring {}",
                    role,
                    existing.display(),
                    path.display()
                );
            }
            Some(_) => {}
            None => {
                next.assigned.insert(role, path);
            }
        }
        next
    }

    /// Copy with `role` bound to its current resolution.
    #[must_use]
    pub fn assign_default(&self, role: FileRole) -> Self {
        self.assign(role, self.resolve(role))
    }

    /// Roles bound so far, in role order.
    pub fn assigned(&self) -> impl Iterator<Item = (FileRole, &Path)> {
        self.assigned
            .iter()
            .map(|(&role, path)| (role, path.as_path()))
    }

    /// Copy every bound artifact that exists into `out_dir`.
    ///
    /// Missing artifacts are skipped with a warning. Returns the destination
    /// paths written.
    pub fn save_files(&self, out_dir: impl AsRef<Path>) -> std::io::Result<Vec<PathBuf>> {
        let out_dir = out_dir.as_ref();
        fs::create_dir_all(out_dir)?;

        let mut saved = Vec::new();
        for (role, source) in self.assigned() {
            if !source.exists() {
                warn!("{:?} artifact {} does not exist, skipping", role, source.display());
                continue;
            }
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = out_dir.join(name);
            if same_file(source, &target) {
                saved.push(target);
                continue;
            }
            fs::copy(source, &target)?;
            debug!("Saved {} -> {}", source.display(), target.display());
            saved.push(target);
        }
        Ok(saved)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Delete `path` if present, so the tool never asks whether to overwrite it.
pub fn clobber(path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Clobbered {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths_strip_fits_suffix() {
        let artifacts = RunArtifacts::for_image("/tmp/pid42.fits");
        assert_eq!(artifacts.base(), Path::new("/tmp/pid42"));
        assert_eq!(
            artifacts.default_path(FileRole::Ap),
            PathBuf::from("/tmp/pid42.ap")
        );
        assert_eq!(
            artifacts.default_path(FileRole::CleanStarSub),
            PathBuf::from("/tmp/pid42.cleanstarsub.fits")
        );
    }

    #[test]
    fn test_non_fits_image_drops_extension() {
        let artifacts = RunArtifacts::for_image("frame.fit");
        assert_eq!(artifacts.default_path(FileRole::Coo), PathBuf::from("frame.coo"));
    }

    #[test]
    fn test_first_assignment_wins() {
        let original = RunArtifacts::for_image("a.fits");
        let first = original.assign(FileRole::Lst, "custom.lst");
        let second = first.assign(FileRole::Lst, "other.lst");

        assert_eq!(original.get(FileRole::Lst), None);
        assert_eq!(first.resolve(FileRole::Lst), PathBuf::from("custom.lst"));
        assert_eq!(second, first);
    }

    #[test]
    fn test_resolve_falls_back_to_default() {
        let artifacts = RunArtifacts::for_image("a.fits");
        assert_eq!(artifacts.resolve(FileRole::Psf), PathBuf::from("a.psf"));
        assert_eq!(artifacts.assigned().count(), 0);
    }

    #[test]
    fn test_clobber_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nothing.ap");
        clobber(&path).unwrap();

        fs::write(&path, "x").unwrap();
        clobber(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_save_files_copies_existing_and_skips_missing() {
        let work = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let image = work.path().join("img.fits");

        let artifacts = RunArtifacts::for_image(&image)
            .assign_default(FileRole::Coo)
            .assign_default(FileRole::Ap);
        fs::write(artifacts.resolve(FileRole::Coo), "coo").unwrap();

        let saved = artifacts.save_files(out.path().join("results")).unwrap();
        assert_eq!(saved, vec![out.path().join("results").join("img.coo")]);
        assert_eq!(fs::read_to_string(&saved[0]).unwrap(), "coo");
    }

    #[test]
    fn test_save_files_into_own_directory_keeps_content() {
        let work = tempfile::tempdir().unwrap();
        let artifacts =
            RunArtifacts::for_image(work.path().join("img.fits")).assign_default(FileRole::Psf);
        fs::write(artifacts.resolve(FileRole::Psf), "model").unwrap();

        artifacts.save_files(work.path()).unwrap();
        assert_eq!(
            fs::read_to_string(artifacts.resolve(FileRole::Psf)).unwrap(),
            "model"
        );
    }
}
