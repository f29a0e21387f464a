use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::{RebaseError, RevisionId, ScriptDocument};

pub const SCRIPT_EXTENSION: &str = "sql";

/// Location of one script file inside a [`ScriptDirectory`].
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScriptHandle {
    path: PathBuf,
}

impl ScriptHandle {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Directory of migration scripts, one `.sql` file per revision.
///
/// Nothing is cached: every lookup lists and reads the directory again, so a
/// relink is visible to the very next call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScriptDirectory {
    root: PathBuf,
}

impl ScriptDirectory {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find the script recording `revision`.
    ///
    /// File names starting with the revision id are tried first and confirmed
    /// by parsing; every other script is then inspected by content. Scripts
    /// that fail to parse are skipped during the content scan.
    ///
    /// # Errors
    /// Returns [`RebaseError::Io`] when the directory or a candidate file
    /// cannot be read.
    pub fn locate(&self, revision: &RevisionId) -> Result<Option<ScriptHandle>, RebaseError> {
        let paths = self.script_paths()?;
        let (by_name, others): (Vec<_>, Vec<_>) =
            paths.into_iter().partition(|path| file_name_matches(path, revision));

        for path in by_name.iter().chain(&others) {
            let raw = read_script(path)?;
            match ScriptDocument::parse(path, raw) {
                Ok(document) if document.revision() == revision => {
                    return Ok(Some(ScriptHandle { path: path.clone() }));
                }
                Ok(_) => {}
                Err(err) => tracing::debug!("Skipping unparseable script while locating: {err}"),
            }
        }

        Ok(None)
    }

    /// Read and parse the script behind `handle`.
    ///
    /// # Errors
    /// Returns [`RebaseError::Io`] on read failure and
    /// [`RebaseError::MalformedScript`] when the revision cannot be extracted.
    pub fn parse(&self, handle: &ScriptHandle) -> Result<ScriptDocument, RebaseError> {
        ScriptDocument::parse(&handle.path, read_script(&handle.path)?)
    }

    /// Locate and parse `revision`, failing when it does not exist.
    ///
    /// # Errors
    /// Returns [`RebaseError::RevisionNotFound`] when no script records the
    /// revision, plus any error of [`Self::locate`] or [`Self::parse`].
    pub fn load(
        &self,
        revision: &RevisionId,
    ) -> Result<(ScriptHandle, ScriptDocument), RebaseError> {
        let handle = self
            .locate(revision)?
            .ok_or_else(|| RebaseError::RevisionNotFound { revision: revision.clone() })?;
        let document = self.parse(&handle)?;
        Ok((handle, document))
    }

    /// Rewrite the parent link of one script in place.
    ///
    /// Returns whether the file content changed; relinking to the recorded
    /// value leaves the file untouched.
    ///
    /// # Errors
    /// Returns [`RebaseError::MalformedScript`] when the script has no parent
    /// field and [`RebaseError::Io`] when reading or writing fails.
    pub fn relink(
        &self,
        handle: &ScriptHandle,
        new_parent: Option<&RevisionId>,
    ) -> Result<bool, RebaseError> {
        let document = self.parse(handle)?;
        let relinked = document.relinked(&handle.path, new_parent)?;
        if relinked.raw() == document.raw() {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&handle.path)
            .map_err(|err| RebaseError::io(&handle.path, &err))?;
        file.write_all(relinked.raw().as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|err| RebaseError::io(&handle.path, &err))?;

        tracing::debug!(
            "Relinked {} to parent {}",
            relinked.revision(),
            new_parent.map_or("none", RevisionId::as_str)
        );
        Ok(true)
    }

    /// Parse every script in the directory, ordered by file name.
    ///
    /// # Errors
    /// Returns the first read or parse failure, and
    /// [`RebaseError::MalformedScript`] when two files record the same revision.
    pub fn scripts(&self) -> Result<Vec<(ScriptHandle, ScriptDocument)>, RebaseError> {
        let mut seen: BTreeMap<RevisionId, PathBuf> = BTreeMap::new();
        let mut scripts = Vec::new();

        for path in self.script_paths()? {
            let document = ScriptDocument::parse(&path, read_script(&path)?)?;
            if let Some(first) = seen.insert(document.revision().clone(), path.clone()) {
                return Err(RebaseError::malformed(
                    &path,
                    format!(
                        "revision {} is also recorded by {}",
                        document.revision(),
                        first.display()
                    ),
                ));
            }
            scripts.push((ScriptHandle { path }, document));
        }

        Ok(scripts)
    }

    /// Revisions no other script names as a parent: the leaves of the forest.
    ///
    /// # Errors
    /// Returns any error of [`Self::scripts`].
    pub fn heads(&self) -> Result<Vec<RevisionId>, RebaseError> {
        let scripts = self.scripts()?;
        let referenced = scripts
            .iter()
            .flat_map(|(_, document)| document.parents().iter().cloned())
            .collect::<BTreeSet<_>>();

        let mut heads = scripts
            .into_iter()
            .map(|(_, document)| document.revision().clone())
            .filter(|revision| !referenced.contains(revision))
            .collect::<Vec<_>>();
        heads.sort();
        Ok(heads)
    }

    /// Scripts recording `revision` among their parents.
    ///
    /// # Errors
    /// Returns any error of [`Self::scripts`].
    pub fn children(&self, revision: &RevisionId) -> Result<Vec<RevisionId>, RebaseError> {
        let mut children = self
            .scripts()?
            .into_iter()
            .filter(|(_, document)| document.parents().contains(revision))
            .map(|(_, document)| document.revision().clone())
            .collect::<Vec<_>>();
        children.sort();
        Ok(children)
    }

    fn script_paths(&self) -> Result<Vec<PathBuf>, RebaseError> {
        let entries = fs::read_dir(&self.root).map_err(|err| RebaseError::io(&self.root, &err))?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| RebaseError::io(&self.root, &err))?.path();
            if path.is_file()
                && path.extension().and_then(|ext| ext.to_str()) == Some(SCRIPT_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn read_script(path: &Path) -> Result<String, RebaseError> {
    fs::read_to_string(path).map_err(|err| RebaseError::io(path, &err))
}

/// File stems like `<revision>_slug`, `<revision>-slug` or exactly `<revision>`.
fn file_name_matches(path: &Path, revision: &RevisionId) -> bool {
    let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
        return false;
    };
    stem.strip_prefix(revision.as_str())
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(['_', '-', '.']))
}
