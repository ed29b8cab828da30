use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{JudgeError, JudgeResult};

const WORK_DIR_PERMISSIONS: u32 = 0o755;
const RUN_DIR: &str = "interjudge-run";

/// Per-session scratch directory with the files handed to the interactor and checker
///
/// The solution gets its own empty directory under the system temp dir, away
/// from the answer file. Both are removed on drop unless kept.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    solution_dir: PathBuf,
    keep: bool,
    pub input: PathBuf,
    pub answer: PathBuf,
    pub tout: PathBuf,
    pub transcript: PathBuf,
}

impl Workspace {
    /// Creates `root/session_id` holding the input, the answer and an empty `tout.txt`
    pub fn create(
        root: &Path,
        session_id: &str,
        input: &[u8],
        answer: &[u8],
        keep: bool,
    ) -> JudgeResult<Self> {
        let setup = |path: &Path| {
            let path = path.to_path_buf();
            move |e: std::io::Error| {
                JudgeError::InvalidSetup(format!("cannot prepare {}: {e}", path.display()))
            }
        };

        fs::create_dir_all(root).map_err(setup(root))?;
        let dir = root.join(session_id);
        fs::create_dir(&dir).map_err(setup(&dir))?;

        let run_root = std::env::temp_dir().join(RUN_DIR);
        let solution_dir = run_root.join(session_id);
        // from here on a failure removes what was already created
        let mut workspace = Self {
            input: dir.join("input.txt"),
            answer: dir.join("answer.txt"),
            tout: dir.join("tout.txt"),
            transcript: dir.join("transcript.log"),
            solution_dir,
            dir,
            keep: false,
        };
        fs::set_permissions(&workspace.dir, fs::Permissions::from_mode(WORK_DIR_PERMISSIONS))
            .map_err(setup(&workspace.dir))?;
        fs::create_dir_all(&run_root).map_err(setup(&run_root))?;
        fs::create_dir(&workspace.solution_dir).map_err(setup(&workspace.solution_dir))?;
        fs::write(&workspace.input, input).map_err(setup(&workspace.input))?;
        fs::write(&workspace.answer, answer).map_err(setup(&workspace.answer))?;
        fs::write(&workspace.tout, b"").map_err(setup(&workspace.tout))?;

        log::debug!(
            "Session directory ready at {}, solution runs in {}",
            workspace.dir.display(),
            workspace.solution_dir.display()
        );
        workspace.keep = keep;
        Ok(workspace)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Empty working directory for the contestant process
    pub fn solution_dir(&self) -> &Path {
        &self.solution_dir
    }

    /// `input tout answer`, the argument order shared by interactors and checkers
    pub fn judge_args(&self) -> Vec<String> {
        [&self.input, &self.tout, &self.answer]
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }

    /// Reads back the interactor's auxiliary output, keeping at most `limit` bytes
    pub fn read_tout(&self, limit: usize) -> String {
        match fs::read(&self.tout) {
            Ok(mut bytes) => {
                bytes.truncate(limit);
                String::from_utf8_lossy(&bytes).into_owned()
            }
            Err(e) => {
                log::warn!("Failed to read {}: {e}", self.tout.display());
                String::new()
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.keep {
            log::info!(
                "Keeping session directories {} and {}",
                self.dir.display(),
                self.solution_dir.display()
            );
            return;
        }
        for dir in [&self.dir, &self.solution_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("Failed to remove {}: {e}", dir.display()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (PathBuf, String) {
        let pid = std::process::id();
        (
            std::env::temp_dir().join(format!("interjudge-{name}-{pid}")),
            format!("{name}-{pid}"),
        )
    }

    #[test]
    fn create_writes_the_case_files_and_drop_removes_them() {
        let (root, id) = scratch("ws");
        let workspace = Workspace::create(&root, &id, b"3 4\n", b"7\n", false).unwrap();

        assert_eq!(fs::read(&workspace.input).unwrap(), b"3 4\n");
        assert_eq!(fs::read(&workspace.answer).unwrap(), b"7\n");
        assert_eq!(workspace.read_tout(16), "");
        assert_eq!(fs::read_dir(workspace.solution_dir()).unwrap().count(), 0);

        fs::write(&workspace.tout, "ok, 12 queries used").unwrap();
        assert_eq!(workspace.read_tout(6), "ok, 12");

        let args = workspace.judge_args();
        assert!(args[0].ends_with("input.txt"));
        assert!(args[1].ends_with("tout.txt"));
        assert!(args[2].ends_with("answer.txt"));

        let dir = workspace.dir().to_path_buf();
        let solution_dir = workspace.solution_dir().to_path_buf();
        drop(workspace);
        assert!(!dir.exists());
        assert!(!solution_dir.exists());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn answer_is_not_next_to_the_solution() {
        let (root, id) = scratch("apart");
        let workspace = Workspace::create(&root, &id, b"", b"42\n", false).unwrap();

        let solution_dir = workspace.solution_dir();
        assert!(!solution_dir.starts_with(&root));
        let parent = solution_dir.parent().unwrap();
        assert!(!parent.join("answer.txt").exists());
        assert!(!parent.join(&id).join("answer.txt").exists());

        drop(workspace);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn kept_workspace_survives_drop() {
        let (root, id) = scratch("kept");
        let workspace = Workspace::create(&root, &id, b"1\n", b"1\n", true).unwrap();
        let dir = workspace.dir().to_path_buf();
        let solution_dir = workspace.solution_dir().to_path_buf();
        drop(workspace);

        assert!(dir.join("answer.txt").exists());
        assert!(solution_dir.exists());
        fs::remove_dir_all(&root).unwrap();
        fs::remove_dir_all(&solution_dir).unwrap();
    }

    #[test]
    fn reusing_a_session_id_fails() {
        let (root, id) = scratch("dup");
        let first = Workspace::create(&root, &id, b"", b"", false).unwrap();
        let second = Workspace::create(&root, &id, b"", b"", false);
        assert!(matches!(second, Err(JudgeError::InvalidSetup(_))));
        assert!(first.dir().join("input.txt").exists());
        drop(first);
        fs::remove_dir_all(&root).ok();
    }
}
