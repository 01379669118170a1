//! JAD descriptor derivation for stored JAR archives.
//!
//! J2ME-era phones fetch a small `.jad` descriptor before committing to a
//! full MIDlet download. The descriptor is produced by the external
//! `jadmaker` tool against a scratch copy of the stored archive, then three
//! targeted rewrites point it back at this service:
//!
//! 1. the `MIDlet-Jar-URL` line referring to the archive by bare ID becomes
//!    an absolute download URL,
//! 2. the `MIDlet-Info-URL` line becomes the service root,
//! 3. a jadmaker defect that glues `MIDlet-Jar-Size` onto the previous line
//!    without a newline is repaired.
//!
//! All intermediates live inside a caller-provided scratch directory whose
//! lifetime is scoped to the request.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};
use tokio::process::Command;
use tracing::{debug, warn};

use drophost_store::StoredFile;

/// Extension of the one archive type supporting descriptor derivation.
pub const ARCHIVE_EXT: &str = ".jar";

/// Extension of the derived descriptor.
pub const DESCRIPTOR_EXT: &str = ".jad";

/// Default bound on a single jadmaker invocation.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(10);

static JAR_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^MIDlet-Jar-URL: \w{6}$").expect("static regex"));
static INFO_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^MIDlet-Info-URL: .*$").expect("static regex"));
static SIZE_GLUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([^\n])MIDlet-Jar-Size: ").expect("static regex"));

/// Failures while deriving a descriptor.
#[derive(Debug, thiserror::Error)]
pub enum JadError {
    /// The tool binary could not be started at all.
    #[error("descriptor tool '{tool}' is not available: {source}")]
    ToolUnavailable {
        tool: String,
        source: std::io::Error,
    },
    /// The tool ran and reported failure.
    #[error("descriptor tool '{tool}' failed with {status}")]
    ToolFailed { tool: String, status: String },
    /// The tool exceeded its invocation bound.
    #[error("descriptor tool '{tool}' timed out after {timeout:?}")]
    Timeout { tool: String, timeout: Duration },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JadError {
    /// True for failures of the external tool itself, as opposed to scratch
    /// I/O problems.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            JadError::ToolUnavailable { .. } | JadError::ToolFailed { .. } | JadError::Timeout { .. }
        )
    }
}

/// Whether an original filename names a supported archive.
pub fn is_archive_name(name: &str) -> bool {
    has_suffix_ignore_case(name, ARCHIVE_EXT)
}

/// Swap the archive extension for the descriptor extension.
pub fn descriptor_name(original: &str) -> String {
    if has_suffix_ignore_case(original, ARCHIVE_EXT) {
        let stem = &original[..original.len() - ARCHIVE_EXT.len()];
        format!("{stem}{DESCRIPTOR_EXT}")
    } else {
        original.to_string()
    }
}

fn has_suffix_ignore_case(name: &str, suffix: &str) -> bool {
    name.len() >= suffix.len()
        && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}

/// Handle to the external descriptor-generation tool.
#[derive(Clone)]
pub struct JadMaker {
    tool: PathBuf,
    timeout: Duration,
}

impl JadMaker {
    pub fn new<P: Into<PathBuf>>(tool: P, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            timeout,
        }
    }

    /// Derive the patched descriptor for `stored` inside `scratch`.
    ///
    /// Returns the path of the patched descriptor file, named after the
    /// original archive with its extension swapped. Every intermediate is
    /// created under `scratch`; the caller owns that directory and its
    /// cleanup, so no exit path here leaks files outside it.
    pub async fn derive(
        &self,
        stored: &StoredFile,
        base_url: &str,
        scratch: &Path,
    ) -> Result<PathBuf, JadError> {
        let scratch_archive = scratch.join(stored.id.as_str());
        tokio::fs::copy(&stored.path, &scratch_archive).await?;

        let run = self.run_tool(&scratch_archive).await;
        // The archive copy is only input for the tool; drop it either way.
        let _ = tokio::fs::remove_file(&scratch_archive).await;
        run?;

        let raw_descriptor = scratch.join(format!("{}{DESCRIPTOR_EXT}", stored.id));
        let text = tokio::fs::read_to_string(&raw_descriptor).await?;
        let _ = tokio::fs::remove_file(&raw_descriptor).await;

        let patched = patch_descriptor(&text, stored.id.as_str(), base_url);

        let out_name = safe_file_name(&descriptor_name(&stored.original_name))
            .unwrap_or_else(|| format!("{}{DESCRIPTOR_EXT}", stored.id));
        let out_path = scratch.join(out_name);
        tokio::fs::write(&out_path, patched).await?;

        debug!(id = %stored.id, "derived descriptor for {}", stored.original_name);
        Ok(out_path)
    }

    async fn run_tool(&self, archive: &Path) -> Result<(), JadError> {
        let tool = self.tool.display().to_string();

        let mut command = Command::new(&self.tool);
        command
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|source| JadError::ToolUnavailable {
            tool: tool.clone(),
            source,
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| JadError::Timeout {
                tool: tool.clone(),
                timeout: self.timeout,
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                warn!(tool = %tool, "descriptor tool stderr: {}", stderr.trim());
            }
            return Err(JadError::ToolFailed {
                tool,
                status: output.status.to_string(),
            });
        }

        Ok(())
    }
}

/// Apply the three descriptor rewrites. Each is a no-op when its pattern is
/// absent, and a second application changes nothing.
pub fn patch_descriptor(text: &str, id: &str, base_url: &str) -> String {
    let jar_url = format!("MIDlet-Jar-URL: {base_url}/{id}{ARCHIVE_EXT}");
    let text = JAR_URL_RE.replace_all(text, NoExpand(&jar_url));

    let info_url = format!("MIDlet-Info-URL: {base_url}");
    let text = INFO_URL_RE.replace_all(&text, NoExpand(&info_url));

    SIZE_GLUE_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            format!("{}\nMIDlet-Jar-Size: ", &caps[1])
        })
        .into_owned()
}

/// Reduce an arbitrary client-supplied name to a bare file name, refusing
/// anything that would escape the scratch directory.
fn safe_file_name(name: &str) -> Option<String> {
    let candidate = Path::new(name).file_name()?.to_string_lossy().to_string();
    if candidate.is_empty() || candidate == "." || candidate == ".." {
        return None;
    }
    Some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "MIDlet-Name: Snake\n\
MIDlet-Version: 1.0\n\
MIDlet-Jar-URL: adgjmp\n\
MIDlet-Info-URL: http://jadmaker.invalid/info\n\
MIDlet-Vendor: UnknownMIDlet-Jar-Size: 20480\n";

    #[test]
    fn test_patch_rewrites_jar_url() {
        let out = patch_descriptor(SAMPLE, "adgjmp", "http://phone.example");
        assert!(out.contains("MIDlet-Jar-URL: http://phone.example/adgjmp.jar\n"));
        assert!(!out.contains("MIDlet-Jar-URL: adgjmp"));
    }

    #[test]
    fn test_patch_rewrites_info_url() {
        let out = patch_descriptor(SAMPLE, "adgjmp", "http://phone.example");
        assert!(out.contains("MIDlet-Info-URL: http://phone.example\n"));
        assert!(!out.contains("jadmaker.invalid"));
    }

    #[test]
    fn test_patch_repairs_missing_newline_before_size() {
        let out = patch_descriptor(SAMPLE, "adgjmp", "http://phone.example");
        assert!(out.contains("MIDlet-Vendor: Unknown\nMIDlet-Jar-Size: 20480"));
        assert!(!SIZE_GLUE_RE.is_match(&out));
    }

    #[test]
    fn test_patch_is_idempotent() {
        let once = patch_descriptor(SAMPLE, "adgjmp", "http://phone.example");
        let twice = patch_descriptor(&once, "adgjmp", "http://phone.example");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_patch_leaves_unrelated_descriptor_alone() {
        let clean = "MIDlet-Name: Clean\nMIDlet-Jar-URL: http://elsewhere/x.jar\n\
MIDlet-Jar-Size: 1\n";
        let out = patch_descriptor(clean, "adgjmp", "http://phone.example");
        assert!(out.contains("MIDlet-Jar-URL: http://elsewhere/x.jar\n"));
        assert!(out.contains("\nMIDlet-Jar-Size: 1\n"));
    }

    #[test]
    fn test_jar_url_only_replaces_bare_id_lines() {
        // The bare-ID line match is anchored; an ID embedded in prose stays.
        let text = "MIDlet-Description: see adgjmp\nMIDlet-Jar-URL: adgjmp\n";
        let out = patch_descriptor(text, "adgjmp", "http://h");
        assert!(out.contains("MIDlet-Description: see adgjmp\n"));
        assert!(out.contains("MIDlet-Jar-URL: http://h/adgjmp.jar\n"));
    }

    #[test]
    fn test_archive_name_checks() {
        assert!(is_archive_name("game.jar"));
        assert!(is_archive_name("GAME.JAR"));
        assert!(!is_archive_name("theme.nth"));
        assert!(!is_archive_name("jar"));

        assert_eq!(descriptor_name("game.jar"), "game.jad");
        assert_eq!(descriptor_name("Game.JAR"), "Game.jad");
        assert_eq!(descriptor_name("notes.txt"), "notes.txt");
    }

    #[test]
    fn test_safe_file_name_strips_path_components() {
        assert_eq!(safe_file_name("game.jad"), Some("game.jad".to_string()));
        assert_eq!(
            safe_file_name("../../etc/passwd"),
            Some("passwd".to_string())
        );
        assert_eq!(safe_file_name(""), None);
    }
}

#[cfg(all(test, unix))]
mod tool_tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use drophost_store::{FileId, StoredFile};

    fn stored_archive(dir: &Path) -> StoredFile {
        let id = FileId::generate(&HashSet::new());
        let path = dir.join(id.as_str());
        fs::write(&path, b"PK\x03\x04 fake jar").unwrap();
        StoredFile {
            id,
            original_name: "snake.jar".to_string(),
            expires_at_ms: u64::MAX,
            size_bytes: 13,
            path,
        }
    }

    fn fake_tool(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("jadmaker");
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_derive_with_working_tool() {
        let data = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let stored = stored_archive(data.path());

        // Emits the same shape jadmaker does, defect included.
        let tool = fake_tool(
            data.path(),
            "#!/bin/sh\n\
             id=$(basename \"$1\")\n\
             printf 'MIDlet-Name: Snake\\nMIDlet-Jar-URL: %s\\nMIDlet-Info-URL: \\nMIDlet-Vendor: XMIDlet-Jar-Size: 14\\n' \"$id\" > \"$1.jad\"\n",
        );

        let maker = JadMaker::new(tool, DEFAULT_TOOL_TIMEOUT);
        let out = maker
            .derive(&stored, "http://host.example", scratch.path())
            .await
            .unwrap();

        assert_eq!(out.file_name().unwrap(), "snake.jad");
        let text = fs::read_to_string(&out).unwrap();
        assert!(text.contains(&format!(
            "MIDlet-Jar-URL: http://host.example/{}.jar",
            stored.id
        )));
        assert!(text.contains("MIDlet-Info-URL: http://host.example\n"));
        assert!(text.contains("MIDlet-Vendor: X\nMIDlet-Jar-Size: 14"));

        // Only the final descriptor remains in scratch.
        let leftovers: Vec<_> = fs::read_dir(scratch.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("snake.jad")]);
    }

    #[tokio::test]
    async fn test_missing_tool_is_unavailable() {
        let data = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let stored = stored_archive(data.path());

        let maker = JadMaker::new("/nonexistent/drophost-jadmaker", DEFAULT_TOOL_TIMEOUT);
        let err = maker
            .derive(&stored, "http://h", scratch.path())
            .await
            .unwrap_err();

        assert!(matches!(err, JadError::ToolUnavailable { .. }));
        assert!(err.is_tool_failure());
    }

    #[tokio::test]
    async fn test_failing_tool_reports_status() {
        let data = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let stored = stored_archive(data.path());

        let tool = fake_tool(data.path(), "#!/bin/sh\necho 'bad jar' >&2\nexit 3\n");
        let maker = JadMaker::new(tool, DEFAULT_TOOL_TIMEOUT);
        let err = maker
            .derive(&stored, "http://h", scratch.path())
            .await
            .unwrap_err();

        assert!(matches!(err, JadError::ToolFailed { .. }));
        // The scratch archive copy is removed even on failure.
        assert!(!scratch.path().join(stored.id.as_str()).exists());
    }

    #[tokio::test]
    async fn test_hung_tool_times_out() {
        let data = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let stored = stored_archive(data.path());

        let tool = fake_tool(data.path(), "#!/bin/sh\nsleep 60\n");
        let maker = JadMaker::new(tool, Duration::from_millis(200));
        let err = maker
            .derive(&stored, "http://h", scratch.path())
            .await
            .unwrap_err();

        assert!(matches!(err, JadError::Timeout { .. }));
    }
}
