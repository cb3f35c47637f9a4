//! Per-exec working directories.
//!
//! Inside a container, the entrypoint preamble re-validates the session id,
//! creates `/scratch/{session}` on the memory-backed scratch mount when no
//! working directory is given, and `cd`s into it before handing over to the
//! agent runtime. There is no cleanup: the tmpfs bounds capacity and a
//! container restart wipes it. Named environments pass their own top-level
//! directory instead, so files survive across joins.
//!
//! Isolation between sessions sharing one container is by directory naming
//! under a single user, not a security boundary.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::container::spec::SCRATCH_DIR;
use crate::error::{SandboxError, SandboxResult};

const MAX_SESSION_ID_LEN: usize = 128;

/// POSIX shell preamble. Arguments: session id, working dir override (may
/// be empty), exec id, then the agent runtime command. The preamble stays
/// the parent of the agent and records its own pid under the exec id, on
/// the `/tmp` tmpfs, so the whole tree can be killed from a second exec.
const ENTRYPOINT_SCRIPT: &str = r#"set -eu
sid="$1"; dir="$2"; xid="$3"; shift 3
case "$sid" in
  ''|-*|*[!A-Za-z0-9_-]*) echo "fluux-entrypoint: invalid session id" >&2; exit 64 ;;
esac
if [ "${#sid}" -gt 128 ]; then
  echo "fluux-entrypoint: invalid session id" >&2; exit 64
fi
case "$xid" in
  ''|-*|*[!A-Za-z0-9_-]*) echo "fluux-entrypoint: invalid exec id" >&2; exit 64 ;;
esac
if [ -z "$dir" ]; then
  dir="/scratch/$sid"
  mkdir -p "$dir"
  chmod 700 "$dir"
fi
cd "$dir"
run="${FLUUX_EXEC_RUN_DIR:-/tmp/.fluux-exec}"
mkdir -p "$run"
echo "$$" > "$run/$xid.pid"
set +e
"$@"
rc=$?
rm -f "$run/$xid.pid"
exit "$rc"
"#;

/// Kills the tree recorded for one exec id: stop each process so it cannot
/// fork, descend into its children, then kill it. Children are found by
/// parent pid in `/proc/*/stat`, which every kernel provides.
const KILL_SCRIPT: &str = r#"set -u
xid="$1"
run="${FLUUX_EXEC_RUN_DIR:-/tmp/.fluux-exec}"
pidfile="$run/$xid.pid"
[ -f "$pidfile" ] || exit 0
children() {
  parent="$1"
  for stat in /proc/[0-9]*/stat; do
    line=$(cat "$stat" 2>/dev/null) || continue
    set -- ${line##*) }
    if [ "${2:-}" = "$parent" ]; then
      pid="${stat#/proc/}"
      echo "${pid%/stat}"
    fi
  done
}
reap() {
  kill -STOP "$1" 2>/dev/null || return 0
  for child in $(children "$1"); do
    reap "$child"
  done
  kill -KILL "$1" 2>/dev/null
  return 0
}
reap "$(cat "$pidfile")"
rm -f "$pidfile"
"#;

fn session_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_-]*$").expect("session id pattern is valid")
    })
}

/// Accepts only identifiers that are safe as a single path component.
pub fn validate_session_id(session_id: &str) -> SandboxResult<()> {
    if session_id.len() > MAX_SESSION_ID_LEN || !session_id_pattern().is_match(session_id) {
        return Err(SandboxError::InvalidIdentifier(session_id.to_string()));
    }
    Ok(())
}

/// Container path of a session's private scratch directory.
pub fn scratch_path(session_id: &str) -> String {
    format!("{SCRATCH_DIR}/{session_id}")
}

/// Command line that runs `agent_command` through the entrypoint preamble.
pub fn entrypoint_argv(
    session_id: &str,
    workdir: Option<&str>,
    exec_id: &str,
    agent_command: &[String],
) -> SandboxResult<Vec<String>> {
    validate_session_id(session_id)?;
    validate_session_id(exec_id)?;
    let mut argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        ENTRYPOINT_SCRIPT.to_string(),
        "fluux-entrypoint".to_string(),
        session_id.to_string(),
        workdir.unwrap_or_default().to_string(),
        exec_id.to_string(),
    ];
    argv.extend(agent_command.iter().cloned());
    Ok(argv)
}

/// Command line, run inside the container, that kills the exec started
/// under `exec_id`. A no-op once that exec has finished.
pub fn kill_exec_argv(exec_id: &str) -> SandboxResult<Vec<String>> {
    validate_session_id(exec_id)?;
    Ok(vec![
        "sh".to_string(),
        "-c".to_string(),
        KILL_SCRIPT.to_string(),
        "fluux-kill".to_string(),
        exec_id.to_string(),
    ])
}

/// Fresh identifier for one exec, safe as a file name.
pub fn new_exec_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Working directory the agent sees for this exec.
pub fn effective_workdir(session_id: &str, workdir: Option<&str>) -> String {
    workdir
        .map(str::to_string)
        .unwrap_or_else(|| scratch_path(session_id))
}

/// Host-side equivalent for direct mode: a private directory under `root`.
pub fn prepare_host_scratch(root: &Path, session_id: &str) -> SandboxResult<PathBuf> {
    validate_session_id(session_id)?;
    let dir = root.join(session_id);
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}
