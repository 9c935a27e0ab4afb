//! Fake inference binaries for process-level tests

use crate::ServerConfig;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Argument parsing shared by every fake engine: records the launch and
/// leaves the `-p` value in `$prompt`.
const PRELUDE: &str = r#"#!/bin/sh
dir=$(dirname "$0")
echo launch >> "$dir/launches.log"
printf '%s\n' "$*" >> "$dir/args.log"
prompt=""
while [ $# -gt 0 ]; do
  case "$1" in
    -p) prompt="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

/// llama.cpp stand-in: echoes the prompt, answers "Hello there", then
/// answers "Again" to every interactive input. Ignores SIGINT.
pub const CHATTY_MAIN: &str = r#"
trap '' INT
printf '%s' "$prompt"
sleep 0.2
printf 'Hello'
sleep 0.1
printf ' there'
sleep 0.1
printf 'user:'
while IFS= read -r line; do
  case "$line" in
    *assistant:*)
      sleep 0.1
      printf 'Again'
      sleep 0.1
      printf 'user:'
      ;;
  esac
done
"#;

/// Waits for the watchdog's newline before finishing the word
pub const STALLING_MAIN: &str = r#"
trap '' INT
printf '%s' "$prompt"
sleep 0.1
printf 'Hel'
read -r nudge
printf 'lo'
sleep 0.1
printf 'user:'
sleep 5
"#;

/// Goes silent after the first token
pub const SILENT_MAIN: &str = r#"
printf '%s' "$prompt"
sleep 0.1
printf 'Hel'
sleep 30
"#;

/// Fails before echoing anything
pub const BROKEN_MAIN: &str = r#"
echo "error: failed to load model" >&2
exit 1
"#;

/// Echoes the prompt, writes two tokens, then exits
pub const SHORT_LIVED_MAIN: &str = r#"
printf '%s' "$prompt"
sleep 0.1
printf ' world'
sleep 0.1
printf '!'
"#;

pub const EMBEDDING: &str = r#"
printf '0.25 -1.5 3 \n'
"#;

/// Temporary engine directories plus a config pointing at them
pub struct FakeEngines {
    dir: TempDir,
}

impl FakeEngines {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Install an executable script under `name`
    pub fn install(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("{}{}", PRELUDE, body)).expect("write engine");
        let mut perms = std::fs::metadata(&path).expect("stat engine").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod engine");
        path
    }

    pub fn config(&self) -> ServerConfig {
        let mut config = ServerConfig::default()
            .with_llama_dir(self.path())
            .with_ggml_dir(self.path())
            .with_model_path("/models/llama-7b/ggml-model-q4_0.bin")
            .with_stall_timeout(Duration::from_secs(10));
        config.shutdown_grace = Duration::from_millis(200);
        config.queue_poll.interval = Duration::from_millis(5);
        config.queue_poll.jitter = Duration::from_millis(5);
        config
    }

    pub fn launches(&self) -> usize {
        std::fs::read_to_string(self.path().join("launches.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }

    pub fn args_log(&self) -> String {
        std::fs::read_to_string(self.path().join("args.log")).unwrap_or_default()
    }
}
