// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

/// Environment variable that overrides the discovered socket path.
pub const SOCKET_ENV_VAR: &str = "TOMTE_SOCKET";

const SOCKET_FILE: &str = "tomte-daemon.sock";

/// Resolve the control socket path.
///
/// Priority, highest first:
/// 1. `cli_flag` (`--socket`)
/// 2. `TOMTE_SOCKET` environment variable
/// 3. the `daemon.socket` config field
/// 4. `$XDG_RUNTIME_DIR/tomte-daemon.sock`
/// 5. `/tmp/tomte-daemon.sock`
pub fn resolve_socket_path(
    cli_flag: Option<&std::path::Path>,
    configured: Option<&std::path::Path>,
) -> PathBuf {
    if let Some(p) = cli_flag {
        return p.to_path_buf();
    }
    if let Ok(p) = std::env::var(SOCKET_ENV_VAR) {
        if !p.is_empty() {
            return PathBuf::from(p);
        }
    }
    if let Some(p) = configured {
        return p.to_path_buf();
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join(SOCKET_FILE);
        }
    }
    PathBuf::from("/tmp").join(SOCKET_FILE)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;

    // Tests mutate process-wide environment variables; serialise them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn cli_flag_wins_over_everything() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(SOCKET_ENV_VAR, "/tmp/env.sock");
        let p = resolve_socket_path(Some(Path::new("/tmp/cli.sock")), Some(Path::new("/tmp/cfg.sock")));
        assert_eq!(p, PathBuf::from("/tmp/cli.sock"));
        std::env::remove_var(SOCKET_ENV_VAR);
    }

    #[test]
    fn env_var_wins_over_config() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(SOCKET_ENV_VAR, "/tmp/env.sock");
        let p = resolve_socket_path(None, Some(Path::new("/tmp/cfg.sock")));
        assert_eq!(p, PathBuf::from("/tmp/env.sock"));
        std::env::remove_var(SOCKET_ENV_VAR);
    }

    #[test]
    fn falls_back_to_runtime_dir_then_tmp() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(SOCKET_ENV_VAR);
        std::env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        assert_eq!(
            resolve_socket_path(None, None),
            PathBuf::from("/run/user/1000/tomte-daemon.sock")
        );
        std::env::remove_var("XDG_RUNTIME_DIR");
        assert_eq!(
            resolve_socket_path(None, None),
            PathBuf::from("/tmp/tomte-daemon.sock")
        );
    }
}
