//! Launcher shortcuts and environment expansion.
//!
//! Shortcuts expand `prefix:arg` strings into full PowerShell commands:
//!
//! - `steam:APPID`   → launch a Steam game by App ID
//! - `epic:GAME`     → launch an Epic game by catalog name
//! - `xbox:PKG` / `msstore:PKG` → launch an Xbox / MS Store package
//! - `exe:PATH` / `run:PATH`    → launch an executable directly
//! - `close:NAME` / `kill:NAME` → gracefully close a process
//!
//! Each prefix imposes a character allow-list on its argument. The
//! allow-lists are the only barrier between bus payloads and the shell: an
//! argument that fails its list is rejected outright and the command is
//! dropped, never passed through.

use tracing::{info, warn};

/// Outcome of testing a command string for the shortcut grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shortcut {
    /// No recognised `prefix:` form; the string passes through unchanged.
    NotShortcut,
    /// Recognised and expanded to a full shell command.
    Expanded(String),
    /// Recognised prefix with an argument failing its allow-list. The
    /// command must be dropped.
    Rejected,
}

/// Test `cmd` for a launcher shortcut and expand it.
pub fn expand_launcher_shortcut(cmd: &str) -> Shortcut {
    let Some((prefix, arg)) = cmd.split_once(':') else {
        return Shortcut::NotShortcut;
    };
    let prefix = prefix.trim().to_lowercase();
    let arg = arg.trim();

    match prefix.as_str() {
        "steam" => {
            if !is_numeric(arg) {
                warn!("Invalid Steam App ID (must be numeric): {arg}");
                return Shortcut::Rejected;
            }
            info!("Launching Steam game: App ID {arg}");
            Shortcut::Expanded(format!(r#"Start-Process "steam://rungameid/{arg}""#))
        }

        "epic" => {
            if !is_safe_identifier(arg) {
                warn!("Invalid Epic game name: {arg}");
                return Shortcut::Rejected;
            }
            info!("Launching Epic game: {arg}");
            Shortcut::Expanded(format!(
                r#"Start-Process "com.epicgames.launcher://apps/{arg}?action=launch&silent=true""#
            ))
        }

        "xbox" | "msstore" => {
            if !is_safe_package_name(arg) {
                warn!("Invalid Xbox/MS Store package name: {arg}");
                return Shortcut::Rejected;
            }
            info!("Launching Xbox/MS Store game: {arg}");
            Shortcut::Expanded(format!(
                r#"Start-Process explorer.exe -ArgumentList 'shell:AppsFolder\{arg}'"#
            ))
        }

        "exe" | "run" => {
            if !is_safe_path(arg) {
                warn!("Invalid executable path (contains shell metacharacters): {arg}");
                return Shortcut::Rejected;
            }
            info!("Launching executable: {arg}");

            let (path, args) = split_exe_args(arg);
            // Quote the path if it contains spaces.
            let path = if path.contains(' ') && !path.starts_with('"') {
                format!("\"{path}\"")
            } else {
                path.to_string()
            };

            Shortcut::Expanded(match args {
                Some(args) => format!("Start-Process {path} -ArgumentList '{args}'"),
                None => format!("Start-Process {path}"),
            })
        }

        "close" | "kill" => {
            let process_name = arg.strip_suffix(".exe").unwrap_or(arg);
            if !is_safe_identifier(process_name) {
                warn!("Invalid process name: {arg}");
                return Shortcut::Rejected;
            }
            info!("Closing process: {arg}");
            Shortcut::Expanded(format!(
                "Get-Process | Where-Object {{ $_.ProcessName -eq '{process_name}' }} | ForEach-Object {{ $_.CloseMainWindow() }}"
            ))
        }

        _ => Shortcut::NotShortcut,
    }
}

/// Split an executable invocation at the first `.exe ` into path and
/// arguments. `C:\Games\Game.exe -fullscreen` → (`C:\Games\Game.exe`,
/// `-fullscreen`).
fn split_exe_args(arg: &str) -> (&str, Option<&str>) {
    let lower = arg.to_lowercase();
    if let Some(idx) = lower.find(".exe ") {
        let path = &arg[..idx + 4];
        let args = arg[idx + 5..].trim();
        return (path, if args.is_empty() { None } else { Some(args) });
    }
    (arg, None)
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Alphanumerics plus `.-_`
fn is_safe_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Alphanumerics plus `.-_!` (package names carry an `!App` suffix)
fn is_safe_package_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '!'))
}

/// Anything except PowerShell metacharacters
fn is_safe_path(s: &str) -> bool {
    !s.is_empty()
        && !s
            .chars()
            .any(|c| matches!(c, ';' | '|' | '&' | '$' | '`' | '"' | '\'' | '\n' | '\r'))
}

/// Expand Windows-style `%VAR%` tokens against the process environment.
/// Unset variables substitute to empty.
pub fn expand_windows_env(s: &str) -> String {
    expand_env_with(s, |name| std::env::var(name).ok())
}

fn expand_env_with(s: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = s.to_string();
    loop {
        let Some(start) = result.find('%') else { break };
        let Some(end) = result[start + 1..].find('%') else {
            break;
        };
        let end = end + start + 1;
        let name = &result[start + 1..end];
        let value = lookup(name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[end + 1..]);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steam_numeric_expands_to_uri() {
        assert_eq!(
            expand_launcher_shortcut("steam:440"),
            Shortcut::Expanded(r#"Start-Process "steam://rungameid/440""#.to_string())
        );
    }

    #[test]
    fn test_steam_non_numeric_is_rejected() {
        assert_eq!(expand_launcher_shortcut("steam:abc"), Shortcut::Rejected);
        assert_eq!(expand_launcher_shortcut("steam:440; calc"), Shortcut::Rejected);
        assert_eq!(expand_launcher_shortcut("steam:"), Shortcut::Rejected);
    }

    #[test]
    fn test_epic_identifier_expands() {
        let result = expand_launcher_shortcut("epic:Fortnite");
        assert_eq!(
            result,
            Shortcut::Expanded(
                r#"Start-Process "com.epicgames.launcher://apps/Fortnite?action=launch&silent=true""#
                    .to_string()
            )
        );
    }

    #[test]
    fn test_epic_rejects_spaces_and_quotes() {
        assert_eq!(expand_launcher_shortcut("epic:a b"), Shortcut::Rejected);
        assert_eq!(expand_launcher_shortcut("epic:a\"b"), Shortcut::Rejected);
    }

    #[test]
    fn test_xbox_package_with_bang_expands() {
        let result =
            expand_launcher_shortcut("xbox:Microsoft.MinecraftUWP_8wekyb3d8bbwe!App");
        assert_eq!(
            result,
            Shortcut::Expanded(
                r"Start-Process explorer.exe -ArgumentList 'shell:AppsFolder\Microsoft.MinecraftUWP_8wekyb3d8bbwe!App'".to_string()
            )
        );
        // msstore is an alias
        assert!(matches!(
            expand_launcher_shortcut("msstore:Some.Package!App"),
            Shortcut::Expanded(_)
        ));
    }

    #[test]
    fn test_exe_plain_path() {
        assert_eq!(
            expand_launcher_shortcut(r"exe:C:\Games\Game.exe"),
            Shortcut::Expanded(r"Start-Process C:\Games\Game.exe".to_string())
        );
    }

    #[test]
    fn test_exe_path_with_spaces_is_quoted() {
        assert_eq!(
            expand_launcher_shortcut(r"exe:C:\Program Files\Game\Game.exe"),
            Shortcut::Expanded(r#"Start-Process "C:\Program Files\Game\Game.exe""#.to_string())
        );
    }

    #[test]
    fn test_exe_splits_arguments_after_exe() {
        assert_eq!(
            expand_launcher_shortcut(r"exe:C:\Games\Game.exe -fullscreen -nosound"),
            Shortcut::Expanded(
                r"Start-Process C:\Games\Game.exe -ArgumentList '-fullscreen -nosound'"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_exe_rejects_every_metacharacter() {
        for meta in [';', '|', '&', '$', '`', '"', '\'', '\n', '\r'] {
            let cmd = format!("exe:C:\\Games\\Game.exe {meta}payload");
            assert_eq!(
                expand_launcher_shortcut(&cmd),
                Shortcut::Rejected,
                "metacharacter {meta:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_run_is_alias_for_exe() {
        assert!(matches!(
            expand_launcher_shortcut(r"run:C:\Tools\tool.exe"),
            Shortcut::Expanded(_)
        ));
    }

    #[test]
    fn test_close_strips_exe_suffix() {
        assert_eq!(
            expand_launcher_shortcut("close:bf6.exe"),
            Shortcut::Expanded(
                "Get-Process | Where-Object { $_.ProcessName -eq 'bf6' } | ForEach-Object { $_.CloseMainWindow() }"
                    .to_string()
            )
        );
    }

    #[test]
    fn test_kill_rejects_injection() {
        assert_eq!(
            expand_launcher_shortcut("kill:x' ; Stop-Computer ; '"),
            Shortcut::Rejected
        );
    }

    #[test]
    fn test_unknown_prefix_passes_through() {
        assert_eq!(
            expand_launcher_shortcut("shutdown -s -t 0"),
            Shortcut::NotShortcut
        );
        // Drive letters look like prefixes but are not in the grammar.
        assert_eq!(
            expand_launcher_shortcut(r"C:\Games\Game.exe"),
            Shortcut::NotShortcut
        );
    }

    #[test]
    fn test_no_colon_passes_through() {
        assert_eq!(expand_launcher_shortcut("notepad"), Shortcut::NotShortcut);
    }

    #[test]
    fn test_split_exe_args() {
        assert_eq!(
            split_exe_args(r"C:\a\b.exe -x"),
            (r"C:\a\b.exe", Some("-x"))
        );
        assert_eq!(split_exe_args(r"C:\a\b.exe"), (r"C:\a\b.exe", None));
        assert_eq!(split_exe_args(r"C:\a\b.EXE -x"), (r"C:\a\b.EXE", Some("-x")));
    }

    #[test]
    fn test_env_expansion_substitutes_and_empties() {
        let lookup = |name: &str| match name {
            "WINDIR" => Some(r"C:\Windows".to_string()),
            _ => None,
        };
        assert_eq!(
            expand_env_with(r"%WINDIR%\System32\scrnsave.scr /s", lookup),
            r"C:\Windows\System32\scrnsave.scr /s"
        );
        assert_eq!(expand_env_with("a %UNSET% b", lookup), "a  b");
        assert_eq!(expand_env_with("50% done", lookup), "50% done");
        assert_eq!(expand_env_with("no vars", lookup), "no vars");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn steam_never_expands_non_digits(arg in "[a-zA-Z;|&$`'\" ]{1,16}") {
                let cmd = format!("steam:{arg}");
                prop_assert!(!matches!(
                    expand_launcher_shortcut(&cmd),
                    Shortcut::Expanded(_)
                ));
            }

            #[test]
            fn exe_never_expands_metacharacters(
                prefix in "[a-zA-Z0-9\\\\ .-]{0,12}",
                meta in prop::sample::select(vec![';', '|', '&', '$', '`', '"', '\'', '\n', '\r']),
                suffix in "[a-zA-Z0-9 ]{0,12}",
            ) {
                let cmd = format!("exe:{prefix}{meta}{suffix}");
                prop_assert!(!matches!(
                    expand_launcher_shortcut(&cmd),
                    Shortcut::Expanded(_)
                ));
            }
        }
    }
}
